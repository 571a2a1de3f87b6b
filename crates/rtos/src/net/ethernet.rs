//! Ethernet framing.

use crate::fs::buffer::BufFlags;
use crate::net::NetBuffer;
use crate::status::{Error, Result};

pub const ETH_HDR_SIZE: usize = 14;
pub const ETH_ADDR_LEN: usize = 6;

pub const ETH_ADDR_BCAST: [u8; ETH_ADDR_LEN] = [0xFF; ETH_ADDR_LEN];

/// Parsed link-layer information for a received frame.
pub struct EthFrame {
    pub ethertype: u16,
    pub src: [u8; ETH_ADDR_LEN],
    pub broadcast: bool,
}

/// Strip and return the Ethernet header of a received frame.
pub fn process(buf: &NetBuffer) -> Result<EthFrame> {
    if buf.total_len() < ETH_HDR_SIZE {
        return Err(Error::InvalidHeader);
    }
    let mut dst = [0u8; ETH_ADDR_LEN];
    let mut src = [0u8; ETH_ADDR_LEN];
    buf.pull_offset(Some(&mut dst), ETH_ADDR_LEN, 0, BufFlags::INPLACE)?;
    buf.pull_offset(Some(&mut src), ETH_ADDR_LEN, ETH_ADDR_LEN, BufFlags::INPLACE)?;
    let ethertype = buf.peek_u16(2 * ETH_ADDR_LEN)?;
    buf.pull(None, ETH_HDR_SIZE, BufFlags::empty())?;
    Ok(EthFrame {
        ethertype,
        src,
        broadcast: dst == ETH_ADDR_BCAST,
    })
}

/// Prepend an Ethernet header.
pub fn header_add(
    buf: &NetBuffer,
    dst: &[u8; ETH_ADDR_LEN],
    src: &[u8; ETH_ADDR_LEN],
    ethertype: u16,
) -> Result<()> {
    // Fields pushed in reverse so they land in wire order.
    buf.push_u16(ethertype, BufFlags::HEAD)?;
    buf.push(src, BufFlags::HEAD)?;
    buf.push(dst, BufFlags::HEAD)?;
    Ok(())
}
