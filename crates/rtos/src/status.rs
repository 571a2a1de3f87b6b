//! Status codes shared across the kernel, descriptor layer and the
//! networking stack.
//!
//! Every public API that can fail reports one of the kinds below. The
//! descriptor byte-count calls (`fs_read`/`fs_write`) keep the firmware
//! convention of negative integers on the wire; [`Error::code`] provides
//! that mapping.

/// Crate-wide result alias.
pub type Result<T> = core::result::Result<T, Error>;

/// Error kinds that propagate beyond one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    // Resource exhaustion.
    /// Buffer or buffer-list pool is out of entries.
    BufferNoSpace,
    /// No free TCP retransmission slot.
    NoRtxAvailable,
    /// Stack watermark breach detected at suspension.
    NotEnoughStack,

    // Validation.
    InvalidHeader,
    InvalidChecksum,
    NotSupported,
    InvalidBufferType,

    // Liveness.
    ConditionTimeout,
    TcpTimeout,
    ReadTimeout,
    /// No task or timer can make progress; a wait would hang forever.
    WouldBlock,

    // State.
    Closed,
    Refused,
    /// The path chose to drop the packet; not a failure.
    NoAction,
    /// Packet dropped to preserve the pool's threshold margin.
    Threshold,

    // Addressing.
    InvalidFd,
    DstUnreachable,
    DstPortUnreachable,
    UnknownProto,
}

impl Error {
    /// Negative integer code for the descriptor byte-count API.
    pub fn code(self) -> i32 {
        match self {
            Error::BufferNoSpace => -100,
            Error::NoRtxAvailable => -101,
            Error::NotEnoughStack => -102,
            Error::InvalidHeader => -110,
            Error::InvalidChecksum => -111,
            Error::NotSupported => -112,
            Error::InvalidBufferType => -113,
            Error::ConditionTimeout => -120,
            Error::TcpTimeout => -121,
            Error::ReadTimeout => -122,
            Error::WouldBlock => -123,
            Error::Closed => -130,
            Error::Refused => -131,
            Error::NoAction => -132,
            Error::Threshold => -133,
            Error::InvalidFd => -140,
            Error::DstUnreachable => -141,
            Error::DstPortUnreachable => -142,
            Error::UnknownProto => -143,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Error::BufferNoSpace => "BUFFER_NO_SPACE",
            Error::NoRtxAvailable => "NO_RTX_AVAILABLE",
            Error::NotEnoughStack => "NOT_ENOUGH_STACK",
            Error::InvalidHeader => "INVALID_HDR",
            Error::InvalidChecksum => "INVALID_CSUM",
            Error::NotSupported => "NOT_SUPPORTED",
            Error::InvalidBufferType => "INVALID_BUFFER_TYPE",
            Error::ConditionTimeout => "CONDITION_TIMEOUT",
            Error::TcpTimeout => "TCP_TIMEOUT",
            Error::ReadTimeout => "READ_TIMEOUT",
            Error::WouldBlock => "WOULD_BLOCK",
            Error::Closed => "CLOSED",
            Error::Refused => "REFUSED",
            Error::NoAction => "NO_ACTION",
            Error::Threshold => "THRESHOLD",
            Error::InvalidFd => "INVALID_FD",
            Error::DstUnreachable => "DST_UNREACHABLE",
            Error::DstPortUnreachable => "DST_PRT_UNREACHABLE",
            Error::UnknownProto => "UNKNOWN_PROTO",
        }
    }
}

/// What the callee did with a buffer handed to it.
///
/// `Consumed` means ownership was retained (queued on a port, parked in a
/// fragment slot, kept for retransmission) and the caller must not free it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Caller still owns the buffer and returns it to its pool.
    Free,
    /// Callee kept the buffer.
    Consumed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_negative_and_distinct() {
        let all = [
            Error::BufferNoSpace,
            Error::NoRtxAvailable,
            Error::NotEnoughStack,
            Error::InvalidHeader,
            Error::InvalidChecksum,
            Error::NotSupported,
            Error::InvalidBufferType,
            Error::ConditionTimeout,
            Error::TcpTimeout,
            Error::ReadTimeout,
            Error::WouldBlock,
            Error::Closed,
            Error::Refused,
            Error::NoAction,
            Error::Threshold,
            Error::InvalidFd,
            Error::DstUnreachable,
            Error::DstPortUnreachable,
            Error::UnknownProto,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(a.code() < 0);
            for b in &all[i + 1..] {
                assert_ne!(a.code(), b.code());
            }
        }
    }
}
