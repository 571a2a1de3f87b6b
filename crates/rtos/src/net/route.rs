//! IPv4 routing table.
//!
//! A small fixed table scanned linearly; the longest matching prefix
//! wins, metric breaks ties. Assigning a device address inserts the host
//! route for its subnet.

use alloc::sync::Weak;

use heapless::Vec as FixedVec;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::config::NET_NUM_ROUTES;
use crate::fs::{Fd, FdRef};
use crate::status::{Error, Result};

#[derive(Clone)]
pub struct Route {
    pub interface: Weak<Fd>,
    pub destination: u32,
    pub gateway: u32,
    pub source: u32,
    pub subnet_mask: u32,
    pub metric: u8,
}

lazy_static! {
    static ref ROUTES: Mutex<FixedVec<Route, NET_NUM_ROUTES>> = Mutex::new(FixedVec::new());
}

/// Install a route.
pub fn add(route: Route) -> Result<()> {
    ROUTES
        .lock()
        .push(route)
        .map_err(|_| Error::BufferNoSpace)
}

/// Drop every route through the given interface (and any whose interface
/// is gone).
pub fn remove_for(fd: &FdRef) {
    let mut routes = ROUTES.lock();
    let mut i = 0;
    while i < routes.len() {
        let keep = routes[i]
            .interface
            .upgrade()
            .map(|iface| !alloc::sync::Arc::ptr_eq(&iface, fd))
            .unwrap_or(false);
        if keep {
            i += 1;
        } else {
            routes.swap_remove(i);
        }
    }
}

/// Resolve `destination` to `(interface, next_hop, source)`.
/// Longest-prefix match; smaller metric wins among equal prefixes.
pub fn lookup(destination: u32) -> Option<(FdRef, u32, u32)> {
    let routes = ROUTES.lock();
    let mut best: Option<&Route> = None;
    for route in routes.iter() {
        if destination & route.subnet_mask != route.destination & route.subnet_mask {
            continue;
        }
        let better = match best {
            None => true,
            Some(b) => {
                route.subnet_mask.count_ones() > b.subnet_mask.count_ones()
                    || (route.subnet_mask == b.subnet_mask && route.metric < b.metric)
            }
        };
        if better {
            best = Some(route);
        }
    }
    let route = best?;
    let interface = route.interface.upgrade()?;
    let next_hop = if route.gateway == 0 {
        destination
    } else {
        route.gateway
    };
    Some((interface, next_hop, route.source))
}

#[doc(hidden)]
pub fn reset() {
    ROUTES.lock().clear();
}
