use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;

/// The identity of an endpoint as seen by the delivery layer.
///
/// A network address alone does not identify an endpoint: a process can be
/// restarted on the same address, and the stack must be able to tell the new
/// incarnation from the old one at the membership level. The address is
/// therefore paired with an incarnation number that the membership service
/// assigns when the endpoint joins; two `NodeAddr`s are equal only if both
/// parts match.
///
/// The delivery layer itself treats the whole thing as opaque: it only ever
/// compares, hashes and orders these values.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeAddr {
    socket_addr: SocketAddr,
    incarnation: u32,
}

impl Debug for NodeAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.socket_addr, self.incarnation)
    }
}

impl NodeAddr {
    pub fn new(socket_addr: SocketAddr, incarnation: u32) -> NodeAddr {
        NodeAddr {
            socket_addr,
            incarnation,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    pub fn incarnation(&self) -> u32 {
        self.incarnation
    }

    /// The delivery layer provides its guarantees only for point-to-point
    ///  traffic; group addresses are passed through untouched.
    pub fn is_multicast(&self) -> bool {
        self.socket_addr.ip().is_multicast()
    }

    #[cfg(test)]
    pub fn localhost(incarnation: u32) -> NodeAddr {
        NodeAddr::new("127.0.0.1:16385".parse().unwrap(), incarnation)
    }
}
