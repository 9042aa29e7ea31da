use std::fmt::{Debug, Display, Formatter};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::{Buf, BufMut};

/// A node's network identity: the IPv4 address and UDP port its network interface is bound to.
///  Every node in a mesh is identified by exactly one [NodeAddr], and paths are sequences of them.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeAddr(SocketAddrV4);

impl Debug for NodeAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.0)
    }
}
impl Display for NodeAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SocketAddrV4> for NodeAddr {
    fn from(value: SocketAddrV4) -> Self {
        NodeAddr(value)
    }
}

impl NodeAddr {
    pub const SERIALIZED_LEN: usize = 4 + 2;

    /// prime modulus for spreading addresses over route cache slots
    pub const HASH_MODULUS: u32 = 65521;

    pub fn new(ip: Ipv4Addr, port: u16) -> NodeAddr {
        NodeAddr(SocketAddrV4::new(ip, port))
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(self.0)
    }

    /// XOR-folds the address' three 16 bit words and reduces the result modulo
    ///  [NodeAddr::HASH_MODULUS]
    pub fn route_hash(&self) -> u16 {
        let ip = self.0.ip().to_bits();
        let folded = (ip >> 16) ^ (ip & 0xffff) ^ self.0.port() as u32;
        (folded % Self::HASH_MODULUS) as u16
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.0.ip().to_bits());
        buf.put_u16(self.0.port());
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<NodeAddr> {
        let ip = buf.try_get_u32()?;
        let port = buf.try_get_u16()?;
        Ok(NodeAddr::new(Ipv4Addr::from_bits(ip), port))
    }
}

#[cfg(test)]
pub fn test_node_addr_from_number(number: u16) -> NodeAddr {
    NodeAddr::new(Ipv4Addr::new(10, 0, (number >> 8) as u8, number as u8), 9000 + number)
}
