use std::fmt::{Debug, Formatter};

use bytes::{Buf, BufMut};

use crate::node_addr::NodeAddr;

/// One endpoint of a connection: a node and a port on that node
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct Channel {
    pub addr: NodeAddr,
    pub port: u16,
}

impl Debug for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.addr, self.port)
    }
}

impl Channel {
    pub const SERIALIZED_LEN: usize = NodeAddr::SERIALIZED_LEN + size_of::<u16>();

    pub fn new(addr: NodeAddr, port: u16) -> Channel {
        Channel { addr, port }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.addr.ser(buf);
        buf.put_u16(self.port);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Channel> {
        let addr = NodeAddr::try_deser(buf)?;
        let port = buf.try_get_u16()?;
        Ok(Channel { addr, port })
    }
}
