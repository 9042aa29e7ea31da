use std::fmt::{Debug, Formatter};

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::ids::RequestId;
use crate::node_addr::NodeAddr;
use crate::routing::path::Path;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum RoutingKind {
    /// carries a payload along a known path
    Data = 0,
    /// flooded to find a path to `destination`
    Discovery = 1,
    /// travels back from a discovery's destination to its originator
    Reply = 2,
}

/// Header prepended to every packet on the network. The payload following it is opaque to the
///  routing layer.
#[derive(Clone, Eq, PartialEq)]
pub struct RoutingHeader {
    pub kind: RoutingKind,
    pub destination: NodeAddr,
    pub request_id: RequestId,
    pub ttl: u32,
    pub path: Path,
}

impl Debug for RoutingHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ROUTE{{{:?}->{}:{:?}@{}:{:?}}}", self.kind, self.destination, self.request_id, self.ttl, self.path)
    }
}

impl RoutingHeader {
    const FIXED_LEN: usize = size_of::<u8>() // kind
        + NodeAddr::SERIALIZED_LEN           // destination
        + size_of::<u32>()                   // request id
        + size_of::<u32>();                  // ttl

    pub fn max_serialized_len(max_route_length: usize) -> usize {
        Self::FIXED_LEN + varint_len(max_route_length) + max_route_length * NodeAddr::SERIALIZED_LEN
    }

    pub fn serialized_len(&self) -> usize {
        Self::FIXED_LEN + varint_len(self.path.len()) + self.path.len() * NodeAddr::SERIALIZED_LEN
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.kind.into());
        self.destination.ser(buf);
        buf.put_u32(self.request_id.to_raw());
        buf.put_u32(self.ttl);
        buf.put_usize_varint(self.path.len());
        for node in self.path.nodes() {
            node.ser(buf);
        }
    }

    /// Parses a header, leaving `buf` positioned at the start of the payload. Paths exceeding
    ///  `max_route_length` are rejected to bound the work done per packet.
    pub fn deser(buf: &mut impl Buf, max_route_length: usize) -> anyhow::Result<RoutingHeader> {
        let kind = RoutingKind::try_from_primitive(buf.try_get_u8()?)?;
        let destination = NodeAddr::try_deser(buf)?;
        let request_id = RequestId::from_raw(buf.try_get_u32()?);
        let ttl = buf.try_get_u32()?;

        let path_len = buf.try_get_usize_varint()
            .map_err(|e| anyhow!("invalid path length: {:?}", e))?;
        if path_len == 0 {
            bail!("empty path");
        }
        if path_len > max_route_length {
            bail!("path of length {} exceeds maximum route length {}", path_len, max_route_length);
        }
        let mut nodes = Vec::with_capacity(path_len);
        for _ in 0..path_len {
            nodes.push(NodeAddr::try_deser(buf)?);
        }

        Ok(RoutingHeader {
            kind,
            destination,
            request_id,
            ttl,
            path: Path::from_nodes(nodes),
        })
    }
}

fn varint_len(value: usize) -> usize {
    let bits = usize::BITS - value.leading_zeros();
    (bits.max(1) as usize).div_ceil(7)
}
