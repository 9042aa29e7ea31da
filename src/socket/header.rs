use std::fmt::{Debug, Formatter};

use anyhow::bail;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::dispatch::ProtocolTag;
use crate::ids::SeqNum;
use crate::socket::channel::Channel;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum MessageType {
    Syn = 1,
    SynAck = 2,
    /// acknowledgement, and the carrier for all payload
    Ack = 3,
    Fin = 4,
}

#[derive(Clone, Eq, PartialEq)]
pub struct TransportHeader {
    pub source: Channel,
    pub destination: Channel,
    pub message_type: MessageType,
    pub seq: SeqNum,
    pub ack: SeqNum,
}

impl Debug for TransportHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SOCK{{{:?}->{:?}:{:?} {:?}/{:?}}}", self.source, self.destination, self.message_type, self.seq, self.ack)
    }
}

impl TransportHeader {
    pub const SERIALIZED_LEN: usize = size_of::<u8>() // protocol tag
        + Channel::SERIALIZED_LEN                     // source
        + Channel::SERIALIZED_LEN                     // destination
        + size_of::<u8>()                             // message type
        + size_of::<u32>()                            // seq
        + size_of::<u32>();                           // ack

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(ProtocolTag::STREAM.0);
        self.source.ser(buf);
        self.destination.ser(buf);
        buf.put_u8(self.message_type.into());
        buf.put_u32(self.seq.to_raw());
        buf.put_u32(self.ack.to_raw());
    }

    /// Parses a header including its leading protocol tag, leaving `buf` positioned at the
    ///  start of the payload
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<TransportHeader> {
        let tag = ProtocolTag(buf.try_get_u8()?);
        if tag != ProtocolTag::STREAM {
            bail!("expected stream protocol, was {:?}", tag);
        }

        let source = Channel::try_deser(buf)?;
        let destination = Channel::try_deser(buf)?;
        let message_type = MessageType::try_from_primitive(buf.try_get_u8()?)?;
        let seq = SeqNum::from_raw(buf.try_get_u32()?);
        let ack = SeqNum::from_raw(buf.try_get_u32()?);

        Ok(TransportHeader {
            source,
            destination,
            message_type,
            seq,
            ack,
        })
    }
}
