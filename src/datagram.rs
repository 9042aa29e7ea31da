use std::fmt::{Debug, Formatter};
use std::sync::{Arc, MutexGuard};

use anyhow::bail;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::config::StackConfig;
use crate::dispatch::{ProtocolHandler, ProtocolTag};
use crate::node_addr::NodeAddr;
use crate::routing::header::RoutingHeader;
use crate::routing::RouteController;
use crate::socket::channel::Channel;
use crate::socket::error::SocketError;
use crate::socket::port_table::{is_listener_port, PortTable};

#[derive(Clone, Eq, PartialEq)]
struct DatagramHeader {
    source: Channel,
    destination_port: u16,
}

impl Debug for DatagramHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DGRAM{{{:?}->#{}}}", self.source, self.destination_port)
    }
}

impl DatagramHeader {
    const SERIALIZED_LEN: usize = size_of::<u8>() + Channel::SERIALIZED_LEN + size_of::<u16>();

    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(ProtocolTag::DATAGRAM.0);
        self.source.ser(buf);
        buf.put_u16(self.destination_port);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<DatagramHeader> {
        let tag = ProtocolTag(buf.try_get_u8()?);
        if tag != ProtocolTag::DATAGRAM {
            bail!("expected datagram protocol, was {:?}", tag);
        }
        let source = Channel::try_deser(buf)?;
        let destination_port = buf.try_get_u16()?;
        Ok(DatagramHeader { source, destination_port })
    }
}

/// A received datagram, with the channel to send replies to
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Datagram {
    pub source: Channel,
    pub payload: Bytes,
}

struct DatagramContext {
    myself: NodeAddr,
    max_payload_len: usize,
    router: Arc<RouteController>,
    ports: std::sync::Mutex<PortTable<PortInbox>>,
}

impl DatagramContext {
    fn ports(&self) -> MutexGuard<'_, PortTable<PortInbox>> {
        self.ports.lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

struct PortInbox {
    port: u16,
    /// `None` once the port is closed, which ends the receiver's stream
    sender: std::sync::Mutex<Option<UnboundedSender<Datagram>>>,
    receiver: Mutex<UnboundedReceiver<Datagram>>,
}

impl PortInbox {
    fn sender(&self) -> MutexGuard<'_, Option<UnboundedSender<Datagram>>> {
        self.sender.lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

/// Unreliable, connectionless messaging over the same routing as sockets. A datagram is
///  delivered at most once and in no particular order. It must fit into a single packet.
pub struct DatagramLayer {
    ctx: Arc<DatagramContext>,
}

impl DatagramLayer {
    pub fn new(config: &StackConfig, router: Arc<RouteController>) -> DatagramLayer {
        DatagramLayer {
            ctx: Arc::new(DatagramContext {
                myself: router.myself(),
                max_payload_len: config.max_network_packet_size
                    - RoutingHeader::max_serialized_len(config.max_route_length)
                    - DatagramHeader::SERIALIZED_LEN,
                router,
                ports: std::sync::Mutex::new(PortTable::default()),
            }),
        }
    }

    pub fn max_payload_len(&self) -> usize {
        self.ctx.max_payload_len
    }

    /// Binds a port for sending and receiving datagrams. Binding a port that is already bound
    ///  returns the existing binding.
    pub fn bind(&self, port: u16) -> Result<DatagramPort, SocketError> {
        let mut ports = self.ctx.ports();
        let inbox = match ports.get(port) {
            Some(inbox) => inbox,
            None => ports.bind_listener(port, |port| {
                let (sender, receiver) = mpsc::unbounded_channel();
                Arc::new(PortInbox {
                    port,
                    sender: std::sync::Mutex::new(Some(sender)),
                    receiver: Mutex::new(receiver),
                })
            })?,
        };
        Ok(DatagramPort {
            ctx: self.ctx.clone(),
            inbox,
        })
    }
}

#[async_trait]
impl ProtocolHandler for DatagramLayer {
    fn tag(&self) -> ProtocolTag {
        ProtocolTag::DATAGRAM
    }

    async fn on_packet(&self, packet: Bytes) {
        let header = match DatagramHeader::deser(&mut &packet[..]) {
            Ok(header) => header,
            Err(e) => {
                warn!("received unparseable datagram header - dropping: {}", e);
                return;
            }
        };
        trace!("received {:?}", header);

        let inbox = self.ctx.ports()
            .get(header.destination_port);
        let Some(inbox) = inbox else {
            debug!("no datagram port {} - dropping", header.destination_port);
            return;
        };

        let datagram = Datagram {
            source: header.source,
            payload: packet.slice(DatagramHeader::SERIALIZED_LEN..),
        };
        let delivered = match inbox.sender().as_ref() {
            Some(sender) => sender.send(datagram).is_ok(),
            None => false,
        };
        if !delivered {
            debug!("datagram port {} was closed - dropping", inbox.port);
        }
    }
}

/// A bound datagram port
#[derive(Clone)]
pub struct DatagramPort {
    ctx: Arc<DatagramContext>,
    inbox: Arc<PortInbox>,
}

impl Debug for DatagramPort {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DatagramPort{{{}#{}}}", self.ctx.myself, self.inbox.port)
    }
}

impl DatagramPort {
    pub fn local(&self) -> Channel {
        Channel::new(self.ctx.myself, self.inbox.port)
    }

    /// Sends a single datagram, returning the number of payload bytes sent. Success does not
    ///  mean the datagram arrived.
    pub async fn send_to(&self, to: Channel, payload: &[u8]) -> Result<usize, SocketError> {
        if payload.len() > self.ctx.max_payload_len || !is_listener_port(to.port) {
            return Err(SocketError::InvalidParams);
        }

        let header = DatagramHeader {
            source: self.local(),
            destination_port: to.port,
        };
        let mut buf = BytesMut::with_capacity(DatagramHeader::SERIALIZED_LEN);
        header.ser(&mut buf);

        match self.ctx.router.send(to.addr, &buf, payload).await {
            Ok(_) => Ok(payload.len()),
            Err(e) => {
                debug!("sending datagram to {:?} failed: {}", to, e);
                Err(SocketError::SendError { bytes_sent: 0 })
            }
        }
    }

    /// Waits for the next datagram on this port. Fails once the port is closed and all
    ///  datagrams received before are taken.
    pub async fn receive(&self) -> Result<Datagram, SocketError> {
        self.inbox.receiver.lock().await
            .recv().await
            .ok_or(SocketError::ReceiveError)
    }

    /// Unbinds the port. Tasks waiting in [DatagramPort::receive] are woken up and fail.
    pub fn close(&self) {
        self.ctx.ports()
            .release(self.inbox.port, &self.inbox);
        self.inbox.sender()
            .take();
    }
}
