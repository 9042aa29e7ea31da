use std::collections::hash_map::Entry;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::network::PacketHandler;
use crate::routing::RouteController;

/// The first byte of every payload delivered by the routing layer, identifying the protocol that
///  handles it
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ProtocolTag(pub u8);

impl ProtocolTag {
    pub const DATAGRAM: ProtocolTag = ProtocolTag(1);
    pub const STREAM: ProtocolTag = ProtocolTag(2);
}

impl Debug for ProtocolTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::DATAGRAM => write!(f, "DATAGRAM"),
            Self::STREAM => write!(f, "STREAM"),
            ProtocolTag(other) => write!(f, "PROTO({})", other),
        }
    }
}

/// A protocol layered on top of routing, receiving the payloads tagged with its [ProtocolTag].
///
/// This is called from the receive loop, so implementations must not block on the network:
///  anything that may trigger a route discovery must be spawned.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProtocolHandler: Send + Sync + 'static {
    fn tag(&self) -> ProtocolTag;

    /// `packet` starts with the protocol tag
    async fn on_packet(&self, packet: Bytes);
}

/// Entry point for all inbound packets: passes them through routing, and dispatches locally
///  delivered payloads to the registered protocol handlers.
pub struct Dispatcher {
    router: Arc<RouteController>,
    handlers: RwLock<FxHashMap<ProtocolTag, Arc<dyn ProtocolHandler>>>,
}

impl Dispatcher {
    pub fn new(router: Arc<RouteController>) -> Dispatcher {
        Dispatcher {
            router,
            handlers: Default::default(),
        }
    }

    pub async fn register(&self, handler: Arc<dyn ProtocolHandler>) -> anyhow::Result<()> {
        match self.handlers.write().await
            .entry(handler.tag())
        {
            Entry::Occupied(_) => {
                Err(anyhow!("registering a second handler for protocol {:?}", handler.tag()))
            }
            Entry::Vacant(e) => {
                e.insert(handler);
                Ok(())
            }
        }
    }

    pub async fn deregister(&self, tag: ProtocolTag) -> anyhow::Result<()> {
        let prev = self.handlers.write().await
            .remove(&tag);
        if prev.is_none() {
            return Err(anyhow!("deregistering protocol {:?} that was not previously registered", tag));
        }
        Ok(())
    }
}

#[async_trait]
impl PacketHandler for Dispatcher {
    async fn on_packet(&self, buf: &[u8]) {
        let Some(payload) = self.router.on_packet(buf).await else {
            return;
        };

        let Some(&tag) = payload.first() else {
            debug!("received empty payload - dropping");
            return;
        };
        let tag = ProtocolTag(tag);

        let handler = self.handlers.read().await
            .get(&tag)
            .cloned();
        match handler {
            Some(handler) => {
                trace!("dispatching payload to {:?}", tag);
                handler.on_packet(payload).await;
            }
            None => {
                debug!("received payload for unregistered protocol {:?} - dropping", tag);
            }
        }
    }
}
