pub mod header;
pub mod path;
pub mod route_cache;

use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use crate::config::StackConfig;
use crate::ids::RequestId;
use crate::network::Network;
use crate::node_addr::NodeAddr;
use crate::routing::header::{RoutingHeader, RoutingKind};
use crate::routing::path::Path;
use crate::routing::route_cache::RouteCache;

struct DiscoveryState {
    next_request_id: RequestId,
    /// id of the newest reply that was accepted, per discovered destination
    last_satisfied: FxHashMap<NodeAddr, RequestId>,
    waiters: FxHashMap<NodeAddr, Vec<oneshot::Sender<Path>>>,
}

/// Source routing over a mesh of nodes that can only talk to direct neighbours.
///
/// Paths are discovered on demand by flooding a DISCOVERY packet that accumulates the nodes it
///  passes through. The destination sends the accumulated path back as a REPLY, and the
///  originator caches it. DATA packets carry their full path, so forwarding nodes keep no state.
///
/// Routing is unreliable: packets lost between hops are not retransmitted here.
pub struct RouteController {
    myself: NodeAddr,
    config: Arc<StackConfig>,
    network: Arc<dyn Network>,
    cache: RwLock<RouteCache>,
    discovery: Mutex<DiscoveryState>,
}

impl RouteController {
    pub fn new(config: Arc<StackConfig>, network: Arc<dyn Network>) -> RouteController {
        RouteController {
            myself: network.local_addr(),
            cache: RwLock::new(RouteCache::new(config.route_ttl)),
            config,
            network,
            discovery: Mutex::new(DiscoveryState {
                next_request_id: RequestId::ZERO.next(),
                last_satisfied: FxHashMap::default(),
                waiters: FxHashMap::default(),
            }),
        }
    }

    pub fn myself(&self) -> NodeAddr {
        self.myself
    }

    fn initial_ttl(&self) -> u32 {
        self.config.max_route_length as u32
    }

    pub async fn cached_path(&self, destination: NodeAddr) -> Option<Path> {
        self.cache.read().await
            .get(destination, Instant::now())
            .cloned()
    }

    pub async fn invalidate(&self, destination: NodeAddr) {
        self.cache.write().await
            .remove(destination);
    }

    /// Sends `header` and `payload` back to back to `destination`, discovering a path first if
    ///  none is cached. This blocks for the duration of discovery.
    pub async fn send(&self, destination: NodeAddr, header: &[u8], payload: &[u8]) -> anyhow::Result<usize> {
        if destination == self.myself {
            bail!("sending to self is not supported");
        }

        let path = match self.cached_path(destination).await {
            Some(path) => path,
            None => {
                debug!("no cached route to {} - starting discovery", destination);
                self.discover(destination).await?
            }
        };

        let routing_header = RoutingHeader {
            kind: RoutingKind::Data,
            destination,
            request_id: RequestId::ZERO,
            ttl: self.initial_ttl(),
            path,
        };
        let next_hop = routing_header.path.hop_after(self.myself)
            .ok_or_else(|| anyhow!("cached path {:?} does not continue after {}", routing_header.path, self.myself))?;

        let mut buf = BytesMut::with_capacity(routing_header.serialized_len() + header.len());
        routing_header.ser(&mut buf);
        buf.put_slice(header);

        trace!("sending data to {} via {}: {:?}", destination, next_hop, routing_header);
        self.network.send_packet(next_hop, &buf, payload).await
    }

    /// Floods a DISCOVERY for `destination` and waits for the first reply. The discovered path
    ///  is cached before this returns.
    pub async fn discover(&self, destination: NodeAddr) -> anyhow::Result<Path> {
        let (send, recv) = oneshot::channel();
        let request_id = {
            let mut discovery = self.discovery.lock().await;
            let request_id = discovery.next_request_id;
            discovery.next_request_id = request_id.next();

            let waiters = discovery.waiters.entry(destination).or_default();
            waiters.retain(|w| !w.is_closed());
            waiters.push(send);
            request_id
        };

        let header = RoutingHeader {
            kind: RoutingKind::Discovery,
            destination,
            request_id,
            ttl: self.initial_ttl(),
            path: Path::new(self.myself),
        };
        debug!("discovering route to {}: {:?}", destination, header);

        let mut buf = BytesMut::with_capacity(header.serialized_len());
        header.ser(&mut buf);

        let result = match self.network.broadcast_packet(&buf, &[]).await {
            Ok(()) => time::timeout(self.config.discovery_timeout, recv).await,
            Err(e) => {
                self.discard_closed_waiters(destination).await;
                return Err(e);
            }
        };

        match result {
            Ok(Ok(path)) => Ok(path),
            Ok(Err(_)) => bail!("discovery for {} was abandoned", destination),
            Err(_) => {
                debug!("route discovery for {} timed out", destination);
                self.discard_closed_waiters(destination).await;
                bail!("route discovery for {} timed out", destination)
            }
        }
    }

    async fn discard_closed_waiters(&self, destination: NodeAddr) {
        let mut discovery = self.discovery.lock().await;
        if let Some(waiters) = discovery.waiters.get_mut(&destination) {
            waiters.retain(|w| !w.is_closed());
            if waiters.is_empty() {
                discovery.waiters.remove(&destination);
            }
        }
    }

    /// Processes an inbound packet. Returns the payload if the packet is DATA addressed to this
    ///  node, and `None` if it was consumed or forwarded.
    pub async fn on_packet(&self, buf: &[u8]) -> Option<Bytes> {
        let mut parse_buf = buf;
        let header = match RoutingHeader::deser(&mut parse_buf, self.config.max_route_length) {
            Ok(header) => header,
            Err(e) => {
                warn!("received unparseable routing header - dropping: {}", e);
                return None;
            }
        };
        trace!("received {:?}", header);

        match header.kind {
            RoutingKind::Discovery => {
                self.on_discovery(header).await;
                None
            }
            RoutingKind::Reply => {
                self.on_reply(header).await;
                None
            }
            RoutingKind::Data => self.on_data(header, parse_buf).await,
        }
    }

    async fn on_discovery(&self, mut header: RoutingHeader) {
        if self.config.suppress_discovery_loops && header.path.contains(self.myself) {
            trace!("discovery {:?} already passed through this node - dropping", header.request_id);
            return;
        }
        if !header.path.push(self.myself, self.config.max_route_length) {
            debug!("discovery path {:?} is full - dropping", header.path);
            return;
        }

        if header.destination == self.myself {
            let reply_path = header.path.reversed();
            let (Some(originator), Some(next_hop)) = (reply_path.terminal(), reply_path.hop_after(self.myself)) else {
                warn!("discovery path {:?} has no originator - dropping", header.path);
                return;
            };

            let reply = RoutingHeader {
                kind: RoutingKind::Reply,
                destination: originator,
                request_id: header.request_id,
                ttl: self.initial_ttl(),
                path: reply_path,
            };
            debug!("replying to discovery from {} via {}: {:?}", originator, next_hop, reply);
            self.send_header(next_hop, &reply, &[]).await;
            return;
        }

        if !Self::decrement_ttl(&mut header) {
            return;
        }

        let mut buf = BytesMut::with_capacity(header.serialized_len());
        header.ser(&mut buf);
        trace!("re-broadcasting {:?}", header);
        if let Err(e) = self.network.broadcast_packet(&buf, &[]).await {
            warn!("error re-broadcasting discovery: {}", e);
        }
    }

    async fn on_reply(&self, header: RoutingHeader) {
        if header.destination != self.myself {
            self.forward(header, &[]).await;
            return;
        }

        let path = header.path.reversed();
        let Some(target) = path.terminal() else {
            return;
        };
        if path.owner() != Some(self.myself) || path.len() < 2 {
            warn!("reply path {:?} does not start at this node - dropping", path);
            return;
        }

        let mut discovery = self.discovery.lock().await;
        if let Some(last) = discovery.last_satisfied.get(&target) {
            if !header.request_id.is_newer_than(*last) {
                debug!("stale or duplicate reply {:?} for {} (last satisfied {:?}) - dropping", header.request_id, target, last);
                return;
            }
        }
        discovery.last_satisfied.insert(target, header.request_id);

        debug!("discovered route {:?}", path);
        self.cache.write().await
            .insert(path.clone(), Instant::now());

        if let Some(waiters) = discovery.waiters.remove(&target) {
            for waiter in waiters {
                let _ = waiter.send(path.clone());
            }
        }
    }

    async fn on_data(&self, header: RoutingHeader, payload: &[u8]) -> Option<Bytes> {
        if header.destination == self.myself {
            return Some(Bytes::copy_from_slice(payload));
        }
        self.forward(header, payload).await;
        None
    }

    async fn forward(&self, mut header: RoutingHeader, payload: &[u8]) {
        if !Self::decrement_ttl(&mut header) {
            return;
        }
        let Some(next_hop) = header.path.hop_after(self.myself) else {
            debug!("this node is not on the path of {:?} - dropping", header);
            return;
        };
        trace!("forwarding to {}: {:?}", next_hop, header);
        self.send_header(next_hop, &header, payload).await;
    }

    fn decrement_ttl(header: &mut RoutingHeader) -> bool {
        header.ttl = header.ttl.saturating_sub(1);
        if header.ttl == 0 {
            debug!("TTL of {:?} expired - dropping", header);
            return false;
        }
        true
    }

    async fn send_header(&self, to: NodeAddr, header: &RoutingHeader, payload: &[u8]) {
        let mut buf = BytesMut::with_capacity(header.serialized_len());
        header.ser(&mut buf);
        if let Err(e) = self.network.send_packet(to, &buf, payload).await {
            warn!("error sending {:?} to {}: {}", header.kind, to, e);
        }
    }
}
