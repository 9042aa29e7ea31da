use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tracing::{debug, info, trace};

use crate::network::{Network, PacketHandler};
use crate::node_addr::NodeAddr;

struct Topology {
    interfaces: FxHashMap<NodeAddr, UnboundedSender<Bytes>>,
    links: FxHashSet<(NodeAddr, NodeAddr)>,
    loss_rate: f64,
    rng: StdRng,
}

/// An in-memory mesh: nodes attach to it, and packets are delivered only between nodes that were
///  explicitly linked. Links are bidirectional. Optionally, packets are dropped at random to
///  simulate a lossy radio network.
pub struct SimulatedNetwork {
    max_packet_size: usize,
    topology: Mutex<Topology>,
}

impl SimulatedNetwork {
    pub fn new(max_packet_size: usize) -> Arc<SimulatedNetwork> {
        Arc::new(SimulatedNetwork {
            max_packet_size,
            topology: Mutex::new(Topology {
                interfaces: FxHashMap::default(),
                links: FxHashSet::default(),
                loss_rate: 0.0,
                rng: StdRng::seed_from_u64(0),
            }),
        })
    }

    /// Drops each packet with probability `loss_rate`. Seeding makes loss patterns reproducible.
    pub fn set_loss(&self, loss_rate: f64, seed: u64) -> anyhow::Result<()> {
        if !(0.0..1.0).contains(&loss_rate) {
            bail!("loss rate must be in [0, 1), was {}", loss_rate);
        }
        let mut topology = self.lock()?;
        topology.loss_rate = loss_rate;
        topology.rng = StdRng::seed_from_u64(seed);
        Ok(())
    }

    pub fn attach(self: &Arc<Self>, addr: NodeAddr) -> anyhow::Result<Arc<SimulatedInterface>> {
        let (send, recv) = mpsc::unbounded_channel();
        let mut topology = self.lock()?;
        if topology.interfaces.contains_key(&addr) {
            bail!("{} is already attached", addr);
        }
        topology.interfaces.insert(addr, send);
        info!("attached {} to simulated network", addr);

        Ok(Arc::new(SimulatedInterface {
            network: self.clone(),
            addr,
            receiver: tokio::sync::Mutex::new(Some(recv)),
            cancel: Notify::new(),
        }))
    }

    pub fn link(&self, a: NodeAddr, b: NodeAddr) -> anyhow::Result<()> {
        let mut topology = self.lock()?;
        topology.links.insert((a, b));
        topology.links.insert((b, a));
        Ok(())
    }

    pub fn unlink(&self, a: NodeAddr, b: NodeAddr) -> anyhow::Result<()> {
        let mut topology = self.lock()?;
        topology.links.remove(&(a, b));
        topology.links.remove(&(b, a));
        Ok(())
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, Topology>> {
        self.topology.lock()
            .map_err(|_| anyhow!("simulated network topology lock is poisoned"))
    }

    fn assemble(&self, header: &[u8], payload: &[u8]) -> anyhow::Result<Bytes> {
        let len = header.len() + payload.len();
        if len > self.max_packet_size {
            bail!("packet of {} bytes exceeds maximum packet size {}", len, self.max_packet_size);
        }
        let mut buf = BytesMut::with_capacity(len);
        buf.put_slice(header);
        buf.put_slice(payload);
        Ok(buf.freeze())
    }

    fn deliver(topology: &mut Topology, from: NodeAddr, to: NodeAddr, packet: Bytes) {
        if !topology.links.contains(&(from, to)) {
            trace!("{} is not a neighbour of {} - packet is lost", to, from);
            return;
        }
        if topology.loss_rate > 0.0 {
            let loss_rate = topology.loss_rate;
            if topology.rng.gen_bool(loss_rate) {
                trace!("dropping packet from {} to {}", from, to);
                return;
            }
        }
        if let Some(interface) = topology.interfaces.get(&to) {
            if interface.send(packet).is_err() {
                debug!("receiver for {} is gone", to);
            }
        }
    }
}

/// One node's attachment to a [SimulatedNetwork]
pub struct SimulatedInterface {
    network: Arc<SimulatedNetwork>,
    addr: NodeAddr,
    receiver: tokio::sync::Mutex<Option<UnboundedReceiver<Bytes>>>,
    cancel: Notify,
}

#[async_trait]
impl Network for SimulatedInterface {
    fn local_addr(&self) -> NodeAddr {
        self.addr
    }

    fn max_packet_size(&self) -> usize {
        self.network.max_packet_size
    }

    async fn send_packet(&self, to: NodeAddr, header: &[u8], payload: &[u8]) -> anyhow::Result<usize> {
        let packet = self.network.assemble(header, payload)?;
        let len = packet.len();
        let mut topology = self.network.lock()?;
        SimulatedNetwork::deliver(&mut topology, self.addr, to, packet);
        Ok(len)
    }

    async fn broadcast_packet(&self, header: &[u8], payload: &[u8]) -> anyhow::Result<()> {
        let packet = self.network.assemble(header, payload)?;
        let mut topology = self.network.lock()?;
        let neighbours = topology.links.iter()
            .filter(|(from, _)| *from == self.addr)
            .map(|(_, to)| *to)
            .collect::<Vec<_>>();
        for to in neighbours {
            SimulatedNetwork::deliver(&mut topology, self.addr, to, packet.clone());
        }
        Ok(())
    }

    async fn recv_loop(&self, handler: Arc<dyn PacketHandler>) -> anyhow::Result<()> {
        let mut receiver = self.receiver.lock().await
            .take()
            .ok_or_else(|| anyhow!("receive loop for {} is already running", self.addr))?;

        info!("starting receive loop for {}", self.addr);
        loop {
            tokio::select! {
                packet = receiver.recv() => {
                    match packet {
                        Some(packet) => handler.on_packet(&packet).await,
                        None => break,
                    }
                }
                _ = self.cancel.notified() => {
                    info!("receive loop for {} cancelled", self.addr);
                    break;
                }
            }
        }
        Ok(())
    }

    fn cancel_recv_loop(&self) {
        self.cancel.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_addr::test_node_addr_from_number;
    use std::time::Duration;

    struct CollectingHandler {
        received: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
    }
    #[async_trait]
    impl PacketHandler for CollectingHandler {
        async fn on_packet(&self, buf: &[u8]) {
            self.received.send(buf.to_vec()).ok();
        }
    }

    fn spawn_collector(interface: Arc<SimulatedInterface>) -> UnboundedReceiver<Vec<u8>> {
        let (send, recv) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            interface.recv_loop(Arc::new(CollectingHandler { received: send })).await
        });
        recv
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_follows_links() {
        let network = SimulatedNetwork::new(100);
        let a = network.attach(test_node_addr_from_number(1)).unwrap();
        let b = network.attach(test_node_addr_from_number(2)).unwrap();
        let c = network.attach(test_node_addr_from_number(3)).unwrap();
        network.link(a.local_addr(), b.local_addr()).unwrap();

        let mut b_recv = spawn_collector(b.clone());
        let mut c_recv = spawn_collector(c.clone());

        assert_eq!(a.send_packet(b.local_addr(), b"ab", b"cd").await.unwrap(), 4);
        a.send_packet(c.local_addr(), b"xy", b"").await.unwrap();
        a.broadcast_packet(b"bc", b"").await.unwrap();

        assert_eq!(b_recv.recv().await.unwrap(), b"abcd");
        assert_eq!(b_recv.recv().await.unwrap(), b"bc");

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(c_recv.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_packet_size_limit() {
        let network = SimulatedNetwork::new(4);
        let a = network.attach(test_node_addr_from_number(1)).unwrap();
        assert!(a.send_packet(test_node_addr_from_number(2), b"abc", b"de").await.is_err());
        assert!(a.broadcast_packet(b"abcde", b"").await.is_err());
    }

    #[test]
    fn test_attach_twice() {
        let network = SimulatedNetwork::new(100);
        let _a = network.attach(test_node_addr_from_number(1)).unwrap();
        assert!(network.attach(test_node_addr_from_number(1)).is_err());
    }

    #[test]
    fn test_loss_rate_bounds() {
        let network = SimulatedNetwork::new(100);
        assert!(network.set_loss(1.0, 0).is_err());
        assert!(network.set_loss(-0.1, 0).is_err());
        network.set_loss(0.5, 1).unwrap();
    }
}
