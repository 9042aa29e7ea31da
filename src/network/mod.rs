pub mod simulated;
pub mod udp;

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::node_addr::NodeAddr;

/// The unreliable datagram substrate the routing layer runs on: it moves a bounded-size packet to
///  a directly reachable neighbour, or to all of them, on a best-effort basis.
///
/// Header and payload are passed separately so that callers need not copy them into one buffer;
///  implementations put them on the wire back to back.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Network: Send + Sync + 'static {
    fn local_addr(&self) -> NodeAddr;

    /// maximum size of header and payload combined
    fn max_packet_size(&self) -> usize;

    /// Sends a packet to a direct neighbour. Success means the packet was handed to the
    ///  network, not that it arrived.
    async fn send_packet(&self, to: NodeAddr, header: &[u8], payload: &[u8]) -> anyhow::Result<usize>;

    async fn broadcast_packet(&self, header: &[u8], payload: &[u8]) -> anyhow::Result<()>;

    /// Passes every inbound packet to `handler` until [Network::cancel_recv_loop] is called
    async fn recv_loop(&self, handler: Arc<dyn PacketHandler>) -> anyhow::Result<()>;

    fn cancel_recv_loop(&self);
}

/// Callback for inbound packets, decoupling the network implementations from the protocol
///  stack that processes what they receive
#[async_trait]
pub trait PacketHandler: Send + Sync {
    async fn on_packet(&self, buf: &[u8]);
}
