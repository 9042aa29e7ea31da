use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, error, info, span, trace, Instrument, Level};

use crate::network::{Network, PacketHandler};
use crate::node_addr::NodeAddr;

/// A [Network] over UDP. There is no link-layer broadcast: 'directly reachable' nodes are a
///  statically configured list of neighbours, and a broadcast is a unicast to each of them.
pub struct UdpNetwork {
    socket: UdpSocket,
    local_addr: NodeAddr,
    neighbours: Vec<NodeAddr>,
    max_packet_size: usize,
    cancel: Notify,
}

impl UdpNetwork {
    pub async fn bind(addr: NodeAddr, neighbours: Vec<NodeAddr>, max_packet_size: usize) -> anyhow::Result<UdpNetwork> {
        let socket = UdpSocket::bind(addr.socket_addr()).await?;
        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(a) => NodeAddr::from(a),
            SocketAddr::V6(a) => bail!("bound to IPV6 address {:?}, only IPV4 is supported", a),
        };
        info!("bound UDP network to {}", local_addr);

        Ok(UdpNetwork {
            socket,
            local_addr,
            neighbours,
            max_packet_size,
            cancel: Notify::new(),
        })
    }

    fn assemble(&self, header: &[u8], payload: &[u8]) -> anyhow::Result<BytesMut> {
        let len = header.len() + payload.len();
        if len > self.max_packet_size {
            bail!("packet of {} bytes exceeds maximum packet size {}", len, self.max_packet_size);
        }
        let mut buf = BytesMut::with_capacity(len);
        buf.put_slice(header);
        buf.put_slice(payload);
        Ok(buf)
    }
}

#[async_trait]
impl Network for UdpNetwork {
    fn local_addr(&self) -> NodeAddr {
        self.local_addr
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    async fn send_packet(&self, to: NodeAddr, header: &[u8], payload: &[u8]) -> anyhow::Result<usize> {
        let buf = self.assemble(header, payload)?;
        trace!("UDP network: sending packet to {}", to);
        Ok(self.socket.send_to(&buf, to.socket_addr()).await?)
    }

    async fn broadcast_packet(&self, header: &[u8], payload: &[u8]) -> anyhow::Result<()> {
        let buf = self.assemble(header, payload)?;
        for to in &self.neighbours {
            if let Err(e) = self.socket.send_to(&buf, to.socket_addr()).await {
                error!("error sending UDP packet to {}: {}", to, e);
            }
        }
        Ok(())
    }

    async fn recv_loop(&self, handler: Arc<dyn PacketHandler>) -> anyhow::Result<()> {
        info!("starting receive loop");

        let mut buf = vec![0u8; self.max_packet_size];
        loop {
            let (num_read, from) = tokio::select! {
                r = self.socket.recv_from(&mut buf) => match r {
                    Ok(x) => x,
                    Err(e) => {
                        error!("socket error: {}", e);
                        continue;
                    }
                },
                _ = self.cancel.notified() => {
                    info!("receive loop cancelled");
                    return Ok(());
                }
            };

            if !matches!(from, SocketAddr::V4(_)) {
                debug!("packet from IPV6 address {:?} - dropping", from);
                continue;
            }

            let span = span!(Level::TRACE, "packet_received", ?from);
            handler.on_packet(&buf[..num_read])
                .instrument(span)
                .await;
        }
    }

    fn cancel_recv_loop(&self) {
        self.cancel.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc;

    struct ForwardingHandler(mpsc::UnboundedSender<Vec<u8>>);
    #[async_trait]
    impl PacketHandler for ForwardingHandler {
        async fn on_packet(&self, buf: &[u8]) {
            self.0.send(buf.to_vec()).ok();
        }
    }

    #[tokio::test]
    async fn test_send_and_broadcast() {
        let b = Arc::new(UdpNetwork::bind(NodeAddr::new(Ipv4Addr::LOCALHOST, 0), vec![], 64).await.unwrap());
        let a = UdpNetwork::bind(NodeAddr::new(Ipv4Addr::LOCALHOST, 0), vec![b.local_addr()], 64).await.unwrap();

        let (send, mut recv) = mpsc::unbounded_channel();
        let b2 = b.clone();
        let recv_loop = tokio::spawn(async move {
            b2.recv_loop(Arc::new(ForwardingHandler(send))).await
        });

        a.send_packet(b.local_addr(), b"hdr", b"data").await.unwrap();
        assert_eq!(recv.recv().await.unwrap(), b"hdrdata");

        a.broadcast_packet(b"all", b"").await.unwrap();
        assert_eq!(recv.recv().await.unwrap(), b"all");

        assert!(a.send_packet(b.local_addr(), &[0u8; 60], &[0u8; 5]).await.is_err());

        b.cancel_recv_loop();
        recv_loop.await.unwrap().unwrap();
    }
}
