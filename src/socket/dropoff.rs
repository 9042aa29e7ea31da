use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time;
use tracing::{debug, trace, warn};

use crate::dispatch::{ProtocolHandler, ProtocolTag};
use crate::socket::header::{MessageType, TransportHeader};
use crate::socket::state::{Role, SocketState};
use crate::socket::{SocketLayer, SocketShared};

#[async_trait]
impl ProtocolHandler for SocketLayer {
    fn tag(&self) -> ProtocolTag {
        ProtocolTag::STREAM
    }

    async fn on_packet(&self, packet: Bytes) {
        let header = match TransportHeader::deser(&mut &packet[..]) {
            Ok(header) => header,
            Err(e) => {
                warn!("received unparseable transport header - dropping: {}", e);
                return;
            }
        };
        let payload = packet.slice(TransportHeader::SERIALIZED_LEN..);
        trace!("received {:?} with {} bytes of payload", header, payload.len());

        if header.destination.addr != self.ctx.myself {
            debug!("{:?} is addressed to a different node - dropping", header);
            return;
        }

        let socket = self.ctx.ports()
            .get(header.destination.port);
        match socket {
            Some(socket) => socket.on_packet(header, payload).await,
            None => debug!("no socket on port {} - dropping {:?}", header.destination.port, header),
        }
    }
}

impl SocketShared {
    /// Handles a packet addressed to this socket, updating its state and waking waiting
    ///  callers. Replies are spawned and never awaited.
    async fn on_packet(self: &Arc<Self>, header: TransportHeader, payload: Bytes) {
        let mut data = self.data.lock().await;

        if data.state == SocketState::Closed {
            debug!("socket {:?} is closed - dropping {:?}", self.local, header);
            return;
        }

        if data.state != SocketState::Listening && data.remote != Some(header.source) {
            debug!("{:?} is not from the peer of socket {:?} - rejecting", header, self.local);
            if header.message_type != MessageType::Fin {
                self.spawn_reply(self.header(header.source, MessageType::Fin, data.seq, data.ack));
            }
            return;
        }

        match header.message_type {
            MessageType::Syn => {
                if data.state == SocketState::Listening && data.remote.is_none() {
                    data.remote = Some(header.source);
                    self.ack_signal.notify_waiters();
                }
                else {
                    trace!("ignoring SYN in state {:?}", data.state);
                }
            }
            MessageType::SynAck => {
                if self.role != Role::Client {
                    debug!("SYNACK for listener socket {:?} - dropping", self.local);
                    return;
                }
                if data.state == SocketState::Handshaking && data.awaiting_ack && !data.ack_received && header.ack == data.seq {
                    data.ack = header.seq;
                    data.ack_received = true;
                    self.ack_signal.notify_waiters();
                    self.spawn_reply(self.header(header.source, MessageType::Ack, data.seq, data.ack));
                }
                else if data.state.accepts_data() && header.seq == data.ack {
                    trace!("duplicate SYNACK - acknowledging again");
                    self.spawn_reply(self.header(header.source, MessageType::Ack, data.seq, data.ack));
                }
            }
            MessageType::Ack => {
                if data.awaiting_ack && !data.ack_received && header.ack == data.seq {
                    data.ack_received = true;
                    self.ack_signal.notify_waiters();
                }

                if payload.is_empty() {
                    return;
                }
                if !data.state.accepts_data() {
                    debug!("payload in state {:?} - dropping", data.state);
                    return;
                }

                if header.seq == data.ack.next() {
                    data.ack = header.seq;
                    data.mailbox.push(payload);
                    self.data_signal.notify_waiters();
                    self.spawn_reply(self.header(header.source, MessageType::Ack, data.seq, data.ack));
                }
                else if !header.seq.is_newer_than(data.ack) {
                    trace!("duplicate {:?} - acknowledging again", header.seq);
                    self.spawn_reply(self.header(header.source, MessageType::Ack, data.seq, data.ack));
                }
                else {
                    debug!("out of sequence {:?}, expected {:?} - dropping", header.seq, data.ack.next());
                }
            }
            MessageType::Fin => {
                match data.state {
                    SocketState::Listening => {
                        trace!("FIN for listening socket - ignoring");
                    }
                    SocketState::Closing => {
                        self.spawn_reply(self.header(header.source, MessageType::Ack, data.seq, header.seq));
                    }
                    _ => {
                        debug!("peer closed connection to {:?}", self.local);
                        data.state = SocketState::Closing;
                        data.ack = header.seq;

                        let grace_period = self.ctx.config.close_grace_period;
                        let shared = self.clone();
                        data.close_timer = Some(tokio::spawn(async move {
                            time::sleep(grace_period).await;
                            shared.reclaim().await;
                        }));

                        drop(data);
                        self.wake_all();
                    }
                }
            }
        }
    }

    async fn reclaim(self: &Arc<Self>) {
        {
            let mut data = self.data.lock().await;
            if data.state != SocketState::Closing {
                return;
            }
            debug!("grace period for {:?} expired - reclaiming", self.local);
            data.state = SocketState::Closed;
            data.close_timer = None;
        }
        self.wake_all();
        self.release_port();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use bytes::{BufMut, BytesMut};
    use rstest::rstest;

    use crate::config::StackConfig;
    use crate::ids::{RequestId, SeqNum};
    use crate::network::MockNetwork;
    use crate::node_addr::{test_node_addr_from_number, NodeAddr};
    use crate::routing::header::{RoutingHeader, RoutingKind};
    use crate::routing::path::Path;
    use crate::routing::RouteController;
    use crate::socket::channel::Channel;
    use crate::socket::error::SocketError;
    use crate::socket::Socket;

    type Sent = Arc<StdMutex<Vec<TransportHeader>>>;

    fn addr(n: u16) -> NodeAddr {
        test_node_addr_from_number(n)
    }

    fn local() -> Channel {
        Channel::new(addr(2), 7)
    }

    fn peer() -> Channel {
        Channel::new(addr(1), 40000)
    }

    fn stranger() -> Channel {
        Channel::new(addr(3), 40001)
    }

    fn reply_from(n: u16) -> Vec<u8> {
        let mut buf = BytesMut::new();
        RoutingHeader {
            kind: RoutingKind::Reply,
            destination: addr(2),
            request_id: RequestId::from_raw(1),
            ttl: 20,
            path: Path::from_nodes(vec![addr(n), addr(2)]),
        }.ser(&mut buf);
        buf.to_vec()
    }

    /// a socket layer on node 2 with routes to its neighbours 1 and 3, recording every transport
    ///  header it sends
    async fn socket_layer() -> (Arc<SocketLayer>, Sent) {
        let sent: Sent = Default::default();

        let mut network = MockNetwork::new();
        network.expect_local_addr()
            .return_const(addr(2));
        let s = sent.clone();
        network.expect_send_packet()
            .returning(move |_, header, payload| {
                let mut buf = header;
                RoutingHeader::deser(&mut buf, 20).unwrap();
                s.lock().unwrap().push(TransportHeader::deser(&mut buf).unwrap());
                Ok(header.len() + payload.len())
            });
        network.expect_broadcast_packet()
            .returning(|_, _| Ok(()));

        let config = Arc::new(StackConfig {
            route_ttl: None,
            ..Default::default()
        });
        let router = Arc::new(RouteController::new(config.clone(), Arc::new(network)));
        router.on_packet(&reply_from(1)).await;
        router.on_packet(&reply_from(3)).await;

        (Arc::new(SocketLayer::new(config, router)), sent)
    }

    /// binds port 7 with local seq 5 and ack 3, connected to `peer()` unless listening
    async fn bind_socket(layer: &SocketLayer, role: Role, state: SocketState, awaiting_ack: bool) -> Arc<SocketShared> {
        let ctx = layer.ctx.clone();
        let shared = layer.ctx.ports()
            .bind_listener(7, |port| Arc::new(SocketShared::new(ctx, port, role)))
            .unwrap();
        {
            let mut data = shared.data.lock().await;
            data.state = state;
            if state != SocketState::Listening {
                data.remote = Some(peer());
            }
            data.seq = SeqNum::from_raw(5);
            data.ack = SeqNum::from_raw(3);
            data.awaiting_ack = awaiting_ack;
        }
        shared
    }

    async fn receive(layer: &SocketLayer, source: Channel, message_type: MessageType, seq: u32, ack: u32, payload: &[u8]) {
        let mut buf = BytesMut::new();
        TransportHeader {
            source,
            destination: local(),
            message_type,
            seq: SeqNum::from_raw(seq),
            ack: SeqNum::from_raw(ack),
        }.ser(&mut buf);
        buf.put_slice(payload);
        layer.on_packet(buf.freeze()).await;

        // replies are spawned
        time::sleep(Duration::from_millis(1)).await;
    }

    fn outbound(sent: &Sent) -> Vec<(Channel, MessageType, u32, u32)> {
        sent.lock().unwrap().iter()
            .map(|h| (h.destination, h.message_type, h.seq.to_raw(), h.ack.to_raw()))
            .collect()
    }

    #[rstest]
    #[case::data_in_order(Role::Listener, SocketState::Established, false, peer(), MessageType::Ack, 4, 5, b"x", SocketState::Established, Some(peer()), 1, false, vec![(peer(), MessageType::Ack, 5, 4)])]
    #[case::data_while_sending(Role::Listener, SocketState::Sending, true, peer(), MessageType::Ack, 4, 5, b"x", SocketState::Sending, Some(peer()), 1, true, vec![(peer(), MessageType::Ack, 5, 4)])]
    #[case::duplicate_data(Role::Listener, SocketState::Established, false, peer(), MessageType::Ack, 3, 5, b"x", SocketState::Established, Some(peer()), 0, false, vec![(peer(), MessageType::Ack, 5, 3)])]
    #[case::out_of_sequence(Role::Listener, SocketState::Established, false, peer(), MessageType::Ack, 6, 5, b"x", SocketState::Established, Some(peer()), 0, false, vec![])]
    #[case::ack(Role::Listener, SocketState::Sending, true, peer(), MessageType::Ack, 3, 5, b"", SocketState::Sending, Some(peer()), 0, true, vec![])]
    #[case::stale_ack(Role::Listener, SocketState::Sending, true, peer(), MessageType::Ack, 3, 4, b"", SocketState::Sending, Some(peer()), 0, false, vec![])]
    #[case::synack(Role::Client, SocketState::Handshaking, true, peer(), MessageType::SynAck, 9, 5, b"", SocketState::Handshaking, Some(peer()), 0, true, vec![(peer(), MessageType::Ack, 5, 9)])]
    #[case::duplicate_synack(Role::Client, SocketState::Established, false, peer(), MessageType::SynAck, 3, 5, b"", SocketState::Established, Some(peer()), 0, false, vec![(peer(), MessageType::Ack, 5, 3)])]
    #[case::synack_for_listener(Role::Listener, SocketState::Sending, true, peer(), MessageType::SynAck, 9, 5, b"", SocketState::Sending, Some(peer()), 0, false, vec![])]
    #[case::syn_while_listening(Role::Listener, SocketState::Listening, false, peer(), MessageType::Syn, 1, 0, b"", SocketState::Listening, Some(peer()), 0, false, vec![])]
    #[case::fin(Role::Listener, SocketState::Established, false, peer(), MessageType::Fin, 4, 5, b"", SocketState::Closing, Some(peer()), 0, false, vec![])]
    #[case::fin_while_closing(Role::Listener, SocketState::Closing, false, peer(), MessageType::Fin, 4, 5, b"", SocketState::Closing, Some(peer()), 0, false, vec![(peer(), MessageType::Ack, 5, 4)])]
    #[case::fin_while_listening(Role::Listener, SocketState::Listening, false, peer(), MessageType::Fin, 4, 5, b"", SocketState::Listening, None, 0, false, vec![])]
    #[case::wrong_peer(Role::Listener, SocketState::Established, false, stranger(), MessageType::Ack, 4, 5, b"x", SocketState::Established, Some(peer()), 0, false, vec![(stranger(), MessageType::Fin, 5, 3)])]
    #[case::wrong_peer_fin(Role::Listener, SocketState::Established, false, stranger(), MessageType::Fin, 4, 5, b"", SocketState::Established, Some(peer()), 0, false, vec![])]
    #[case::closed(Role::Listener, SocketState::Closed, false, peer(), MessageType::Ack, 4, 5, b"x", SocketState::Closed, Some(peer()), 0, false, vec![])]
    fn test_on_packet(
        #[case] role: Role,
        #[case] state: SocketState,
        #[case] awaiting_ack: bool,
        #[case] source: Channel,
        #[case] message_type: MessageType,
        #[case] seq: u32,
        #[case] ack: u32,
        #[case] payload: &[u8],
        #[case] expected_state: SocketState,
        #[case] expected_remote: Option<Channel>,
        #[case] expected_queued: usize,
        #[case] expected_ack_received: bool,
        #[case] expected_replies: Vec<(Channel, MessageType, u32, u32)>,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        rt.block_on(async {
            let (layer, sent) = socket_layer().await;
            let shared = bind_socket(&layer, role, state, awaiting_ack).await;

            receive(&layer, source, message_type, seq, ack, payload).await;

            let data = shared.data.lock().await;
            assert_eq!(data.state, expected_state);
            assert_eq!(data.remote, expected_remote);
            assert_eq!(data.mailbox.len(), expected_queued);
            assert_eq!(data.ack_received, expected_ack_received);
            assert_eq!(outbound(&sent), expected_replies);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_fin_fails_send_and_receive() {
        let (layer, sent) = socket_layer().await;
        let socket = Socket { shared: bind_socket(&layer, Role::Listener, SocketState::Established, false).await };

        let s = socket.clone();
        let sending = tokio::spawn(async move { s.send(b"abc").await });
        let s = socket.clone();
        let receiving = tokio::spawn(async move {
            let mut buf = [0u8; 10];
            s.receive(&mut buf).await
        });
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(outbound(&sent), vec![(peer(), MessageType::Ack, 6, 3)]);

        receive(&layer, peer(), MessageType::Fin, 4, 5, b"").await;
        assert_eq!(sending.await.unwrap(), Err(SocketError::SendError { bytes_sent: 0 }));
        assert_eq!(receiving.await.unwrap(), Err(SocketError::ReceiveError));
        assert_eq!(socket.state().await, SocketState::Closing);
        assert!(layer.is_port_bound(7));

        time::sleep(layer.ctx.config.close_grace_period).await;
        assert_eq!(socket.state().await, SocketState::Closed);
        assert!(!layer.is_port_bound(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_survives_fin_during_handshake() {
        let (layer, sent) = socket_layer().await;
        let l = layer.clone();
        let listening = tokio::spawn(async move { l.listen(7).await });
        time::sleep(Duration::from_millis(1)).await;

        receive(&layer, peer(), MessageType::Syn, 1, 0, b"").await;
        assert_eq!(outbound(&sent), vec![(peer(), MessageType::SynAck, 1, 1)]);

        receive(&layer, peer(), MessageType::Fin, 2, 1, b"").await;
        let shared = layer.ctx.ports().get(7).unwrap();
        assert_eq!(shared.data.lock().await.state, SocketState::Listening);

        time::sleep(layer.ctx.config.close_grace_period + Duration::from_secs(2)).await;
        assert!(layer.is_port_bound(7));
        assert!(!listening.is_finished());

        receive(&layer, stranger(), MessageType::Syn, 1, 0, b"").await;
        assert_eq!(outbound(&sent), vec![
            (peer(), MessageType::SynAck, 1, 1),
            (stranger(), MessageType::SynAck, 1, 1),
        ]);
        receive(&layer, stranger(), MessageType::Ack, 1, 1, b"").await;

        let socket = listening.await.unwrap().unwrap();
        assert_eq!(socket.remote().await, Some(stranger()));
        assert_eq!(socket.state().await, SocketState::Established);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fin_is_not_acknowledged_by_duplicate_data_ack() {
        let (layer, sent) = socket_layer().await;
        let socket = Socket { shared: bind_socket(&layer, Role::Listener, SocketState::Established, false).await };

        let s = socket.clone();
        let closing = tokio::spawn(async move { s.close().await });
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(outbound(&sent), vec![(peer(), MessageType::Fin, 6, 3)]);

        receive(&layer, peer(), MessageType::Ack, 3, 5, b"").await;
        assert!(!closing.is_finished());

        receive(&layer, peer(), MessageType::Ack, 3, 6, b"").await;
        closing.await.unwrap();
        assert_eq!(socket.state().await, SocketState::Closed);
        assert!(!layer.is_port_bound(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retransmits_drop_cached_route() {
        let (layer, _) = socket_layer().await;
        let socket = Socket { shared: bind_socket(&layer, Role::Listener, SocketState::Established, false).await };
        assert!(layer.ctx.router.cached_path(addr(1)).await.is_some());

        assert_eq!(socket.send(b"abc").await, Err(SocketError::SendError { bytes_sent: 0 }));
        assert_eq!(layer.ctx.router.cached_path(addr(1)).await, None);
        assert!(layer.ctx.router.cached_path(addr(3)).await.is_some());
    }
}
