pub mod channel;
mod dropoff;
pub mod error;
pub mod header;
pub mod mailbox;
pub mod port_table;
mod retransmit;
pub mod state;

use std::fmt::{Debug, Formatter};
use std::sync::{Arc, MutexGuard};

use bytes::BytesMut;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::StackConfig;
use crate::ids::SeqNum;
use crate::node_addr::NodeAddr;
use crate::routing::RouteController;
use crate::socket::channel::Channel;
use crate::socket::error::SocketError;
use crate::socket::header::{MessageType, TransportHeader};
use crate::socket::mailbox::Mailbox;
use crate::socket::port_table::{is_listener_port, PortTable};
use crate::socket::state::{Role, SocketState};

/// Everything the sockets of one node share
struct SocketContext {
    myself: NodeAddr,
    config: Arc<StackConfig>,
    router: Arc<RouteController>,
    ports: std::sync::Mutex<PortTable<SocketShared>>,
}

impl SocketContext {
    fn ports(&self) -> MutexGuard<'_, PortTable<SocketShared>> {
        self.ports.lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

struct SocketData {
    state: SocketState,
    remote: Option<Channel>,
    /// sequence number of the last packet this socket sent
    seq: SeqNum,
    /// sequence number of the last packet accepted from the peer
    ack: SeqNum,
    awaiting_ack: bool,
    ack_received: bool,
    /// set by `close`; aborts sends and receives that are in progress
    closed_locally: bool,
    close_timer: Option<JoinHandle<()>>,
    mailbox: Mailbox,
}

struct SocketShared {
    local: Channel,
    role: Role,
    ctx: Arc<SocketContext>,
    data: Mutex<SocketData>,
    /// notified when an acknowledgement or SYN arrives, or the state changes to closing
    ack_signal: Notify,
    /// notified when payload is queued, or the state changes to closing
    data_signal: Notify,
    /// sends are sequential, with one outstanding packet at a time
    send_lock: Mutex<()>,
}

impl SocketShared {
    fn new(ctx: Arc<SocketContext>, port: u16, role: Role) -> SocketShared {
        SocketShared {
            local: Channel::new(ctx.myself, port),
            role,
            ctx,
            data: Mutex::new(SocketData {
                state: match role {
                    Role::Listener => SocketState::Listening,
                    Role::Client => SocketState::Handshaking,
                },
                remote: None,
                seq: SeqNum::ZERO,
                ack: SeqNum::ZERO,
                awaiting_ack: false,
                ack_received: false,
                closed_locally: false,
                close_timer: None,
                mailbox: Mailbox::default(),
            }),
            ack_signal: Notify::new(),
            data_signal: Notify::new(),
            send_lock: Mutex::new(()),
        }
    }

    fn header(&self, remote: Channel, message_type: MessageType, seq: SeqNum, ack: SeqNum) -> TransportHeader {
        TransportHeader {
            source: self.local,
            destination: remote,
            message_type,
            seq,
            ack,
        }
    }

    fn wake_all(&self) {
        self.ack_signal.notify_waiters();
        self.data_signal.notify_waiters();
    }

    /// Sends a packet without waiting for an acknowledgement. This is spawned rather than
    ///  awaited because routing may need to discover a path, which must not block inbound
    ///  packet handling.
    fn spawn_reply(&self, header: TransportHeader) {
        let router = self.ctx.router.clone();
        tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(TransportHeader::SERIALIZED_LEN);
            header.ser(&mut buf);
            if let Err(e) = router.send(header.destination.addr, &buf, &[]).await {
                debug!("error sending {:?}: {}", header, e);
            }
        });
    }

    fn release_port(self: &Arc<Self>) {
        self.ctx.ports()
            .release(self.local.port, self);
    }

    async fn wait_for_syn(&self) -> Channel {
        loop {
            let notified = self.ack_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let data = self.data.lock().await;
                if data.state == SocketState::Listening {
                    if let Some(remote) = data.remote {
                        return remote;
                    }
                }
            }

            notified.await;
        }
    }
}

/// Releases a socket's port unless it is disarmed, so that a `listen` or `connect` call that is
///  abandoned before it completes frees its port
struct PortReservation {
    shared: Arc<SocketShared>,
    armed: bool,
}

impl PortReservation {
    fn new(shared: Arc<SocketShared>) -> PortReservation {
        PortReservation { shared, armed: true }
    }

    fn disarm(mut self) -> Arc<SocketShared> {
        self.armed = false;
        self.shared.clone()
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        if self.armed {
            self.shared.release_port();
        }
    }
}

/// The reliable, connection oriented transport: sockets that deliver a byte stream in order and
///  without loss, on top of unreliable multi-hop routing.
///
/// At most one packet per direction is unacknowledged at any time. Every packet is retransmitted
///  with exponential backoff until the peer acknowledges it, and the peer accepts only the packet
///  following the last one it accepted.
pub struct SocketLayer {
    ctx: Arc<SocketContext>,
}

impl SocketLayer {
    pub fn new(config: Arc<StackConfig>, router: Arc<RouteController>) -> SocketLayer {
        SocketLayer {
            ctx: Arc::new(SocketContext {
                myself: router.myself(),
                config,
                router,
                ports: std::sync::Mutex::new(PortTable::default()),
            }),
        }
    }

    pub fn num_bound_ports(&self) -> usize {
        self.ctx.ports().len()
    }

    pub fn is_port_bound(&self, port: u16) -> bool {
        self.ctx.ports().get(port).is_some()
    }

    /// Binds a listener port and waits for a client to connect. If a handshake fails, the port
    ///  goes back to listening. The returned socket is connected to the client and stays bound
    ///  to `port` until it is closed.
    pub async fn listen(&self, port: u16) -> Result<Socket, SocketError> {
        let ctx = self.ctx.clone();
        let shared = self.ctx.ports()
            .bind_listener(port, |port| Arc::new(SocketShared::new(ctx, port, Role::Listener)))?;
        let reservation = PortReservation::new(shared.clone());
        info!("listening on port {}", port);

        loop {
            let remote = shared.wait_for_syn().await;

            let synack = {
                let mut data = shared.data.lock().await;
                data.state = SocketState::Handshaking;
                data.seq = data.seq.next();
                data.ack = data.ack.next();
                data.state = SocketState::Sending;
                shared.header(remote, MessageType::SynAck, data.seq, data.ack)
            };
            debug!("SYN from {:?} on port {}", remote, port);

            match shared.send_and_wait(&synack, &[]).await {
                Ok(()) => {
                    shared.data.lock().await
                        .state = SocketState::Established;
                    info!("accepted connection from {:?} on port {}", remote, port);
                    return Ok(Socket { shared: reservation.disarm() });
                }
                Err(e) => {
                    debug!("handshake with {:?} failed, listening again: {}", remote, e);
                    let mut data = shared.data.lock().await;
                    if let Some(close_timer) = data.close_timer.take() {
                        close_timer.abort();
                    }
                    data.state = SocketState::Listening;
                    data.remote = None;
                    data.awaiting_ack = false;
                    data.ack_received = false;
                    data.seq = SeqNum::ZERO;
                    data.ack = SeqNum::ZERO;
                    data.mailbox = Mailbox::default();
                }
            }
        }
    }

    /// Connects to a listening peer from a newly allocated client port
    pub async fn connect(&self, addr: NodeAddr, port: u16) -> Result<Socket, SocketError> {
        if !is_listener_port(port) || addr == self.ctx.myself {
            return Err(SocketError::InvalidParams);
        }

        let ctx = self.ctx.clone();
        let shared = self.ctx.ports()
            .allocate_client(|port| Arc::new(SocketShared::new(ctx, port, Role::Client)))?;
        let reservation = PortReservation::new(shared.clone());

        let remote = Channel::new(addr, port);
        let syn = {
            let mut data = shared.data.lock().await;
            data.remote = Some(remote);
            data.seq = SeqNum::ZERO.next();
            shared.header(remote, MessageType::Syn, data.seq, data.ack)
        };
        debug!("connecting to {:?} from port {}", remote, shared.local.port);

        if let Err(e) = shared.send_and_wait(&syn, &[]).await {
            warn!("connecting to {:?} failed: {}", remote, e);
            let mut data = shared.data.lock().await;
            if let Some(close_timer) = data.close_timer.take() {
                close_timer.abort();
            }
            data.state = SocketState::Closed;
            return Err(SocketError::NoServer);
        }

        shared.data.lock().await
            .state = SocketState::Established;
        info!("connected to {:?} from port {}", remote, shared.local.port);
        Ok(Socket { shared: reservation.disarm() })
    }
}

/// A handle to a connected socket. Handles are cheap to clone and refer to the same connection.
#[derive(Clone)]
pub struct Socket {
    shared: Arc<SocketShared>,
}

impl Debug for Socket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Socket{{{:?}}}", self.shared.local)
    }
}

impl Socket {
    pub fn local(&self) -> Channel {
        self.shared.local
    }

    pub async fn remote(&self) -> Option<Channel> {
        self.shared.data.lock().await
            .remote
    }

    pub async fn state(&self) -> SocketState {
        self.shared.data.lock().await
            .state
    }

    /// Sends `buf`, split into fragments that fit into a single packet each. Returns when all
    ///  fragments were acknowledged. On failure, [SocketError::SendError] reports the number of
    ///  bytes that were acknowledged before.
    pub async fn send(&self, buf: &[u8]) -> Result<usize, SocketError> {
        let _send_guard = self.shared.send_lock.lock().await;

        let mut bytes_sent = 0;
        for fragment in buf.chunks(self.shared.ctx.config.max_fragment_size()) {
            let header = {
                let mut data = self.shared.data.lock().await;
                let Some(remote) = data.remote else {
                    return Err(SocketError::SendError { bytes_sent });
                };
                if data.state.is_closing() || data.closed_locally {
                    return Err(SocketError::SendError { bytes_sent });
                }
                data.seq = data.seq.next();
                data.state = SocketState::Sending;
                self.shared.header(remote, MessageType::Ack, data.seq, data.ack)
            };

            let result = self.shared.send_and_wait(&header, fragment).await;

            {
                let mut data = self.shared.data.lock().await;
                if data.state == SocketState::Sending {
                    data.state = SocketState::Established;
                }
            }

            if let Err(e) = result {
                debug!("sending fragment {:?} failed: {}", header.seq, e);
                return Err(SocketError::SendError { bytes_sent });
            }
            bytes_sent += fragment.len();
        }

        if buf.is_empty() && self.state().await.is_closing() {
            return Err(SocketError::SendError { bytes_sent: 0 });
        }
        Ok(bytes_sent)
    }

    /// Waits for payload from the peer and copies as many whole received packets into `buf` as
    ///  fit. Returns `Ok(0)` if `buf` is too small for the next packet.
    pub async fn receive(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        if buf.is_empty() {
            return Err(SocketError::InvalidParams);
        }

        loop {
            let notified = self.shared.data_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut data = self.shared.data.lock().await;
                if data.state.is_closing() || data.closed_locally {
                    return Err(SocketError::ReceiveError);
                }
                if let Some(len) = data.mailbox.take_into(buf) {
                    return Ok(len);
                }
            }

            notified.await;
        }
    }

    /// Closes the connection, notifying the peer on a best effort basis, and frees the port.
    ///  Sends and receives in progress fail. This never fails, and calling it repeatedly has no
    ///  further effect.
    pub async fn close(&self) {
        self.shared.data.lock().await
            .closed_locally = true;
        self.shared.wake_all();

        let _send_guard = self.shared.send_lock.lock().await;

        let fin = {
            let mut data = self.shared.data.lock().await;
            match (data.state, data.remote) {
                (SocketState::Closing | SocketState::Closed | SocketState::Listening, _) => None,
                (_, Some(remote)) => {
                    data.seq = data.seq.next();
                    Some(self.shared.header(remote, MessageType::Fin, data.seq, data.ack))
                }
                (_, None) => None,
            }
        };

        if let Some(fin) = fin {
            if let Err(e) = self.shared.send_and_wait(&fin, &[]).await {
                debug!("peer did not acknowledge FIN: {}", e);
            }
        }

        {
            let mut data = self.shared.data.lock().await;
            if let Some(close_timer) = data.close_timer.take() {
                close_timer.abort();
            }
            if data.state != SocketState::Closed {
                debug!("closed socket {:?}", self.shared.local);
            }
            data.state = SocketState::Closed;
        }
        self.shared.wake_all();
        self.shared.release_port();
    }
}
