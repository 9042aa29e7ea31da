#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SocketState {
    /// waiting for a client's SYN
    Listening,
    /// SYN sent or received, handshake in progress
    Handshaking,
    /// a packet is outstanding, waiting for the peer's acknowledgement
    Sending,
    Established,
    /// the peer closed the connection, the socket lingers for the grace period
    Closing,
    Closed,
}

impl SocketState {
    pub fn is_closing(&self) -> bool {
        matches!(self, SocketState::Closing | SocketState::Closed)
    }

    /// whether payload from the peer is accepted in this state
    pub fn accepts_data(&self) -> bool {
        matches!(self, SocketState::Established | SocketState::Sending)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    /// created by `listen`
    Listener,
    /// created by `connect`
    Client,
}
