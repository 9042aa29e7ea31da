use thiserror::Error;

/// Errors reported to applications using sockets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SocketError {
    #[error("invalid parameters")]
    InvalidParams,

    #[error("port is already in use")]
    PortInUse,

    #[error("all client ports are in use")]
    NoMorePorts,

    #[error("no server responded")]
    NoServer,

    /// `bytes_sent` is the number of bytes the peer acknowledged before sending failed
    #[error("send failed after {bytes_sent} bytes were acknowledged")]
    SendError { bytes_sent: usize },

    #[error("receive failed, connection is closed")]
    ReceiveError,
}
