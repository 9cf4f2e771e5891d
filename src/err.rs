#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("endpoint is not running")]
    NotRunning,

    #[error("operation does not match endpoint mode (listening vs connecting)")]
    WrongMode,

    #[error("handshake did not complete within the timeout")]
    HandshakeTimeout,

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("connection is not established")]
    NotConnected,

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}
