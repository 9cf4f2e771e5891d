use std::time::Duration;

/// Protocol constants shared by every connection an [`crate::Endpoint`] owns.
///
/// Named once here instead of re-literalized at each call site, the way the
/// original groups them as class constants on its transport type.
pub struct Limits;

impl Limits {
    pub const VERSION: u8 = 1;
    pub const HEADER_SIZE: usize = 20;
    pub const MAX_PAYLOAD_SIZE: usize = 1024;
    pub const MAX_WINDOW_SIZE: usize = 10;
    /// Receive buffer is bounded to 2x the send window, per the spec's own
    /// suggested hardening against unbounded out-of-order memory growth.
    pub const MAX_RECEIVE_BUFFER: usize = 2 * Self::MAX_WINDOW_SIZE;

    pub const INITIAL_RTO: Duration = Duration::from_secs(1);
    pub const MIN_RTO: Duration = Duration::from_millis(100);
    pub const MAX_RTO: Duration = Duration::from_secs(30);

    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
    pub const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

    pub const RETRANSMIT_TICK: Duration = Duration::from_millis(100);
    pub const SEND_WINDOW_POLL: Duration = Duration::from_millis(10);
    pub const HANDSHAKE_POLL: Duration = Duration::from_millis(100);
    pub const SOCKET_RECV_TIMEOUT: Duration = Duration::from_secs(1);

    pub const RECV_BUF_SIZE: usize = 4096;
}
