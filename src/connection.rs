//! Per-peer connection state: sequence counters, the unacknowledged send
//! window, the out-of-order receive buffer, the RTT estimator, and the two
//! application delivery callbacks.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::codec::Flags;
use crate::config::Limits;
use crate::rtt::Estimator;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

pub(crate) fn next_connection_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// One entry in a connection's send window: a packet that has been emitted
/// but not yet acknowledged.
#[derive(Debug, Clone)]
pub(crate) struct SendEntry {
    pub seq: u32,
    pub flags: Flags,
    pub ack: u32,
    pub payload: Vec<u8>,
    pub last_send: Instant,
}

type MessageCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;
type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;

pub(crate) struct ConnectionInner {
    pub id: u64,
    pub peer_addr: SocketAddr,

    pub next_seq: u32,
    pub expected_seq: u32,

    pub send_window: VecDeque<SendEntry>,
    pub receive_buffer: HashMap<u32, Vec<u8>>,
    pub packet_times: HashMap<u32, Instant>,
    pub rtt: Estimator,

    pub established: bool,
    pub connected: bool,
    pub last_activity: Instant,

    pub on_message: Option<MessageCallback>,
    pub on_disconnect: Option<DisconnectCallback>,
}

impl ConnectionInner {
    fn new(peer_addr: SocketAddr) -> Self {
        ConnectionInner {
            id: next_connection_id(),
            peer_addr,
            next_seq: 0,
            expected_seq: 0,
            send_window: VecDeque::new(),
            receive_buffer: HashMap::new(),
            packet_times: HashMap::new(),
            rtt: Estimator::default(),
            established: false,
            connected: true,
            last_activity: Instant::now(),
            on_message: None,
            on_disconnect: None,
        }
    }
}

/// A handle to a connection, shared between the application and the
/// endpoint's background threads. Cheap to clone; all clones refer to the
/// same underlying state.
#[derive(Clone)]
pub struct Connection(pub(crate) Arc<Mutex<ConnectionInner>>);

impl Connection {
    pub(crate) fn new(peer_addr: SocketAddr) -> Self {
        Connection(Arc::new(Mutex::new(ConnectionInner::new(peer_addr))))
    }

    pub fn id(&self) -> u64 {
        self.0.lock().unwrap().id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.0.lock().unwrap().peer_addr
    }

    pub fn is_established(&self) -> bool {
        self.0.lock().unwrap().established
    }

    pub fn is_connected(&self) -> bool {
        self.0.lock().unwrap().connected
    }

    /// Registers the callback invoked, on the endpoint's receive-loop
    /// thread, once per delivered payload, in strictly ascending sequence
    /// order.
    pub fn on_message(&self, callback: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.0.lock().unwrap().on_message = Some(Arc::new(callback));
    }

    /// Registers the callback invoked once, on the receive-loop thread,
    /// when the peer sends FIN.
    pub fn on_disconnect(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.0.lock().unwrap().on_disconnect = Some(Arc::new(callback));
    }

    pub(crate) fn send_window_len(&self) -> usize {
        self.0.lock().unwrap().send_window.len()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.lock().unwrap();
        f.debug_struct("Connection")
            .field("id", &inner.id)
            .field("peer_addr", &inner.peer_addr)
            .field("connected", &inner.connected)
            .field("established", &inner.established)
            .finish()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_connection_starts_unestablished_at_seq_zero() {
        let conn = Connection::new("127.0.0.1:9".parse().unwrap());
        assert!(!conn.is_established());
        assert!(conn.is_connected());
        assert_eq!(conn.send_window_len(), 0);
    }

    #[test]
    fn two_handles_share_state() {
        let conn = Connection::new("127.0.0.1:9".parse().unwrap());
        let alias = conn.clone();
        alias.0.lock().unwrap().established = true;
        assert!(conn.is_established());
    }

    #[test]
    fn respects_the_window_bound() {
        let conn = Connection::new("127.0.0.1:9".parse().unwrap());
        {
            let mut inner = conn.0.lock().unwrap();
            for i in 0..Limits::MAX_WINDOW_SIZE as u32 {
                inner.send_window.push_back(SendEntry {
                    seq: i,
                    flags: Flags::DATA,
                    ack: 0,
                    payload: Vec::new(),
                    last_send: Instant::now(),
                });
            }
        }
        assert_eq!(conn.send_window_len(), Limits::MAX_WINDOW_SIZE);
    }
}
