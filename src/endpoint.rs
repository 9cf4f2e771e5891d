//! The transport's entry point: owns the datagram socket, the connection
//! table (listening mode) or the single connection (connecting mode), the
//! receive loop, the retransmission-timer loop, and the aggregate counters.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use socket2::{Domain, Socket, Type};

use crate::codec::{Flags, Packet};
use crate::config::Limits;
use crate::connection::{Connection, SendEntry};
use crate::err::Error;
use crate::stats::{CounterExt, Counters, Stats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Listening,
    Connecting,
}

type NewConnectionCallback = Arc<dyn Fn(Connection) + Send + Sync>;

#[derive(Default)]
struct Shared {
    connections: HashMap<SocketAddr, Connection>,
    client: Option<Connection>,
    on_new_connection: Option<NewConnectionCallback>,
}

struct Threads {
    receive: Option<JoinHandle<()>>,
    receive_done: Option<mpsc::Receiver<()>>,
    timer: Option<JoinHandle<()>>,
    timer_done: Option<mpsc::Receiver<()>>,
}

struct Inner {
    local_port: u16,
    mode: Mutex<Option<Mode>>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    running: AtomicBool,
    shared: Mutex<Shared>,
    threads: Mutex<Threads>,
    counters: Counters,
    started_at: Mutex<Instant>,
}

/// A transport endpoint: `listen()` to become a server demultiplexing many
/// peers, or `connect()` to become a client with a single connection.
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl Endpoint {
    /// Constructs an unstarted endpoint bound to `local_port` (0 lets the OS
    /// assign one once started).
    pub fn new(local_port: u16) -> Self {
        Endpoint {
            inner: Arc::new(Inner {
                local_port,
                mode: Mutex::new(None),
                socket: Mutex::new(None),
                running: AtomicBool::new(false),
                shared: Mutex::new(Shared::default()),
                threads: Mutex::new(Threads {
                    receive: None,
                    receive_done: None,
                    timer: None,
                    timer_done: None,
                }),
                counters: Counters::default(),
                started_at: Mutex::new(Instant::now()),
            }),
        }
    }

    fn running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Registers the callback invoked, exactly once per newly observed peer
    /// address, before any payload of theirs is delivered. Server-mode only.
    pub fn on_new_connection(&self, callback: impl Fn(Connection) + Send + Sync + 'static) {
        self.inner.shared.lock().unwrap().on_new_connection = Some(Arc::new(callback));
    }

    /// Binds and starts listening for peers. Idempotent if already listening;
    /// an error if the endpoint is already running as a client.
    pub fn listen(&self) -> Result<(), Error> {
        let mut mode = self.inner.mode.lock().unwrap();
        match *mode {
            Some(Mode::Listening) => return Ok(()),
            Some(Mode::Connecting) => return Err(Error::WrongMode),
            None => {}
        }

        let socket = bind_with_reuse_addr(self.inner.local_port)?;
        socket.set_read_timeout(Some(Limits::SOCKET_RECV_TIMEOUT))?;
        let socket = Arc::new(socket);

        *self.inner.socket.lock().unwrap() = Some(socket);
        *mode = Some(Mode::Listening);
        self.inner.running.store(true, Ordering::Release);
        *self.inner.started_at.lock().unwrap() = Instant::now();
        drop(mode);

        self.spawn_background_threads();

        info!(
            "transport started in listening mode on port {}",
            self.inner.local_port
        );
        Ok(())
    }

    /// Connects to `peer`, blocking until the handshake completes or
    /// `timeout` elapses (background progress continues either way).
    pub fn connect<A: ToSocketAddrs>(
        &self,
        peer: A,
        timeout: Duration,
    ) -> Result<Connection, Error> {
        let mut mode = self.inner.mode.lock().unwrap();
        if mode.is_some() {
            return Err(Error::WrongMode);
        }

        let peer_addr = peer
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "no address resolved",
            )))?;

        let socket = UdpSocket::bind(("0.0.0.0", self.inner.local_port))?;
        socket.set_read_timeout(Some(Limits::SOCKET_RECV_TIMEOUT))?;
        socket.connect(peer_addr)?;
        let socket = Arc::new(socket);

        let conn = Connection::new(peer_addr);
        self.inner.shared.lock().unwrap().client = Some(conn.clone());

        *self.inner.socket.lock().unwrap() = Some(socket);
        *mode = Some(Mode::Connecting);
        self.inner.running.store(true, Ordering::Release);
        *self.inner.started_at.lock().unwrap() = Instant::now();
        drop(mode);

        self.spawn_background_threads();

        self.send_raw(peer_addr, Flags::SYN, 0, 0, &[]);

        let deadline = Instant::now() + timeout;
        while !conn.is_established() {
            if Instant::now() >= deadline {
                warn!("handshake timeout connecting to {peer_addr}, continuing in background");
                break;
            }
            thread::sleep(Limits::HANDSHAKE_POLL);
        }

        info!("transport connected to {peer_addr} in connecting mode");
        Ok(conn)
    }

    fn spawn_background_threads(&self) {
        let receive_inner = self.inner.clone();
        let timer_inner = self.inner.clone();

        let (receive_tx, receive_done) = mpsc::channel();
        let (timer_tx, timer_done) = mpsc::channel();

        let mut threads = self.inner.threads.lock().unwrap();
        threads.receive = Some(thread::spawn(move || {
            receive_loop(receive_inner);
            let _ = receive_tx.send(());
        }));
        threads.receive_done = Some(receive_done);
        threads.timer = Some(thread::spawn(move || {
            timer_loop(timer_inner);
            let _ = timer_tx.send(());
        }));
        threads.timer_done = Some(timer_done);
    }

    fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.inner.socket.lock().unwrap().clone()
    }

    /// The address the endpoint's socket is bound to, once started.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.socket()
            .ok_or(Error::NotRunning)?
            .local_addr()
            .map_err(Error::Io)
    }

    fn send_raw(&self, peer: SocketAddr, flags: Flags, seq: u32, ack: u32, payload: &[u8]) {
        let Some(socket) = self.socket() else {
            return;
        };
        let packet = Packet::new(flags, seq, ack, payload.to_vec());
        let wire = packet.encode();
        match socket.send_to(&wire, peer) {
            Ok(n) => {
                self.inner.counters.packets_sent.inc();
                self.inner.counters.bytes_sent.add(n as u64);
            }
            Err(e) => warn!("send error to {peer}: {e}"),
        }
    }

    /// Sends `data` reliably and in order to `conn`, chunking it into
    /// pieces no larger than [`Limits::MAX_PAYLOAD_SIZE`].
    pub fn send(&self, conn: &Connection, data: &[u8]) -> Result<(), Error> {
        if !self.running() || !conn.is_connected() {
            return Err(Error::NotConnected);
        }

        let deadline = Instant::now() + Limits::HANDSHAKE_TIMEOUT;
        while !conn.is_established() {
            if Instant::now() >= deadline {
                return Err(Error::HandshakeTimeout);
            }
            if !self.running() {
                return Err(Error::NotRunning);
            }
            thread::sleep(Limits::HANDSHAKE_POLL);
        }

        self.inner.counters.messages_sent.inc();

        let peer_addr = conn.peer_addr();

        // Mirrors the original chunk comprehension: zero-length data
        // produces an empty chunk list, so no packet is ever emitted.
        for chunk in data.chunks(Limits::MAX_PAYLOAD_SIZE) {
            loop {
                if conn.send_window_len() < Limits::MAX_WINDOW_SIZE {
                    break;
                }
                if !self.running() {
                    return Err(Error::NotRunning);
                }
                thread::sleep(Limits::SEND_WINDOW_POLL);
            }

            let seq = {
                let mut inner = conn.0.lock().unwrap();
                let seq = inner.next_seq;
                inner.next_seq += 1;
                inner.send_window.push_back(SendEntry {
                    seq,
                    flags: Flags::DATA,
                    ack: 0,
                    payload: chunk.to_vec(),
                    last_send: Instant::now(),
                });
                inner.packet_times.insert(seq, Instant::now());
                seq
            };

            self.send_raw(peer_addr, Flags::DATA, seq, 0, chunk);
        }

        Ok(())
    }

    /// Snapshots the endpoint's counters and derived metrics.
    pub fn stats(&self) -> Stats {
        let started_at = *self.inner.started_at.lock().unwrap();
        self.inner.counters.snapshot(started_at)
    }

    /// Records an end-to-end latency sample (e.g. measured by a layer above
    /// the core that embeds and reads its own send timestamps) so that it is
    /// reflected in [`Self::stats`].
    pub fn record_latency(&self, sample: Duration) {
        self.inner.counters.record_latency(sample);
    }

    /// Stops the endpoint: best-effort FIN to every connected peer, joins
    /// the background threads, closes the socket. Idempotent.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }

        {
            // Consistent with `connect()`/`listen()`: acquire `mode` before
            // `shared` everywhere a caller might hold both, to avoid a
            // lock-order inversion between methods.
            let mode = self.inner.mode.lock().unwrap();
            let peers: Vec<Connection> = {
                let shared = self.inner.shared.lock().unwrap();
                match *mode {
                    Some(Mode::Listening) => shared.connections.values().cloned().collect(),
                    Some(Mode::Connecting) => shared.client.iter().cloned().collect(),
                    None => Vec::new(),
                }
            };
            drop(mode);

            for conn in peers {
                if conn.is_connected() {
                    let (peer, next_seq) = {
                        let inner = conn.0.lock().unwrap();
                        (inner.peer_addr, inner.next_seq)
                    };
                    self.send_raw(peer, Flags::FIN, next_seq, 0, &[]);
                }
            }
        }

        let mut threads = self.inner.threads.lock().unwrap();
        join_background_thread("receive", threads.receive.take(), threads.receive_done.take());
        join_background_thread("timer", threads.timer.take(), threads.timer_done.take());

        *self.inner.socket.lock().unwrap() = None;
        info!("transport stopped");
    }
}

/// Waits up to [`Limits::SHUTDOWN_JOIN_TIMEOUT`] for a background loop to
/// signal completion before joining it. On timeout the handle is dropped
/// without joining rather than blocking shutdown indefinitely; the thread
/// is left to finish (or already has, by the time the log line above
/// prints) on its own.
fn join_background_thread(
    name: &str,
    handle: Option<JoinHandle<()>>,
    done: Option<mpsc::Receiver<()>>,
) {
    let Some(handle) = handle else { return };
    match done.and_then(|rx| rx.recv_timeout(Limits::SHUTDOWN_JOIN_TIMEOUT).ok()) {
        Some(()) => {
            let _ = handle.join();
        }
        None => {
            warn!("{name} loop did not exit within the shutdown timeout, detaching it");
        }
    }
}

fn bind_with_reuse_addr(port: u16) -> Result<UdpSocket, Error> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    let addr: SocketAddr = ("0.0.0.0", port)
        .to_socket_addrs()?
        .next()
        .expect("0.0.0.0 always resolves");
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

fn get_or_create_connection(inner: &Arc<Inner>, addr: SocketAddr) -> (Connection, bool) {
    let mode = *inner.mode.lock().unwrap();
    let mut shared = inner.shared.lock().unwrap();

    match mode {
        Some(Mode::Connecting) => {
            let conn = shared
                .client
                .get_or_insert_with(|| Connection::new(addr))
                .clone();
            (conn, false)
        }
        _ => {
            if let Some(conn) = shared.connections.get(&addr) {
                (conn.clone(), false)
            } else {
                let conn = Connection::new(addr);
                shared.connections.insert(addr, conn.clone());
                (conn, true)
            }
        }
    }
}

fn receive_loop(inner: Arc<Inner>) {
    let mut buf = vec![0u8; Limits::RECV_BUF_SIZE];

    while inner.running.load(Ordering::Acquire) {
        let Some(socket) = inner.socket.lock().unwrap().clone() else {
            break;
        };

        match socket.recv_from(&mut buf) {
            Ok((n, addr)) => handle_datagram(&inner, &buf[..n], addr),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue
            }
            Err(e) => {
                if inner.running.load(Ordering::Acquire) {
                    warn!("receive error: {e}");
                }
            }
        }
    }
}

fn handle_datagram(inner: &Arc<Inner>, datagram: &[u8], addr: SocketAddr) {
    let Some(packet) = Packet::decode(datagram) else {
        inner.counters.checksum_errors.inc();
        return;
    };

    inner.counters.packets_received.inc();
    inner.counters.bytes_received.add(datagram.len() as u64);

    let (conn, is_new) = get_or_create_connection(inner, addr);

    if is_new {
        let callback = inner.shared.lock().unwrap().on_new_connection.clone();
        if let Some(cb) = callback {
            cb(conn.clone());
        }
    }

    {
        let mut c = conn.0.lock().unwrap();
        c.last_activity = Instant::now();
    }

    let endpoint = EndpointRef { inner };

    if packet.flags.contains(Flags::SYN) {
        handle_syn(&endpoint, &conn, &packet);
    } else if packet.flags.contains(Flags::ACK) {
        handle_ack(&endpoint, &conn, &packet);
    } else if packet.flags.contains(Flags::DATA) {
        handle_data(&endpoint, &conn, &packet);
    } else if packet.flags.contains(Flags::FIN) {
        handle_fin(&endpoint, &conn, &packet);
    }
}

/// A borrowed view of the endpoint used by the background threads to send
/// raw packets without needing a full [`Endpoint`] handle.
struct EndpointRef<'a> {
    inner: &'a Arc<Inner>,
}

impl EndpointRef<'_> {
    fn send_raw(&self, peer: SocketAddr, flags: Flags, seq: u32, ack: u32, payload: &[u8]) {
        let Some(socket) = self.inner.socket.lock().unwrap().clone() else {
            return;
        };
        let packet = Packet::new(flags, seq, ack, payload.to_vec());
        let wire = packet.encode();
        match socket.send_to(&wire, peer) {
            Ok(n) => {
                self.inner.counters.packets_sent.inc();
                self.inner.counters.bytes_sent.add(n as u64);
            }
            Err(e) => warn!("send error to {peer}: {e}"),
        }
    }
}

fn handle_syn(endpoint: &EndpointRef, conn: &Connection, packet: &Packet) {
    if packet.flags.contains(Flags::ACK) {
        // SYN|ACK: initiator completing the handshake.
        let (ack_seq, expected) = {
            let mut c = conn.0.lock().unwrap();
            c.expected_seq = packet.seq + 1;
            let ack_seq = c.next_seq;
            c.next_seq += 1;
            c.established = true;
            (ack_seq, c.expected_seq)
        };
        endpoint.send_raw(conn.peer_addr(), Flags::ACK, ack_seq, expected, &[]);
        info!("handshake complete for connection {}", conn.id());
    } else {
        // Plain SYN: responder side.
        let (syn_ack_seq, expected) = {
            let mut c = conn.0.lock().unwrap();
            c.expected_seq = packet.seq + 1;
            let syn_ack_seq = c.next_seq;
            c.next_seq += 1;
            (syn_ack_seq, c.expected_seq)
        };
        endpoint.send_raw(
            conn.peer_addr(),
            Flags::SYN | Flags::ACK,
            syn_ack_seq,
            expected,
            &[],
        );
        debug!("sent SYN|ACK for connection {}", conn.id());
    }
}

fn handle_ack(_endpoint: &EndpointRef, conn: &Connection, packet: &Packet) {
    let mut newly_established = false;
    {
        let mut c = conn.0.lock().unwrap();
        if !c.established && packet.ack > 0 {
            c.established = true;
            newly_established = true;
        }

        if let Some(send_time) = c.packet_times.remove(&packet.ack) {
            let rtt = Instant::now().saturating_duration_since(send_time);
            c.rtt.sample(rtt);
        }

        while let Some(front) = c.send_window.front() {
            if front.seq < packet.ack {
                c.send_window.pop_front();
            } else {
                break;
            }
        }
    }

    if newly_established {
        info!("handshake complete for connection {}", conn.id());
    }
}

fn handle_data(endpoint: &EndpointRef, conn: &Connection, packet: &Packet) {
    let mut delivered: Vec<Vec<u8>> = Vec::new();
    let (next_seq, expected_seq, callback) = {
        let mut c = conn.0.lock().unwrap();

        if packet.seq == c.expected_seq {
            delivered.push(packet.payload.clone());
            c.expected_seq += 1;
            while let Some(buffered) = c.receive_buffer.remove(&c.expected_seq) {
                delivered.push(buffered);
                c.expected_seq += 1;
            }
        } else if packet.seq > c.expected_seq {
            if c.receive_buffer.len() < Limits::MAX_RECEIVE_BUFFER
                || c.receive_buffer.contains_key(&packet.seq)
            {
                c.receive_buffer.insert(packet.seq, packet.payload.clone());
            } else {
                trace!(
                    "receive buffer full for connection {}, dropping out-of-order seq {}",
                    c.id,
                    packet.seq
                );
            }
            endpoint.inner.counters.out_of_order_packets.inc();
        }
        // packet.seq < c.expected_seq: duplicate, discarded silently.

        (c.next_seq, c.expected_seq, c.on_message.clone())
    };

    if !delivered.is_empty() {
        endpoint
            .inner
            .counters
            .messages_received
            .add(delivered.len() as u64);
        if let Some(cb) = callback {
            for payload in &delivered {
                cb(payload);
            }
        }
    }

    endpoint.send_raw(conn.peer_addr(), Flags::ACK, next_seq, expected_seq, &[]);
}

fn handle_fin(endpoint: &EndpointRef, conn: &Connection, packet: &Packet) {
    let (next_seq, callback) = {
        let mut c = conn.0.lock().unwrap();
        c.connected = false;
        (c.next_seq, c.on_disconnect.clone())
    };

    endpoint.send_raw(
        conn.peer_addr(),
        Flags::FIN | Flags::ACK,
        next_seq,
        packet.seq + 1,
        &[],
    );

    if let Some(cb) = callback {
        cb();
    }
}

fn timer_loop(inner: Arc<Inner>) {
    while inner.running.load(Ordering::Acquire) {
        thread::sleep(Limits::RETRANSMIT_TICK);
        if !inner.running.load(Ordering::Acquire) {
            break;
        }

        let mode = *inner.mode.lock().unwrap();
        let connections: Vec<Connection> = {
            let shared = inner.shared.lock().unwrap();
            match mode {
                Some(Mode::Listening) => shared.connections.values().cloned().collect(),
                Some(Mode::Connecting) => shared.client.iter().cloned().collect(),
                None => Vec::new(),
            }
        };

        let endpoint = EndpointRef { inner: &inner };

        for conn in connections {
            if !conn.is_connected() {
                continue;
            }

            let due: Vec<SendEntry> = {
                let mut c = conn.0.lock().unwrap();
                if !c.established {
                    continue;
                }
                let now = Instant::now();
                let rto = c.rtt.rto();
                let mut due = Vec::new();
                for entry in c.send_window.iter_mut() {
                    if now.saturating_duration_since(entry.last_send) > rto {
                        due.push(entry.clone());
                        entry.last_send = now;
                    }
                }
                due
            };

            for entry in due {
                endpoint.send_raw(
                    conn.peer_addr(),
                    entry.flags,
                    entry.seq,
                    entry.ack,
                    &entry.payload,
                );
                inner.counters.packets_retransmitted.inc();
            }
        }
    }
}
