//! End-to-end scenarios running the transport over real loopback UDP
//! sockets, optionally through a fault-injecting relay for loss scenarios.

use std::net::UdpSocket;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ripplenet::Endpoint;

fn start_server() -> (Endpoint, mpsc::Receiver<Vec<u8>>) {
    let server = Endpoint::new(0);
    let (tx, rx) = mpsc::channel();

    server.on_new_connection(move |conn| {
        let tx = tx.clone();
        conn.on_message(move |payload| {
            let _ = tx.send(payload.to_vec());
        });
    });

    server.listen().expect("server failed to bind");
    (server, rx)
}

/// Like [`start_server`], but echoes every received payload back to its
/// sender prefixed with `"Echo: "`, mirroring the chat layer's demo server.
fn start_echo_server() -> (Arc<Endpoint>, mpsc::Receiver<Vec<u8>>) {
    let server = Arc::new(Endpoint::new(0));
    let (tx, rx) = mpsc::channel();

    let echo_endpoint = server.clone();
    server.on_new_connection(move |conn| {
        let tx = tx.clone();
        let echo_endpoint = echo_endpoint.clone();
        let reply_conn = conn.clone();
        conn.on_message(move |payload| {
            let _ = tx.send(payload.to_vec());
            let mut reply = b"Echo: ".to_vec();
            reply.extend_from_slice(payload);
            let _ = echo_endpoint.send(&reply_conn, &reply);
        });
    });

    server.listen().expect("server failed to bind");
    (server, rx)
}

fn recv_within(rx: &mpsc::Receiver<Vec<u8>>, timeout: Duration) -> Option<Vec<u8>> {
    rx.recv_timeout(timeout).ok()
}

#[test]
fn echo_round_trip() {
    let (server, server_rx) = start_echo_server();
    let server_addr = server.local_addr().unwrap();

    let client = Endpoint::new(0);
    let (client_tx, client_rx) = mpsc::channel();
    let conn = client
        .connect(server_addr, Duration::from_secs(5))
        .expect("client failed to connect");
    conn.on_message(move |payload| {
        let _ = client_tx.send(payload.to_vec());
    });

    client.send(&conn, b"Hello, Server!").unwrap();
    let received = recv_within(&server_rx, Duration::from_secs(2)).expect("server never got it");
    assert_eq!(received, b"Hello, Server!");

    let echoed = recv_within(&client_rx, Duration::from_secs(2)).expect("client never got echo");
    assert_eq!(echoed, b"Echo: Hello, Server!");

    let stats_server = server.stats();
    assert!(stats_server.packets_received > 0);
    assert_eq!(stats_server.checksum_errors, 0);

    let stats_client = client.stats();
    assert!(stats_client.packets_received > 0);
    assert_eq!(stats_client.checksum_errors, 0);

    client.shutdown();
    server.shutdown();
}

#[test]
fn burst_of_ten_arrives_in_order() {
    let (server, server_rx) = start_server();
    let server_addr = server.local_addr().unwrap();

    let client = Endpoint::new(0);
    let conn = client
        .connect(server_addr, Duration::from_secs(5))
        .unwrap();

    for i in 1..=10 {
        client
            .send(&conn, format!("Message {i}").as_bytes())
            .unwrap();
        thread::sleep(Duration::from_millis(100));
    }

    let mut received = Vec::new();
    for _ in 0..10 {
        received.push(recv_within(&server_rx, Duration::from_secs(2)).expect("missing message"));
    }

    let expected: Vec<Vec<u8>> = (1..=10)
        .map(|i| format!("Message {i}").into_bytes())
        .collect();
    assert_eq!(received, expected);
    assert_eq!(server.stats().messages_received, 10);

    client.shutdown();
    server.shutdown();
}

#[test]
fn large_payload_is_chunked_and_reassembled_in_order() {
    let (server, server_rx) = start_server();
    let server_addr = server.local_addr().unwrap();

    let client = Endpoint::new(0);
    let conn = client
        .connect(server_addr, Duration::from_secs(5))
        .unwrap();

    let payload = vec![b'X'; 3000];
    client.send(&conn, &payload).unwrap();

    let mut reassembled = Vec::new();
    for _ in 0..3 {
        let chunk = recv_within(&server_rx, Duration::from_secs(2)).expect("missing chunk");
        reassembled.extend(chunk);
    }

    assert_eq!(reassembled, payload);
    assert!(client.stats().packets_sent >= 3 + 2); // 3 data packets + handshake

    client.shutdown();
    server.shutdown();
}

#[test]
fn clean_channel_never_retransmits() {
    let (server, server_rx) = start_server();
    let server_addr = server.local_addr().unwrap();

    let client = Endpoint::new(0);
    let conn = client
        .connect(server_addr, Duration::from_secs(5))
        .unwrap();

    for i in 0..10 {
        client.send(&conn, format!("msg-{i}").as_bytes()).unwrap();
    }

    for _ in 0..10 {
        recv_within(&server_rx, Duration::from_secs(2)).expect("missing message");
    }

    // Give the timer loop a couple of ticks to prove it finds nothing due.
    thread::sleep(Duration::from_millis(300));

    let stats = server.stats();
    assert_eq!(stats.packets_retransmitted, 0);
    assert_eq!(stats.out_of_order_packets, 0);

    client.shutdown();
    server.shutdown();
}

/// A tiny deterministic PRNG so loss scenarios are reproducible without
/// pulling in a dependency the core has no other use for.
struct Lcg(u64);

impl Lcg {
    fn next_f64(&mut self) -> f64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1);
        ((self.0 >> 11) as f64) / ((1u64 << 53) as f64)
    }
}

/// The handshake itself carries no retransmission safety net (SYN packets
/// never enter a send window), so the relay never drops it — loss
/// scenarios exercise the data-plane retransmission path only.
fn is_handshake_flag(datagram: &[u8]) -> bool {
    const SYN: u8 = 0x04;
    datagram.len() > 1 && datagram[1] & SYN != 0
}

/// Forwards datagrams between two fixed addresses, dropping some according
/// to `should_drop`, standing in for the lossy network link between a real
/// client socket and a real server socket.
struct FaultyRelay {
    stop: Arc<Mutex<bool>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl FaultyRelay {
    fn spawn(
        client_facing: UdpSocket,
        server_addr: std::net::SocketAddr,
        should_drop: impl Fn(&mut Lcg) -> bool + Send + 'static,
    ) -> (Self, std::net::SocketAddr) {
        let relay_to_server = UdpSocket::bind("127.0.0.1:0").unwrap();
        relay_to_server.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        client_facing
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();

        let relay_addr = client_facing.local_addr().unwrap();
        let stop = Arc::new(Mutex::new(false));
        let should_drop = Arc::new(Mutex::new(should_drop));
        let rng = Arc::new(Mutex::new(Lcg(0x2545F4914F6CDD1D)));
        let known_client: Arc<Mutex<Option<std::net::SocketAddr>>> = Arc::new(Mutex::new(None));

        let client_to_server = {
            let client_facing = client_facing.try_clone().unwrap();
            let relay_to_server = relay_to_server.try_clone().unwrap();
            let stop = stop.clone();
            let should_drop = should_drop.clone();
            let rng = rng.clone();
            let known_client = known_client.clone();

            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    if *stop.lock().unwrap() {
                        return;
                    }
                    let Ok((n, from)) = client_facing.recv_from(&mut buf) else {
                        continue;
                    };
                    *known_client.lock().unwrap() = Some(from);
                    let drop = !is_handshake_flag(&buf[..n])
                        && should_drop.lock().unwrap()(&mut rng.lock().unwrap());
                    if !drop {
                        let _ = relay_to_server.send_to(&buf[..n], server_addr);
                    }
                }
            })
        };

        let server_to_client = {
            let stop = stop.clone();
            let should_drop = should_drop.clone();
            let rng = rng.clone();
            let known_client = known_client.clone();

            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    if *stop.lock().unwrap() {
                        return;
                    }
                    let Ok((n, _from)) = relay_to_server.recv_from(&mut buf) else {
                        continue;
                    };
                    let Some(client_addr) = *known_client.lock().unwrap() else {
                        continue;
                    };
                    let drop = !is_handshake_flag(&buf[..n])
                        && should_drop.lock().unwrap()(&mut rng.lock().unwrap());
                    if !drop {
                        let _ = client_facing.send_to(&buf[..n], client_addr);
                    }
                }
            })
        };

        (
            FaultyRelay {
                stop,
                handles: vec![client_to_server, server_to_client],
            },
            relay_addr,
        )
    }
}

impl Drop for FaultyRelay {
    fn drop(&mut self) {
        *self.stop.lock().unwrap() = true;
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[test]
fn random_five_percent_loss_still_delivers_all_in_order() {
    let (server, server_rx) = start_server();
    let server_addr = server.local_addr().unwrap();

    let client_facing = UdpSocket::bind("127.0.0.1:0").unwrap();
    let (_relay, relay_addr) = FaultyRelay::spawn(client_facing, server_addr, |rng| {
        rng.next_f64() < 0.05
    });

    let client = Endpoint::new(0);
    let conn = client
        .connect(relay_addr, Duration::from_secs(5))
        .unwrap();

    for i in 0..20 {
        client.send(&conn, format!("m{i}").as_bytes()).unwrap();
    }

    let mut received = Vec::new();
    for _ in 0..20 {
        received.push(
            recv_within(&server_rx, Duration::from_secs(10)).expect("message lost past recovery"),
        );
    }

    let expected: Vec<Vec<u8>> = (0..20).map(|i| format!("m{i}").into_bytes()).collect();
    assert_eq!(received, expected);
    assert!(client.stats().packets_retransmitted > 0);

    client.shutdown();
    server.shutdown();
}

#[test]
fn bursty_loss_still_delivers_all_in_order() {
    let (server, server_rx) = start_server();
    let server_addr = server.local_addr().unwrap();

    let client_facing = UdpSocket::bind("127.0.0.1:0").unwrap();
    let counter = Arc::new(Mutex::new(0u32));
    let (_relay, relay_addr) = FaultyRelay::spawn(client_facing, server_addr, move |_rng| {
        let mut n = counter.lock().unwrap();
        *n += 1;
        // Drop four consecutive packets out of every twenty.
        (*n % 20) < 4
    });

    let client = Endpoint::new(0);
    let conn = client
        .connect(relay_addr, Duration::from_secs(5))
        .unwrap();

    for i in 0..30 {
        client.send(&conn, format!("b{i}").as_bytes()).unwrap();
    }

    let mut received = Vec::new();
    for _ in 0..30 {
        received.push(
            recv_within(&server_rx, Duration::from_secs(15)).expect("message lost past recovery"),
        );
    }

    let expected: Vec<Vec<u8>> = (0..30).map(|i| format!("b{i}").into_bytes()).collect();
    assert_eq!(received, expected);

    client.shutdown();
    server.shutdown();
}
