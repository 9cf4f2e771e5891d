use std::sync::Arc;
use std::time::Duration;

use ripplenet::Endpoint;

fn main() {
    env_logger::init();

    let endpoint = Arc::new(Endpoint::new(9090));

    let echo_endpoint = endpoint.clone();
    endpoint.on_new_connection(move |conn| {
        println!(">>> connection {} from {}", conn.id(), conn.peer_addr());

        let echo_endpoint = echo_endpoint.clone();
        let reply_conn = conn.clone();
        conn.on_message(move |payload| {
            println!(
                ">>> read {} bytes from connection {}",
                payload.len(),
                reply_conn.id()
            );
            if let Err(e) = echo_endpoint.send(&reply_conn, payload) {
                eprintln!(">>> echo failed: {e}");
            }
        });

        conn.on_disconnect(|| {
            println!(">>> connection closed");
        });
    });

    endpoint.listen().expect("failed to bind endpoint");
    println!(">>> listening on port 9090");

    loop {
        std::thread::sleep(Duration::from_secs(5));
        let stats = endpoint.stats();
        println!(
            ">>> messages_received={} packets_retransmitted={}",
            stats.messages_received, stats.packets_retransmitted
        );
    }
}
