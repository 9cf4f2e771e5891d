use std::io::{self, BufRead};
use std::time::Duration;

use ripplenet::Endpoint;

fn main() {
    env_logger::init();

    let endpoint = Endpoint::new(0);
    let conn = endpoint
        .connect("127.0.0.1:9090", Duration::from_secs(5))
        .expect("failed to connect");

    conn.on_message(|payload| {
        println!(">>> echo: {:?}", String::from_utf8_lossy(payload));
    });

    println!(">>> connected, type a line and press enter to send it");
    for line in io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        if let Err(e) = endpoint.send(&conn, line.as_bytes()) {
            eprintln!(">>> send failed: {e}");
            break;
        }
    }

    endpoint.shutdown();
}
