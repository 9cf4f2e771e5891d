//! Aggregate counters and the derived metrics exposed through
//! [`crate::Endpoint::stats`].
//!
//! Counters are plain atomics, read without locking: per §5 they are
//! "monotonic counters, tolerated to be slightly stale."

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Default)]
pub(crate) struct Counters {
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub packets_retransmitted: AtomicU64,
    pub checksum_errors: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub out_of_order_packets: AtomicU64,
    pub latencies: Mutex<Vec<Duration>>,
}

impl Counters {
    pub fn record_latency(&self, sample: Duration) {
        self.latencies.lock().unwrap().push(sample);
    }
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

pub(crate) trait CounterExt {
    fn inc(&self);
    fn add(&self, by: u64);
}

impl CounterExt for AtomicU64 {
    fn inc(&self) {
        bump(self, 1);
    }
    fn add(&self, by: u64) {
        bump(self, by);
    }
}

/// A point-in-time snapshot of endpoint statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_retransmitted: u64,
    pub checksum_errors: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub out_of_order_packets: u64,

    pub goodput_msgs_per_sec: f64,
    pub retransmissions_per_kb: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub out_of_order_percentage: f64,
}

impl Counters {
    pub fn snapshot(&self, started_at: Instant) -> Stats {
        let packets_sent = self.packets_sent.load(Ordering::Relaxed);
        let packets_received = self.packets_received.load(Ordering::Relaxed);
        let bytes_sent = self.bytes_sent.load(Ordering::Relaxed);
        let bytes_received = self.bytes_received.load(Ordering::Relaxed);
        let packets_retransmitted = self.packets_retransmitted.load(Ordering::Relaxed);
        let checksum_errors = self.checksum_errors.load(Ordering::Relaxed);
        let messages_sent = self.messages_sent.load(Ordering::Relaxed);
        let messages_received = self.messages_received.load(Ordering::Relaxed);
        let out_of_order_packets = self.out_of_order_packets.load(Ordering::Relaxed);

        let elapsed = started_at.elapsed().as_secs_f64();
        let goodput_msgs_per_sec = if elapsed > 0.0 {
            messages_received as f64 / elapsed
        } else {
            0.0
        };

        let retransmissions_per_kb = if bytes_sent > 0 {
            (packets_retransmitted as f64 * 1024.0) / bytes_sent as f64
        } else {
            0.0
        };

        let (avg_latency_ms, p95_latency_ms) = {
            let latencies = self.latencies.lock().unwrap();
            if latencies.is_empty() {
                (0.0, 0.0)
            } else {
                let mut millis: Vec<f64> =
                    latencies.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
                millis.sort_by(|a, b| a.partial_cmp(b).unwrap());
                let avg = millis.iter().sum::<f64>() / millis.len() as f64;
                let idx = ((millis.len() as f64) * 0.95) as usize;
                let p95 = millis[idx.min(millis.len() - 1)];
                (avg, p95)
            }
        };

        let out_of_order_percentage = if packets_received > 0 {
            (out_of_order_packets as f64 / packets_received as f64) * 100.0
        } else {
            0.0
        };

        Stats {
            packets_sent,
            packets_received,
            bytes_sent,
            bytes_received,
            packets_retransmitted,
            checksum_errors,
            messages_sent,
            messages_received,
            out_of_order_packets,
            goodput_msgs_per_sec,
            retransmissions_per_kb,
            avg_latency_ms,
            p95_latency_ms,
            out_of_order_percentage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_counters_yield_zeroed_derived_stats() {
        let counters = Counters::default();
        let snapshot = counters.snapshot(Instant::now());
        assert_eq!(snapshot.packets_sent, 0);
        assert_eq!(snapshot.avg_latency_ms, 0.0);
        assert_eq!(snapshot.out_of_order_percentage, 0.0);
    }

    #[test]
    fn retransmissions_per_kb_matches_formula() {
        let counters = Counters::default();
        counters.bytes_sent.add(2048);
        counters.packets_retransmitted.add(4);
        let snapshot = counters.snapshot(Instant::now());
        assert_eq!(snapshot.retransmissions_per_kb, (4.0 * 1024.0) / 2048.0);
    }

    #[test]
    fn p95_latency_uses_the_highest_recorded_sample_for_small_sets() {
        let counters = Counters::default();
        for ms in [10, 20, 30, 40, 1000] {
            counters.record_latency(Duration::from_millis(ms));
        }
        let snapshot = counters.snapshot(Instant::now());
        assert_eq!(snapshot.p95_latency_ms, 1000.0);
    }

    #[test]
    fn out_of_order_percentage_matches_formula() {
        let counters = Counters::default();
        counters.packets_received.add(40);
        counters.out_of_order_packets.add(4);
        let snapshot = counters.snapshot(Instant::now());
        assert_eq!(snapshot.out_of_order_percentage, 10.0);
    }
}
