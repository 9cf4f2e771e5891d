//! Jacobson/Karels-style smoothed round-trip-time estimator, driving the
//! per-connection retransmission timeout (RTO).

use std::time::Duration;

use crate::config::Limits;

#[derive(Debug, Clone, Copy)]
pub struct Estimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
}

impl Default for Estimator {
    fn default() -> Self {
        Estimator {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: Limits::INITIAL_RTO,
        }
    }
}

impl Estimator {
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Feeds one RTT sample into the estimator and recomputes the RTO.
    pub fn sample(&mut self, sample: Duration) {
        let sample = sample.as_secs_f64();

        let (srtt, rttvar) = match self.srtt {
            None => (sample, sample / 2.0),
            Some(srtt) => {
                let srtt = srtt.as_secs_f64();
                let rttvar = self.rttvar.as_secs_f64();
                let err = sample - srtt;
                (srtt + 0.125 * err, rttvar + 0.25 * (err.abs() - rttvar))
            }
        };

        self.srtt = Some(Duration::from_secs_f64(srtt.max(0.0)));
        self.rttvar = Duration::from_secs_f64(rttvar.max(0.0));

        let rto = srtt + 4.0 * rttvar;
        let rto = Duration::from_secs_f64(rto.max(0.0));
        self.rto = rto.clamp(Limits::MIN_RTO, Limits::MAX_RTO);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_the_initial_rto() {
        let est = Estimator::default();
        assert_eq!(est.rto(), Limits::INITIAL_RTO);
    }

    #[test]
    fn first_sample_sets_srtt_and_half_variance() {
        let mut est = Estimator::default();
        est.sample(Duration::from_millis(200));
        // rto = srtt + 4*rttvar = 200ms + 4*100ms = 600ms
        assert_eq!(est.rto(), Duration::from_millis(600));
    }

    #[test]
    fn rto_stays_within_bounds_across_many_samples() {
        let mut est = Estimator::default();
        for ms in [1, 5000, 1, 60000, 2, 2, 2, 40000] {
            est.sample(Duration::from_millis(ms));
            assert!(est.rto() >= Limits::MIN_RTO);
            assert!(est.rto() <= Limits::MAX_RTO);
        }
    }

    #[test]
    fn converges_towards_a_stable_sample() {
        let mut est = Estimator::default();
        for _ in 0..50 {
            est.sample(Duration::from_millis(50));
        }
        let rto = est.rto();
        assert!(rto >= Duration::from_millis(50));
        assert!(rto < Duration::from_millis(100));
    }
}
