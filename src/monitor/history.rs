use std::fmt;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;

/// Outcome of a single probe: the round trip time, or the fact that no
/// reply arrived before the next probe went out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeResult {
    pub rtt: Duration,
    pub lost: bool,
}

/// Aggregate snapshot computed from a [`History`].
///
/// All duration fields are zero when every recorded probe was lost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Metrics {
    pub packets_sent: usize,
    pub packets_lost: usize,
    #[serde(with = "duration_micros")]
    pub best: Duration,
    #[serde(with = "duration_micros")]
    pub worst: Duration,
    #[serde(with = "duration_micros")]
    pub median: Duration,
    #[serde(with = "duration_micros")]
    pub mean: Duration,
    #[serde(with = "duration_micros")]
    pub std_dev: Duration,
}

impl Metrics {
    pub fn loss_pct(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            self.packets_lost as f64 / self.packets_sent as f64 * 100.0
        }
    }
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent={} lost={} ({:.1}% loss) best={:?} worst={:?} median={:?} mean={:?} stddev={:?}",
            self.packets_sent,
            self.packets_lost,
            self.loss_pct(),
            self.best,
            self.worst,
            self.median,
            self.mean,
            self.std_dev,
        )
    }
}

/// Fixed-capacity ring of probe results for a single target.
pub struct History {
    inner: RwLock<Ring>,
}

struct Ring {
    results: Vec<ProbeResult>,
    count: usize,
    position: usize,
}

impl History {
    /// Creates a history holding up to `capacity` results.
    pub fn new(capacity: usize) -> History {
        assert!(capacity > 0, "history capacity must be positive");
        History {
            inner: RwLock::new(Ring {
                results: vec![ProbeResult::default(); capacity],
                count: 0,
                position: 0,
            }),
        }
    }

    /// Records one probe outcome, overwriting the oldest entry once the
    /// ring is full.
    pub fn add_result(&self, rtt: Duration, lost: bool) {
        let mut ring = self.inner.write();
        let capacity = ring.results.len();

        let position = ring.position;
        ring.results[position] = ProbeResult { rtt, lost };
        ring.position = (position + 1) % capacity;

        if ring.count < capacity {
            ring.count += 1;
        }
    }

    /// Aggregates the recorded results, or None when nothing was recorded.
    pub fn compute(&self) -> Option<Metrics> {
        self.inner.read().compute()
    }

    /// Like [`compute`](Self::compute), then atomically resets the ring.
    pub fn compute_and_clear(&self) -> Option<Metrics> {
        let mut ring = self.inner.write();
        let metrics = ring.compute();
        ring.count = 0;
        ring.position = 0;
        metrics
    }

    /// The recorded results, oldest first.
    pub fn snapshot(&self) -> Vec<ProbeResult> {
        let ring = self.inner.read();
        if ring.count < ring.results.len() {
            ring.results[..ring.count].to_vec()
        } else {
            let (tail, head) = ring.results.split_at(ring.position);
            head.iter().chain(tail).copied().collect()
        }
    }

    #[cfg(test)]
    fn count(&self) -> usize {
        self.inner.read().count
    }

    #[cfg(test)]
    fn position(&self) -> usize {
        self.inner.read().position
    }
}

impl Ring {
    fn compute(&self) -> Option<Metrics> {
        if self.count == 0 {
            return None;
        }

        let mut lost = 0;
        let mut data: Vec<f64> = Vec::with_capacity(self.count);
        let mut best = Duration::ZERO;
        let mut worst = Duration::ZERO;
        let mut extreme_found = false;
        let mut total = 0.0;

        // order within the ring is irrelevant for the statistics
        for result in &self.results[..self.count] {
            if result.lost {
                lost += 1;
                continue;
            }

            data.push(result.rtt.as_nanos() as f64);
            if !extreme_found || result.rtt < best {
                best = result.rtt;
            }
            if !extreme_found || result.rtt > worst {
                worst = result.rtt;
            }
            extreme_found = true;
            total += result.rtt.as_nanos() as f64;
        }

        let mut metrics = Metrics {
            packets_sent: self.count,
            packets_lost: lost,
            best,
            worst,
            ..Metrics::default()
        };

        if lost < self.count {
            let size = self.count - lost;
            let mean = total / size as f64;

            let sum_squares: f64 = data.iter().map(|rtt| (rtt - mean).powi(2)).sum();
            // divide by the sample count, not the mean
            let std_dev = (sum_squares / size as f64).sqrt();

            data.sort_by(f64::total_cmp);
            let median = if size % 2 == 0 {
                (data[size / 2 - 1] + data[size / 2]) / 2.0
            } else {
                data[size / 2]
            };

            metrics.mean = Duration::from_nanos(mean as u64);
            metrics.std_dev = Duration::from_nanos(std_dev as u64);
            metrics.median = Duration::from_nanos(median as u64);
        }

        Some(metrics)
    }
}

mod duration_micros {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_micros() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    fn ms(n: u64) -> Duration {
        MS * n as u32
    }

    #[test]
    fn compute_empty() {
        let history = History::new(4);
        assert!(history.compute().is_none());
    }

    #[test]
    fn compute_all_failed() {
        let history = History::new(4);
        history.add_result(Duration::from_nanos(2), true);

        let metrics = history.compute().unwrap();
        assert_eq!(metrics.packets_sent, 1);
        assert_eq!(metrics.packets_lost, 1);
        assert_eq!(metrics.best, Duration::ZERO);
        assert_eq!(metrics.worst, Duration::ZERO);
        assert_eq!(metrics.median, Duration::ZERO);
        assert_eq!(metrics.mean, Duration::ZERO);
        assert_eq!(metrics.std_dev, Duration::ZERO);
    }

    #[test]
    fn compute_median_parity() {
        let history = History::new(5);
        history.add_result(ms(300), false);
        history.add_result(ms(200), false);
        history.add_result(ms(100), false);
        history.add_result(Duration::ZERO, false);
        assert_eq!(history.compute().unwrap().median, ms(150));

        history.add_result(ms(400), false);
        assert_eq!(history.compute().unwrap().median, ms(200));
    }

    #[test]
    fn compute_mixed_losses() {
        let history = History::new(8);
        history.add_result(Duration::ZERO, false);
        history.add_result(ms(100), false);
        history.add_result(ms(100), false);
        history.add_result(Duration::ZERO, true);
        history.add_result(ms(100), false);

        assert_eq!(history.count(), 5);
        let metrics = history.compute().unwrap();
        assert_eq!(metrics.packets_sent, 5);
        assert_eq!(metrics.packets_lost, 1);
        assert_eq!(metrics.best, Duration::ZERO);
        assert_eq!(metrics.worst, ms(100));
        assert_eq!(metrics.mean, ms(75));
    }

    #[test]
    fn compute_running_statistics() {
        let history = History::new(8);
        history.add_result(ms(100), false);
        history.add_result(ms(100), false);
        history.add_result(Duration::ZERO, true);

        let metrics = history.compute().unwrap();
        assert_eq!(metrics.best, ms(100));
        assert_eq!(metrics.worst, ms(100));
        assert_eq!(metrics.mean, ms(100));
        assert_eq!(metrics.median, ms(100));
        assert_eq!(metrics.std_dev, Duration::ZERO);
        assert_eq!(metrics.packets_sent, 3);
        assert_eq!(metrics.packets_lost, 1);

        // results getting worse
        history.add_result(ms(200), false);
        history.add_result(ms(100), false);
        history.add_result(Duration::ZERO, true);

        let metrics = history.compute().unwrap();
        assert_eq!(metrics.best, ms(100));
        assert_eq!(metrics.worst, ms(200));
        assert_eq!(metrics.mean, ms(125));
        assert_eq!(metrics.median, ms(100));
        assert_eq!(metrics.std_dev, Duration::from_nanos(43_301_270));
        assert_eq!(metrics.packets_sent, 6);
        assert_eq!(metrics.packets_lost, 2);

        // finally something better
        history.add_result(Duration::ZERO, false);
        let metrics = history.compute().unwrap();
        assert_eq!(metrics.best, Duration::ZERO);
        assert_eq!(metrics.worst, ms(200));
        assert_eq!(metrics.mean, ms(100));
        assert_eq!(metrics.median, ms(100));
        assert_eq!(metrics.std_dev, Duration::from_nanos(63_245_553));
        assert_eq!(metrics.packets_sent, 7);
        assert_eq!(metrics.packets_lost, 2);
    }

    #[test]
    fn ring_saturates_at_capacity() {
        let history = History::new(3);
        assert_eq!(history.count(), 0);

        history.add_result(Duration::from_nanos(1), false);
        history.add_result(Duration::from_nanos(2), true);
        assert_eq!(history.count(), 2);
        assert_eq!(history.position(), 2);

        history.add_result(Duration::from_nanos(1), false);
        assert_eq!(history.count(), 3);
        assert_eq!(history.position(), 0);

        history.add_result(Duration::ZERO, false);
        assert_eq!(history.count(), 3);
        assert_eq!(history.position(), 1);
        assert_eq!(history.compute().unwrap().packets_lost, 1);

        // overwrite the lost entry
        history.add_result(Duration::ZERO, false);
        assert_eq!(history.compute().unwrap().packets_lost, 0);

        history.compute_and_clear();
        assert_eq!(history.count(), 0);
        assert_eq!(history.position(), 0);
    }

    #[test]
    fn snapshot_is_oldest_first() {
        let history = History::new(3);
        for n in 1..=2u64 {
            history.add_result(ms(n), false);
        }
        let rtts: Vec<_> = history.snapshot().iter().map(|r| r.rtt).collect();
        assert_eq!(rtts, vec![ms(1), ms(2)]);

        for n in 3..=5u64 {
            history.add_result(ms(n), false);
        }
        let rtts: Vec<_> = history.snapshot().iter().map(|r| r.rtt).collect();
        assert_eq!(rtts, vec![ms(3), ms(4), ms(5)]);
    }

    #[test]
    fn metrics_serialize_as_microseconds() {
        let metrics = Metrics {
            packets_sent: 2,
            packets_lost: 1,
            best: ms(1),
            worst: ms(3),
            median: ms(2),
            mean: ms(2),
            std_dev: ms(1),
        };
        let json = serde_json::to_value(metrics).unwrap();
        assert_eq!(json["packets_sent"], 2);
        assert_eq!(json["best"], 1000);
        assert_eq!(json["worst"], 3000);
    }
}
