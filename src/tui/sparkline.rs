use crate::monitor::ProbeResult;

/// Unicode block characters for sparkline
const BLOCKS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

/// Generate a sparkline string from a result ring: one block per probe,
/// scaled between the window's best and worst RTT, '×' for lost probes.
pub fn sparkline_string(results: &[ProbeResult], width: usize) -> String {
    if results.is_empty() {
        return String::new();
    }

    let rtts: Vec<f64> = results
        .iter()
        .filter(|r| !r.lost)
        .map(|r| r.rtt.as_secs_f64() * 1000.0)
        .collect();

    if rtts.is_empty() {
        return "×".repeat(results.len().min(width));
    }

    let min_rtt = rtts.iter().cloned().fold(f64::INFINITY, f64::min);
    let max_rtt = rtts.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let range = if (max_rtt - min_rtt).abs() < 0.001 {
        1.0
    } else {
        max_rtt - min_rtt
    };

    let samples: Vec<_> = results.iter().rev().take(width).rev().collect();

    samples
        .iter()
        .map(|result| {
            if result.lost {
                '×'
            } else {
                let ms = result.rtt.as_secs_f64() * 1000.0;
                let normalized = (ms - min_rtt) / range;
                let idx = (normalized * 7.0).round() as usize;
                BLOCKS[idx.min(7)]
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ok(ms: u64) -> ProbeResult {
        ProbeResult {
            rtt: Duration::from_millis(ms),
            lost: false,
        }
    }

    const LOST: ProbeResult = ProbeResult {
        rtt: Duration::ZERO,
        lost: true,
    };

    #[test]
    fn scales_between_extremes() {
        let line = sparkline_string(&[ok(1), ok(100)], 10);
        assert_eq!(line.chars().count(), 2);
        assert_eq!(line.chars().next(), Some('▁'));
        assert_eq!(line.chars().last(), Some('█'));
    }

    #[test]
    fn losses_are_crosses() {
        assert_eq!(sparkline_string(&[LOST, LOST], 10), "××");
        let line = sparkline_string(&[ok(5), LOST], 10);
        assert_eq!(line.chars().last(), Some('×'));
    }

    #[test]
    fn clips_to_width() {
        let results: Vec<_> = (0..20u64).map(ok).collect();
        assert_eq!(sparkline_string(&results, 8).chars().count(), 8);
    }

    #[test]
    fn empty_ring_is_empty() {
        assert_eq!(sparkline_string(&[], 10), "");
    }
}
