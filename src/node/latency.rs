// # Per-node latency table
//
// Bounded mapping of probe domain to an EWMA of observed RTTs. Capacity is
// enforced by least-recently-updated eviction so a node probed against many
// one-off domains cannot grow without bound.
//
// The EWMA uses a half-life decay: the weight given to a new sample grows
// with the time elapsed since the previous one,
// `ewma += (sample - ewma) * (1 - exp(-dt / half_life))`.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySample {
    pub ewma_ns: i64,
    pub last_updated_ns: i64,
}

#[derive(Debug)]
pub struct LatencyTable {
    cap: usize,
    entries: HashMap<String, LatencySample>,
    // Least-recently-updated domain at the front.
    order: VecDeque<String>,
}

impl LatencyTable {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Record one RTT observation for `domain`.
    pub fn observe(&mut self, domain: &str, rtt: Duration, now_ns: i64, half_life: Duration) {
        let sample_ns = rtt.as_nanos() as i64;
        let next = match self.entries.get(domain) {
            Some(prev) => {
                let dt = (now_ns - prev.last_updated_ns).max(0) as f64;
                let half = half_life.as_nanos().max(1) as f64;
                let alpha = 1.0 - (-dt / half).exp();
                let ewma = prev.ewma_ns as f64 + (sample_ns as f64 - prev.ewma_ns as f64) * alpha;
                LatencySample {
                    ewma_ns: ewma as i64,
                    last_updated_ns: now_ns,
                }
            }
            None => LatencySample {
                ewma_ns: sample_ns,
                last_updated_ns: now_ns,
            },
        };
        self.insert(domain, next);
    }

    /// Boot-time restore of a persisted sample.
    pub fn restore(&mut self, domain: &str, sample: LatencySample) {
        self.insert(domain, sample);
    }

    pub fn get(&self, domain: &str) -> Option<LatencySample> {
        self.entries.get(domain).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &LatencySample)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Average EWMA across `domains` restricted to samples updated within
    /// `window` of `now_ns`. `None` when no domain has a fresh sample.
    pub fn authority_score(&self, domains: &[String], now_ns: i64, window: Duration) -> Option<f64> {
        let window_ns = window.as_nanos() as i64;
        let mut sum = 0.0;
        let mut n = 0u32;
        for d in domains {
            if let Some(s) = self.entries.get(d) {
                if now_ns - s.last_updated_ns <= window_ns {
                    sum += s.ewma_ns as f64;
                    n += 1;
                }
            }
        }
        if n == 0 {
            None
        } else {
            Some(sum / n as f64)
        }
    }

    fn insert(&mut self, domain: &str, sample: LatencySample) {
        if self.entries.insert(domain.to_string(), sample).is_some() {
            self.order.retain(|d| d != domain);
        }
        self.order.push_back(domain.to_string());
        while self.entries.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HALF: Duration = Duration::from_secs(600);

    #[test]
    fn test_first_sample_is_taken_verbatim() {
        let mut t = LatencyTable::new(8);
        t.observe("a.example", Duration::from_millis(120), 1_000, HALF);
        assert_eq!(
            t.get("a.example").unwrap().ewma_ns,
            Duration::from_millis(120).as_nanos() as i64
        );
    }

    #[test]
    fn test_ewma_moves_toward_new_sample() {
        let mut t = LatencyTable::new(8);
        let half_ns = HALF.as_nanos() as i64;
        t.observe("a.example", Duration::from_millis(100), 0, HALF);
        // One half-life later, a 200ms sample should pull the EWMA half way.
        t.observe("a.example", Duration::from_millis(200), half_ns, HALF);
        let got = t.get("a.example").unwrap().ewma_ns as f64 / 1e6;
        assert!((got - 150.0).abs() < 1.0, "expected ~150ms, got {got}ms");
    }

    #[test]
    fn test_tiny_dt_barely_moves_ewma() {
        let mut t = LatencyTable::new(8);
        t.observe("a.example", Duration::from_millis(100), 0, HALF);
        t.observe("a.example", Duration::from_millis(500), 1_000, HALF);
        let got = t.get("a.example").unwrap().ewma_ns as f64 / 1e6;
        assert!(got < 101.0, "expected ~100ms, got {got}ms");
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let mut t = LatencyTable::new(2);
        t.observe("one", Duration::from_millis(1), 1, HALF);
        t.observe("two", Duration::from_millis(2), 2, HALF);
        t.observe("three", Duration::from_millis(3), 3, HALF);
        assert_eq!(t.len(), 2);
        assert!(t.get("one").is_none());
        assert!(t.get("two").is_some());
        assert!(t.get("three").is_some());
    }

    #[test]
    fn test_update_refreshes_lru_position() {
        let mut t = LatencyTable::new(2);
        t.observe("one", Duration::from_millis(1), 1, HALF);
        t.observe("two", Duration::from_millis(2), 2, HALF);
        t.observe("one", Duration::from_millis(1), 3, HALF);
        t.observe("three", Duration::from_millis(3), 4, HALF);
        // "two" was least recently updated.
        assert!(t.get("two").is_none());
        assert!(t.get("one").is_some());
    }

    #[test]
    fn test_authority_score_window() {
        let mut t = LatencyTable::new(8);
        let domains = vec!["a.example".to_string(), "b.example".to_string()];
        let window = Duration::from_secs(10);
        assert!(t.authority_score(&domains, 0, window).is_none());

        t.observe("a.example", Duration::from_millis(100), 0, HALF);
        t.observe("b.example", Duration::from_millis(300), 0, HALF);
        let score = t
            .authority_score(&domains, 5_000_000_000, window)
            .unwrap();
        assert!((score - 200e6).abs() < 1.0);

        // Outside the window nothing is ready.
        assert!(t
            .authority_score(&domains, 20_000_000_000, window)
            .is_none());
    }
}
