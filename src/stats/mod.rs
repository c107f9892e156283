// Statistics collector module

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Thread-safe statistics collector using atomic operations.
pub struct StatsCollector {
    scenarios_started: AtomicU64,
    scenarios_completed: AtomicU64,
    scenarios_failed: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    retransmissions: AtomicU64,
    duplicates: AtomicU64,
    unrouted: AtomicU64,
    stale_routes: AtomicU64,
    status_codes: DashMap<u16, AtomicU64>,
    durations: Mutex<Vec<Duration>>,
    start_time: Instant,
}

/// A point-in-time snapshot of collected statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub elapsed: Duration,
    pub scenarios_started: u64,
    pub scenarios_completed: u64,
    pub scenarios_failed: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub retransmissions: u64,
    pub duplicates: u64,
    pub unrouted: u64,
    pub stale_routes: u64,
    pub duration_p50: Duration,
    pub duration_p99: Duration,
    pub status_codes: BTreeMap<u16, u64>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            scenarios_started: AtomicU64::new(0),
            scenarios_completed: AtomicU64::new(0),
            scenarios_failed: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            retransmissions: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            unrouted: AtomicU64::new(0),
            stale_routes: AtomicU64::new(0),
            status_codes: DashMap::new(),
            durations: Mutex::new(Vec::new()),
            start_time: Instant::now(),
        }
    }

    pub fn record_scenario_started(&self) {
        self.scenarios_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished scenario run and how long it took.
    pub fn record_scenario_finished(&self, ok: bool, took: Duration) {
        if ok {
            self.scenarios_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.scenarios_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.durations.lock().push(took);
    }

    pub fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a delivered inbound message; responses are also counted per status code.
    pub fn record_received(&self, status_code: Option<u16>) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        if let Some(code) = status_code {
            self.status_codes
                .entry(code)
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_retransmission(&self) {
        self.retransmissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unrouted(&self) {
        self.unrouted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_routes(&self, n: usize) {
        self.stale_routes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mut durations = self.durations.lock().clone();
        durations.sort_unstable();
        let status_codes = self
            .status_codes
            .iter()
            .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
            .collect();
        StatsSnapshot {
            elapsed: self.start_time.elapsed(),
            scenarios_started: self.scenarios_started.load(Ordering::Relaxed),
            scenarios_completed: self.scenarios_completed.load(Ordering::Relaxed),
            scenarios_failed: self.scenarios_failed.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            unrouted: self.unrouted.load(Ordering::Relaxed),
            stale_routes: self.stale_routes.load(Ordering::Relaxed),
            duration_p50: percentile(&durations, 50.0),
            duration_p99: percentile(&durations, 99.0),
            status_codes,
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Nearest-rank percentile of a sorted slice
fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scenarios: {} started, {} completed, {} failed | messages: {} sent, {} received | \
             retransmissions: {} | duplicates: {} | unrouted: {} | stale routes: {} | \
             run time p50 {:.1}ms p99 {:.1}ms",
            self.scenarios_started,
            self.scenarios_completed,
            self.scenarios_failed,
            self.messages_sent,
            self.messages_received,
            self.retransmissions,
            self.duplicates,
            self.unrouted,
            self.stale_routes,
            self.duration_p50.as_secs_f64() * 1000.0,
            self.duration_p99.as_secs_f64() * 1000.0,
        )?;
        if !self.status_codes.is_empty() {
            let codes: Vec<String> = self
                .status_codes
                .iter()
                .map(|(k, v)| format!("{}:{}", k, v))
                .collect();
            write!(f, " | status codes: {}", codes.join(" "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_new_collector_is_zero() {
        let snap = StatsCollector::new().snapshot();
        assert_eq!(snap.scenarios_started, 0);
        assert_eq!(snap.messages_sent, 0);
        assert_eq!(snap.duration_p50, Duration::ZERO);
        assert!(snap.status_codes.is_empty());
    }

    #[test]
    fn test_counters() {
        let stats = StatsCollector::new();
        stats.record_scenario_started();
        stats.record_scenario_finished(true, Duration::from_millis(10));
        stats.record_scenario_started();
        stats.record_scenario_finished(false, Duration::from_millis(30));
        stats.record_sent();
        stats.record_received(Some(180));
        stats.record_received(Some(200));
        stats.record_received(Some(200));
        stats.record_received(None);
        stats.record_retransmission();
        stats.record_duplicate();
        stats.record_unrouted();
        stats.record_stale_routes(3);

        let snap = stats.snapshot();
        assert_eq!(snap.scenarios_started, 2);
        assert_eq!(snap.scenarios_completed, 1);
        assert_eq!(snap.scenarios_failed, 1);
        assert_eq!(snap.messages_received, 4);
        assert_eq!(snap.status_codes.get(&200), Some(&2));
        assert_eq!(snap.status_codes.get(&180), Some(&1));
        assert_eq!(snap.stale_routes, 3);
        assert_eq!(snap.duration_p50, Duration::from_millis(10));
        assert_eq!(snap.duration_p99, Duration::from_millis(30));
    }

    #[test]
    fn test_display_contains_counts() {
        let stats = StatsCollector::new();
        stats.record_received(Some(486));
        let text = stats.snapshot().to_string();
        assert!(text.contains("1 received"));
        assert!(text.contains("486:1"));
    }

    #[test]
    fn test_concurrent_updates() {
        let stats = Arc::new(StatsCollector::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_sent();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.snapshot().messages_sent, 8000);
    }

    #[test]
    fn test_percentile() {
        let sorted: Vec<Duration> = (1..=100).map(Duration::from_millis).collect();
        assert_eq!(percentile(&sorted, 50.0), Duration::from_millis(50));
        assert_eq!(percentile(&sorted, 99.0), Duration::from_millis(99));
        assert_eq!(percentile(&sorted[..1], 99.0), Duration::from_millis(1));
    }
}
