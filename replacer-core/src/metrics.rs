use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared state for metrics
#[derive(Debug, Default)]
pub struct ReplacerMetrics {
    pub hooked_packets: AtomicU64,
    pub matched_rules: AtomicU64,
    pub dropped_exchanges: AtomicU64,
    pub match_timeouts: AtomicU64,
    pub skipped_rules: AtomicU64,
    // Extra repeat
    pub repeats_sent: AtomicU64,
    pub repeats_failed: AtomicU64,
    // Mirror path
    pub colored_flows: AtomicU64,
    pub extracted_data: AtomicU64,
    pub recovered_panics: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub hooked_packets: u64,
    pub matched_rules: u64,
    pub dropped_exchanges: u64,
    pub match_timeouts: u64,
    pub skipped_rules: u64,
    pub repeat: RepeatMetrics,
    pub colored_flows: u64,
    pub extracted_data: u64,
    pub recovered_panics: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepeatMetrics {
    pub sent: u64,
    pub failed: u64,
    pub success_rate: f64,
}

impl ReplacerMetrics {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let sent = self.repeats_sent.load(Ordering::Relaxed);
        let failed = self.repeats_failed.load(Ordering::Relaxed);
        let attempts = sent + failed;

        let success_rate = if attempts > 0 {
            (sent as f64 / attempts as f64) * 100.0
        } else {
            0.0
        };

        MetricsSnapshot {
            hooked_packets: self.hooked_packets.load(Ordering::Relaxed),
            matched_rules: self.matched_rules.load(Ordering::Relaxed),
            dropped_exchanges: self.dropped_exchanges.load(Ordering::Relaxed),
            match_timeouts: self.match_timeouts.load(Ordering::Relaxed),
            skipped_rules: self.skipped_rules.load(Ordering::Relaxed),
            repeat: RepeatMetrics {
                sent,
                failed,
                success_rate,
            },
            colored_flows: self.colored_flows.load(Ordering::Relaxed),
            extracted_data: self.extracted_data.load(Ordering::Relaxed),
            recovered_panics: self.recovered_panics.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let metrics = ReplacerMetrics::default();
        ReplacerMetrics::incr(&metrics.repeats_sent);
        ReplacerMetrics::incr(&metrics.repeats_sent);
        ReplacerMetrics::incr(&metrics.repeats_sent);
        ReplacerMetrics::incr(&metrics.repeats_failed);
        ReplacerMetrics::add(&metrics.matched_rules, 4);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.matched_rules, 4);
        assert_eq!(snapshot.repeat.sent, 3);
        assert_eq!(snapshot.repeat.success_rate, 75.0);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["repeat"]["failed"], 1);
    }
}
