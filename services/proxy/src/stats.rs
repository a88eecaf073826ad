// Per-topic traffic counters with a 60 s rollup schedule.
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Rollup cadence shared with the per-connection splice rate samplers.
pub const STATS_ROLLUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
pub struct TopicStats {
    bytes_in: AtomicU64,
    msgs_in: AtomicU64,
    // Snapshot taken at the previous rollup, for rate computation.
    bytes_at_rollup: AtomicU64,
    msgs_at_rollup: AtomicU64,
    rate_bytes_1m: AtomicU64,
    rate_msgs_1m: AtomicU64,
    // Rollup generation of the last write, for eviction ordering.
    touched_at: AtomicU64,
}

impl TopicStats {
    pub fn rate_bytes_1m(&self) -> u64 {
        self.rate_bytes_1m.load(Ordering::Relaxed)
    }

    pub fn rate_msgs_1m(&self) -> u64 {
        self.rate_msgs_1m.load(Ordering::Relaxed)
    }

    pub fn totals(&self) -> (u64, u64) {
        (
            self.bytes_in.load(Ordering::Relaxed),
            self.msgs_in.load(Ordering::Relaxed),
        )
    }
}

/// Registry of per-topic counters. Entries are created on first use and
/// evicted (least recently written first) once `max_entries` is exceeded,
/// so a proxy fronting an unbounded topic population stays bounded.
pub struct TopicStatsRegistry {
    topics: DashMap<String, Arc<TopicStats>>,
    max_entries: usize,
    generation: AtomicU64,
}

impl TopicStatsRegistry {
    pub fn new(max_entries: usize) -> Self {
        Self {
            topics: DashMap::new(),
            max_entries: max_entries.max(1),
            generation: AtomicU64::new(1),
        }
    }

    fn entry(&self, topic: &str) -> Arc<TopicStats> {
        if let Some(stats) = self.topics.get(topic) {
            return Arc::clone(&stats);
        }
        Arc::clone(
            &self
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| Arc::new(TopicStats::default())),
        )
    }

    /// Record message ingress observed while frames are still decoded
    /// (before splice mode disables the parser).
    pub fn record_messages(&self, topic: &str, messages: u64, bytes: u64) {
        let stats = self.entry(topic);
        stats.msgs_in.fetch_add(messages, Ordering::Relaxed);
        stats.bytes_in.fetch_add(bytes, Ordering::Relaxed);
        stats
            .touched_at
            .store(self.generation.load(Ordering::Relaxed), Ordering::Relaxed);
        metrics::counter!("pulsar_proxy_topic_msg_in", "topic" => topic.to_string())
            .increment(messages);
        metrics::counter!("pulsar_proxy_topic_bytes_in", "topic" => topic.to_string())
            .increment(bytes);
    }

    /// Record opaque splice bytes attributed to the connection's topic.
    pub fn record_bytes(&self, topic: &str, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let stats = self.entry(topic);
        stats.bytes_in.fetch_add(bytes, Ordering::Relaxed);
        stats
            .touched_at
            .store(self.generation.load(Ordering::Relaxed), Ordering::Relaxed);
        metrics::counter!("pulsar_proxy_topic_bytes_in", "topic" => topic.to_string())
            .increment(bytes);
    }

    pub fn get(&self, topic: &str) -> Option<Arc<TopicStats>> {
        self.topics.get(topic).map(|stats| Arc::clone(&stats))
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// One scheduled pass: compute 1-minute rates from the counter deltas,
    /// then evict the least recently written entries beyond the cap.
    pub fn rollup(&self) {
        self.generation.fetch_add(1, Ordering::Relaxed);
        for entry in self.topics.iter() {
            let stats = entry.value();
            let bytes = stats.bytes_in.load(Ordering::Relaxed);
            let msgs = stats.msgs_in.load(Ordering::Relaxed);
            let rate_bytes = bytes.saturating_sub(stats.bytes_at_rollup.swap(bytes, Ordering::Relaxed));
            let rate_msgs = msgs.saturating_sub(stats.msgs_at_rollup.swap(msgs, Ordering::Relaxed));
            stats.rate_bytes_1m.store(rate_bytes, Ordering::Relaxed);
            stats.rate_msgs_1m.store(rate_msgs, Ordering::Relaxed);
            metrics::gauge!("pulsar_proxy_topic_bytes_rate_1m", "topic" => entry.key().clone())
                .set(rate_bytes as f64);
            metrics::gauge!("pulsar_proxy_topic_msg_rate_1m", "topic" => entry.key().clone())
                .set(rate_msgs as f64);
        }
        self.evict_over_cap();
    }

    fn evict_over_cap(&self) {
        let excess = self.topics.len().saturating_sub(self.max_entries);
        if excess == 0 {
            return;
        }
        let mut candidates: Vec<(String, u64)> = self
            .topics
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.value().touched_at.load(Ordering::Relaxed),
                )
            })
            .collect();
        candidates.sort_by_key(|(_, touched)| *touched);
        for (topic, _) in candidates.into_iter().take(excess) {
            self.topics.remove(&topic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let registry = TopicStatsRegistry::new(16);
        registry.record_messages("persistent://t/n/a", 2, 100);
        registry.record_bytes("persistent://t/n/a", 50);
        let stats = registry.get("persistent://t/n/a").expect("stats");
        assert_eq!(stats.totals(), (150, 2));
    }

    #[test]
    fn rollup_computes_deltas_not_totals() {
        let registry = TopicStatsRegistry::new(16);
        registry.record_messages("persistent://t/n/a", 10, 1000);
        registry.rollup();
        let stats = registry.get("persistent://t/n/a").expect("stats");
        assert_eq!(stats.rate_bytes_1m(), 1000);
        assert_eq!(stats.rate_msgs_1m(), 10);

        // A quiet minute produces a zero rate, not the running total.
        registry.rollup();
        assert_eq!(stats.rate_bytes_1m(), 0);
        assert_eq!(stats.rate_msgs_1m(), 0);

        registry.record_messages("persistent://t/n/a", 1, 10);
        registry.rollup();
        assert_eq!(stats.rate_bytes_1m(), 10);
        assert_eq!(stats.rate_msgs_1m(), 1);
    }

    #[test]
    fn eviction_keeps_recently_written_topics() {
        let registry = TopicStatsRegistry::new(2);
        registry.record_messages("persistent://t/n/old", 1, 1);
        registry.rollup();
        registry.record_messages("persistent://t/n/warm", 1, 1);
        registry.rollup();
        registry.record_messages("persistent://t/n/hot", 1, 1);
        registry.rollup();
        assert_eq!(registry.len(), 2);
        assert!(registry.get("persistent://t/n/old").is_none());
        assert!(registry.get("persistent://t/n/hot").is_some());
    }

    #[test]
    fn zero_byte_record_is_a_noop() {
        let registry = TopicStatsRegistry::new(2);
        registry.record_bytes("persistent://t/n/a", 0);
        assert!(registry.is_empty());
    }
}
