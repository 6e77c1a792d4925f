//! Log fan-out: bounded per-model ring buffers with replay-then-tail
//! subscriptions.
//!
//! `append` never blocks: the buffer evicts its oldest entry and live
//! delivery rides a bounded broadcast channel, so a slow subscriber lags
//! out (and is cut by the SSE layer with an error frame) instead of
//! stalling the producer. `subscribe` snapshots the buffer and attaches the
//! live tail under one lock, so every subscriber sees a prefix of the
//! buffer followed by a strictly in-order tail.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::broadcast;

use crate::unix_ts;

/// Ring buffer capacity per model.
pub const BUFFER_CAPACITY: usize = 2000;

/// Outbound queue depth per subscriber; overflow drops the subscriber.
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

/// One captured line.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: f64,
    pub message: String,
}

struct ModelBuffer {
    entries: VecDeque<LogEntry>,
    tx: broadcast::Sender<LogEntry>,
}

impl ModelBuffer {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_QUEUE_DEPTH);
        Self {
            entries: VecDeque::with_capacity(BUFFER_CAPACITY),
            tx,
        }
    }
}

/// Per-model log statistics, for the logs API.
#[derive(Debug, Serialize)]
pub struct ModelLogStats {
    pub log_count: usize,
    pub subscriber_count: usize,
}

#[derive(Debug, Serialize)]
pub struct LogStats {
    pub total_models: usize,
    pub total_log_entries: usize,
    pub total_subscribers: usize,
    pub model_stats: BTreeMap<String, ModelLogStats>,
}

/// Multi-model log fan-out.
pub struct LogFanout {
    inner: Mutex<HashMap<String, ModelBuffer>>,
    capacity: usize,
}

impl Default for LogFanout {
    fn default() -> Self {
        Self::with_capacity(BUFFER_CAPACITY)
    }
}

impl LogFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Ensure a buffer exists for the model. Idempotent.
    pub fn register(&self, model: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.entry(model.to_string()).or_insert_with(ModelBuffer::new);
    }

    /// Append a line for a model. Always succeeds, evicting the oldest
    /// entry when the buffer is full.
    pub fn append(&self, model: &str, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: unix_ts(),
            message: message.into(),
        };

        let mut inner = self.inner.lock().unwrap();
        let buffer = inner
            .entry(model.to_string())
            .or_insert_with(ModelBuffer::new);

        if buffer.entries.len() >= self.capacity {
            buffer.entries.pop_front();
        }
        buffer.entries.push_back(entry.clone());

        // Errors only mean no live subscribers; the buffer is the record.
        let _ = buffer.tx.send(entry);
    }

    /// Snapshot of the current buffer plus a live tail receiver, taken
    /// atomically with respect to `append`.
    pub fn subscribe(&self, model: &str) -> (Vec<LogEntry>, broadcast::Receiver<LogEntry>) {
        let mut inner = self.inner.lock().unwrap();
        let buffer = inner
            .entry(model.to_string())
            .or_insert_with(ModelBuffer::new);
        let snapshot = buffer.entries.iter().cloned().collect();
        (snapshot, buffer.tx.subscribe())
    }

    /// Buffered entries for a model without subscribing.
    pub fn entries(&self, model: &str) -> Vec<LogEntry> {
        let inner = self.inner.lock().unwrap();
        inner
            .get(model)
            .map(|b| b.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop entries older than `keep_minutes` (0 wipes the buffer).
    /// Returns the number of entries removed.
    pub fn clear(&self, model: &str, keep_minutes: u64) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let Some(buffer) = inner.get_mut(model) else {
            return 0;
        };

        let before = buffer.entries.len();
        if keep_minutes == 0 {
            buffer.entries.clear();
        } else {
            let cutoff = unix_ts() - (keep_minutes * 60) as f64;
            buffer.entries.retain(|e| e.timestamp > cutoff);
        }
        before - buffer.entries.len()
    }

    /// Buffer occupancy and subscriber counts across all models.
    pub fn stats(&self) -> LogStats {
        let inner = self.inner.lock().unwrap();
        let mut model_stats = BTreeMap::new();
        let mut total_entries = 0;
        let mut total_subscribers = 0;

        for (model, buffer) in inner.iter() {
            let subscribers = buffer.tx.receiver_count();
            total_entries += buffer.entries.len();
            total_subscribers += subscribers;
            model_stats.insert(
                model.clone(),
                ModelLogStats {
                    log_count: buffer.entries.len(),
                    subscriber_count: subscribers,
                },
            );
        }

        LogStats {
            total_models: inner.len(),
            total_log_entries: total_entries,
            total_subscribers,
            model_stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[test]
    fn append_and_read_back() {
        let fanout = LogFanout::new();
        fanout.append("m1", "line 1");
        fanout.append("m1", "line 2");

        let entries = fanout.entries("m1");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "line 1");
        assert_eq!(entries[1].message, "line 2");
        assert!(entries[0].timestamp <= entries[1].timestamp);
    }

    #[test]
    fn buffer_evicts_oldest() {
        let fanout = LogFanout::with_capacity(3);
        for i in 0..5 {
            fanout.append("m1", format!("line {i}"));
        }

        let entries = fanout.entries("m1");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "line 2");
        assert_eq!(entries[2].message, "line 4");
    }

    #[tokio::test]
    async fn replay_then_tail_in_order() {
        let fanout = LogFanout::new();
        for i in 0..500 {
            fanout.append("m1", format!("L{i}"));
        }

        let (snapshot, mut rx) = fanout.subscribe("m1");
        assert_eq!(snapshot.len(), 500);
        assert_eq!(snapshot[0].message, "L0");
        assert_eq!(snapshot[499].message, "L499");

        fanout.append("m1", "L500");
        fanout.append("m1", "L501");
        fanout.append("m1", "L502");

        assert_eq!(rx.recv().await.unwrap().message, "L500");
        assert_eq!(rx.recv().await.unwrap().message, "L501");
        assert_eq!(rx.recv().await.unwrap().message, "L502");
    }

    #[tokio::test]
    async fn slow_subscriber_lags_out_and_producer_survives() {
        let fanout = LogFanout::new();
        let (_snapshot, mut rx) = fanout.subscribe("m1");

        // Overflow the subscriber queue without draining it.
        for i in 0..SUBSCRIBER_QUEUE_DEPTH + 10 {
            fanout.append("m1", format!("L{i}"));
        }

        match rx.recv().await {
            Err(RecvError::Lagged(n)) => assert!(n > 0),
            other => panic!("expected lag, got {other:?}"),
        }

        // Producer side is unaffected and new subscribers work.
        let (snapshot, _rx2) = fanout.subscribe("m1");
        assert_eq!(snapshot.len(), SUBSCRIBER_QUEUE_DEPTH + 10);
    }

    #[test]
    fn clear_wipes_or_keeps_by_horizon() {
        let fanout = LogFanout::new();
        fanout.append("m1", "old");
        fanout.append("m1", "new");

        // keep_minutes large enough: everything is newer than the horizon
        assert_eq!(fanout.clear("m1", 10), 0);
        assert_eq!(fanout.entries("m1").len(), 2);

        // keep_minutes = 0 wipes
        assert_eq!(fanout.clear("m1", 0), 2);
        assert!(fanout.entries("m1").is_empty());

        // clearing an unknown model is a no-op
        assert_eq!(fanout.clear("nope", 0), 0);
    }

    #[test]
    fn stats_counts_models_entries_subscribers() {
        let fanout = LogFanout::new();
        fanout.append("m1", "a");
        fanout.append("m1", "b");
        fanout.append("m2", "c");
        let (_snap, _rx) = fanout.subscribe("m1");

        let stats = fanout.stats();
        assert_eq!(stats.total_models, 2);
        assert_eq!(stats.total_log_entries, 3);
        assert_eq!(stats.total_subscribers, 1);
        assert_eq!(stats.model_stats["m1"].log_count, 2);
        assert_eq!(stats.model_stats["m1"].subscriber_count, 1);
        assert_eq!(stats.model_stats["m2"].subscriber_count, 0);
    }
}
