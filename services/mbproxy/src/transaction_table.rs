//! Upstream transaction translation table
//!
//! Maps the transaction identifier the proxy used on the upstream connection
//! back to the client's own identifier and the client's reply queue.
//!
//! # Thread Safety
//! Uses `DashMap` for per-bucket locking. The forwarding loop inserts, the
//! response loop takes and the eviction sweep removes. `take` is a single
//! remove so a response can never be delivered twice.

use dashmap::DashMap;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::upstream::ReplySender;

/// Routing information for one request in flight upstream
#[derive(Debug, Clone)]
pub struct TranslationEntry {
    /// Transaction identifier chosen by the client
    pub client_transaction_id: u16,
    /// Reply queue of the originating session
    pub reply_tx: ReplySender,
    /// When the request was forwarded
    pub created_at: Instant,
}

/// Concurrent map from upstream transaction identifier to [`TranslationEntry`]
#[derive(Debug, Default)]
pub struct TransactionTable {
    entries: DashMap<u16, TranslationEntry>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Record a forwarded request
    ///
    /// Returns the entry previously stored under `upstream_id`, which only
    /// happens after the 16-bit counter wrapped onto a request that is still
    /// unanswered.
    pub fn insert(
        &self,
        upstream_id: u16,
        client_transaction_id: u16,
        reply_tx: ReplySender,
        now: Instant,
    ) -> Option<TranslationEntry> {
        let previous = self.entries.insert(
            upstream_id,
            TranslationEntry {
                client_transaction_id,
                reply_tx,
                created_at: now,
            },
        );

        if let Some(old) = &previous {
            warn!(
                server_transaction = upstream_id,
                client_transaction = old.client_transaction_id,
                "Upstream transaction id reused while still pending, previous request dropped"
            );
        }
        previous
    }

    /// Atomically look up and remove the entry for an upstream response
    pub fn take(&self, upstream_id: u16) -> Option<TranslationEntry> {
        self.entries.remove(&upstream_id).map(|(_, entry)| entry)
    }

    /// Remove every entry created at or before `cutoff`
    ///
    /// Waiting clients are not notified; they simply never get a reply for the
    /// evicted transaction. Returns the number of entries removed.
    pub fn evict_older_than(&self, cutoff: Instant) -> usize {
        let mut evicted = Vec::new();
        self.entries.retain(|upstream_id, entry| {
            if entry.created_at > cutoff {
                return true;
            }
            evicted.push((*upstream_id, entry.client_transaction_id, entry.created_at));
            false
        });

        // Logged after retain so no shard lock is held while writing
        for (upstream_id, client_transaction_id, created_at) in &evicted {
            warn!(
                server_transaction = *upstream_id,
                client_transaction = *client_transaction_id,
                age_secs = cutoff.saturating_duration_since(*created_at).as_secs(),
                "Deleted unanswered request"
            );
        }

        let evicted = evicted.len();
        if evicted > 0 {
            debug!("Evicted {} stale entries, {} pending", evicted, self.len());
        }
        evicted
    }

    /// Evict entries that have waited `staleness` or longer as of `now`
    pub fn evict_stale(&self, now: Instant, staleness: Duration) -> usize {
        match now.checked_sub(staleness) {
            Some(cutoff) => self.evict_older_than(cutoff),
            None => 0,
        }
    }

    pub fn contains(&self, upstream_id: u16) -> bool {
        self.entries.contains_key(&upstream_id)
    }

    /// Number of requests awaiting an upstream answer
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tracing_test::traced_test;

    const WINDOW: Duration = Duration::from_secs(300);

    #[tokio::test]
    async fn test_insert_and_take() {
        let table = TransactionTable::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        assert!(table.insert(1, 5, tx, Instant::now()).is_none());
        assert!(table.contains(1));
        assert_eq!(table.len(), 1);

        let entry = table.take(1).unwrap();
        assert_eq!(entry.client_transaction_id, 5);
        assert!(table.take(1).is_none());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_take_unknown_id() {
        let table = TransactionTable::new();
        assert!(table.take(77).is_none());
    }

    #[tokio::test]
    async fn test_insert_replaces_pending_entry() {
        let table = TransactionTable::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let now = Instant::now();

        table.insert(3, 10, tx.clone(), now);
        let previous = table.insert(3, 11, tx, now).unwrap();
        assert_eq!(previous.client_transaction_id, 10);
        assert_eq!(table.take(3).unwrap().client_transaction_id, 11);
    }

    #[tokio::test]
    async fn test_eviction_window() {
        let table = TransactionTable::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let t0 = Instant::now();
        table.insert(1, 5, tx, t0);

        // Still present just before the window closes
        assert_eq!(
            table.evict_stale(t0 + WINDOW - Duration::from_millis(1), WINDOW),
            0
        );
        assert!(table.contains(1));

        // Gone at the window boundary
        assert_eq!(table.evict_stale(t0 + WINDOW, WINDOW), 1);
        assert!(!table.contains(1));
    }

    #[tokio::test]
    async fn test_eviction_keeps_fresh_entries() {
        let table = TransactionTable::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let t0 = Instant::now();

        table.insert(1, 100, tx.clone(), t0);
        table.insert(2, 200, tx, t0 + Duration::from_secs(120));

        assert_eq!(table.evict_stale(t0 + WINDOW, WINDOW), 1);
        assert!(!table.contains(1));
        assert!(table.contains(2));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_eviction_logs_each_entry() {
        let table = TransactionTable::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let t0 = Instant::now();
        for id in 0..40u16 {
            table.insert(id, 1000 + id, tx.clone(), t0);
        }

        assert_eq!(table.evict_stale(t0 + WINDOW, WINDOW), 40);
        assert!(table.is_empty());
        assert!(logs_contain("Deleted unanswered request"));
        assert!(logs_contain("client_transaction=1039"));
        assert!(logs_contain("age_secs=300"));
    }

    #[tokio::test]
    async fn test_concurrent_take_delivers_once() {
        let table = Arc::new(TransactionTable::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        for id in 0..100u16 {
            table.insert(id, id, tx.clone(), Instant::now());
        }

        let mut handles = vec![];
        for _ in 0..4 {
            let table = table.clone();
            handles.push(tokio::spawn(async move {
                (0..100u16).filter(|id| table.take(*id).is_some()).count()
            }));
        }

        let mut taken = 0;
        for h in handles {
            taken += h.await.unwrap();
        }
        assert_eq!(taken, 100);
        assert!(table.is_empty());
    }
}
