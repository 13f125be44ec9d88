//! Proxy traffic counters
//!
//! Counters are observational only: an unmatched response is still dropped,
//! the counter just records that it happened.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Shared, lock-free proxy counters
#[derive(Debug, Default)]
pub struct ProxyStats {
    requests_forwarded: AtomicU64,
    replies_delivered: AtomicU64,
    unmatched_responses: AtomicU64,
    orphaned_replies: AtomicU64,
    evicted_entries: AtomicU64,
    upstream_disconnects: AtomicU64,
    upstream_reconnects: AtomicU64,
    sessions_accepted: AtomicU64,
    sessions_active: AtomicU64,
}

/// Point-in-time copy of [`ProxyStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub requests_forwarded: u64,
    pub replies_delivered: u64,
    pub unmatched_responses: u64,
    /// Replies whose client session had already ended
    pub orphaned_replies: u64,
    pub evicted_entries: u64,
    /// Upstream connections lost after being established
    pub upstream_disconnects: u64,
    pub upstream_reconnects: u64,
    pub sessions_accepted: u64,
    pub sessions_active: u64,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_forwarded(&self) {
        self.requests_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.replies_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unmatched(&self) {
        self.unmatched_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_orphaned(&self) {
        self.orphaned_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evicted(&self, count: usize) {
        self.evicted_entries
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self) {
        self.upstream_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.upstream_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_opened(&self) {
        self.sessions_accepted.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        // Saturating: never wrap below zero
        let _ = self
            .sessions_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_forwarded: self.requests_forwarded.load(Ordering::Relaxed),
            replies_delivered: self.replies_delivered.load(Ordering::Relaxed),
            unmatched_responses: self.unmatched_responses.load(Ordering::Relaxed),
            orphaned_replies: self.orphaned_replies.load(Ordering::Relaxed),
            evicted_entries: self.evicted_entries.load(Ordering::Relaxed),
            upstream_disconnects: self.upstream_disconnects.load(Ordering::Relaxed),
            upstream_reconnects: self.upstream_reconnects.load(Ordering::Relaxed),
            sessions_accepted: self.sessions_accepted.load(Ordering::Relaxed),
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "forwarded={} delivered={} unmatched={} orphaned={} evicted={} disconnects={} reconnects={} sessions={}/{}",
            self.requests_forwarded,
            self.replies_delivered,
            self.unmatched_responses,
            self.orphaned_replies,
            self.evicted_entries,
            self.upstream_disconnects,
            self.upstream_reconnects,
            self.sessions_active,
            self.sessions_accepted,
        )
    }
}
