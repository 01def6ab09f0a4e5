//! Process-wide consensus counters.
//!
//! Plain atomics, readable at any time without touching the state store's
//! lock. The harness prints a [`MetricsSnapshot`] in its final report.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct ConsensusMetrics {
    proposals_started: AtomicU64,
    proposals_committed: AtomicU64,
    proposals_aborted: AtomicU64,
    proposals_expired: AtomicU64,
    votes_cast: AtomicU64,
    commits_applied: AtomicU64,
    messages_dropped: AtomicU64,
    recoveries_completed: AtomicU64,
    recoveries_failed: AtomicU64,
    recovery_tiebreaks: AtomicU64,
}

impl ConsensusMetrics {
    pub fn proposal_started(&self) {
        self.proposals_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn proposal_committed(&self) {
        self.proposals_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn proposal_aborted(&self) {
        self.proposals_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn proposal_expired(&self) {
        self.proposals_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn vote_cast(&self) {
        self.votes_cast.fetch_add(1, Ordering::Relaxed);
    }

    pub fn commit_applied(&self) {
        self.commits_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn recovery_completed(&self) {
        self.recoveries_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn recovery_failed(&self) {
        self.recoveries_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn recovery_tiebreak(&self) {
        self.recovery_tiebreaks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            proposals_started: self.proposals_started.load(Ordering::Relaxed),
            proposals_committed: self.proposals_committed.load(Ordering::Relaxed),
            proposals_aborted: self.proposals_aborted.load(Ordering::Relaxed),
            proposals_expired: self.proposals_expired.load(Ordering::Relaxed),
            votes_cast: self.votes_cast.load(Ordering::Relaxed),
            commits_applied: self.commits_applied.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            recoveries_completed: self.recoveries_completed.load(Ordering::Relaxed),
            recoveries_failed: self.recoveries_failed.load(Ordering::Relaxed),
            recovery_tiebreaks: self.recovery_tiebreaks.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub proposals_started: u64,
    pub proposals_committed: u64,
    pub proposals_aborted: u64,
    pub proposals_expired: u64,
    pub votes_cast: u64,
    pub commits_applied: u64,
    pub messages_dropped: u64,
    pub recoveries_completed: u64,
    pub recoveries_failed: u64,
    pub recovery_tiebreaks: u64,
}
