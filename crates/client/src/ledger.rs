//! Reconciliation ledger — bridges optimistic local sends and eventual
//! remote confirmation.
//!
//! All operations are synchronous registry mutations; confirmations arrive
//! via callback from the inbound router, never by the ledger blocking. A
//! `Pending` entry reaches exactly one terminal status exactly once —
//! re-delivered confirmations and late failures are no-ops, because network
//! retries can legitimately deliver the same confirmation twice.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::OperationError;

/// Lifecycle of an optimistically applied message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Pending,
    Confirmed,
    Failed,
}

/// One optimistic message tracked until the remote authority settles it.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    /// Client-generated id, stable for the message's lifetime.
    pub local_id: String,
    /// Sent to the remote side so the confirmation can be matched back.
    pub correlation_id: String,
    pub content: String,
    pub status: MessageStatus,
    /// Canonical id assigned by the server, merged in on confirmation.
    pub server_id: Option<String>,
    pub server_timestamp: Option<String>,
    pub error: Option<OperationError>,
    pub created_at: Instant,
}

/// Maintained tally of entry statuses; cheap enough to read on every render.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerStats {
    pub pending: usize,
    pub confirmed: usize,
    pub failed: usize,
}

/// Outcome of feeding a remote confirmation into the ledger.
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// A pending entry matched; the merged entry is returned.
    Confirmed(LedgerEntry),
    /// The matched entry was already terminal; nothing changed.
    AlreadySettled,
    /// No entry ever carried this correlation id. The message originated
    /// remotely (or the ledger was cleared) and should be treated as a new
    /// incoming message, not an error.
    NewRemote,
}

struct Inner {
    /// Entries keyed by local id.
    entries: HashMap<String, LedgerEntry>,
    /// correlation id → local id.
    by_correlation: HashMap<String, String>,
    stats: LedgerStats,
}

pub struct MessageLedger {
    inner: Mutex<Inner>,
    confirmation_timeout: Duration,
}

impl MessageLedger {
    pub fn new(confirmation_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                by_correlation: HashMap::new(),
                stats: LedgerStats::default(),
            }),
            confirmation_timeout,
        }
    }

    /// Register an optimistically applied message. Visible under `local_id`
    /// immediately; stays `Pending` until confirmed, failed or timed out.
    pub fn add_optimistic(&self, local_id: &str, correlation_id: &str, content: &str) {
        let mut inner = self.inner.lock().expect("ledger lock poisoned");
        if inner.entries.contains_key(local_id) {
            warn!(
                component = "ledger",
                event = "ledger.duplicate_local_id",
                local_id,
                "Optimistic message re-registered, ignoring"
            );
            return;
        }
        inner.entries.insert(
            local_id.to_string(),
            LedgerEntry {
                local_id: local_id.to_string(),
                correlation_id: correlation_id.to_string(),
                content: content.to_string(),
                status: MessageStatus::Pending,
                server_id: None,
                server_timestamp: None,
                error: None,
                created_at: Instant::now(),
            },
        );
        inner
            .by_correlation
            .insert(correlation_id.to_string(), local_id.to_string());
        inner.stats.pending += 1;
    }

    /// Feed a remote confirmation. Matches on correlation id; merges the
    /// server-assigned fields into the local entry on first confirmation.
    pub fn process_confirmation(
        &self,
        correlation_id: &str,
        server_id: &str,
        server_timestamp: &str,
    ) -> ReconcileOutcome {
        let mut inner = self.inner.lock().expect("ledger lock poisoned");
        let Some(local_id) = inner.by_correlation.get(correlation_id).cloned() else {
            return ReconcileOutcome::NewRemote;
        };
        let Some(entry) = inner.entries.get_mut(&local_id) else {
            return ReconcileOutcome::NewRemote;
        };
        if entry.status != MessageStatus::Pending {
            debug!(
                component = "ledger",
                event = "ledger.duplicate_confirmation",
                correlation_id,
                "Confirmation for already-settled entry, ignoring"
            );
            return ReconcileOutcome::AlreadySettled;
        }

        entry.status = MessageStatus::Confirmed;
        entry.server_id = Some(server_id.to_string());
        entry.server_timestamp = Some(server_timestamp.to_string());
        let merged = entry.clone();
        inner.stats.pending -= 1;
        inner.stats.confirmed += 1;
        ReconcileOutcome::Confirmed(merged)
    }

    /// Explicit failure path: the send itself errored, or the caller gave up.
    /// Returns false if the entry was unknown or already terminal.
    pub fn mark_failed(&self, local_id: &str, error: OperationError) -> bool {
        let mut inner = self.inner.lock().expect("ledger lock poisoned");
        let Some(entry) = inner.entries.get_mut(local_id) else {
            return false;
        };
        if entry.status != MessageStatus::Pending {
            return false;
        }
        entry.status = MessageStatus::Failed;
        entry.error = Some(error);
        inner.stats.pending -= 1;
        inner.stats.failed += 1;
        true
    }

    /// Like [`mark_failed`](Self::mark_failed) but keyed by correlation id,
    /// for server error replies.
    pub fn fail_by_correlation(&self, correlation_id: &str, error: OperationError) -> bool {
        let local_id = {
            let inner = self.inner.lock().expect("ledger lock poisoned");
            inner.by_correlation.get(correlation_id).cloned()
        };
        match local_id {
            Some(id) => self.mark_failed(&id, error),
            None => false,
        }
    }

    /// Move every entry pending longer than the configured window to
    /// `Failed(Timeout)`. Returns the local ids that were expired.
    pub fn sweep_timeouts(&self) -> Vec<String> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("ledger lock poisoned");
        let mut expired = Vec::new();
        for entry in inner.entries.values_mut() {
            if entry.status == MessageStatus::Pending
                && now.duration_since(entry.created_at) >= self.confirmation_timeout
            {
                entry.status = MessageStatus::Failed;
                entry.error = Some(OperationError::Timeout);
                expired.push(entry.local_id.clone());
            }
        }
        inner.stats.pending -= expired.len();
        inner.stats.failed += expired.len();
        for local_id in &expired {
            warn!(
                component = "ledger",
                event = "ledger.confirmation_timeout",
                local_id,
                "Optimistic message expired without confirmation"
            );
        }
        expired
    }

    /// Remove a terminal entry once the UI has consumed it. Pending entries
    /// are not removable; they are still awaiting settlement.
    pub fn acknowledge(&self, local_id: &str) -> Option<LedgerEntry> {
        let mut inner = self.inner.lock().expect("ledger lock poisoned");
        let status = inner.entries.get(local_id)?.status;
        if status == MessageStatus::Pending {
            return None;
        }
        let entry = inner.entries.remove(local_id)?;
        inner.by_correlation.remove(&entry.correlation_id);
        match status {
            MessageStatus::Confirmed => inner.stats.confirmed -= 1,
            MessageStatus::Failed => inner.stats.failed -= 1,
            MessageStatus::Pending => unreachable!(),
        }
        Some(entry)
    }

    pub fn get(&self, local_id: &str) -> Option<LedgerEntry> {
        let inner = self.inner.lock().expect("ledger lock poisoned");
        inner.entries.get(local_id).cloned()
    }

    pub fn stats(&self) -> LedgerStats {
        let inner = self.inner.lock().expect("ledger lock poisoned");
        inner.stats
    }
}
