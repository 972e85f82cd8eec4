//! Operation serializer.
//!
//! Admits at most one in-flight thread-lifecycle operation per kind and
//! absorbs bursts of identical triggers. Rejected calls never run the
//! executor and never reach the wire: thread creation is not idempotent, so
//! a second click must be rejected, not queued behind the first.
//!
//! The per-kind slot is released on every exit path (success, error,
//! cancellation, panic) via a drop guard; generations keep a superseding
//! forced operation from having its slot cleared by the one it displaced.

use std::future::Future;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::OperationError;

/// Mutual-exclusion domain for thread-lifecycle operations. Different kinds
/// may run concurrently; two operations of the same kind may not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Create,
    Switch,
    Delete,
}

/// Outcome of an admitted or rejected operation. The serializer never
/// panics and never throws; every path lands here.
#[derive(Debug, Clone)]
pub struct OperationResult {
    pub success: bool,
    pub result_id: Option<String>,
    pub error: Option<OperationError>,
}

impl OperationResult {
    pub fn ok(result_id: impl Into<String>) -> Self {
        Self {
            success: true,
            result_id: Some(result_id.into()),
            error: None,
        }
    }

    pub fn ok_empty() -> Self {
        Self {
            success: true,
            result_id: None,
            error: None,
        }
    }

    pub fn err(error: OperationError) -> Self {
        Self {
            success: false,
            result_id: None,
            error: Some(error),
        }
    }
}

/// Per-call knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct OperationOptions {
    /// Bypass the debounce window, and supersede (cancel) a running
    /// operation of the same kind instead of being rejected by it.
    pub force: bool,
    /// Override the configured debounce window for this call.
    pub debounce_window: Option<Duration>,
}

#[derive(Default)]
struct KindSlot {
    busy: bool,
    generation: u64,
    last_accepted: Option<Instant>,
    cancel: Option<CancellationToken>,
}

/// The serializer itself: one admission slot per operation kind.
pub struct OperationGate {
    slots: DashMap<OperationKind, KindSlot>,
    debounce_window: Duration,
}

impl OperationGate {
    pub fn new(debounce_window: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            debounce_window,
        }
    }

    /// Admit and run one operation. The executor receives a cancellation
    /// token it must check cooperatively; it is invoked exactly once per
    /// admitted call and never for rejected ones.
    pub async fn start_operation<F, Fut>(
        &self,
        kind: OperationKind,
        target_id: Option<&str>,
        executor: F,
        options: OperationOptions,
    ) -> OperationResult
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = OperationResult>,
    {
        let token = CancellationToken::new();
        let window = options.debounce_window.unwrap_or(self.debounce_window);
        let generation;
        {
            let mut slot = self.slots.entry(kind).or_default();
            let now = Instant::now();

            if slot.busy {
                if options.force {
                    // Supersede: signal the running executor and take the slot.
                    if let Some(running) = slot.cancel.take() {
                        running.cancel();
                    }
                    info!(
                        component = "serializer",
                        event = "op.superseded",
                        kind = ?kind,
                        "Forced operation superseded a running one"
                    );
                } else {
                    debug!(
                        component = "serializer",
                        event = "op.rejected.in_progress",
                        kind = ?kind,
                        target_id,
                    );
                    return OperationResult::err(OperationError::AlreadyInProgress);
                }
            } else if !options.force {
                let debounced = slot
                    .last_accepted
                    .is_some_and(|last| now.duration_since(last) < window);
                if debounced {
                    debug!(
                        component = "serializer",
                        event = "op.rejected.debounced",
                        kind = ?kind,
                        target_id,
                    );
                    return OperationResult::err(OperationError::Debounced);
                }
            }

            slot.busy = true;
            slot.generation += 1;
            generation = slot.generation;
            slot.last_accepted = Some(now);
            slot.cancel = Some(token.clone());
        }

        debug!(
            component = "serializer",
            event = "op.admitted",
            kind = ?kind,
            target_id,
        );

        // Released on drop, whatever exit path the executor takes.
        let _guard = SlotGuard {
            gate: self,
            kind,
            generation,
        };
        executor(token).await
    }

    /// Cooperatively cancel the running operation of the given kind, if any.
    pub fn cancel(&self, kind: OperationKind) {
        if let Some(slot) = self.slots.get(&kind) {
            if let Some(token) = slot.cancel.as_ref() {
                token.cancel();
            }
        }
    }

    /// Whether an operation of this kind is currently in flight.
    pub fn is_busy(&self, kind: OperationKind) -> bool {
        self.slots.get(&kind).is_some_and(|slot| slot.busy)
    }
}

struct SlotGuard<'a> {
    gate: &'a OperationGate,
    kind: OperationKind,
    generation: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut slot) = self.gate.slots.get_mut(&self.kind) {
            // A superseding operation bumped the generation; its guard owns
            // the slot now.
            if slot.generation == self.generation {
                slot.busy = false;
                slot.cancel = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::{advance, sleep};

    fn gate() -> OperationGate {
        OperationGate::new(Duration::from_millis(300))
    }

    #[tokio::test(start_paused = true)]
    async fn admits_first_and_rejects_concurrent_same_kind() {
        let gate = Arc::new(gate());
        let runs = Arc::new(AtomicUsize::new(0));

        let g = gate.clone();
        let r = runs.clone();
        let first = tokio::spawn(async move {
            g.start_operation(
                OperationKind::Create,
                None,
                |_cancel| async move {
                    r.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_secs(1)).await;
                    OperationResult::ok("thread-1")
                },
                OperationOptions::default(),
            )
            .await
        });

        // Let the first operation start
        tokio::task::yield_now().await;

        let second = gate
            .start_operation(
                OperationKind::Create,
                None,
                |_cancel| async { OperationResult::ok("thread-2") },
                OperationOptions::default(),
            )
            .await;
        assert_eq!(second.error, Some(OperationError::AlreadyInProgress));

        advance(Duration::from_secs(1)).await;
        let first = first.await.unwrap();
        assert!(first.success);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn debounces_rapid_repeat_after_completion() {
        let gate = gate();

        let first = gate
            .start_operation(
                OperationKind::Create,
                None,
                |_cancel| async { OperationResult::ok("thread-1") },
                OperationOptions::default(),
            )
            .await;
        assert!(first.success);

        // Immediately again: inside the window
        let second = gate
            .start_operation(
                OperationKind::Create,
                None,
                |_cancel| async { OperationResult::ok("thread-2") },
                OperationOptions::default(),
            )
            .await;
        assert_eq!(second.error, Some(OperationError::Debounced));

        // After the window passes the next trigger is admitted
        advance(Duration::from_millis(301)).await;
        let third = gate
            .start_operation(
                OperationKind::Create,
                None,
                |_cancel| async { OperationResult::ok("thread-3") },
                OperationOptions::default(),
            )
            .await;
        assert!(third.success);
    }

    #[tokio::test(start_paused = true)]
    async fn force_bypasses_debounce() {
        let gate = gate();

        gate.start_operation(
            OperationKind::Create,
            None,
            |_cancel| async { OperationResult::ok_empty() },
            OperationOptions::default(),
        )
        .await;

        let forced = gate
            .start_operation(
                OperationKind::Create,
                None,
                |_cancel| async { OperationResult::ok_empty() },
                OperationOptions {
                    force: true,
                    ..Default::default()
                },
            )
            .await;
        assert!(forced.success);
    }

    #[tokio::test(start_paused = true)]
    async fn different_kinds_run_concurrently() {
        let gate = Arc::new(gate());

        let g = gate.clone();
        let create = tokio::spawn(async move {
            g.start_operation(
                OperationKind::Create,
                None,
                |_cancel| async {
                    sleep(Duration::from_secs(1)).await;
                    OperationResult::ok_empty()
                },
                OperationOptions::default(),
            )
            .await
        });
        tokio::task::yield_now().await;

        let delete = gate
            .start_operation(
                OperationKind::Delete,
                Some("thread-1"),
                |_cancel| async { OperationResult::ok_empty() },
                OperationOptions::default(),
            )
            .await;
        assert!(delete.success);

        advance(Duration::from_secs(1)).await;
        assert!(create.await.unwrap().success);
    }

    #[tokio::test(start_paused = true)]
    async fn slot_released_after_error_and_cancellation() {
        let gate = Arc::new(gate());

        // Error exit
        let errored = gate
            .start_operation(
                OperationKind::Create,
                None,
                |_cancel| async { OperationResult::err(OperationError::Transport("down".into())) },
                OperationOptions::default(),
            )
            .await;
        assert!(!errored.success);
        assert!(!gate.is_busy(OperationKind::Create));

        // Cancellation exit
        advance(Duration::from_millis(301)).await;
        let g = gate.clone();
        let cancelled = tokio::spawn(async move {
            g.start_operation(
                OperationKind::Create,
                None,
                |cancel| async move {
                    cancel.cancelled().await;
                    OperationResult::err(OperationError::Cancelled)
                },
                OperationOptions::default(),
            )
            .await
        });
        tokio::task::yield_now().await;
        assert!(gate.is_busy(OperationKind::Create));

        gate.cancel(OperationKind::Create);
        let result = cancelled.await.unwrap();
        assert_eq!(result.error, Some(OperationError::Cancelled));
        assert!(!gate.is_busy(OperationKind::Create));

        // And a fresh operation is admitted right after
        advance(Duration::from_millis(301)).await;
        let next = gate
            .start_operation(
                OperationKind::Create,
                None,
                |_cancel| async { OperationResult::ok_empty() },
                OperationOptions::default(),
            )
            .await;
        assert!(next.success);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_operation_supersedes_running_one() {
        let gate = Arc::new(gate());

        let g = gate.clone();
        let displaced = tokio::spawn(async move {
            g.start_operation(
                OperationKind::Create,
                None,
                |cancel| async move {
                    cancel.cancelled().await;
                    OperationResult::err(OperationError::Cancelled)
                },
                OperationOptions::default(),
            )
            .await
        });
        tokio::task::yield_now().await;

        let forced = gate
            .start_operation(
                OperationKind::Create,
                None,
                |_cancel| async { OperationResult::ok("thread-forced") },
                OperationOptions {
                    force: true,
                    ..Default::default()
                },
            )
            .await;
        assert!(forced.success);

        let displaced = displaced.await.unwrap();
        assert_eq!(displaced.error, Some(OperationError::Cancelled));

        // The displaced guard must not have released the forced slot early;
        // after both settle the kind is free again.
        assert!(!gate.is_busy(OperationKind::Create));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_admits_exactly_one() {
        let gate = Arc::new(gate());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let g = gate.clone();
            let r = runs.clone();
            handles.push(tokio::spawn(async move {
                g.start_operation(
                    OperationKind::Create,
                    None,
                    |_cancel| async move {
                        r.fetch_add(1, Ordering::SeqCst);
                        sleep(Duration::from_millis(50)).await;
                        OperationResult::ok("thread-1")
                    },
                    OperationOptions::default(),
                )
                .await
            }));
        }

        advance(Duration::from_millis(100)).await;
        let mut admitted = 0;
        for handle in handles {
            let result = handle.await.unwrap();
            if result.success {
                admitted += 1;
            } else {
                assert!(matches!(
                    result.error,
                    Some(OperationError::AlreadyInProgress) | Some(OperationError::Debounced)
                ));
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
