//! Workflow state machine.
//!
//! Tracks the human-visible phase of a multi-step operation independent of
//! how many times the user retried triggering it. The transition function is
//! pure and total: every `(state, event)` pair resolves, and an event that
//! is not meaningful in the current state is a logged no-op, never an error.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tracing::{debug, error};

/// Phase of a workflow. `Idle` is both the initial and the success-terminal
/// state; `Error` only exits via an explicit `Reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    Idle,
    Creating,
    Switching,
    Error,
}

/// Events fed to a workflow machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowEvent {
    StartCreate,
    StartSwitch,
    CompleteSuccess,
    Fail,
    Reset,
}

/// Pass-through annotation for observers; the machine never branches on it.
#[derive(Debug, Clone, Default)]
pub struct TransitionPayload {
    pub thread_id: Option<String>,
    pub detail: Option<String>,
}

/// Delivered to listeners on every state-changing transition.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub previous: WorkflowState,
    pub current: WorkflowState,
    pub payload: TransitionPayload,
}

/// Pure transition function. `None` means the event is a no-op in this state.
pub fn next_state(state: WorkflowState, event: WorkflowEvent) -> Option<WorkflowState> {
    use WorkflowEvent::*;
    use WorkflowState::*;
    match (state, event) {
        (Idle, StartCreate) => Some(Creating),
        // A standalone switch starts from Idle; within a create it follows Creating.
        (Idle, StartSwitch) | (Creating, StartSwitch) => Some(Switching),
        (Switching, CompleteSuccess) => Some(Idle),
        (Creating, Fail) | (Switching, Fail) => Some(Error),
        (Error, Reset) => Some(Idle),
        _ => None,
    }
}

type Listener = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// One machine per named workflow; a small shared register, not per-request.
pub struct WorkflowMachine {
    name: String,
    state: Mutex<WorkflowState>,
    listeners: Mutex<Vec<Listener>>,
}

impl WorkflowMachine {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(WorkflowState::Idle),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> WorkflowState {
        *self.state.lock().expect("workflow lock poisoned")
    }

    /// Apply an event. Synchronous, always succeeds: either the state changes
    /// and listeners are notified, or the event is ignored.
    pub fn transition(&self, event: WorkflowEvent, payload: TransitionPayload) -> WorkflowState {
        let change = {
            let mut state = self.state.lock().expect("workflow lock poisoned");
            match next_state(*state, event) {
                Some(next) => {
                    let previous = *state;
                    *state = next;
                    Some(StateChange {
                        previous,
                        current: next,
                        payload,
                    })
                }
                None => {
                    debug!(
                        component = "workflow",
                        event = "workflow.event_ignored",
                        workflow = %self.name,
                        state = ?*state,
                        workflow_event = ?event,
                        "Event not applicable in current state"
                    );
                    None
                }
            }
        };

        if let Some(change) = change {
            self.notify(&change);
            change.current
        } else {
            self.state()
        }
    }

    /// Register an observer invoked on every state-changing transition.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.listeners
            .lock()
            .expect("workflow lock poisoned")
            .push(Arc::new(listener));
    }

    /// Force the machine back to `Idle` regardless of current state.
    pub fn reset(&self) {
        let change = {
            let mut state = self.state.lock().expect("workflow lock poisoned");
            if *state == WorkflowState::Idle {
                None
            } else {
                let previous = *state;
                *state = WorkflowState::Idle;
                Some(StateChange {
                    previous,
                    current: WorkflowState::Idle,
                    payload: TransitionPayload::default(),
                })
            }
        };
        if let Some(change) = change {
            self.notify(&change);
        }
    }

    fn notify(&self, change: &StateChange) {
        // Snapshot the list so listeners run without the lock held; a
        // listener may re-enter transition() or register further listeners.
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .expect("workflow lock poisoned")
            .clone();
        for listener in &listeners {
            // A panicking listener must not take the machine down with it.
            if catch_unwind(AssertUnwindSafe(|| listener(change))).is_err() {
                error!(
                    component = "workflow",
                    event = "workflow.listener_panicked",
                    workflow = %self.name,
                    previous = ?change.previous,
                    current = ?change.current,
                    "Listener panicked during dispatch"
                );
            }
        }
    }
}

/// Registry of machines keyed by workflow name. Lazily creates machines and
/// caches them for the lifetime of the session it belongs to.
#[derive(Default)]
pub struct WorkflowRegistry {
    machines: DashMap<String, Arc<WorkflowMachine>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn machine(&self, name: &str) -> Arc<WorkflowMachine> {
        self.machines
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(WorkflowMachine::new(name)))
            .clone()
    }

    /// Force every machine back to `Idle`. Test/teardown escape hatch.
    pub fn reset_all(&self) {
        for entry in self.machines.iter() {
            entry.value().reset();
        }
    }
}
