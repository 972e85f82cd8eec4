//! Threadbridge — thread-operation concurrency and message-reconciliation
//! core for chat clients.
//!
//! Keeps a single logical conversation consistent across rapid user-triggered
//! lifecycle operations, an unreliable reconnecting transport, and optimistic
//! local edits awaiting remote confirmation. Four pieces:
//!
//! - [`connection::ConnectionHandle`] — transport lifecycle, reconnect with
//!   backoff, heartbeat, and the outbound queue.
//! - [`serializer::OperationGate`] — at most one in-flight operation per
//!   kind, burst debouncing, cooperative cancellation.
//! - [`workflow::WorkflowMachine`] — the human-visible phase of a multi-step
//!   operation, independent of retry count.
//! - [`ledger::MessageLedger`] — optimistic messages tracked until the
//!   transport confirms or rejects them.
//!
//! [`client::ThreadClient`] wires them together and is the entry point UI
//! triggers call.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod serializer;
pub mod transport;
pub mod workflow;

pub use client::ThreadClient;
pub use config::{BackoffConfig, ClientConfig};
pub use connection::{ConnectionEvent, ConnectionHandle, ConnectionSnapshot, ConnectionState};
pub use error::OperationError;
pub use ledger::{LedgerEntry, LedgerStats, MessageLedger, MessageStatus, ReconcileOutcome};
pub use serializer::{OperationGate, OperationKind, OperationOptions, OperationResult};
pub use workflow::{
    StateChange, TransitionPayload, WorkflowEvent, WorkflowMachine, WorkflowRegistry, WorkflowState,
};
