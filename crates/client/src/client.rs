//! Thread client facade.
//!
//! Wires the four core pieces together: a UI trigger enters through the
//! operation serializer; if admitted, the workflow machine transitions, the
//! operation body talks to the connection manager, and the result settles
//! the ledger and drives the machine to a terminal state. The facade also
//! owns the inbound router that matches server replies back to waiting
//! operations and feeds message confirmations to the ledger.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use threadbridge_protocol::{new_id, ClientMessage, ServerMessage};

use crate::config::ClientConfig;
use crate::connection::{ConnectionEvent, ConnectionHandle, ConnectionSnapshot};
use crate::error::OperationError;
use crate::ledger::{LedgerStats, MessageLedger, ReconcileOutcome};
use crate::serializer::{OperationGate, OperationKind, OperationOptions, OperationResult};
use crate::transport::Connector;
use crate::workflow::{TransitionPayload, WorkflowEvent, WorkflowRegistry};

/// Workflow names used by the built-in operations.
pub const WORKFLOW_NEW_CHAT: &str = "new_chat";
pub const WORKFLOW_SWITCH_THREAD: &str = "switch_thread";

const ROUTER_CHANNEL_CAPACITY: usize = 256;

type PendingOps = Arc<DashMap<String, oneshot::Sender<ServerMessage>>>;

/// The single entry point UI triggers call.
pub struct ThreadClient {
    config: ClientConfig,
    gate: OperationGate,
    workflows: Arc<WorkflowRegistry>,
    ledger: Arc<MessageLedger>,
    connection: ConnectionHandle,
    pending_ops: PendingOps,
    active_thread: Arc<ArcSwapOption<String>>,
    shutdown: CancellationToken,
}

impl ThreadClient {
    pub async fn new(connector: Arc<dyn Connector>, config: ClientConfig) -> Self {
        let connection = ConnectionHandle::spawn(connector, config.clone());
        let ledger = Arc::new(MessageLedger::new(config.confirmation_timeout));
        let pending_ops: PendingOps = Arc::new(DashMap::new());
        let shutdown = CancellationToken::new();

        let (router_tx, router_rx) = mpsc::channel(ROUTER_CHANNEL_CAPACITY);
        connection.subscribe(router_tx).await;
        tokio::spawn(route_inbound(
            router_rx,
            ledger.clone(),
            pending_ops.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(sweep_ledger(
            ledger.clone(),
            config.confirmation_timeout,
            shutdown.clone(),
        ));

        Self {
            gate: OperationGate::new(config.debounce_window),
            workflows: Arc::new(WorkflowRegistry::new()),
            ledger,
            connection,
            pending_ops,
            active_thread: Arc::new(ArcSwapOption::empty()),
            shutdown,
            config,
        }
    }

    pub async fn connect(&self, url: &str) {
        self.connection.connect(url).await;
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Create a thread and switch to it. At most one create runs at a time;
    /// bursts inside the debounce window collapse into the first trigger.
    pub async fn new_thread(&self) -> OperationResult {
        self.new_thread_with(OperationOptions::default()).await
    }

    pub async fn new_thread_with(&self, options: OperationOptions) -> OperationResult {
        let machine = self.workflows.machine(WORKFLOW_NEW_CHAT);
        let connection = self.connection.clone();
        let pending_ops = self.pending_ops.clone();
        let active_thread = self.active_thread.clone();
        let window = self.config.confirmation_timeout;

        self.gate
            .start_operation(
                OperationKind::Create,
                None,
                move |cancel| async move {
                    machine.transition(WorkflowEvent::StartCreate, TransitionPayload::default());

                    let correlation_id = new_id();
                    let reply = call_remote(
                        &connection,
                        &pending_ops,
                        correlation_id.clone(),
                        ClientMessage::CreateThread { correlation_id },
                        &cancel,
                        window,
                    )
                    .await;

                    match reply {
                        Ok(ServerMessage::ThreadCreated { thread, .. }) => {
                            machine.transition(
                                WorkflowEvent::StartSwitch,
                                TransitionPayload {
                                    thread_id: Some(thread.id.clone()),
                                    detail: None,
                                },
                            );
                            active_thread.store(Some(Arc::new(thread.id.clone())));
                            // Tell the authority where we moved; the switch
                            // itself already happened locally.
                            notify_switch(&connection, &thread.id).await;
                            machine.transition(
                                WorkflowEvent::CompleteSuccess,
                                TransitionPayload {
                                    thread_id: Some(thread.id.clone()),
                                    detail: None,
                                },
                            );
                            OperationResult::ok(thread.id)
                        }
                        Ok(reply) => fail(&machine, unexpected_reply(reply)),
                        Err(e) => fail(&machine, e),
                    }
                },
                options,
            )
            .await
    }

    /// Switch the active thread.
    pub async fn switch_thread(&self, thread_id: &str) -> OperationResult {
        self.switch_thread_with(thread_id, OperationOptions::default())
            .await
    }

    pub async fn switch_thread_with(
        &self,
        thread_id: &str,
        options: OperationOptions,
    ) -> OperationResult {
        let machine = self.workflows.machine(WORKFLOW_SWITCH_THREAD);
        let connection = self.connection.clone();
        let pending_ops = self.pending_ops.clone();
        let active_thread = self.active_thread.clone();
        let window = self.config.confirmation_timeout;
        let target = thread_id.to_string();

        self.gate
            .start_operation(
                OperationKind::Switch,
                Some(thread_id),
                move |cancel| async move {
                    machine.transition(
                        WorkflowEvent::StartSwitch,
                        TransitionPayload {
                            thread_id: Some(target.clone()),
                            detail: None,
                        },
                    );

                    let correlation_id = new_id();
                    let reply = call_remote(
                        &connection,
                        &pending_ops,
                        correlation_id.clone(),
                        ClientMessage::SwitchThread {
                            correlation_id,
                            thread_id: target.clone(),
                        },
                        &cancel,
                        window,
                    )
                    .await;

                    match reply {
                        Ok(ServerMessage::ThreadSwitched { thread_id, .. }) => {
                            active_thread.store(Some(Arc::new(thread_id.clone())));
                            machine.transition(
                                WorkflowEvent::CompleteSuccess,
                                TransitionPayload {
                                    thread_id: Some(thread_id.clone()),
                                    detail: None,
                                },
                            );
                            OperationResult::ok(thread_id)
                        }
                        Ok(reply) => fail(&machine, unexpected_reply(reply)),
                        Err(e) => fail(&machine, e),
                    }
                },
                options,
            )
            .await
    }

    /// Delete a thread. Does not drive a workflow machine; there is no
    /// user-visible multi-step phase to a delete.
    pub async fn delete_thread(&self, thread_id: &str) -> OperationResult {
        let connection = self.connection.clone();
        let pending_ops = self.pending_ops.clone();
        let active_thread = self.active_thread.clone();
        let window = self.config.confirmation_timeout;
        let target = thread_id.to_string();

        self.gate
            .start_operation(
                OperationKind::Delete,
                Some(thread_id),
                move |cancel| async move {
                    let correlation_id = new_id();
                    let reply = call_remote(
                        &connection,
                        &pending_ops,
                        correlation_id.clone(),
                        ClientMessage::DeleteThread {
                            correlation_id,
                            thread_id: target.clone(),
                        },
                        &cancel,
                        window,
                    )
                    .await;

                    match reply {
                        Ok(ServerMessage::ThreadDeleted { thread_id, .. }) => {
                            let was_active = active_thread
                                .load_full()
                                .is_some_and(|active| *active == thread_id);
                            if was_active {
                                active_thread.store(None);
                            }
                            OperationResult::ok(thread_id)
                        }
                        Ok(reply) => OperationResult::err(unexpected_reply(reply)),
                        Err(e) => OperationResult::err(e),
                    }
                },
                OperationOptions::default(),
            )
            .await
    }

    /// Optimistically post a message. The returned local id is immediately
    /// visible in the ledger as `Pending`; settlement happens when the
    /// confirmation (or an error, or the timeout) arrives. A send failure is
    /// recorded in the ledger rather than returned — the entry stays around
    /// for a retry affordance.
    pub async fn post_message(&self, thread_id: &str, content: &str) -> String {
        let local_id = new_id();
        let correlation_id = new_id();
        self.ledger
            .add_optimistic(&local_id, &correlation_id, content);

        let result = self
            .connection
            .send(ClientMessage::PostMessage {
                correlation_id,
                thread_id: thread_id.to_string(),
                content: content.to_string(),
            })
            .await;
        if let Err(e) = result {
            warn!(
                component = "client",
                event = "client.post_failed",
                local_id = %local_id,
                error = %e,
            );
            self.ledger.mark_failed(&local_id, e);
        }
        local_id
    }

    /// Cooperatively cancel the running operation of a kind, if any.
    pub fn cancel(&self, kind: OperationKind) {
        self.gate.cancel(kind);
    }

    /// Subscribe to connection state changes and inbound messages.
    pub async fn subscribe(&self, tx: mpsc::Sender<ConnectionEvent>) {
        self.connection.subscribe(tx).await;
    }

    pub fn connection_snapshot(&self) -> Arc<ConnectionSnapshot> {
        self.connection.snapshot()
    }

    pub fn ledger(&self) -> &MessageLedger {
        &self.ledger
    }

    pub fn stats(&self) -> LedgerStats {
        self.ledger.stats()
    }

    pub fn workflows(&self) -> &WorkflowRegistry {
        &self.workflows
    }

    pub fn active_thread(&self) -> Option<Arc<String>> {
        self.active_thread.load_full()
    }

    /// Test/teardown escape hatch: force every workflow machine to `Idle`.
    pub fn reset_workflows(&self) {
        self.workflows.reset_all();
    }
}

impl Drop for ThreadClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Send a request and wait for the reply carrying the same correlation id.
async fn call_remote(
    connection: &ConnectionHandle,
    pending_ops: &PendingOps,
    correlation_id: String,
    message: ClientMessage,
    cancel: &CancellationToken,
    window: Duration,
) -> Result<ServerMessage, OperationError> {
    let (tx, rx) = oneshot::channel();
    pending_ops.insert(correlation_id.clone(), tx);

    let result = async {
        connection.send(message).await?;
        tokio::select! {
            _ = cancel.cancelled() => Err(OperationError::Cancelled),
            reply = time::timeout(window, rx) => match reply {
                Ok(Ok(ServerMessage::Error { message, .. })) => {
                    Err(OperationError::Transport(message))
                }
                Ok(Ok(msg)) => Ok(msg),
                Ok(Err(_)) => Err(OperationError::Transport("reply channel dropped".into())),
                Err(_) => Err(OperationError::Timeout),
            },
        }
    }
    .await;

    // No-op if the router already consumed and removed the entry.
    pending_ops.remove(&correlation_id);
    result
}

/// Best-effort switch notification after a create. The local switch already
/// happened; a rejected send leaves the authority's view stale, which the
/// next explicit switch repairs.
async fn notify_switch(connection: &ConnectionHandle, thread_id: &str) {
    let correlation_id = new_id();
    if let Err(e) = connection
        .send(ClientMessage::SwitchThread {
            correlation_id,
            thread_id: thread_id.to_string(),
        })
        .await
    {
        warn!(
            component = "client",
            event = "client.switch_notify_failed",
            thread_id = %thread_id,
            error = %e,
        );
    }
}

fn fail(machine: &crate::workflow::WorkflowMachine, error: OperationError) -> OperationResult {
    machine.transition(
        WorkflowEvent::Fail,
        TransitionPayload {
            thread_id: None,
            detail: Some(error.to_string()),
        },
    );
    OperationResult::err(error)
}

fn unexpected_reply(reply: ServerMessage) -> OperationError {
    OperationError::Transport(format!("unexpected reply: {:?}", reply))
}

/// Inbound router: thread-operation replies go to their waiting callers,
/// message confirmations and rejections go to the ledger. Everything else is
/// for UI subscribers, who hold their own subscription.
async fn route_inbound(
    mut rx: mpsc::Receiver<ConnectionEvent>,
    ledger: Arc<MessageLedger>,
    pending_ops: PendingOps,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            ev = rx.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
        };
        let ConnectionEvent::Message(msg) = event else {
            continue;
        };

        if let Some(correlation_id) = msg.correlation_id() {
            if let Some((_, reply)) = pending_ops.remove(correlation_id) {
                let _ = reply.send(msg);
                continue;
            }
        }

        match msg {
            ServerMessage::MessageAppended {
                correlation_id: Some(correlation_id),
                message,
            } => {
                match ledger.process_confirmation(&correlation_id, &message.id, &message.timestamp)
                {
                    ReconcileOutcome::Confirmed(entry) => {
                        debug!(
                            component = "client",
                            event = "client.message_confirmed",
                            local_id = %entry.local_id,
                            server_id = %message.id,
                        );
                    }
                    ReconcileOutcome::AlreadySettled => {}
                    // A correlation id we never issued: someone else's
                    // message, already visible to UI subscribers.
                    ReconcileOutcome::NewRemote => {}
                }
            }
            ServerMessage::Error {
                correlation_id: Some(correlation_id),
                message,
                ..
            } => {
                if !ledger.fail_by_correlation(&correlation_id, OperationError::Transport(message))
                {
                    debug!(
                        component = "client",
                        event = "client.error_unmatched",
                        correlation_id = %correlation_id,
                    );
                }
            }
            _ => {}
        }
    }
}

/// Periodically expire pending ledger entries that never got confirmed.
async fn sweep_ledger(ledger: Arc<MessageLedger>, window: Duration, shutdown: CancellationToken) {
    let interval = (window / 4).max(Duration::from_millis(100));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = time::sleep(interval) => {
                ledger.sweep_timeouts();
            }
        }
    }
}
