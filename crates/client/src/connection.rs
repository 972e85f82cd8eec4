//! Connection lifecycle manager.
//!
//! Owns one transport connection as an actor task: external callers hold a
//! cheap-to-clone [`ConnectionHandle`] and communicate over an mpsc channel,
//! state reads go through an `ArcSwap` snapshot. The manager is the only
//! component touching the raw transport; everything else observes
//! [`ConnectionState`] and inbound messages through subscriptions.
//!
//! Lifecycle errors never propagate out of the actor. They become state
//! transitions plus an `error` field on the snapshot, and reconnection is
//! automatic with exponential backoff and jitter until an explicit
//! `disconnect` or the configured attempt cap.

use std::collections::VecDeque;
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use threadbridge_protocol::{ClientMessage, ServerMessage};

use crate::config::ClientConfig;
use crate::error::OperationError;
use crate::transport::{Connector, TransportEvent, TransportLink};

const COMMAND_CHANNEL_CAPACITY: usize = 128;

/// Transport connection state. Only the manager mutates it; consumers read
/// the snapshot or subscribe to changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Lock-free view of the manager's state.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
    /// Messages currently held in the outbound queue.
    pub queued: usize,
}

/// Events delivered to subscribers.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged {
        previous: ConnectionState,
        current: ConnectionState,
    },
    Message(ServerMessage),
}

enum Command {
    Connect {
        url: String,
    },
    Disconnect,
    Send {
        message: ClientMessage,
        reply: oneshot::Sender<Result<(), OperationError>>,
    },
    Subscribe {
        tx: mpsc::Sender<ConnectionEvent>,
    },
}

/// Handle to the connection actor (cheap to Clone).
#[derive(Clone)]
pub struct ConnectionHandle {
    command_tx: mpsc::Sender<Command>,
    snapshot: Arc<ArcSwap<ConnectionSnapshot>>,
}

impl ConnectionHandle {
    /// Spawn the manager task. The connection starts `Closed`; call
    /// [`connect`](Self::connect) to bring it up.
    pub fn spawn(connector: Arc<dyn Connector>, config: ClientConfig) -> ConnectionHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        // Self-scheduled reconnect timers use their own channel so the actor
        // never holds a sender for its command channel; when the last handle
        // drops, the command channel closes and the actor exits.
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();
        let snapshot = Arc::new(ArcSwap::from_pointee(ConnectionSnapshot {
            state: ConnectionState::Closed,
            last_error: None,
            reconnect_attempts: 0,
            queued: 0,
        }));

        let actor = ConnectionActor {
            connector,
            config,
            state: ConnectionState::Closed,
            url: None,
            auto_reconnect: false,
            link_out: None,
            events: None,
            queue: VecDeque::new(),
            subscribers: Vec::new(),
            snapshot: snapshot.clone(),
            last_error: None,
            reconnect_attempts: 0,
            reconnect_generation: 0,
            last_activity: Instant::now(),
            reconnect_tx,
        };
        tokio::spawn(actor.run(command_rx, reconnect_rx));

        ConnectionHandle {
            command_tx,
            snapshot,
        }
    }

    /// Begin connecting. Resolves once the command is accepted, not once the
    /// link is open; observe state for that.
    pub async fn connect(&self, url: &str) {
        self.send_command(Command::Connect {
            url: url.to_string(),
        })
        .await;
    }

    /// Explicit teardown. Cancels any scheduled reconnect.
    pub async fn disconnect(&self) {
        self.send_command(Command::Disconnect).await;
    }

    /// Send a message, queueing it if the connection is not open. Fails with
    /// `QueueFull` once the bounded queue is at capacity.
    pub async fn send(&self, message: ClientMessage) -> Result<(), OperationError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Send { message, reply }).await;
        rx.await
            .unwrap_or_else(|_| Err(OperationError::Transport("connection actor gone".into())))
    }

    /// Subscribe to state changes and inbound messages.
    pub async fn subscribe(&self, tx: mpsc::Sender<ConnectionEvent>) {
        self.send_command(Command::Subscribe { tx }).await;
    }

    /// Lock-free snapshot read.
    pub fn snapshot(&self) -> Arc<ConnectionSnapshot> {
        self.snapshot.load_full()
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.load().state
    }

    async fn send_command(&self, cmd: Command) {
        if self.command_tx.send(cmd).await.is_err() {
            warn!(
                component = "connection",
                event = "conn.command_dropped",
                "Connection actor channel closed, command dropped"
            );
        }
    }
}

struct ConnectionActor {
    connector: Arc<dyn Connector>,
    config: ClientConfig,
    state: ConnectionState,
    url: Option<String>,
    auto_reconnect: bool,
    link_out: Option<mpsc::Sender<Bytes>>,
    events: Option<mpsc::Receiver<TransportEvent>>,
    queue: VecDeque<ClientMessage>,
    subscribers: Vec<mpsc::Sender<ConnectionEvent>>,
    snapshot: Arc<ArcSwap<ConnectionSnapshot>>,
    last_error: Option<String>,
    reconnect_attempts: u32,
    /// Bumped on disconnect so a scheduled reconnect timer from a previous
    /// life of the connection is ignored when it fires.
    reconnect_generation: u64,
    last_activity: Instant,
    reconnect_tx: mpsc::UnboundedSender<u64>,
}

enum Tick {
    Command(Option<Command>),
    Transport(Option<TransportEvent>),
    Reconnect(u64),
    Heartbeat,
}

impl ConnectionActor {
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<Command>,
        mut reconnect_rx: mpsc::UnboundedReceiver<u64>,
    ) {
        let mut heartbeat = time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let tick = {
                let events = &mut self.events;
                tokio::select! {
                    cmd = command_rx.recv() => Tick::Command(cmd),
                    ev = async {
                        match events.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => Tick::Transport(ev),
                    Some(generation) = reconnect_rx.recv() => Tick::Reconnect(generation),
                    _ = heartbeat.tick(), if matches!(
                        self.state,
                        ConnectionState::Open | ConnectionState::Connecting
                    ) => Tick::Heartbeat,
                }
            };

            match tick {
                Tick::Command(None) => break,
                Tick::Command(Some(cmd)) => self.handle_command(cmd).await,
                Tick::Transport(Some(ev)) => self.handle_transport_event(ev).await,
                // Event channel gone without a Closed event: same thing.
                Tick::Transport(None) => self.handle_link_failure("transport dropped").await,
                Tick::Reconnect(generation) => self.reconnect_timer_fired(generation).await,
                Tick::Heartbeat => self.heartbeat_tick().await,
            }
        }
        debug!(
            component = "connection",
            event = "conn.actor_stopped",
            "All handles dropped, connection actor exiting"
        );
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { url } => {
                self.url = Some(url);
                self.auto_reconnect = true;
                self.reconnect_attempts = 0;
                self.start_attempt().await;
            }
            Command::Disconnect => {
                info!(
                    component = "connection",
                    event = "conn.disconnect",
                    "Explicit disconnect requested"
                );
                self.auto_reconnect = false;
                self.reconnect_generation += 1;
                self.set_state(ConnectionState::Closing).await;
                self.drop_link();
                self.set_state(ConnectionState::Closed).await;
            }
            Command::Send { message, reply } => {
                let result = self.handle_send(message).await;
                let _ = reply.send(result);
            }
            Command::Subscribe { tx } => {
                self.subscribers.retain(|s| !s.is_closed());
                self.subscribers.push(tx);
            }
        }
    }

    /// A backoff timer elapsed. Stale generations are timers from a previous
    /// life of the connection and are ignored.
    async fn reconnect_timer_fired(&mut self, generation: u64) {
        if generation == self.reconnect_generation
            && self.auto_reconnect
            && self.state == ConnectionState::Closed
        {
            self.start_attempt().await;
        }
    }

    async fn handle_send(&mut self, message: ClientMessage) -> Result<(), OperationError> {
        if self.state == ConnectionState::Open {
            if let Some(out) = self.link_out.clone() {
                let frame = match encode(&message) {
                    Ok(frame) => frame,
                    Err(e) => return Err(OperationError::Transport(e.to_string())),
                };
                if out.send(frame).await.is_ok() {
                    return Ok(());
                }
                // Wire died under us; keep the message and go reconnect.
                let result = self.enqueue(message);
                self.handle_link_failure("transport send failed").await;
                return result;
            }
        }
        let result = self.enqueue(message);
        self.publish();
        result
    }

    fn enqueue(&mut self, message: ClientMessage) -> Result<(), OperationError> {
        if self.queue.len() >= self.config.outbound_queue_capacity {
            warn!(
                component = "connection",
                event = "conn.queue_full",
                capacity = self.config.outbound_queue_capacity,
                "Outbound queue at capacity, rejecting send"
            );
            return Err(OperationError::QueueFull);
        }
        self.queue.push_back(message);
        Ok(())
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                info!(
                    component = "connection",
                    event = "conn.opened",
                    queued = self.queue.len(),
                    "Transport link established"
                );
                self.last_activity = Instant::now();
                self.reconnect_attempts = 0;
                self.last_error = None;
                self.set_state(ConnectionState::Open).await;
                self.flush_queue().await;
            }
            TransportEvent::Frame(frame) => {
                self.last_activity = Instant::now();
                match serde_json::from_slice::<ServerMessage>(&frame) {
                    Ok(ServerMessage::Pong) => {
                        debug!(component = "connection", event = "conn.pong");
                    }
                    Ok(msg) => self.broadcast(ConnectionEvent::Message(msg)).await,
                    Err(e) => {
                        warn!(
                            component = "connection",
                            event = "conn.frame_unparseable",
                            error = %e,
                            "Dropping inbound frame"
                        );
                    }
                }
            }
            TransportEvent::Closed { code, reason } => {
                debug!(
                    component = "connection",
                    event = "conn.transport_closed",
                    code,
                    reason = %reason,
                );
                self.handle_link_failure(&reason).await;
            }
            TransportEvent::Error(e) => {
                self.handle_link_failure(&e).await;
            }
        }
    }

    async fn start_attempt(&mut self) {
        let Some(url) = self.url.clone() else {
            return;
        };
        self.set_state(ConnectionState::Connecting).await;
        match self.connector.connect(&url).await {
            Ok(TransportLink { outbound, events }) => {
                self.link_out = Some(outbound);
                self.events = Some(events);
                self.last_activity = Instant::now();
                // Open arrives as a transport event.
            }
            Err(e) => {
                debug!(
                    component = "connection",
                    event = "conn.attempt_failed",
                    error = %e,
                    attempt = self.reconnect_attempts,
                );
                self.last_error = Some(e.to_string());
                self.set_state(ConnectionState::Closed).await;
                self.schedule_reconnect();
            }
        }
    }

    async fn handle_link_failure(&mut self, reason: &str) {
        if self.state == ConnectionState::Closed && self.events.is_none() {
            return;
        }
        self.last_error = Some(reason.to_string());
        self.drop_link();
        self.set_state(ConnectionState::Closed).await;
        if self.auto_reconnect {
            self.schedule_reconnect();
        }
    }

    fn drop_link(&mut self) {
        self.link_out = None;
        self.events = None;
    }

    fn schedule_reconnect(&mut self) {
        if let Some(max) = self.config.max_reconnect_attempts {
            if self.reconnect_attempts >= max {
                warn!(
                    component = "connection",
                    event = "conn.giving_up",
                    attempts = self.reconnect_attempts,
                    "Reconnect attempt cap reached, staying closed"
                );
                self.publish();
                return;
            }
        }
        self.reconnect_attempts += 1;
        let delay = self.config.backoff.delay(self.reconnect_attempts);
        let generation = self.reconnect_generation;
        let reconnect_tx = self.reconnect_tx.clone();
        info!(
            component = "connection",
            event = "conn.reconnect_scheduled",
            attempt = self.reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
        );
        self.publish();
        tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = reconnect_tx.send(generation);
        });
    }

    async fn flush_queue(&mut self) {
        while self.state == ConnectionState::Open {
            let Some(message) = self.queue.pop_front() else {
                break;
            };
            let Some(out) = self.link_out.clone() else {
                self.queue.push_front(message);
                break;
            };
            let frame = match encode(&message) {
                Ok(frame) => frame,
                Err(e) => {
                    // Unencodable messages cannot be retried either; drop with a trace.
                    warn!(
                        component = "connection",
                        event = "conn.flush_encode_failed",
                        error = %e,
                    );
                    continue;
                }
            };
            if out.send(frame).await.is_err() {
                self.queue.push_front(message);
                self.handle_link_failure("transport send failed during flush").await;
                break;
            }
        }
        self.publish();
    }

    async fn heartbeat_tick(&mut self) {
        let idle = Instant::now().duration_since(self.last_activity);
        if idle >= self.config.heartbeat_timeout {
            // Covers both a silently dead open link and a dial whose
            // Opened event never arrives.
            let reason = if self.state == ConnectionState::Connecting {
                "open timeout"
            } else {
                "heartbeat timeout"
            };
            warn!(
                component = "connection",
                event = "conn.heartbeat_timeout",
                idle_ms = idle.as_millis() as u64,
                reason,
                "No transport activity within timeout, forcing close"
            );
            self.handle_link_failure(reason).await;
            return;
        }
        if self.state != ConnectionState::Open {
            return;
        }
        if let Some(out) = self.link_out.clone() {
            if let Ok(frame) = encode(&ClientMessage::Ping) {
                if out.send(frame).await.is_err() {
                    self.handle_link_failure("transport send failed").await;
                }
            }
        }
    }

    async fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            self.publish();
            return;
        }
        let previous = self.state;
        self.state = next;
        debug!(
            component = "connection",
            event = "conn.state_changed",
            previous = ?previous,
            current = ?next,
        );
        self.publish();
        self.broadcast(ConnectionEvent::StateChanged {
            previous,
            current: next,
        })
        .await;
    }

    fn publish(&self) {
        self.snapshot.store(Arc::new(ConnectionSnapshot {
            state: self.state,
            last_error: self.last_error.clone(),
            reconnect_attempts: self.reconnect_attempts,
            queued: self.queue.len(),
        }));
    }

    async fn broadcast(&mut self, event: ConnectionEvent) {
        self.subscribers.retain(|tx| !tx.is_closed());
        for tx in &self.subscribers {
            let _ = tx.send(event.clone()).await;
        }
    }
}

fn encode(message: &ClientMessage) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(message).map(Bytes::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use crate::transport::memory::{MemoryConnector, ServerEnd};
    use std::time::Duration;
    use tokio::time::sleep;

    fn test_config() -> ClientConfig {
        ClientConfig {
            backoff: BackoffConfig {
                base: Duration::from_secs(1),
                multiplier: 2.0,
                cap: Duration::from_secs(8),
                jitter: Duration::ZERO,
            },
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(30),
            outbound_queue_capacity: 4,
            ..Default::default()
        }
    }

    fn decode(frame: &Bytes) -> ClientMessage {
        serde_json::from_slice(frame).expect("client frame")
    }

    async fn recv_non_ping(server: &mut ServerEnd) -> ClientMessage {
        loop {
            let frame = server.from_client.recv().await.expect("frame");
            match decode(&frame) {
                ClientMessage::Ping => continue,
                other => return other,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn messages_queued_while_closed_flush_in_order() {
        let (connector, mut accept_rx) = MemoryConnector::new();
        let handle = ConnectionHandle::spawn(Arc::new(connector), test_config());

        for content in ["one", "two", "three"] {
            handle
                .send(ClientMessage::PostMessage {
                    correlation_id: content.to_string(),
                    thread_id: "thread-1".to_string(),
                    content: content.to_string(),
                })
                .await
                .expect("queued");
        }
        assert_eq!(handle.snapshot().queued, 3);
        assert_eq!(handle.state(), ConnectionState::Closed);

        handle.connect("mem://server").await;
        let mut server = accept_rx.recv().await.expect("accepted");

        for expected in ["one", "two", "three"] {
            match recv_non_ping(&mut server).await {
                ClientMessage::PostMessage { correlation_id, .. } => {
                    assert_eq!(correlation_id, expected);
                }
                other => panic!("unexpected message: {:?}", other),
            }
        }
        assert_eq!(handle.snapshot().queued, 0);
        assert_eq!(handle.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_at_capacity_rejects_new_sends() {
        let (connector, _accept_rx) = MemoryConnector::new();
        let handle = ConnectionHandle::spawn(Arc::new(connector), test_config());

        for i in 0..4 {
            handle
                .send(ClientMessage::PostMessage {
                    correlation_id: format!("corr-{i}"),
                    thread_id: "thread-1".to_string(),
                    content: "hi".to_string(),
                })
                .await
                .expect("queued");
        }
        let overflow = handle
            .send(ClientMessage::PostMessage {
                correlation_id: "corr-overflow".to_string(),
                thread_id: "thread-1".to_string(),
                content: "hi".to_string(),
            })
            .await;
        assert_eq!(overflow, Err(OperationError::QueueFull));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_with_backoff_after_transport_close() {
        let (connector, mut accept_rx) = MemoryConnector::new();
        let handle = ConnectionHandle::spawn(Arc::new(connector), test_config());

        handle.connect("mem://server").await;
        let server = accept_rx.recv().await.expect("first connection");
        // Let the Opened event land
        sleep(Duration::from_millis(1)).await;
        assert_eq!(handle.state(), ConnectionState::Open);

        // Server drops the connection
        server
            .to_client
            .send(TransportEvent::Closed {
                code: Some(1006),
                reason: "gone".to_string(),
            })
            .await
            .expect("close event");
        sleep(Duration::from_millis(1)).await;
        assert_eq!(handle.state(), ConnectionState::Closed);
        assert_eq!(handle.snapshot().last_error.as_deref(), Some("gone"));

        // Backoff elapses; a fresh link is dialed and comes up
        let _server2 = accept_rx.recv().await.expect("second connection");
        sleep(Duration::from_millis(1)).await;
        assert_eq!(handle.state(), ConnectionState::Open);
        assert_eq!(handle.snapshot().reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_dial_retries_until_cap_then_gives_up() {
        let (connector, mut accept_rx) = MemoryConnector::new();
        connector.fail_next(10);
        let config = ClientConfig {
            max_reconnect_attempts: Some(2),
            ..test_config()
        };
        let handle = ConnectionHandle::spawn(Arc::new(connector), config);

        handle.connect("mem://server").await;
        // Initial attempt + 2 retries all fail; no connection is ever accepted
        sleep(Duration::from_secs(60)).await;
        assert_eq!(handle.state(), ConnectionState::Closed);
        assert_eq!(handle.snapshot().reconnect_attempts, 2);
        assert!(handle.snapshot().last_error.is_some());
        assert!(accept_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn link_that_never_opens_times_out_and_redials() {
        let (connector, mut accept_rx) = MemoryConnector::new();
        let connector = connector.manual_open();
        let handle = ConnectionHandle::spawn(Arc::new(connector), test_config());

        handle.connect("mem://server").await;
        let _stalled = accept_rx.recv().await.expect("first dial");
        sleep(Duration::from_millis(1)).await;
        assert_eq!(handle.state(), ConnectionState::Connecting);

        // No Opened ever arrives; after the idle timeout the manager gives
        // up on the handshake and dials a fresh link.
        let _second = accept_rx.recv().await.expect("second dial");
        assert_eq!(handle.snapshot().last_error.as_deref(), Some("open timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_all_handles_stops_actor_and_closes_link() {
        let (connector, mut accept_rx) = MemoryConnector::new();
        let handle = ConnectionHandle::spawn(Arc::new(connector), test_config());

        handle.connect("mem://server").await;
        let mut server = accept_rx.recv().await.expect("connection");
        sleep(Duration::from_millis(1)).await;
        assert_eq!(handle.state(), ConnectionState::Open);

        drop(handle);
        // The command channel closes, the actor exits and the transport link
        // is torn down with it; pending pings drain first.
        while server.from_client.recv().await.is_some() {}
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_scheduled_reconnect() {
        let (connector, mut accept_rx) = MemoryConnector::new();
        let handle = ConnectionHandle::spawn(Arc::new(connector), test_config());

        handle.connect("mem://server").await;
        let server = accept_rx.recv().await.expect("first connection");
        sleep(Duration::from_millis(1)).await;

        server
            .to_client
            .send(TransportEvent::Closed {
                code: None,
                reason: "server restart".to_string(),
            })
            .await
            .expect("close event");
        sleep(Duration::from_millis(1)).await;

        // A reconnect is now scheduled; disconnect before it fires
        handle.disconnect().await;
        sleep(Duration::from_secs(60)).await;

        assert_eq!(handle.state(), ConnectionState::Closed);
        assert!(accept_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pings_and_forces_close_when_silent() {
        let (connector, mut accept_rx) = MemoryConnector::new();
        let handle = ConnectionHandle::spawn(Arc::new(connector), test_config());

        handle.connect("mem://server").await;
        let mut server = accept_rx.recv().await.expect("connection");
        sleep(Duration::from_millis(1)).await;
        assert_eq!(handle.state(), ConnectionState::Open);

        // First heartbeat goes out as a ping
        let frame = server.from_client.recv().await.expect("ping frame");
        assert!(matches!(decode(&frame), ClientMessage::Ping));

        // The server answers nothing; after the idle timeout the manager
        // forces the connection closed and dials again.
        let _server2 = accept_rx.recv().await.expect("reconnect after silence");
        sleep(Duration::from_millis(1)).await;
        assert_eq!(handle.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn pong_counts_as_activity_and_keeps_link_alive() {
        let (connector, mut accept_rx) = MemoryConnector::new();
        let handle = ConnectionHandle::spawn(Arc::new(connector), test_config());

        handle.connect("mem://server").await;
        let mut server = accept_rx.recv().await.expect("connection");
        sleep(Duration::from_millis(1)).await;

        // Answer every ping for a while; the link must stay up
        for _ in 0..4 {
            let frame = server.from_client.recv().await.expect("ping");
            assert!(matches!(decode(&frame), ClientMessage::Ping));
            let pong = serde_json::to_vec(&ServerMessage::Pong).unwrap();
            server
                .to_client
                .send(TransportEvent::Frame(Bytes::from(pong)))
                .await
                .expect("pong");
        }
        assert_eq!(handle.state(), ConnectionState::Open);
        assert!(accept_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn subscribers_observe_state_changes_and_messages() {
        let (connector, mut accept_rx) = MemoryConnector::new();
        let handle = ConnectionHandle::spawn(Arc::new(connector), test_config());

        let (tx, mut rx) = mpsc::channel(16);
        handle.subscribe(tx).await;

        handle.connect("mem://server").await;
        let server = accept_rx.recv().await.expect("connection");
        sleep(Duration::from_millis(1)).await;

        // Closed -> Connecting -> Open
        assert!(matches!(
            rx.recv().await,
            Some(ConnectionEvent::StateChanged {
                current: ConnectionState::Connecting,
                ..
            })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(ConnectionEvent::StateChanged {
                current: ConnectionState::Open,
                ..
            })
        ));

        let msg = ServerMessage::ThreadDeleted {
            correlation_id: "corr-1".to_string(),
            thread_id: "thread-1".to_string(),
        };
        server
            .to_client
            .send(TransportEvent::Frame(Bytes::from(
                serde_json::to_vec(&msg).unwrap(),
            )))
            .await
            .expect("frame");

        match rx.recv().await {
            Some(ConnectionEvent::Message(ServerMessage::ThreadDeleted { thread_id, .. })) => {
                assert_eq!(thread_id, "thread-1");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
