//! Streaming interpretation client
//!
//! `InterpretationClient` is a cheap, cloneable handle. All state lives in a
//! single driver task that owns the [`Machine`], the transport and the timers,
//! so every transition happens on one logical thread in arrival order.

use std::future::pending;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::{StaticToken, TokenProvider};
use crate::backoff::ReconnectPolicy;
use crate::error::{ClientError, TransportError};
use crate::machine::{ConnectionId, Effect, Machine};
use crate::protocol::{
    interpret_url, InterpretationRequest, ProtocolError, ABNORMAL_CLOSURE, NORMAL_CLOSURE,
};
use crate::state::{ClientEvent, ClientSnapshot, StateChange};
use crate::transport::{Connection, Connector, OutboundFrame, TransportEvent};
use crate::websocket::WebSocketConnector;

pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_MISSED_PONGS: u32 = 3;

const EVENT_CAPACITY: usize = 256;

/// Runtime settings of one client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// HTTP(S) origin of the backend; the socket URL is derived from it
    pub backend_origin: Url,
    pub keepalive_interval: Duration,
    pub reconnect: ReconnectPolicy,
    /// Unanswered pings tolerated before the connection is dropped, 0 disables
    pub max_missed_pongs: u32,
}

impl ClientConfig {
    pub fn new(backend_origin: Url) -> Self {
        Self {
            backend_origin,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            reconnect: ReconnectPolicy::default(),
            max_missed_pongs: DEFAULT_MAX_MISSED_PONGS,
        }
    }

    pub fn interpret_url(&self) -> Result<Url, ProtocolError> {
        interpret_url(&self.backend_origin)
    }
}

type Observer = Arc<dyn Fn(StateChange) + Send + Sync>;

enum Command {
    Connect,
    Disconnect,
    Submit {
        request: InterpretationRequest,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Clear,
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct InterpretationClient {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<ClientSnapshot>,
    events: broadcast::Sender<ClientEvent>,
    observers: Arc<Mutex<Vec<Observer>>>,
}

impl InterpretationClient {
    /// Start a client that talks WebSocket to the configured backend
    pub fn websocket(
        config: ClientConfig,
        tokens: impl TokenProvider + 'static,
    ) -> Result<Self, ProtocolError> {
        Self::spawn(config, Arc::new(WebSocketConnector::new()), Arc::new(tokens))
    }

    /// Start a client over any connector. Must be called inside a tokio runtime.
    pub fn spawn(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self, ProtocolError> {
        let url = config.interpret_url()?;
        let machine = Machine::new(config.reconnect, config.max_missed_pongs);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(machine.snapshot());
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        let observers: Arc<Mutex<Vec<Observer>>> = Arc::new(Mutex::new(Vec::new()));

        let driver = Driver {
            last_change: machine.snapshot().state_change(),
            machine,
            url,
            connector,
            tokens,
            keepalive_interval: config.keepalive_interval,
            commands: command_rx,
            snapshot: snapshot_tx,
            events: event_tx.clone(),
            observers: observers.clone(),
            opened_tx,
            opened_rx,
            pending_open: None,
            link: None,
            reconnect_at: None,
            keepalive: None,
        };
        tokio::spawn(driver.run());

        Ok(Self {
            commands: command_tx,
            snapshot: snapshot_rx,
            events: event_tx,
            observers,
        })
    }

    /// Convenience for callers without a token provider
    pub fn websocket_anonymous(config: ClientConfig) -> Result<Self, ProtocolError> {
        Self::websocket(config, StaticToken::none())
    }

    fn command(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::ClientClosed)
    }

    /// Open the connection. No-op while connected or connecting.
    pub fn connect(&self) -> Result<(), ClientError> {
        self.command(Command::Connect)
    }

    /// Close the connection with a normal closure and cancel any pending
    /// reconnect.
    pub fn disconnect(&self) -> Result<(), ClientError> {
        self.command(Command::Disconnect)
    }

    /// Send a request. Returns once the request has been validated and
    /// handed to the transport; the interpretation arrives through state
    /// changes and events.
    pub async fn submit(&self, request: InterpretationRequest) -> Result<(), ClientError> {
        let (reply, response) = oneshot::channel();
        self.command(Command::Submit { request, reply })?;
        response.await.map_err(|_| ClientError::ClientClosed)?
    }

    pub fn clear_interpretation(&self) -> Result<(), ClientError> {
        self.command(Command::Clear)
    }

    /// Register an observer called with the new pair of states whenever the
    /// connection or processing state changes. Runs on the driver task, so it
    /// must not block. Observers registered from inside a callback take
    /// effect from the next change.
    pub fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(StateChange) + Send + Sync + 'static,
    {
        if let Ok(mut observers) = self.observers.lock() {
            observers.push(Arc::new(callback));
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ClientSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until the snapshot satisfies `predicate`
    pub async fn wait_until<F>(&self, predicate: F) -> Result<ClientSnapshot, ClientError>
    where
        F: FnMut(&ClientSnapshot) -> bool,
    {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(predicate)
            .await
            .map_err(|_| ClientError::ClientClosed)?;
        Ok((*snapshot).clone())
    }

    /// Disconnect and stop the driver task
    pub async fn shutdown(self) {
        let (done, finished) = oneshot::channel();
        if self.command(Command::Shutdown(done)).is_ok() {
            let _ = finished.await;
        }
    }
}

struct Link {
    id: ConnectionId,
    connection: Connection,
}

struct Driver {
    machine: Machine,
    url: Url,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenProvider>,
    keepalive_interval: Duration,
    commands: mpsc::UnboundedReceiver<Command>,
    snapshot: watch::Sender<ClientSnapshot>,
    events: broadcast::Sender<ClientEvent>,
    observers: Arc<Mutex<Vec<Observer>>>,
    last_change: StateChange,
    opened_tx: mpsc::UnboundedSender<(ConnectionId, Result<Connection, TransportError>)>,
    opened_rx: mpsc::UnboundedReceiver<(ConnectionId, Result<Connection, TransportError>)>,
    pending_open: Option<(ConnectionId, JoinHandle<()>)>,
    link: Option<Link>,
    reconnect_at: Option<Pin<Box<Sleep>>>,
    keepalive: Option<Interval>,
}

async fn next_transport_event(link: &mut Option<Link>) -> (ConnectionId, Option<TransportEvent>) {
    match link {
        Some(link) => (link.id, link.connection.inbound.recv().await),
        None => pending().await,
    }
}

async fn reconnect_due(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

async fn keepalive_due(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

impl Driver {
    async fn run(mut self) {
        debug!(url = %self.url, "interpretation client started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Connect) => {
                        let effects = self.machine.connect();
                        self.apply(effects);
                    }
                    Some(Command::Disconnect) => {
                        let effects = self.machine.disconnect();
                        self.apply(effects);
                    }
                    Some(Command::Submit { request, reply }) => {
                        let token = self.tokens.token();
                        let result = self
                            .machine
                            .submit(&request, token)
                            .map(|effects| self.apply(effects));
                        let _ = reply.send(result);
                    }
                    Some(Command::Clear) => {
                        let effects = self.machine.clear_interpretation();
                        self.apply(effects);
                    }
                    Some(Command::Shutdown(done)) => {
                        self.stop();
                        self.commands.close();
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.stop();
                        break;
                    }
                },
                Some((id, result)) = self.opened_rx.recv() => self.on_opened(id, result),
                (id, event) = next_transport_event(&mut self.link) => self.on_transport_event(id, event),
                _ = reconnect_due(&mut self.reconnect_at) => {
                    self.reconnect_at = None;
                    let effects = self.machine.on_reconnect_timer();
                    self.apply(effects);
                }
                _ = keepalive_due(&mut self.keepalive) => {
                    let effects = self.machine.on_keepalive_tick();
                    self.apply(effects);
                }
            }
        }

        debug!("interpretation client stopped");
    }

    fn stop(&mut self) {
        let effects = self.machine.disconnect();
        self.apply(effects);
    }

    fn on_opened(&mut self, id: ConnectionId, result: Result<Connection, TransportError>) {
        if matches!(self.pending_open, Some((pending, _)) if pending == id) {
            self.pending_open = None;
        }

        match result {
            Ok(connection) => {
                let effects = self.machine.on_open(id);
                let rejected = effects
                    .iter()
                    .any(|e| matches!(e, Effect::Close(closed, _) if *closed == id));
                if rejected {
                    let _ = connection
                        .outbound
                        .send(OutboundFrame::Close(NORMAL_CLOSURE));
                } else {
                    info!(url = %self.url, "connected to interpretation service");
                    self.link = Some(Link { id, connection });
                }
                self.apply(effects);
            }
            Err(e) => {
                let effects = self.machine.on_connect_failed(id, &e.to_string());
                self.apply(effects);
            }
        }
    }

    fn on_transport_event(&mut self, id: ConnectionId, event: Option<TransportEvent>) {
        let effects = match event {
            Some(TransportEvent::Frame(text)) => self.machine.on_frame(id, &text),
            Some(TransportEvent::Closed { code }) => {
                self.link = None;
                self.machine.on_closed(id, code)
            }
            None => {
                self.link = None;
                self.machine.on_closed(id, ABNORMAL_CLOSURE)
            }
        };
        self.apply(effects);
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        let mut events = Vec::new();

        for effect in effects {
            match effect {
                Effect::Open(id) => self.open(id),
                Effect::Send(id, message) => self.send(id, message.kind(), message.to_json()),
                Effect::Close(id, code) => self.close(id, code),
                Effect::ScheduleReconnect(delay) => {
                    self.reconnect_at = Some(Box::pin(sleep(delay)));
                }
                Effect::CancelReconnect => self.reconnect_at = None,
                Effect::StartKeepalive => {
                    let period = self.keepalive_interval;
                    self.keepalive = match Instant::now().checked_add(period) {
                        Some(first_tick) => {
                            let mut interval = interval_at(first_tick, period);
                            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                            Some(interval)
                        }
                        None => {
                            warn!(?period, "keepalive interval out of range, pings disabled");
                            None
                        }
                    };
                }
                Effect::StopKeepalive => self.keepalive = None,
                Effect::Emit(event) => events.push(event),
            }
        }

        // Observers read the snapshot, so publish it before notifying
        self.snapshot.send_replace(self.machine.snapshot());
        for event in events {
            self.dispatch(event);
        }
    }

    fn open(&mut self, id: ConnectionId) {
        let connector = self.connector.clone();
        let url = self.url.clone();
        let opened = self.opened_tx.clone();

        debug!(connection = id.0, url = %url, "opening transport");
        let handle = tokio::spawn(async move {
            let result = connector.connect(&url).await;
            let _ = opened.send((id, result));
        });

        if let Some((_, previous)) = self.pending_open.replace((id, handle)) {
            previous.abort();
        }
    }

    fn send(&mut self, id: ConnectionId, kind: &str, json: String) {
        match &self.link {
            Some(link) if link.id == id => {
                if link.connection.outbound.send(OutboundFrame::Text(json)).is_err() {
                    // The reader side reports the closure
                    warn!(kind, "transport writer is gone, message dropped");
                }
            }
            _ => warn!(kind, connection = id.0, "no live transport for message"),
        }
    }

    fn close(&mut self, id: ConnectionId, code: u16) {
        if matches!(self.pending_open, Some((pending, _)) if pending == id) {
            if let Some((_, handle)) = self.pending_open.take() {
                handle.abort();
            }
        }

        if matches!(&self.link, Some(link) if link.id == id) {
            if let Some(link) = self.link.take() {
                let _ = link.connection.outbound.send(OutboundFrame::Close(code));
            }
        }
    }

    fn dispatch(&mut self, event: ClientEvent) {
        let change = match &event {
            ClientEvent::ConnectionChanged { to, .. } => Some(StateChange {
                connection: *to,
                processing: self.last_change.processing,
            }),
            ClientEvent::ProcessingChanged { to, .. } => Some(StateChange {
                connection: self.last_change.connection,
                processing: *to,
            }),
            _ => None,
        };

        if let Some(change) = change {
            self.last_change = change;
            // Callbacks may register observers themselves
            let observers = match self.observers.lock() {
                Ok(observers) => observers.clone(),
                Err(_) => Vec::new(),
            };
            for observer in observers {
                observer(change);
            }
        }

        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl std::fmt::Debug for InterpretationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot.borrow();
        f.debug_struct("InterpretationClient")
            .field("connection", &snapshot.connection)
            .field("processing", &snapshot.processing)
            .finish()
    }
}
