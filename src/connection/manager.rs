//! Connection manager: the handle callers hold and the driver task behind it
//!
//! Every input (caller commands, timer fires, connect results, link signals
//! and connectivity changes) goes through one queue into a single driver
//! task. The driver feeds them to the state machine and carries out the
//! actions it returns, so transitions never race each other.

use crate::connection::config::ConnectionConfig;
use crate::connection::timers::{TimerFired, TimerSet};
use crate::network::{ConnectivityMonitor, NetworkStatus};
use crate::transport::{
    Hello, Link, LinkSignal, PollingConnector, StreamConnector, TransportConnector,
};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use switchback_shared::{
    state_machine::{
        Action, ConnectionState, ConnectionStateMachine, DisconnectReason, Generation, LinkEvent,
        Notification, TimerKind, TransitionResult,
    },
    Event, LinkError, TransportKind, TransportPreference,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Events emitted by the connection manager
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Link is up. Not repeated for upgrades or fallbacks.
    Connected { transport: TransportKind },
    Disconnected { reason: DisconnectReason },
    /// Now on the persistent transport
    Upgraded,
    /// Upgrade attempts used up; reliable for the rest of the session
    Degraded,
    /// Application event from the server
    Received { event: String, payload: Bytes },
}

impl From<Notification> for ConnectionEvent {
    fn from(notification: Notification) -> Self {
        match notification {
            Notification::Connected { transport } => ConnectionEvent::Connected { transport },
            Notification::Disconnected { reason } => ConnectionEvent::Disconnected { reason },
            Notification::Upgraded => ConnectionEvent::Upgraded,
            Notification::Degraded => ConnectionEvent::Degraded,
        }
    }
}

/// Point-in-time view of the manager
#[derive(Debug, Clone, PartialEq)]
pub struct LinkStatus {
    pub state: ConnectionState,
    pub transport: Option<TransportKind>,
    pub preference: TransportPreference,
    pub upgrade_failures: u32,
    pub degraded: bool,
    pub upgraded: bool,
    pub generation: Generation,
}

impl LinkStatus {
    fn of(fsm: &ConnectionStateMachine) -> Self {
        Self {
            state: fsm.state(),
            transport: fsm.current_transport(),
            preference: fsm.preference(),
            upgrade_failures: fsm.attempts().count(),
            degraded: fsm.is_degraded(),
            upgraded: fsm.is_upgraded(),
            generation: fsm.generation(),
        }
    }
}

enum Command {
    Connect,
    Disconnect,
    Send {
        event: String,
        payload: Bytes,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Shutdown,
}

enum Input {
    Command(Command),
    Timer(TimerFired),
    Opened {
        generation: Generation,
        transport: TransportKind,
        session_id: String,
        outbound: mpsc::Sender<Event>,
    },
    OpenFailed {
        generation: Generation,
        error: String,
    },
    Signal {
        generation: Generation,
        signal: LinkSignal,
    },
    ConnectivityRestored,
}

impl From<TimerFired> for Input {
    fn from(fired: TimerFired) -> Self {
        Input::Timer(fired)
    }
}

/// Handle to one logical connection.
///
/// Dropping the handle tears the connection down.
pub struct ConnectionManager {
    input_tx: mpsc::UnboundedSender<Input>,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    status_rx: watch::Receiver<LinkStatus>,
    driver: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Create a manager for `endpoint` using the built-in transports.
    ///
    /// Nothing is dialled until [`connect`](Self::connect).
    pub fn create(
        endpoint: impl Into<String>,
        config: ConnectionConfig,
        connectivity: watch::Receiver<NetworkStatus>,
    ) -> Self {
        let endpoint = endpoint.into();
        let connectors: Vec<Arc<dyn TransportConnector>> = vec![
            Arc::new(PollingConnector::new(
                endpoint.clone(),
                config.connect_timeout,
                config.read_timeout,
            )),
            Arc::new(StreamConnector::new(
                endpoint,
                config.heartbeat_interval,
                config.read_timeout,
            )),
        ];
        Self::with_connectors(config, connectors, connectivity)
    }

    /// Create a manager over caller-supplied transports
    pub fn with_connectors(
        config: ConnectionConfig,
        connectors: Vec<Arc<dyn TransportConnector>>,
        connectivity: watch::Receiver<NetworkStatus>,
    ) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let fsm = ConnectionStateMachine::new(config.policy());
        let (status_tx, status_rx) = watch::channel(LinkStatus::of(&fsm));

        let monitor_tx = input_tx.clone();
        let monitor = ConnectivityMonitor::spawn(connectivity, move || {
            monitor_tx.send(Input::ConnectivityRestored).is_ok()
        });

        let driver = Driver {
            fsm,
            timers: TimerSet::new(input_tx.clone()),
            connectors: connectors.into(),
            hello: Hello {
                credential: config.credential.clone(),
                path: config.path.clone(),
                session_id: None,
            },
            connect_timeout: config.connect_timeout,
            input_tx: input_tx.clone(),
            event_tx,
            status_tx,
            attempt: None,
            outbound: None,
            monitor: Some(monitor),
        };
        let driver = tokio::spawn(driver.run(input_rx));

        Self {
            input_tx,
            event_rx,
            status_rx,
            driver: Some(driver),
        }
    }

    /// Start connecting. A connect while a retry is waiting on backoff
    /// retries immediately; otherwise it is ignored unless disconnected.
    pub fn connect(&self) -> Result<(), LinkError> {
        self.command(Command::Connect)
    }

    /// Drop the link and stop retrying until the next [`connect`](Self::connect)
    pub fn disconnect(&self) -> Result<(), LinkError> {
        self.command(Command::Disconnect)
    }

    /// Hand one event to the live link. Nothing is buffered while the link
    /// is down.
    pub async fn send(
        &self,
        event: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<(), LinkError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send {
            event: event.into(),
            payload: payload.into(),
            reply,
        })?;
        rx.await.map_err(|_| LinkError::Shutdown)?
    }

    /// Receive the next connection event
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.event_rx.recv().await
    }

    pub fn state(&self) -> LinkStatus {
        self.status_rx.borrow().clone()
    }

    /// Tear the connection down and wait for every task to stop
    pub async fn shutdown(&mut self) {
        let _ = self.command(Command::Shutdown);
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
    }

    fn command(&self, command: Command) -> Result<(), LinkError> {
        self.input_tx
            .send(Input::Command(command))
            .map_err(|_| LinkError::Shutdown)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let _ = self.command(Command::Shutdown);
    }
}

struct Attempt {
    generation: Generation,
    task: JoinHandle<()>,
}

struct Driver {
    fsm: ConnectionStateMachine,
    timers: TimerSet<Input>,
    connectors: Arc<[Arc<dyn TransportConnector>]>,
    hello: Hello,
    connect_timeout: Duration,
    input_tx: mpsc::UnboundedSender<Input>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    status_tx: watch::Sender<LinkStatus>,
    /// Open in flight or link being forwarded, for the current generation
    attempt: Option<Attempt>,
    /// Sender of the established link
    outbound: Option<mpsc::Sender<Event>>,
    monitor: Option<ConnectivityMonitor>,
}

impl Driver {
    async fn run(mut self, mut input_rx: mpsc::UnboundedReceiver<Input>) {
        while let Some(input) = input_rx.recv().await {
            self.handle(input);
            if self.fsm.is_torn_down() {
                break;
            }
        }
        self.release();
        debug!("connection driver stopped");
    }

    fn handle(&mut self, input: Input) {
        match input {
            Input::Command(Command::Connect) => {
                self.apply(LinkEvent::Connect);
            }
            Input::Command(Command::Disconnect) => {
                self.apply(LinkEvent::Disconnect);
            }
            Input::Command(Command::Shutdown) => {
                self.apply(LinkEvent::Teardown);
            }
            Input::Command(Command::Send {
                event,
                payload,
                reply,
            }) => {
                let _ = reply.send(self.send(event, payload));
            }
            Input::Timer(fired) => {
                if self.timers.accept(&fired) {
                    self.apply(LinkEvent::TimerElapsed {
                        timer: fired.timer,
                        generation: fired.generation,
                    });
                } else {
                    trace!("dropping cancelled {:?} fire", fired.timer);
                }
            }
            Input::Opened {
                generation,
                transport,
                session_id,
                outbound,
            } => {
                if self.apply(LinkEvent::TransportOpened {
                    generation,
                    transport,
                }) {
                    info!("{} link up, session {}", transport, session_id);
                    self.outbound = Some(outbound);
                    self.hello.session_id = Some(session_id);
                }
            }
            Input::OpenFailed { generation, error } => {
                if generation == self.fsm.generation() {
                    warn!("connect attempt failed: {}", error);
                }
                self.apply(LinkEvent::ConnectFailed { generation });
            }
            Input::Signal {
                generation,
                signal: LinkSignal::Frame(event),
            } => {
                if generation == self.fsm.generation() && self.outbound.is_some() {
                    let _ = self.event_tx.send(ConnectionEvent::Received {
                        event: event.name,
                        payload: event.payload,
                    });
                } else {
                    trace!("dropping frame from generation {}", generation);
                }
            }
            Input::Signal {
                generation,
                signal: LinkSignal::Closed(reason),
            } => {
                self.apply(LinkEvent::TransportClosed { generation, reason });
            }
            Input::ConnectivityRestored => {
                self.apply(LinkEvent::ConnectivityRestored);
            }
        }
    }

    /// Feed one event to the state machine and carry out what it asks for.
    /// Returns whether the event was applied.
    fn apply(&mut self, event: LinkEvent) -> bool {
        let result = self.fsm.process_event(event);

        match &result {
            TransitionResult::Applied { from, to, .. } => {
                if from != to {
                    info!("link state: {:?} -> {:?}", from, to);
                }
                self.explain(event);
            }
            TransitionResult::Stale { current, .. } => {
                debug!("dropping stale {:?} (generation now {})", event, current);
            }
            TransitionResult::Invalid { from, .. } => {
                debug!("ignoring {:?} in {:?}", event, from);
            }
            TransitionResult::Terminated => {
                debug!("ignoring {:?} after teardown", event);
            }
        }

        if !result.is_applied() {
            return false;
        }

        self.status_tx.send_replace(LinkStatus::of(&self.fsm));
        for action in result.into_actions() {
            self.execute(action);
        }
        true
    }

    fn explain(&self, event: LinkEvent) {
        match event {
            LinkEvent::TimerElapsed {
                timer: TimerKind::UpgradeConfirm,
                ..
            } => {
                let err = LinkError::UpgradeTimeout {
                    attempt: self.fsm.attempts().count(),
                };
                warn!("{}, staying on reliable", err);
            }
            LinkEvent::TransportClosed {
                reason: DisconnectReason::ServerInitiated,
                ..
            } => {
                let err = LinkError::ServerInitiatedDisconnect("reconnecting now".into());
                info!("{}", err);
            }
            _ => {}
        }
    }

    fn execute(&mut self, action: Action) {
        match action {
            Action::Open {
                generation,
                preference,
            } => self.open(generation, preference),
            Action::Close { generation } => self.close(generation),
            Action::StartTimer {
                timer,
                generation,
                after,
            } => self.timers.start(timer, generation, after),
            Action::CancelTimer(timer) => {
                self.timers.cancel(timer);
            }
            Action::Notify(notification) => {
                if notification == Notification::Degraded {
                    let err = LinkError::AttemptsExhausted {
                        attempts: self.fsm.attempts().max(),
                    };
                    warn!("{}, committing to reliable", err);
                }
                let _ = self.event_tx.send(notification.into());
            }
            Action::Release => self.release(),
        }
    }

    fn open(&mut self, generation: Generation, preference: TransportPreference) {
        if let Some(previous) = self.attempt.take() {
            previous.task.abort();
        }
        self.outbound = None;

        debug!("opening {} (generation {})", preference, generation);
        let task = tokio::spawn(run_attempt(
            generation,
            preference,
            self.connectors.clone(),
            self.hello.clone(),
            self.connect_timeout,
            self.input_tx.clone(),
        ));
        self.attempt = Some(Attempt { generation, task });
    }

    fn close(&mut self, generation: Generation) {
        let current = matches!(&self.attempt, Some(a) if a.generation == generation);
        if current {
            if let Some(attempt) = self.attempt.take() {
                attempt.task.abort();
            }
        }
        self.outbound = None;
    }

    fn send(&self, event: String, payload: Bytes) -> Result<(), LinkError> {
        let outbound = self.outbound.as_ref().ok_or(LinkError::NotConnected)?;
        outbound
            .try_send(Event {
                name: event,
                payload,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => LinkError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => LinkError::NotConnected,
            })
    }

    fn release(&mut self) {
        if self.timers.live_count() > 0 {
            debug!("cancelling {} live timers", self.timers.live_count());
        }
        self.timers.cancel_all();
        if let Some(attempt) = self.attempt.take() {
            attempt.task.abort();
        }
        self.outbound = None;
        if let Some(monitor) = self.monitor.take() {
            monitor.stop();
        }
    }
}

/// Try each transport of `preference` in order, then forward the first
/// link that comes up until it closes
async fn run_attempt(
    generation: Generation,
    preference: TransportPreference,
    connectors: Arc<[Arc<dyn TransportConnector>]>,
    hello: Hello,
    connect_timeout: Duration,
    tx: mpsc::UnboundedSender<Input>,
) {
    let mut failures = Vec::new();

    for &kind in preference.as_slice() {
        for connector in connectors.iter().filter(|c| c.kind() == kind) {
            debug!("trying {} transport", connector.name());
            let err = match timeout(connect_timeout, connector.connect(&hello)).await {
                Ok(Ok(link)) => {
                    forward(generation, link, &tx).await;
                    return;
                }
                Ok(Err(e)) => LinkError::connect(kind, &e),
                Err(_) => {
                    LinkError::connect(kind, format!("timed out after {:?}", connect_timeout))
                }
            };
            debug!("{}", err);
            failures.push(err.to_string());
        }
    }

    if failures.is_empty() {
        failures.push(format!("no connector for {}", preference));
    }
    let _ = tx.send(Input::OpenFailed {
        generation,
        error: failures.join("; "),
    });
}

async fn forward(generation: Generation, link: Link, tx: &mpsc::UnboundedSender<Input>) {
    let Link {
        transport,
        session_id,
        outbound,
        mut inbound,
        pump,
    } = link;
    // Dropping the pump tears the transport down
    let _pump = pump;

    let opened = Input::Opened {
        generation,
        transport,
        session_id,
        outbound,
    };
    if tx.send(opened).is_err() {
        return;
    }

    let reason = loop {
        match inbound.recv().await {
            Some(LinkSignal::Closed(reason)) => break reason,
            Some(signal) => {
                if tx.send(Input::Signal { generation, signal }).is_err() {
                    return;
                }
            }
            None => break DisconnectReason::NetworkLoss,
        }
    };

    let _ = tx.send(Input::Signal {
        generation,
        signal: LinkSignal::Closed(reason),
    });
}
