//! Connection State Machine
//!
//! Owns the connection state, the transport preference, the upgrade attempt
//! budget and the set of armed timers. It performs no I/O: every input is a
//! [`LinkEvent`] and every side effect comes back as an [`Action`] for the
//! runtime to carry out.
//!
//! Each connect cycle gets a new [`Generation`]. Events that carry a
//! generation other than the current one are stale and are dropped without
//! touching any state.

use crate::{defaults, AttemptCounter, TransportKind, TransportPreference};
use std::fmt;
use std::time::Duration;

/// Connect-cycle epoch
pub type Generation = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    UpgradePending,
    UpgradeConfirming,
    Reconnecting,
    /// Last attempt failed, next one waits on the backoff timer
    Failed,
}

/// Named timers. At most one of each kind is armed at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    UpgradeDelay,
    UpgradeConfirm,
    ReconnectBackoff,
}

impl TimerKind {
    pub const ALL: [TimerKind; 3] = [
        TimerKind::UpgradeDelay,
        TimerKind::UpgradeConfirm,
        TimerKind::ReconnectBackoff,
    ];

    fn index(self) -> usize {
        match self {
            TimerKind::UpgradeDelay => 0,
            TimerKind::UpgradeConfirm => 1,
            TimerKind::ReconnectBackoff => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Server closed the session on purpose
    ServerInitiated,
    /// Transport error, EOF or read timeout
    NetworkLoss,
    /// Caller asked for it
    ClientInitiated,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ServerInitiated => write!(f, "server closed the connection"),
            DisconnectReason::NetworkLoss => write!(f, "network connection lost"),
            DisconnectReason::ClientInitiated => write!(f, "client disconnect"),
        }
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connect,
    Disconnect,
    Teardown,
    ConnectivityRestored,
    TransportOpened {
        generation: Generation,
        transport: TransportKind,
    },
    /// Every transport in the preference failed to open
    ConnectFailed { generation: Generation },
    TransportClosed {
        generation: Generation,
        reason: DisconnectReason,
    },
    TimerElapsed {
        timer: TimerKind,
        generation: Generation,
    },
}

impl LinkEvent {
    pub fn generation(&self) -> Option<Generation> {
        match *self {
            LinkEvent::TransportOpened { generation, .. }
            | LinkEvent::ConnectFailed { generation }
            | LinkEvent::TransportClosed { generation, .. }
            | LinkEvent::TimerElapsed { generation, .. } => Some(generation),
            _ => None,
        }
    }
}

/// Coarse notifications surfaced to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    Connected { transport: TransportKind },
    Disconnected { reason: DisconnectReason },
    Upgraded,
    Degraded,
}

/// Side effects requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Open a link, trying the preference in order
    Open {
        generation: Generation,
        preference: TransportPreference,
    },
    /// Drop whatever link or attempt belongs to `generation`
    Close { generation: Generation },
    /// Arm a timer, replacing any armed timer of the same kind
    StartTimer {
        timer: TimerKind,
        generation: Generation,
        after: Duration,
    },
    CancelTimer(TimerKind),
    Notify(Notification),
    /// Terminal: release every resource
    Release,
}

/// Result of feeding one event to the state machine
#[derive(Debug, Clone)]
pub enum TransitionResult {
    Applied {
        from: ConnectionState,
        to: ConnectionState,
        actions: Vec<Action>,
    },
    /// Event belonged to a superseded connect cycle or a cancelled timer
    Stale { event: LinkEvent, current: Generation },
    /// Event has no meaning in the current state
    Invalid { from: ConnectionState, event: LinkEvent },
    /// Manager was torn down
    Terminated,
}

impl TransitionResult {
    pub fn actions(&self) -> &[Action] {
        match self {
            TransitionResult::Applied { actions, .. } => actions,
            _ => &[],
        }
    }

    pub fn into_actions(self) -> Vec<Action> {
        match self {
            TransitionResult::Applied { actions, .. } => actions,
            _ => Vec::new(),
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionResult::Applied { .. })
    }
}

/// Timing and budget knobs of the upgrade and reconnect logic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradePolicy {
    pub upgrade_delay: Duration,
    pub confirm_timeout: Duration,
    pub max_upgrade_attempts: u32,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl Default for UpgradePolicy {
    fn default() -> Self {
        Self {
            upgrade_delay: Duration::from_millis(defaults::UPGRADE_DELAY_MS),
            confirm_timeout: Duration::from_millis(defaults::UPGRADE_CONFIRM_TIMEOUT_MS),
            max_upgrade_attempts: defaults::MAX_UPGRADE_ATTEMPTS,
            reconnect_delay: Duration::from_millis(defaults::RECONNECT_DELAY_MS),
            max_reconnect_delay: Duration::from_millis(defaults::MAX_RECONNECT_DELAY_MS),
        }
    }
}

impl UpgradePolicy {
    /// Exponential backoff for the `retry`-th consecutive reconnect (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        let delay = self.reconnect_delay.saturating_mul(1u32 << exp);
        std::cmp::min(delay, self.max_reconnect_delay)
    }
}

#[derive(Debug)]
pub struct ConnectionStateMachine {
    policy: UpgradePolicy,
    state: ConnectionState,
    generation: Generation,
    preference: TransportPreference,
    attempts: AttemptCounter,
    /// Reliable for the rest of the session
    degraded: bool,
    /// At least one upgrade succeeded this session
    upgraded: bool,
    /// Transport of the live link, if any
    established: Option<TransportKind>,
    /// Caller has seen `Connected` without a matching `Disconnected`
    announced: bool,
    /// Consecutive reconnect attempts, drives the backoff
    retries: u32,
    armed: [Option<Generation>; 3],
    torn_down: bool,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new(UpgradePolicy::default())
    }
}

impl ConnectionStateMachine {
    pub fn new(policy: UpgradePolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            generation: 0,
            preference: TransportPreference::RELIABLE,
            attempts: AttemptCounter::new(policy.max_upgrade_attempts),
            degraded: false,
            upgraded: false,
            established: None,
            announced: false,
            retries: 0,
            armed: [None; 3],
            torn_down: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn preference(&self) -> TransportPreference {
        self.preference
    }

    pub fn attempts(&self) -> AttemptCounter {
        self.attempts
    }

    pub fn policy(&self) -> &UpgradePolicy {
        &self.policy
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn is_upgraded(&self) -> bool {
        self.upgraded
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn is_armed(&self, timer: TimerKind) -> bool {
        self.armed[timer.index()].is_some()
    }

    /// Transport in use, or being attempted, in the current state
    pub fn current_transport(&self) -> Option<TransportKind> {
        match self.state {
            ConnectionState::Connected | ConnectionState::UpgradePending => self.established,
            ConnectionState::Connecting
            | ConnectionState::Reconnecting
            | ConnectionState::UpgradeConfirming => Some(self.preference.primary()),
            ConnectionState::Disconnected | ConnectionState::Failed => None,
        }
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: LinkEvent) -> TransitionResult {
        if self.torn_down {
            return TransitionResult::Terminated;
        }

        if let Some(generation) = event.generation() {
            if generation != self.generation {
                return TransitionResult::Stale {
                    event,
                    current: self.generation,
                };
            }
        }

        if let LinkEvent::TimerElapsed { timer, generation } = event {
            if self.armed[timer.index()] != Some(generation) {
                return TransitionResult::Stale {
                    event,
                    current: self.generation,
                };
            }
        }

        let from = self.state;
        let mut actions = Vec::new();

        let applied = match event {
            LinkEvent::Connect => self.on_connect(&mut actions),
            LinkEvent::Disconnect => self.on_disconnect(&mut actions),
            LinkEvent::Teardown => {
                self.on_teardown(&mut actions);
                true
            }
            LinkEvent::ConnectivityRestored => self.on_connectivity_restored(&mut actions),
            LinkEvent::TransportOpened { transport, .. } => {
                self.on_transport_opened(transport, &mut actions)
            }
            LinkEvent::ConnectFailed { .. } => self.on_connect_failed(&mut actions),
            LinkEvent::TransportClosed { reason, .. } => {
                self.on_transport_closed(reason, &mut actions)
            }
            LinkEvent::TimerElapsed { timer, .. } => self.on_timer(timer, &mut actions),
        };

        if applied {
            TransitionResult::Applied {
                from,
                to: self.state,
                actions,
            }
        } else {
            TransitionResult::Invalid { from, event }
        }
    }

    fn on_connect(&mut self, out: &mut Vec<Action>) -> bool {
        match self.state {
            ConnectionState::Disconnected => {
                self.retries = 0;
                self.state = ConnectionState::Connecting;
                self.open(TransportPreference::RELIABLE, out);
                true
            }
            ConnectionState::Reconnecting | ConnectionState::Failed
                if self.is_armed(TimerKind::ReconnectBackoff) =>
            {
                self.retry_now(out);
                true
            }
            _ => false,
        }
    }

    fn on_disconnect(&mut self, out: &mut Vec<Action>) -> bool {
        if self.state == ConnectionState::Disconnected {
            return false;
        }

        self.cancel_all_timers(out);
        out.push(Action::Close {
            generation: self.generation,
        });
        // Late results of the closed cycle must not match anymore
        self.generation += 1;
        self.established = None;
        self.state = ConnectionState::Disconnected;
        self.announce_disconnect(DisconnectReason::ClientInitiated, out);
        true
    }

    fn on_teardown(&mut self, out: &mut Vec<Action>) {
        self.cancel_all_timers(out);
        if self.state != ConnectionState::Disconnected {
            out.push(Action::Close {
                generation: self.generation,
            });
        }
        self.generation += 1;
        self.established = None;
        self.state = ConnectionState::Disconnected;
        self.torn_down = true;
        out.push(Action::Release);
    }

    /// Only a retry waiting on backoff is hurried along. `Disconnected` is
    /// left alone: it is reached only before the first connect or after the
    /// caller asked to disconnect, and a restore must not override that.
    fn on_connectivity_restored(&mut self, out: &mut Vec<Action>) -> bool {
        match self.state {
            ConnectionState::Reconnecting | ConnectionState::Failed
                if self.is_armed(TimerKind::ReconnectBackoff) =>
            {
                self.retry_now(out);
                true
            }
            _ => false,
        }
    }

    fn on_transport_opened(&mut self, transport: TransportKind, out: &mut Vec<Action>) -> bool {
        match (self.state, transport) {
            (ConnectionState::Connecting | ConnectionState::Reconnecting, _) => {
                self.establish(transport, out);
                true
            }
            (ConnectionState::UpgradeConfirming, TransportKind::Persistent) => {
                self.cancel_timer(TimerKind::UpgradeConfirm, out);
                self.established = Some(TransportKind::Persistent);
                self.upgraded = true;
                self.state = ConnectionState::Connected;
                out.push(Action::Notify(Notification::Upgraded));
                true
            }
            (ConnectionState::UpgradeConfirming, TransportKind::Reliable) => {
                // Persistent leg failed inside the attempt, reliable answered
                self.cancel_timer(TimerKind::UpgradeConfirm, out);
                self.fail_upgrade(out);
                self.establish(TransportKind::Reliable, out);
                true
            }
            _ => false,
        }
    }

    fn on_connect_failed(&mut self, out: &mut Vec<Action>) -> bool {
        match self.state {
            ConnectionState::UpgradeConfirming => {
                self.cancel_timer(TimerKind::UpgradeConfirm, out);
                self.fail_upgrade(out);
                self.state = ConnectionState::Reconnecting;
                self.open(TransportPreference::RELIABLE, out);
                true
            }
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                if self.preference.primary() == TransportKind::Persistent
                    && self.attempts.is_exhausted()
                {
                    self.degrade(out);
                    self.state = ConnectionState::Reconnecting;
                    self.open(TransportPreference::RELIABLE, out);
                    return true;
                }

                self.announce_disconnect(DisconnectReason::NetworkLoss, out);
                self.state = ConnectionState::Failed;
                self.schedule_retry(out);
                true
            }
            _ => false,
        }
    }

    fn on_transport_closed(&mut self, reason: DisconnectReason, out: &mut Vec<Action>) -> bool {
        if !matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::UpgradePending
        ) {
            return false;
        }

        self.cancel_timer(TimerKind::UpgradeDelay, out);
        out.push(Action::Close {
            generation: self.generation,
        });
        self.established = None;
        self.announce_disconnect(reason, out);
        self.state = ConnectionState::Reconnecting;

        match reason {
            DisconnectReason::ServerInitiated => self.open(self.preference, out),
            DisconnectReason::NetworkLoss | DisconnectReason::ClientInitiated => {
                self.schedule_retry(out)
            }
        }
        true
    }

    fn on_timer(&mut self, timer: TimerKind, out: &mut Vec<Action>) -> bool {
        match (timer, self.state) {
            (TimerKind::UpgradeDelay, ConnectionState::UpgradePending) => {
                self.armed[timer.index()] = None;
                out.push(Action::Close {
                    generation: self.generation,
                });
                self.state = ConnectionState::UpgradeConfirming;
                self.open(TransportPreference::UPGRADE, out);
                self.start_timer(TimerKind::UpgradeConfirm, self.policy.confirm_timeout, out);
                true
            }
            (TimerKind::UpgradeConfirm, ConnectionState::UpgradeConfirming) => {
                self.armed[timer.index()] = None;
                out.push(Action::Close {
                    generation: self.generation,
                });
                self.fail_upgrade(out);
                self.state = ConnectionState::Reconnecting;
                self.open(TransportPreference::RELIABLE, out);
                true
            }
            (
                TimerKind::ReconnectBackoff,
                ConnectionState::Reconnecting | ConnectionState::Failed,
            ) => {
                self.armed[timer.index()] = None;
                self.state = ConnectionState::Reconnecting;
                self.open(self.preference, out);
                true
            }
            _ => false,
        }
    }

    /// A link came up from Connecting/Reconnecting/fallback
    fn establish(&mut self, transport: TransportKind, out: &mut Vec<Action>) {
        self.retries = 0;
        self.established = Some(transport);

        if !self.announced {
            self.announced = true;
            out.push(Action::Notify(Notification::Connected { transport }));
        }

        match transport {
            TransportKind::Reliable => {
                self.preference = TransportPreference::RELIABLE;
                if self.upgrade_allowed() {
                    self.state = ConnectionState::UpgradePending;
                    self.start_timer(TimerKind::UpgradeDelay, self.policy.upgrade_delay, out);
                } else {
                    self.state = ConnectionState::Connected;
                }
            }
            TransportKind::Persistent => {
                self.state = ConnectionState::Connected;
            }
        }
    }

    fn upgrade_allowed(&self) -> bool {
        !self.degraded && !self.attempts.is_exhausted()
    }

    fn fail_upgrade(&mut self, out: &mut Vec<Action>) {
        self.attempts.record_failure();
        if self.attempts.is_exhausted() {
            self.degrade(out);
        }
    }

    fn degrade(&mut self, out: &mut Vec<Action>) {
        self.preference = TransportPreference::RELIABLE;
        if !self.degraded {
            self.degraded = true;
            out.push(Action::Notify(Notification::Degraded));
        }
    }

    fn announce_disconnect(&mut self, reason: DisconnectReason, out: &mut Vec<Action>) {
        if self.announced {
            self.announced = false;
            out.push(Action::Notify(Notification::Disconnected { reason }));
        }
    }

    fn retry_now(&mut self, out: &mut Vec<Action>) {
        self.cancel_timer(TimerKind::ReconnectBackoff, out);
        self.retries = 0;
        self.state = ConnectionState::Reconnecting;
        self.open(self.preference, out);
    }

    fn schedule_retry(&mut self, out: &mut Vec<Action>) {
        self.retries = self.retries.saturating_add(1);
        let after = self.policy.backoff(self.retries);
        self.start_timer(TimerKind::ReconnectBackoff, after, out);
    }

    /// Begin a new connect cycle
    fn open(&mut self, preference: TransportPreference, out: &mut Vec<Action>) {
        self.generation += 1;
        self.preference = if self.degraded {
            TransportPreference::RELIABLE
        } else {
            preference
        };
        out.push(Action::Open {
            generation: self.generation,
            preference: self.preference,
        });
    }

    fn start_timer(&mut self, timer: TimerKind, after: Duration, out: &mut Vec<Action>) {
        self.armed[timer.index()] = Some(self.generation);
        out.push(Action::StartTimer {
            timer,
            generation: self.generation,
            after,
        });
    }

    fn cancel_timer(&mut self, timer: TimerKind, out: &mut Vec<Action>) {
        if self.armed[timer.index()].take().is_some() {
            out.push(Action::CancelTimer(timer));
        }
    }

    fn cancel_all_timers(&mut self, out: &mut Vec<Action>) {
        for timer in TimerKind::ALL {
            self.cancel_timer(timer, out);
        }
    }
}
