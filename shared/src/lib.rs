//! Switchback Shared Types
//!
//! This crate provides the wire types, the frame codec and the runtime-free
//! connection state machine used by the switchback client.

pub mod codec;
pub mod error;
pub mod state_machine;
pub mod transport;

mod proto;

use bytes::Bytes;
use state_machine::DisconnectReason;
use std::time::{SystemTime, UNIX_EPOCH};

// Re-export commonly used types at crate root
pub use error::LinkError;
pub use proto::*;
pub use transport::{AttemptCounter, TransportKind, TransportPreference};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Default connection policy values
pub mod defaults {
    /// Delay after a reliable connect before trying the persistent transport
    pub const UPGRADE_DELAY_MS: u64 = 1000;

    /// How long an upgrade attempt may take before it counts as failed
    pub const UPGRADE_CONFIRM_TIMEOUT_MS: u64 = 5000;

    /// Upgrade attempts per session before committing to the reliable transport
    pub const MAX_UPGRADE_ATTEMPTS: u32 = 3;

    /// First reconnect backoff step
    pub const RECONNECT_DELAY_MS: u64 = 1000;

    /// Reconnect backoff ceiling
    pub const MAX_RECONNECT_DELAY_MS: u64 = 30000;

    /// Per-attempt connect timeout
    pub const CONNECT_TIMEOUT_MS: u64 = 5000;

    /// Client ping interval on the persistent transport
    pub const HEARTBEAT_INTERVAL_MS: u64 = 5000;

    /// Silence on a link longer than this is treated as network loss
    pub const READ_TIMEOUT_MS: u64 = 15000;

    /// Namespace path sent in the handshake
    pub const PATH: &str = "/realtime";
}

impl From<TransportKind> for WireTransport {
    fn from(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Reliable => WireTransport::Polling,
            TransportKind::Persistent => WireTransport::Stream,
        }
    }
}

/// Builder helpers for creating envelopes
impl Envelope {
    pub fn handshake(
        credential: Option<&str>,
        path: &str,
        transport: TransportKind,
        session_id: &str,
    ) -> Self {
        Self::wrap(envelope::Payload::Handshake(Handshake {
            credential: credential.unwrap_or_default().to_string(),
            path: path.to_string(),
            transport: WireTransport::from(transport).into(),
            session_id: session_id.to_string(),
        }))
    }

    pub fn event(name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::wrap(envelope::Payload::Event(Event {
            name: name.into(),
            payload: payload.into(),
        }))
    }

    pub fn ping() -> Self {
        Self::wrap(envelope::Payload::Ping(Ping {
            timestamp_ms: now_ms(),
        }))
    }

    pub fn poll(session_id: &str, events: Vec<Event>) -> Self {
        Self::wrap(envelope::Payload::Poll(Poll {
            session_id: session_id.to_string(),
            events,
        }))
    }

    pub fn close(reason: CloseReason, message: impl Into<String>) -> Self {
        Self::wrap(envelope::Payload::Close(Close {
            reason: reason.into(),
            message: message.into(),
        }))
    }

    fn wrap(payload: envelope::Payload) -> Self {
        Self {
            sequence_id: 0,
            payload: Some(payload),
        }
    }
}

impl Close {
    /// Whether the server closed the session deliberately
    pub fn is_server_initiated(&self) -> bool {
        matches!(
            CloseReason::try_from(self.reason).unwrap_or(CloseReason::Unknown),
            CloseReason::Server | CloseReason::TransportChange
        )
    }

    /// How the state machine should read this close
    pub fn disconnect_reason(&self) -> DisconnectReason {
        if self.is_server_initiated() {
            DisconnectReason::ServerInitiated
        } else {
            DisconnectReason::NetworkLoss
        }
    }
}
