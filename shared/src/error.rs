//! Error taxonomy of the connection manager

use crate::codec::CodecError;
use crate::TransportKind;
use thiserror::Error;

/// Errors produced while establishing or using a link.
///
/// Only `NotConnected`, `Backpressure` and `Shutdown` ever reach a caller;
/// the rest are handled internally by the state machine and logged.
#[derive(Error, Debug)]
pub enum LinkError {
    /// A connect attempt failed
    #[error("{transport} connect failed: {reason}")]
    TransportConnect {
        transport: TransportKind,
        reason: String,
    },

    /// The confirm timer fired before the persistent transport came up
    #[error("upgrade attempt {attempt} timed out")]
    UpgradeTimeout { attempt: u32 },

    /// All upgrade attempts used; the session stays on the reliable transport
    #[error("upgrade attempts exhausted after {attempts}")]
    AttemptsExhausted { attempts: u32 },

    /// The server closed the session on purpose
    #[error("server closed the connection: {0}")]
    ServerInitiatedDisconnect(String),

    #[error("handshake rejected: {0}")]
    Handshake(String),

    #[error("not connected")]
    NotConnected,

    /// The live link's outbound queue is full
    #[error("send queue full")]
    Backpressure,

    #[error("connection manager has shut down")]
    Shutdown,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LinkError {
    pub fn connect(transport: TransportKind, reason: impl ToString) -> Self {
        Self::TransportConnect {
            transport,
            reason: reason.to_string(),
        }
    }
}
