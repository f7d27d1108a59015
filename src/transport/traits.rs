//! Transport trait abstraction for pluggable network backends

use anyhow::Result;
use async_trait::async_trait;
use switchback_shared::{state_machine::DisconnectReason, Envelope, Event, TransportKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What a live link reports to the manager
#[derive(Debug, Clone, PartialEq)]
pub enum LinkSignal {
    /// Application event from the server
    Frame(Event),
    /// The link is gone; nothing follows this
    Closed(DisconnectReason),
}

/// Handshake parameters sent on every new link
#[derive(Debug, Clone, Default)]
pub struct Hello {
    pub credential: Option<String>,
    pub path: String,
    /// Session to resume, if the server handed one out earlier
    pub session_id: Option<String>,
}

impl Hello {
    pub fn envelope(&self, transport: TransportKind) -> Envelope {
        Envelope::handshake(
            self.credential.as_deref(),
            &self.path,
            transport,
            self.session_id.as_deref().unwrap_or_default(),
        )
    }
}

/// Aborts the transport's background task when dropped
#[derive(Debug)]
pub struct PumpHandle(JoinHandle<()>);

impl Drop for PumpHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// An established link. Dropping it tears the connection down.
#[derive(Debug)]
pub struct Link {
    pub transport: TransportKind,
    pub session_id: String,
    /// Events to deliver to the server
    pub outbound: mpsc::Sender<Event>,
    /// Events and the final close from the server
    pub inbound: mpsc::Receiver<LinkSignal>,
    pub pump: Option<PumpHandle>,
}

impl Link {
    pub fn new(
        transport: TransportKind,
        session_id: impl Into<String>,
        outbound: mpsc::Sender<Event>,
        inbound: mpsc::Receiver<LinkSignal>,
        pump: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            transport,
            session_id: session_id.into(),
            outbound,
            inbound,
            pump: pump.map(PumpHandle),
        }
    }
}

/// Factory for links over one transport kind
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Which transport this connector provides
    fn kind(&self) -> TransportKind;

    /// Human-readable name for logs
    fn name(&self) -> &'static str;

    /// Attempt to connect and complete the handshake
    async fn connect(&self, hello: &Hello) -> Result<Link>;
}
