//! Reliable transport: request/response emulation of a duplex channel
//!
//! Every exchange opens a fresh TCP connection, writes one envelope and reads
//! one envelope back, so nothing relies on a long-lived socket surviving a
//! proxy or NAT. After the handshake the link runs two loops:
//!
//! - receive: an empty `Poll` that the server holds until it has events
//! - send: a `Poll` carrying a batch of outbound events, answered at once

use crate::transport::frames::{expect_ack, read_envelope, write_envelope};
use crate::transport::traits::{Hello, Link, LinkSignal, TransportConnector};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::time::Duration;
use switchback_shared::{
    codec::FrameDecoder, envelope::Payload, state_machine::DisconnectReason, Envelope, Event,
    TransportKind,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace};

const OUTBOUND_CAPACITY: usize = 64;
const INBOUND_CAPACITY: usize = 256;
const MAX_BATCH: usize = 32;

/// Connector for the long-polling transport
pub struct PollingConnector {
    address: String,
    /// Bound on a send exchange
    request_timeout: Duration,
    /// Bound on a held receive exchange
    poll_timeout: Duration,
}

impl PollingConnector {
    pub fn new(address: String, request_timeout: Duration, poll_timeout: Duration) -> Self {
        Self {
            address,
            request_timeout,
            poll_timeout,
        }
    }
}

#[async_trait]
impl TransportConnector for PollingConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Reliable
    }

    fn name(&self) -> &'static str {
        "polling"
    }

    async fn connect(&self, hello: &Hello) -> Result<Link> {
        let reply = exchange(&self.address, &hello.envelope(TransportKind::Reliable)).await?;
        let ack = expect_ack(reply)?;

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (signal_tx, signal_rx) = mpsc::channel(INBOUND_CAPACITY);

        let session = Session {
            address: self.address.clone(),
            session_id: ack.session_id.clone(),
            request_timeout: self.request_timeout,
            poll_timeout: self.poll_timeout,
        };

        let pump = tokio::spawn(async move {
            let reason = tokio::select! {
                reason = session.receive_loop(&signal_tx) => reason,
                reason = session.send_loop(outbound_rx) => reason,
            };
            let _ = signal_tx.send(LinkSignal::Closed(reason)).await;
        });

        Ok(Link::new(
            TransportKind::Reliable,
            ack.session_id,
            outbound_tx,
            signal_rx,
            Some(pump),
        ))
    }
}

/// One request envelope out, one reply envelope back
pub async fn exchange(address: &str, request: &Envelope) -> Result<Option<Envelope>> {
    let mut stream = TcpStream::connect(address).await?;
    write_envelope(&mut stream, request).await?;

    let mut decoder = FrameDecoder::new();
    Ok(read_envelope(&mut stream, &mut decoder).await?)
}

struct Session {
    address: String,
    session_id: String,
    request_timeout: Duration,
    poll_timeout: Duration,
}

impl Session {
    async fn request(&self, request: &Envelope, limit: Duration) -> Result<Envelope> {
        match timeout(limit, exchange(&self.address, request)).await {
            Ok(Ok(Some(reply))) => Ok(reply),
            Ok(Ok(None)) => Err(anyhow!("server closed the exchange without a reply")),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(anyhow!("exchange timed out after {:?}", limit)),
        }
    }

    async fn receive_loop(&self, signal_tx: &mpsc::Sender<LinkSignal>) -> DisconnectReason {
        loop {
            let poll = Envelope::poll(&self.session_id, Vec::new());
            let reply = match timeout(self.poll_timeout, exchange(&self.address, &poll)).await {
                Ok(Ok(Some(reply))) => reply,
                Ok(Ok(None)) => {
                    debug!("server closed the poll without a reply");
                    return DisconnectReason::NetworkLoss;
                }
                Ok(Err(e)) => {
                    debug!("poll failed: {}", e);
                    return DisconnectReason::NetworkLoss;
                }
                // An idle server may hold a poll past our bound
                Err(_) => {
                    trace!("poll held for {:?}, polling again", self.poll_timeout);
                    continue;
                }
            };

            match reply.payload {
                Some(Payload::Poll(batch)) => {
                    for event in batch.events {
                        if signal_tx.send(LinkSignal::Frame(event)).await.is_err() {
                            return DisconnectReason::ClientInitiated;
                        }
                    }
                }
                Some(Payload::Close(close)) => return close.disconnect_reason(),
                other => debug!("ignoring unexpected poll reply: {:?}", other),
            }
        }
    }

    async fn send_loop(&self, mut outbound_rx: mpsc::Receiver<Event>) -> DisconnectReason {
        while let Some(first) = outbound_rx.recv().await {
            let mut batch = vec![first];
            while batch.len() < MAX_BATCH {
                match outbound_rx.try_recv() {
                    Ok(event) => batch.push(event),
                    Err(_) => break,
                }
            }

            let delivery = Envelope::poll(&self.session_id, batch);
            match self.request(&delivery, self.request_timeout).await {
                Ok(reply) => {
                    if let Some(Payload::Close(close)) = reply.payload {
                        return close.disconnect_reason();
                    }
                }
                Err(e) => {
                    debug!("delivery failed: {}", e);
                    return DisconnectReason::NetworkLoss;
                }
            }
        }
        DisconnectReason::ClientInitiated
    }
}
