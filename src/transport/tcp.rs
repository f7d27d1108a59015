//! Persistent transport: one long-lived TCP stream carrying framed envelopes

use crate::transport::frames::{expect_ack, fill, read_envelope, write_envelope};
use crate::transport::traits::{Hello, Link, LinkSignal, TransportConnector};
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use switchback_shared::{
    codec::FrameDecoder, envelope::Payload, state_machine::DisconnectReason, CloseReason,
    Envelope, Event, TransportKind,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tracing::{debug, trace};

const OUTBOUND_CAPACITY: usize = 64;
const INBOUND_CAPACITY: usize = 256;
const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// TCP connector for the persistent stream transport
pub struct StreamConnector {
    address: String,
    heartbeat_interval: Duration,
    read_timeout: Duration,
}

impl StreamConnector {
    pub fn new(address: String, heartbeat_interval: Duration, read_timeout: Duration) -> Self {
        Self {
            address,
            heartbeat_interval: heartbeat_interval.max(MIN_HEARTBEAT),
            read_timeout,
        }
    }
}

#[async_trait]
impl TransportConnector for StreamConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Persistent
    }

    fn name(&self) -> &'static str {
        "stream"
    }

    async fn connect(&self, hello: &Hello) -> Result<Link> {
        let mut stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;

        write_envelope(&mut stream, &hello.envelope(TransportKind::Persistent)).await?;
        let mut decoder = FrameDecoder::new();
        let ack = expect_ack(read_envelope(&mut stream, &mut decoder).await?)?;

        let heartbeat = match ack.ping_interval_ms {
            0 => self.heartbeat_interval,
            ms => Duration::from_millis(ms),
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (signal_tx, signal_rx) = mpsc::channel(INBOUND_CAPACITY);
        let read_timeout = self.read_timeout;

        let pump = tokio::spawn(async move {
            let reason = match run_stream(
                stream,
                decoder,
                outbound_rx,
                &signal_tx,
                heartbeat,
                read_timeout,
            )
            .await
            {
                Ok(reason) => reason,
                Err(e) => {
                    debug!("stream transport error: {}", e);
                    DisconnectReason::NetworkLoss
                }
            };
            let _ = signal_tx.send(LinkSignal::Closed(reason)).await;
        });

        Ok(Link::new(
            TransportKind::Persistent,
            ack.session_id,
            outbound_tx,
            signal_rx,
            Some(pump),
        ))
    }
}

/// Drive an established stream until it closes
async fn run_stream(
    stream: TcpStream,
    mut decoder: FrameDecoder,
    mut outbound_rx: mpsc::Receiver<Event>,
    signal_tx: &mpsc::Sender<LinkSignal>,
    heartbeat: Duration,
    read_timeout: Duration,
) -> Result<DisconnectReason> {
    let (mut reader, mut writer) = stream.into_split();
    let mut heartbeat_ticker = interval_at(Instant::now() + heartbeat, heartbeat);
    let mut last_heard = Instant::now();

    // Frames that arrived together with the handshake ack
    while let Some(envelope) = decoder.decode_next()? {
        if let Some(reason) = dispatch(envelope, signal_tx, &mut writer).await? {
            return Ok(reason);
        }
    }

    loop {
        tokio::select! {
            _ = heartbeat_ticker.tick() => {
                if last_heard.elapsed() > read_timeout {
                    debug!("no traffic for {:?}, dropping stream", last_heard.elapsed());
                    return Ok(DisconnectReason::NetworkLoss);
                }
                write_envelope(&mut writer, &Envelope::ping()).await?;
            }

            outbound = outbound_rx.recv() => match outbound {
                Some(event) => {
                    write_envelope(&mut writer, &Envelope::event(event.name, event.payload)).await?;
                }
                None => {
                    // Manager let go of the link
                    let bye = Envelope::close(CloseReason::Client, "");
                    let _ = write_envelope(&mut writer, &bye).await;
                    return Ok(DisconnectReason::ClientInitiated);
                }
            },

            more = fill(&mut reader, &mut decoder) => {
                if !more? {
                    debug!("stream closed without a close frame");
                    return Ok(DisconnectReason::NetworkLoss);
                }
                last_heard = Instant::now();

                while let Some(envelope) = decoder.decode_next()? {
                    if let Some(reason) = dispatch(envelope, signal_tx, &mut writer).await? {
                        return Ok(reason);
                    }
                }
            }
        }
    }
}

/// Handle one inbound envelope; `Some` ends the stream
async fn dispatch<W>(
    envelope: Envelope,
    signal_tx: &mpsc::Sender<LinkSignal>,
    writer: &mut W,
) -> Result<Option<DisconnectReason>>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    match envelope.payload {
        Some(Payload::Event(event)) => {
            if signal_tx.send(LinkSignal::Frame(event)).await.is_err() {
                return Ok(Some(DisconnectReason::ClientInitiated));
            }
        }
        Some(Payload::Close(close)) => return Ok(Some(close.disconnect_reason())),
        Some(Payload::Ping(ping)) => {
            let pong = Envelope {
                sequence_id: envelope.sequence_id,
                payload: Some(Payload::Pong(switchback_shared::Pong {
                    timestamp_ms: ping.timestamp_ms,
                })),
            };
            write_envelope(writer, &pong).await?;
        }
        Some(Payload::Pong(_)) => trace!("pong"),
        other => debug!("ignoring unexpected frame on stream: {:?}", other),
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use switchback_shared::HandshakeAck;
    use tokio::net::TcpListener;

    async fn read_one(sock: &mut TcpStream, decoder: &mut FrameDecoder) -> Envelope {
        read_envelope(sock, decoder)
            .await
            .expect("read failed")
            .expect("unexpected eof")
    }

    fn ack(session_id: &str) -> Envelope {
        Envelope {
            sequence_id: 0,
            payload: Some(Payload::HandshakeAck(HandshakeAck {
                session_id: session_id.into(),
                ping_interval_ms: 0,
            })),
        }
    }

    fn connector(address: String) -> StreamConnector {
        StreamConnector::new(address, Duration::from_secs(5), Duration::from_secs(15))
    }

    #[test]
    fn test_stream_connector_kind() {
        let c = connector("127.0.0.1:1".into());
        assert_eq!(c.kind(), TransportKind::Persistent);
        assert_eq!(c.name(), "stream");
    }

    #[tokio::test]
    async fn test_stream_exchange_and_server_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr").to_string();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.expect("accept");
            let mut decoder = FrameDecoder::new();

            let hello = read_one(&mut sock, &mut decoder).await;
            let Some(Payload::Handshake(hs)) = hello.payload else {
                panic!("expected handshake");
            };
            assert_eq!(hs.credential, "secret");
            assert_eq!(hs.path, "/rt");
            assert_eq!(hs.session_id, "prior");

            write_envelope(&mut sock, &ack("s-1")).await.expect("write");
            write_envelope(&mut sock, &Envelope::event("welcome", Bytes::from_static(b"hi")))
                .await
                .expect("write");

            let reply = read_one(&mut sock, &mut decoder).await;
            let Some(Payload::Event(ev)) = reply.payload else {
                panic!("expected event");
            };
            assert_eq!(ev.name, "answer");

            write_envelope(&mut sock, &Envelope::close(CloseReason::Server, "bye"))
                .await
                .expect("write");
        });

        let hello = Hello {
            credential: Some("secret".into()),
            path: "/rt".into(),
            session_id: Some("prior".into()),
        };
        let mut link = connector(address).connect(&hello).await.expect("connect");
        assert_eq!(link.session_id, "s-1");
        assert_eq!(link.transport, TransportKind::Persistent);

        match link.inbound.recv().await {
            Some(LinkSignal::Frame(ev)) => assert_eq!(ev.name, "welcome"),
            other => panic!("unexpected: {:?}", other),
        }

        link.outbound
            .send(Event {
                name: "answer".into(),
                payload: Bytes::from_static(b"42"),
            })
            .await
            .expect("send");

        assert_eq!(
            link.inbound.recv().await,
            Some(LinkSignal::Closed(DisconnectReason::ServerInitiated))
        );
        server.await.expect("server panicked");
    }

    #[tokio::test]
    async fn test_eof_is_network_loss() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr").to_string();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.expect("accept");
            let mut decoder = FrameDecoder::new();
            read_one(&mut sock, &mut decoder).await;
            write_envelope(&mut sock, &ack("s-2")).await.expect("write");
            // dropping the socket without a close frame
        });

        let mut link = connector(address)
            .connect(&Hello::default())
            .await
            .expect("connect");
        assert_eq!(
            link.inbound.recv().await,
            Some(LinkSignal::Closed(DisconnectReason::NetworkLoss))
        );
    }

    #[tokio::test]
    async fn test_handshake_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr").to_string();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.expect("accept");
            let mut decoder = FrameDecoder::new();
            read_one(&mut sock, &mut decoder).await;
            write_envelope(&mut sock, &Envelope::close(CloseReason::Server, "denied"))
                .await
                .expect("write");
        });

        let err = connector(address)
            .connect(&Hello::default())
            .await
            .expect_err("handshake should fail");
        assert!(err.to_string().contains("denied"));
    }
}
