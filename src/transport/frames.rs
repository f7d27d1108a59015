//! Reading and writing single envelopes on a byte stream

use std::io;
use switchback_shared::{
    codec::{self, FrameDecoder},
    envelope::Payload,
    Envelope, HandshakeAck, LinkError,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), LinkError>
where
    W: AsyncWrite + Unpin,
{
    let encoded = codec::encode(envelope)?;
    writer.write_all(&encoded).await?;
    Ok(())
}

/// Read until one whole envelope is decoded. `Ok(None)` on clean EOF.
pub async fn read_envelope<R>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
) -> Result<Option<Envelope>, LinkError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(envelope) = decoder.decode_next()? {
            return Ok(Some(envelope));
        }
        if !fill(reader, decoder).await? {
            return Ok(None);
        }
    }
}

/// Pull whatever bytes are ready into the decoder. Returns false on clean
/// EOF. Cancel safe, so it can sit in a `select!` arm.
pub async fn fill<R>(reader: &mut R, decoder: &mut FrameDecoder) -> Result<bool, LinkError>
where
    R: AsyncRead + Unpin,
{
    if reader.read_buf(decoder.buffer_mut()).await? > 0 {
        return Ok(true);
    }
    if decoder.has_partial() {
        let cut = io::Error::new(io::ErrorKind::UnexpectedEof, "stream ended inside a frame");
        return Err(cut.into());
    }
    Ok(false)
}

/// Accept only a handshake acknowledgement
pub fn expect_ack(envelope: Option<Envelope>) -> Result<HandshakeAck, LinkError> {
    match envelope.and_then(|e| e.payload) {
        Some(Payload::HandshakeAck(ack)) => Ok(ack),
        Some(Payload::Close(close)) => Err(LinkError::Handshake(if close.message.is_empty() {
            "closed by server".into()
        } else {
            close.message
        })),
        Some(other) => Err(LinkError::Handshake(format!(
            "unexpected reply {:?}",
            other
        ))),
        None => Err(LinkError::Handshake("connection closed".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use switchback_shared::CloseReason;

    #[tokio::test]
    async fn test_read_across_small_reads() {
        let (mut client, mut server) = tokio::io::duplex(8);
        let sent = Envelope::event("chat", Bytes::from_static(b"a longer payload than eight"));

        let writer = tokio::spawn(async move {
            write_envelope(&mut client, &sent).await.expect("write failed");
        });

        let mut decoder = FrameDecoder::new();
        let got = read_envelope(&mut server, &mut decoder)
            .await
            .expect("read failed")
            .expect("eof before frame");
        writer.await.expect("writer panicked");

        assert!(matches!(got.payload, Some(Payload::Event(ev)) if ev.name == "chat"));
    }

    #[tokio::test]
    async fn test_clean_eof() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let mut decoder = FrameDecoder::new();
        let got = read_envelope(&mut server, &mut decoder)
            .await
            .expect("eof is not an error");
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_eof_inside_frame_is_io_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let encoded = codec::encode(&Envelope::event("chat", Bytes::from_static(b"cut short")))
            .expect("encode failed");
        client.write_all(&encoded[..7]).await.expect("write failed");
        drop(client);

        let mut decoder = FrameDecoder::new();
        match read_envelope(&mut server, &mut decoder).await {
            Err(LinkError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_garbage_prefix_is_codec_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0xff; 8]).await.expect("write failed");

        let mut decoder = FrameDecoder::new();
        assert!(matches!(
            read_envelope(&mut server, &mut decoder).await,
            Err(LinkError::Codec(codec::CodecError::InvalidLength(_)))
        ));
    }

    #[test]
    fn test_expect_ack_rejections() {
        let close = Envelope::close(CloseReason::Server, "bad credential");
        match expect_ack(Some(close)) {
            Err(LinkError::Handshake(msg)) => assert_eq!(msg, "bad credential"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(matches!(expect_ack(None), Err(LinkError::Handshake(_))));
        assert!(expect_ack(Some(Envelope::ping())).is_err());
    }
}
