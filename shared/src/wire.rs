//! Length-delimited bincode framing used on every TCP connection.

use crate::MAX_FRAME_LENGTH;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

pub type PacketStream<T> = Framed<T, LengthDelimitedCodec>;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed packet: {0}")]
    Codec(#[from] bincode::Error),
}

pub fn framed<T: AsyncRead + AsyncWrite>(io: T) -> PacketStream<T> {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_framed(io)
}

pub fn encode_packet<P: Serialize>(packet: &P) -> Result<Bytes, WireError> {
    Ok(Bytes::from(bincode::serialize(packet)?))
}

pub fn decode_packet<P: DeserializeOwned>(frame: &[u8]) -> Result<P, WireError> {
    Ok(bincode::deserialize(frame)?)
}

/// Sends an already encoded frame.
pub async fn send_frame<T>(stream: &mut PacketStream<T>, frame: Bytes) -> Result<(), WireError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    stream.send(frame).await?;
    Ok(())
}

pub async fn send_packet<T, P>(stream: &mut PacketStream<T>, packet: &P) -> Result<(), WireError>
where
    T: AsyncRead + AsyncWrite + Unpin,
    P: Serialize,
{
    send_frame(stream, encode_packet(packet)?).await
}

/// Reads the next packet. `Ok(None)` means the peer closed the stream cleanly.
pub async fn recv_packet<T, P>(stream: &mut PacketStream<T>) -> Result<Option<P>, WireError>
where
    T: AsyncRead + AsyncWrite + Unpin,
    P: DeserializeOwned,
{
    match stream.next().await {
        Some(Ok(frame)) => Ok(Some(decode_packet(&frame)?)),
        Some(Err(e)) => Err(WireError::Io(e)),
        None => Ok(None),
    }
}
