// SPDX-License-Identifier: Apache-2.0

//! Length-prefixed framing shared by the transaction-processor channel and
//! the consensus-engine channel (spec.md §6: "Length-prefixed framed
//! messages over a bidirectional channel"). Frame = 4-byte big-endian
//! length, followed by a `bincode`-encoded message.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are refused; a well-formed message never
/// approaches it, and it bounds how much a corrupt length prefix can make
/// a reader allocate.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("message encoding error: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("frame length {0} exceeds maximum {MAX_FRAME_LEN}")]
    FrameTooLarge(u32),
}

pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, CodecError> {
    let body = bincode::serialize(message)?;
    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
    framed.extend_from_slice(&body);
    Ok(framed)
}

pub fn decode_frame<T: DeserializeOwned>(body: &[u8]) -> Result<T, CodecError> {
    Ok(bincode::deserialize(body)?)
}

/// Writes one framed message to an async channel.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let framed = encode_frame(message)?;
    writer.write_all(&framed).await?;
    Ok(())
}

/// Reads one framed message from an async channel.
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, CodecError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    decode_frame(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ProcessorMessage;

    #[tokio::test]
    async fn round_trips_a_message_through_an_in_memory_pipe() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let message = ProcessorMessage::Unregister;
        write_message(&mut client, &message).await.unwrap();
        let received: ProcessorMessage = read_message(&mut server).await.unwrap();
        assert_eq!(received, message);
    }

    #[test]
    fn encode_then_decode_round_trips() {
        let message = ProcessorMessage::Heartbeat;
        let framed = encode_frame(&message).unwrap();
        let len = u32::from_be_bytes(framed[..4].try_into().unwrap()) as usize;
        let decoded: ProcessorMessage = decode_frame(&framed[4..4 + len]).unwrap();
        assert_eq!(decoded, message);
    }
}
