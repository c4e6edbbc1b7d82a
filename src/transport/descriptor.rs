use bytes::BytesMut;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    error::TransportError,
    message::{MessageId, MessageKind},
};

use super::{BoxedReader, BoxedWriter};

/// Version written in the connection hello.
pub(crate) const PROTOCOL_VERSION: u16 = 1;

/// Largest encoded descriptor or hello frame.
const MAX_HEADER_LEN: u32 = 1 << 20;

/// Shape of an incoming message, delivered before any payload byte moves.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Kind of the message.
    pub kind: MessageKind,
    /// Id of the message.
    pub id: MessageId,
    /// Length of the main payload.
    pub payload_len: u64,
    /// The separately transferred buffers, in order.
    pub buffers: Vec<BufferDescriptor>,
}

impl Descriptor {
    /// Total number of bytes following the descriptor.
    pub fn total_len(&self) -> u64 {
        self.buffers
            .iter()
            .fold(self.payload_len, |acc, buf| acc.saturating_add(buf.len))
    }
}

/// Shape of one separately transferred buffer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferDescriptor {
    /// Opaque type tag of the buffer.
    pub type_tag: String,
    /// Length in bytes.
    pub len: u64,
}

/// Destination buffers allocated for an incoming message.
#[derive(Debug)]
pub struct Allocation {
    /// Destination of the main payload.
    pub payload: BytesMut,
    /// Destinations of the separately transferred buffers.
    pub buffers: Vec<BytesMut>,
}

/// First frame sent by the dialing side of a connection.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Hello {
    pub version: u16,
    pub channel: String,
}

/// Writes a length prefixed, msgpack encoded frame.
pub(crate) async fn write_frame<T: Serialize>(
    writer: &mut BoxedWriter,
    value: &T,
) -> Result<(), TransportError> {
    let body = rmp_serde::to_vec(value)?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_HEADER_LEN)
        .ok_or(TransportError::FrameTooLarge {
            size: body.len() as u64,
            max: MAX_HEADER_LEN as u64,
        })?;

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&body);
    writer.write_all(&frame).await?;
    Ok(())
}

/// Reads a frame written by [`write_frame`].
pub(crate) async fn read_frame<T: DeserializeOwned>(
    reader: &mut BoxedReader,
) -> Result<T, TransportError> {
    let len = reader.read_u32_le().await?;
    if len > MAX_HEADER_LEN {
        return Err(TransportError::FrameTooLarge {
            size: len as u64,
            max: MAX_HEADER_LEN as u64,
        });
    }

    let mut body = vec![0; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(rmp_serde::from_slice(&body)?)
}
