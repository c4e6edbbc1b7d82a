//! Adapts [`Message`]s to the two-step descriptor based read and the owning write of a [`Connection`].

use bytes::BytesMut;

use crate::{
    error::TransportError,
    message::{Message, TypedBuffer},
    transport::{Allocation, BufferDescriptor, Connection, Descriptor},
};

/// Describes a message the way the receiving side will see it before any payload byte moves.
pub(crate) fn describe(message: &Message) -> Descriptor {
    Descriptor {
        kind: message.kind(),
        id: message.id(),
        payload_len: message.payload().len() as u64,
        buffers: message
            .buffers()
            .iter()
            .map(|buf| BufferDescriptor {
                type_tag: buf.type_tag.to_string(),
                len: buf.data.len() as u64,
            })
            .collect(),
    }
}

/// Allocates destination buffers matching a descriptor exactly.
pub(crate) fn allocate(descriptor: &Descriptor) -> Allocation {
    Allocation {
        payload: BytesMut::zeroed(descriptor.payload_len as usize),
        buffers: descriptor
            .buffers
            .iter()
            .map(|buf| BytesMut::zeroed(buf.len as usize))
            .collect(),
    }
}

/// Reads the next message: descriptor first, then the data into buffers allocated from it.
///
/// # Panics
///
/// Panics if the connection fills a different number of buffers than its descriptor announced.
pub(crate) async fn read_message(conn: &dyn Connection) -> Result<Message, TransportError> {
    let descriptor = conn.read_descriptor().await?;
    let allocation = conn.read(allocate(&descriptor)).await?;
    Ok(assemble(descriptor, allocation))
}

fn assemble(descriptor: Descriptor, allocation: Allocation) -> Message {
    assert_eq!(
        allocation.buffers.len(),
        descriptor.buffers.len(),
        "connection filled {} buffers for a descriptor of {}",
        allocation.buffers.len(),
        descriptor.buffers.len(),
    );

    let buffers = descriptor
        .buffers
        .into_iter()
        .zip(allocation.buffers)
        .map(|(desc, data)| TypedBuffer::new(desc.type_tag, data.freeze()))
        .collect();
    Message::new(descriptor.kind, allocation.payload.freeze(), buffers).with_id(descriptor.id)
}

/// Writes a message. The payload and buffers are moved into the write and live until it completes.
pub(crate) async fn write_message(
    conn: &dyn Connection,
    message: Message,
) -> Result<(), TransportError> {
    let descriptor = describe(&message);
    let (payload, buffers) = message.into_parts();
    let buffers = buffers.into_iter().map(|buf| buf.data).collect();
    conn.write(descriptor, payload, buffers).await
}
