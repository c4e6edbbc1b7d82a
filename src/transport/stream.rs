use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::Mutex,
};
use tracing::trace;

use crate::error::TransportError;

use super::{
    context::ChannelSet,
    descriptor::{read_frame, write_frame, Allocation, Descriptor, Hello, PROTOCOL_VERSION},
    BoxedReader, BoxedWriter, ChannelBackend, Connection, RawStream,
};

/// A [`Connection`] over a raw byte stream.
///
/// Each message is written as a length prefixed descriptor frame, followed by the payload bytes, followed by
/// the buffers as moved by the negotiated channel. The dialing side opens with a [`Hello`] frame naming the
/// channel; the accepting side reads it lazily, before its first descriptor.
pub(crate) struct StreamConnection {
    reader: Mutex<BoxedReader>,
    writer: Mutex<BoxedWriter>,
    channel: tokio::sync::OnceCell<Arc<dyn ChannelBackend>>,
    channels: Arc<ChannelSet>,
    max_message_size: u64,
    peer: String,
    closed: AtomicBool,
}

impl StreamConnection {
    /// Wraps a dialed stream, announcing the preferred channel to the peer.
    pub(crate) async fn dialed(
        stream: RawStream,
        channels: Arc<ChannelSet>,
        max_message_size: u64,
    ) -> Result<Self, TransportError> {
        let (name, channel) = channels
            .preferred()
            .ok_or_else(|| TransportError::UnsupportedChannel(String::new()))?;
        let hello = Hello {
            version: PROTOCOL_VERSION,
            channel: name.to_string(),
        };

        let RawStream {
            reader,
            mut writer,
            peer,
        } = stream;
        write_frame(&mut writer, &hello).await?;
        writer.flush().await?;
        trace!(%peer, channel = %hello.channel, "dialed connection");

        Ok(StreamConnection {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            channel: tokio::sync::OnceCell::new_with(Some(channel)),
            channels,
            max_message_size,
            peer,
            closed: AtomicBool::new(false),
        })
    }

    /// Wraps an accepted stream. The channel is resolved from the peer's hello on the first read.
    pub(crate) fn accepted(
        stream: RawStream,
        channels: Arc<ChannelSet>,
        max_message_size: u64,
    ) -> Self {
        StreamConnection {
            reader: Mutex::new(stream.reader),
            writer: Mutex::new(stream.writer),
            channel: tokio::sync::OnceCell::new(),
            channels,
            max_message_size,
            peer: stream.peer,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(())
    }

    async fn handshake(&self, reader: &mut BoxedReader) -> Result<(), TransportError> {
        if self.channel.initialized() {
            return Ok(());
        }

        let hello: Hello = read_frame(reader).await?;
        if hello.version != PROTOCOL_VERSION {
            return Err(TransportError::MalformedFrame(format!(
                "unsupported protocol version {}",
                hello.version
            )));
        }
        let channel = self
            .channels
            .get(&hello.channel)
            .ok_or_else(|| TransportError::UnsupportedChannel(hello.channel.clone()))?;
        trace!(peer = %self.peer, channel = %hello.channel, "accepted connection");
        // Only the single reader initializes the cell, so a concurrent set cannot race this one.
        let _ = self.channel.set(channel);
        Ok(())
    }

    fn channel(&self) -> Result<&Arc<dyn ChannelBackend>, TransportError> {
        self.channel.get().ok_or_else(|| {
            TransportError::MalformedFrame("no channel negotiated on this connection".to_string())
        })
    }
}

impl Connection for StreamConnection {
    fn read_descriptor(&self) -> BoxFuture<'_, Result<Descriptor, TransportError>> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut reader = self.reader.lock().await;
            self.handshake(&mut reader).await?;

            let descriptor: Descriptor = read_frame(&mut reader).await?;
            let size = descriptor.total_len();
            if size > self.max_message_size {
                return Err(TransportError::FrameTooLarge {
                    size,
                    max: self.max_message_size,
                });
            }
            Ok(descriptor)
        })
    }

    fn read(&self, mut allocation: Allocation) -> BoxFuture<'_, Result<Allocation, TransportError>> {
        Box::pin(async move {
            self.ensure_open()?;
            let channel = self.channel()?.clone();
            let mut reader = self.reader.lock().await;

            reader.read_exact(&mut allocation.payload[..]).await?;
            channel
                .recv_buffers(&mut reader, &mut allocation.buffers)
                .await?;
            Ok(allocation)
        })
    }

    fn write(
        &self,
        descriptor: Descriptor,
        payload: Bytes,
        buffers: Vec<Bytes>,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.ensure_open()?;
            debug_assert_eq!(descriptor.payload_len, payload.len() as u64);
            debug_assert_eq!(descriptor.buffers.len(), buffers.len());

            let channel = self.channel()?.clone();
            let mut writer = self.writer.lock().await;
            write_frame(&mut writer, &descriptor).await?;
            writer.write_all(&payload).await?;
            channel.send_buffers(&mut writer, &buffers).await?;
            writer.flush().await?;
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            // A write stuck on a peer which stopped reading holds the lock; dropping the stream closes it.
            let Ok(mut writer) = self.writer.try_lock() else {
                return;
            };
            if let Err(err) = writer.shutdown().await {
                trace!(peer = %self.peer, "error shutting down connection: {err}");
            }
        })
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}
