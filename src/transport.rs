//! Connection layer consumed by the agent.
//!
//! The agent only relies on the [`Connection`] and [`Listener`] abstractions defined here. A connection is a
//! bidirectional, order preserving pipe between two workers. Receiving a message happens in two steps: first
//! [`Connection::read_descriptor`] delivers the shape of the incoming message, then [`Connection::read`] fills
//! destination buffers which the caller allocated from that descriptor. Sending hands the payload and the
//! separately transferred buffers to [`Connection::write`], which owns them until the write completes.
//!
//! Byte-level plumbing is pluggable through a [`TransportContext`]:
//!
//! - a [`TransportBackend`] establishes raw byte streams for one address scheme (`tcp`, `mem`, ...),
//! - a [`ChannelBackend`] moves the separately transferred buffers over an established stream.
//!
//! Backends are registered under a name and a priority; higher priorities are preferred.

use std::{fmt, io};

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::TransportError;

mod channel;
mod context;
mod descriptor;
pub mod memory;
mod stream;
pub mod tcp;

pub use channel::BasicChannel;
pub use context::{Listener, TransportContext, BASIC_CHANNEL};
pub use descriptor::{Allocation, BufferDescriptor, Descriptor};
pub use memory::MemoryTransport;
pub use tcp::TcpTransport;

/// Read half of a raw byte stream.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Write half of a raw byte stream.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A raw byte stream established by a [`TransportBackend`].
pub struct RawStream {
    /// Read half.
    pub reader: BoxedReader,
    /// Write half.
    pub writer: BoxedWriter,
    /// Human readable address of the remote end.
    pub peer: String,
}

impl fmt::Debug for RawStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawStream").field("peer", &self.peer).finish()
    }
}

/// An established, message oriented connection between two workers.
///
/// Reads complete in the order they are issued, and so do writes, but the two directions are independent.
/// A connection supports a single reader at a time: [`read_descriptor`](Connection::read_descriptor) and the
/// following [`read`](Connection::read) must not be interleaved with another reader.
pub trait Connection: Send + Sync + 'static {
    /// Waits for the next incoming message and returns its descriptor.
    fn read_descriptor(&self) -> BoxFuture<'_, Result<Descriptor, TransportError>>;

    /// Fills the buffers of an allocation made for the last descriptor read.
    fn read(&self, allocation: Allocation) -> BoxFuture<'_, Result<Allocation, TransportError>>;

    /// Writes a message.
    ///
    /// The payload and buffers are owned by the returned future, so they stay alive until the transport is done
    /// with them.
    fn write(
        &self,
        descriptor: Descriptor,
        payload: Bytes,
        buffers: Vec<Bytes>,
    ) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Closes the connection. Pending and later operations fail.
    fn close(&self) -> BoxFuture<'_, ()>;

    /// Address of the remote end.
    fn peer(&self) -> &str;
}

/// Establishes raw byte streams for one address scheme.
pub trait TransportBackend: Send + Sync + 'static {
    /// Binds an address. The address excludes the `scheme://` prefix.
    fn listen<'a>(
        &'a self,
        address: &'a str,
    ) -> BoxFuture<'a, Result<Box<dyn RawListener>, TransportError>>;

    /// Dials an address. The address excludes the `scheme://` prefix.
    fn connect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<RawStream, TransportError>>;
}

/// A bound address accepting raw byte streams.
pub trait RawListener: Send + Sync + 'static {
    /// The address actually bound, without the scheme prefix.
    fn local_address(&self) -> String;

    /// Waits for the next inbound stream. Must be cancel safe.
    fn accept(&self) -> BoxFuture<'_, Result<RawStream, TransportError>>;
}

/// Moves separately transferred buffers over an established stream.
pub trait ChannelBackend: Send + Sync + 'static {
    /// Sends buffers in order.
    fn send_buffers<'a>(
        &'a self,
        writer: &'a mut BoxedWriter,
        buffers: &'a [Bytes],
    ) -> BoxFuture<'a, io::Result<()>>;

    /// Receives buffers in order, filling each destination completely.
    fn recv_buffers<'a>(
        &'a self,
        reader: &'a mut BoxedReader,
        buffers: &'a mut [BytesMut],
    ) -> BoxFuture<'a, io::Result<()>>;
}

/// Splits a `scheme://address` URL.
pub fn split_url(url: &str) -> Result<(&str, &str), TransportError> {
    match url.split_once("://") {
        Some((scheme, address)) if !scheme.is_empty() => Ok((scheme, address)),
        _ => Err(TransportError::InvalidAddress(url.to_string())),
    }
}
