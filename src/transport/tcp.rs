//! TCP transport backend.

use futures::future::BoxFuture;
use tokio::net::{TcpListener, TcpStream};

use crate::error::TransportError;

use super::{RawListener, RawStream, TransportBackend};

/// Transport over TCP sockets, registered under the `tcp` scheme by default.
#[derive(Clone, Copy, Debug)]
pub struct TcpTransport {
    nodelay: bool,
}

impl TcpTransport {
    /// Creates a TCP transport with Nagle's algorithm disabled.
    pub fn new() -> Self {
        TcpTransport { nodelay: true }
    }

    /// Sets `TCP_NODELAY` on every stream.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    fn wrap(&self, stream: TcpStream) -> Result<RawStream, TransportError> {
        stream.set_nodelay(self.nodelay)?;
        let peer = stream.peer_addr()?.to_string();
        let (reader, writer) = stream.into_split();
        Ok(RawStream {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer,
        })
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        TcpTransport::new()
    }
}

impl TransportBackend for TcpTransport {
    fn listen<'a>(
        &'a self,
        address: &'a str,
    ) -> BoxFuture<'a, Result<Box<dyn RawListener>, TransportError>> {
        Box::pin(async move {
            let listener = TcpListener::bind(address).await?;
            let local = listener.local_addr()?;
            Ok(Box::new(TcpRawListener {
                listener,
                local: local.to_string(),
                transport: *self,
            }) as Box<dyn RawListener>)
        })
    }

    fn connect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<RawStream, TransportError>> {
        Box::pin(async move {
            let stream = TcpStream::connect(address).await.map_err(|err| {
                TransportError::ConnectionRefused(format!("{address}: {err}"))
            })?;
            self.wrap(stream)
        })
    }
}

struct TcpRawListener {
    listener: TcpListener,
    local: String,
    transport: TcpTransport,
}

impl RawListener for TcpRawListener {
    fn local_address(&self) -> String {
        self.local.clone()
    }

    fn accept(&self) -> BoxFuture<'_, Result<RawStream, TransportError>> {
        Box::pin(async move {
            let (stream, _) = self.listener.accept().await?;
            self.transport.wrap(stream)
        })
    }
}
