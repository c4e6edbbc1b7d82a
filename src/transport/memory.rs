//! In-process transport backend.
//!
//! Every [`MemoryTransport`] clone shares one hub of bound addresses, so agents registering clones of the same
//! transport can reach each other without touching the network. Connections are backed by
//! [`tokio::io::duplex`] pipes.
//!
//! Connections can be cut from the outside with [`MemoryTransport::sever`], which makes every pending and
//! later operation on both ends fail as if the peer had crashed.

use std::{
    collections::HashMap,
    fmt, io,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    task::{Context, Poll},
};

use futures::{future::BoxFuture, task::AtomicWaker};
use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf},
    sync::mpsc,
};
use tracing::debug;

use crate::error::TransportError;

use super::{RawListener, RawStream, TransportBackend};

const PIPE_CAPACITY: usize = 64 * 1024;

static NEXT_ADDRESS: AtomicU64 = AtomicU64::new(0);

/// Transport over in-process pipes, conventionally registered under the `mem` scheme.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    hub: Arc<Hub>,
}

#[derive(Default)]
struct Hub {
    listeners: Mutex<HashMap<String, mpsc::UnboundedSender<RawStream>>>,
    links: Mutex<HashMap<String, Vec<Weak<Severance>>>>,
}

impl Hub {
    fn listeners(&self) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<RawStream>>> {
        self.listeners.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn links(&self) -> MutexGuard<'_, HashMap<String, Vec<Weak<Severance>>>> {
        self.links.lock().unwrap_or_else(|err| err.into_inner())
    }
}

impl MemoryTransport {
    /// Creates a transport with its own empty hub.
    pub fn new() -> Self {
        MemoryTransport::default()
    }

    /// Returns an address no other listener in this process has used.
    pub fn unique_address() -> String {
        format!(
            "pipe-{}-{}",
            std::process::id(),
            NEXT_ADDRESS.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// Severs every open connection accepted on `address`, returning how many were cut.
    ///
    /// The address keeps accepting new connections.
    pub fn sever(&self, address: &str) -> usize {
        let address = address.strip_prefix("mem://").unwrap_or(address);
        let links = self.hub.links().remove(address).unwrap_or_default();
        let mut severed = 0;
        for link in links.iter().filter_map(Weak::upgrade) {
            link.sever();
            severed += 1;
        }
        debug!(%address, severed, "severed connections");
        severed
    }
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("listeners", &self.hub.listeners().len())
            .finish()
    }
}

impl TransportBackend for MemoryTransport {
    fn listen<'a>(
        &'a self,
        address: &'a str,
    ) -> BoxFuture<'a, Result<Box<dyn RawListener>, TransportError>> {
        Box::pin(async move {
            let address = if address.is_empty() {
                MemoryTransport::unique_address()
            } else {
                address.to_string()
            };

            let mut listeners = self.hub.listeners();
            if listeners
                .get(&address)
                .is_some_and(|tx| !tx.is_closed())
            {
                return Err(TransportError::InvalidAddress(format!(
                    "mem://{address} is already bound"
                )));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            listeners.insert(address.clone(), tx);

            Ok(Box::new(MemoryListener {
                address,
                incoming: tokio::sync::Mutex::new(rx),
                hub: Arc::downgrade(&self.hub),
            }) as Box<dyn RawListener>)
        })
    }

    fn connect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, Result<RawStream, TransportError>> {
        Box::pin(async move {
            let tx = self
                .hub
                .listeners()
                .get(address)
                .cloned()
                .ok_or_else(|| TransportError::ConnectionRefused(format!("mem://{address}")))?;

            let severance = Arc::new(Severance::default());
            let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
            let client = SeverableStream::new(client, severance.clone(), 0);
            let server = SeverableStream::new(server, severance.clone(), 1);

            let (server_reader, server_writer) = tokio::io::split(server);
            tx.send(RawStream {
                reader: Box::new(server_reader),
                writer: Box::new(server_writer),
                peer: "mem://dialer".to_string(),
            })
            .map_err(|_| TransportError::ConnectionRefused(format!("mem://{address}")))?;

            let mut links = self.hub.links();
            let entry = links.entry(address.to_string()).or_default();
            entry.retain(|link| link.strong_count() > 0);
            entry.push(Arc::downgrade(&severance));
            drop(links);

            let (reader, writer) = tokio::io::split(client);
            Ok(RawStream {
                reader: Box::new(reader),
                writer: Box::new(writer),
                peer: format!("mem://{address}"),
            })
        })
    }
}

struct MemoryListener {
    address: String,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<RawStream>>,
    hub: Weak<Hub>,
}

impl RawListener for MemoryListener {
    fn local_address(&self) -> String {
        self.address.clone()
    }

    fn accept(&self) -> BoxFuture<'_, Result<RawStream, TransportError>> {
        Box::pin(async move {
            self.incoming
                .lock()
                .await
                .recv()
                .await
                .ok_or(TransportError::ListenerClosed)
        })
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.listeners().remove(&self.address);
        }
    }
}

/// Shared cut-off switch of both ends of one pipe.
#[derive(Default)]
struct Severance {
    severed: AtomicBool,
    readers: [AtomicWaker; 2],
    writers: [AtomicWaker; 2],
}

impl Severance {
    fn sever(&self) {
        self.severed.store(true, Ordering::Release);
        for waker in self.readers.iter().chain(&self.writers) {
            waker.wake();
        }
    }

    fn is_severed(&self) -> bool {
        self.severed.load(Ordering::Acquire)
    }
}

struct SeverableStream {
    inner: DuplexStream,
    severance: Arc<Severance>,
    end: usize,
}

impl SeverableStream {
    fn new(inner: DuplexStream, severance: Arc<Severance>, end: usize) -> Self {
        SeverableStream {
            inner,
            severance,
            end,
        }
    }

    fn severed_error() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionReset, "connection severed")
    }

    fn broken_pipe() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "connection severed")
    }
}

impl AsyncRead for SeverableStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.severance.is_severed() {
            return Poll::Ready(Err(Self::severed_error()));
        }
        self.severance.readers[self.end].register(cx.waker());
        if self.severance.is_severed() {
            return Poll::Ready(Err(Self::severed_error()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for SeverableStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.severance.is_severed() {
            return Poll::Ready(Err(Self::broken_pipe()));
        }
        self.severance.writers[self.end].register(cx.waker());
        if self.severance.is_severed() {
            return Poll::Ready(Err(Self::broken_pipe()));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn unbound_address_is_refused() {
        let mem = MemoryTransport::new();
        let err = mem.connect("nowhere").await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionRefused(_)));
    }

    #[tokio::test]
    async fn address_cannot_be_bound_twice() {
        let mem = MemoryTransport::new();
        let address = MemoryTransport::unique_address();
        let _listener = mem.listen(&address).await.unwrap();
        assert!(mem.listen(&address).await.is_err());
    }

    #[tokio::test]
    async fn dropping_listener_unbinds() {
        let mem = MemoryTransport::new();
        let address = MemoryTransport::unique_address();
        drop(mem.listen(&address).await.unwrap());
        assert!(mem.connect(&address).await.is_err());
        assert!(mem.listen(&address).await.is_ok());
    }

    #[tokio::test]
    async fn sever_fails_blocked_reads_on_both_ends() {
        let mem = MemoryTransport::new();
        let address = MemoryTransport::unique_address();
        let listener = mem.listen(&address).await.unwrap();

        let mut client = mem.connect(&address).await.unwrap();
        let mut server = listener.accept().await.unwrap();

        client.writer.write_all(b"ping").await.unwrap();
        let mut buf = [0; 4];
        server.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        let blocked = tokio::spawn(async move {
            let mut buf = [0; 1];
            server.reader.read_exact(&mut buf).await
        });
        tokio::task::yield_now().await;

        assert_eq!(mem.sever(&format!("mem://{address}")), 1);
        let err = blocked.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert!(client.writer.write_all(b"x").await.is_err());

        // The address still accepts fresh connections.
        assert!(mem.connect(&address).await.is_ok());
    }
}
