//! Outbound connections and the matching of responses to pending requests.
//!
//! A [`ClientPipe`] owns one persistent connection to a peer along with the table of requests sent on it and
//! still waiting for a response. Two tasks drive it:
//!
//! - the writer dials the peer, then writes queued requests in order. Every successful write arms exactly one
//!   read on the reader, since each request is answered by exactly one response.
//! - the reader waits for an armed read, reads the response, takes the matching handle out of the pending table
//!   and hands its completion to the worker pool.
//!
//! A failed read, or a write failure which may have left a partial frame on the stream, fails every pending
//! handle together and marks the pipe errored. Errored pipes are never reused; the [`PipeRegistry`] replaces them
//! on the next send.

use std::{
    collections::HashMap,
    fmt, mem,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use once_cell::sync::OnceCell;
use tokio::{runtime::Handle, sync::mpsc, task::AbortHandle};
use tracing::{debug, error, trace, warn};

use crate::{
    error::{ResponseError, TransportError},
    future_message::FutureMessage,
    message::{Message, MessageId, MessageKind},
    transport::{Connection, TransportContext},
    worker::{WorkerId, WorkerInfo},
};

use super::{
    io::{read_message, write_message},
    pool::WorkerPool,
};

/// What a pipe needs from its agent to run.
#[derive(Clone)]
pub(crate) struct PipeEnv {
    pub(crate) context: Arc<TransportContext>,
    pub(crate) pool: Arc<WorkerPool>,
    pub(crate) runtime: Handle,
}

#[derive(Default)]
struct PipeState {
    pending: HashMap<MessageId, FutureMessage>,
    errored: Option<ResponseError>,
}

/// Persistent outbound connection state for one peer.
pub(crate) struct ClientPipe {
    peer: WorkerInfo,
    state: Mutex<PipeState>,
    outbox: mpsc::UnboundedSender<Message>,
    connection: OnceCell<Arc<dyn Connection>>,
    tasks: Mutex<Vec<AbortHandle>>,
    runtime: Handle,
}

impl ClientPipe {
    /// Creates the pipe and spawns its writer, which dials `url` before writing anything.
    fn open(peer: WorkerInfo, url: String, env: &PipeEnv) -> Arc<Self> {
        let (outbox, queued) = mpsc::unbounded_channel();
        let pipe = Arc::new(ClientPipe {
            peer,
            state: Mutex::new(PipeState::default()),
            outbox,
            connection: OnceCell::new(),
            tasks: Mutex::new(Vec::new()),
            runtime: env.runtime.clone(),
        });

        let writer = env
            .runtime
            .spawn(pipe.clone().write_loop(url, env.clone(), queued));
        pipe.track(writer.abort_handle());
        pipe
    }

    /// Registers a request in the pending table, then queues it for writing.
    ///
    /// The id is taken from `ids` under the pipe lock, so the handle is always in the table before its request
    /// can be written.
    fn send(&self, mut request: Message, ids: &AtomicU64) -> FutureMessage {
        let fut = FutureMessage::new();
        {
            let mut state = self.lock();
            if let Some(err) = &state.errored {
                return FutureMessage::errored(err.clone());
            }
            let id = ids.fetch_add(1, Ordering::Relaxed);
            request.set_id(id);
            state.pending.insert(id, fut.clone());
        }

        let id = request.id();
        trace!(peer = %self.peer, message_id = id, "queued request");
        if self.outbox.send(request).is_err() {
            // The writer is gone, which only happens once the pipe was torn down.
            self.fail(id, ResponseError::Transport(TransportError::ConnectionClosed));
        }
        fut
    }

    async fn write_loop(
        self: Arc<Self>,
        url: String,
        env: PipeEnv,
        mut queued: mpsc::UnboundedReceiver<Message>,
    ) {
        let conn = match env.context.connect(&url).await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(peer = %self.peer, %url, "failed to connect: {err}");
                self.teardown(err.into());
                return;
            }
        };
        debug!(peer = %self.peer, %url, "connected");
        let _ = self.connection.set(conn.clone());

        let (arm, armed) = mpsc::unbounded_channel();
        let reader = env
            .runtime
            .spawn(self.clone().read_loop(conn.clone(), env.pool.clone(), armed));
        self.track(reader.abort_handle());

        while let Some(request) = queued.recv().await {
            let id = request.id();
            match write_message(&*conn, request).await {
                Ok(()) => {
                    trace!(peer = %self.peer, message_id = id, "wrote request");
                    let _ = arm.send(());
                }
                Err(err) if err.is_stream_fault() => {
                    warn!(peer = %self.peer, message_id = id, "connection broken while writing request: {err}");
                    self.teardown(err.into());
                    return;
                }
                Err(err) => {
                    warn!(peer = %self.peer, message_id = id, "failed to write request: {err}");
                    self.fail(id, err.into());
                }
            }
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        conn: Arc<dyn Connection>,
        pool: Arc<WorkerPool>,
        mut armed: mpsc::UnboundedReceiver<()>,
    ) {
        while armed.recv().await.is_some() {
            let response = match read_message(&*conn).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(peer = %self.peer, "failed to read response: {err}");
                    self.teardown(err.into());
                    return;
                }
            };

            match self.take_pending(&response) {
                Ok(fut) => {
                    trace!(peer = %self.peer, message_id = response.id(), "matched response");
                    pool.submit(move || {
                        fut.complete(response.into_result());
                    });
                }
                Err(violation) => {
                    error!(peer = %self.peer, "{violation}");
                    self.teardown(ResponseError::protocol(violation));
                    return;
                }
            }
        }
    }

    /// Removes the handle a response answers.
    fn take_pending(&self, response: &Message) -> Result<FutureMessage, String> {
        let mut state = self.lock();
        if state.errored.is_some() {
            return Err(format!(
                "read response {} on a pipe already marked errored",
                response.id()
            ));
        }
        if response.kind() == MessageKind::Request {
            return Err(format!("received request {} on a client pipe", response.id()));
        }
        state
            .pending
            .remove(&response.id())
            .ok_or_else(|| format!("received response {} with no pending request", response.id()))
    }

    /// Fails a single pending request.
    fn fail(&self, id: MessageId, err: ResponseError) {
        let fut = self.lock().pending.remove(&id);
        if let Some(fut) = fut {
            fut.set_error(err);
        }
    }

    /// Marks the pipe errored and fails every pending request with `err`, returning how many were failed.
    fn flush(&self, err: ResponseError) -> usize {
        let pending = {
            let mut state = self.lock();
            if state.errored.is_none() {
                state.errored = Some(err.clone());
            }
            mem::take(&mut state.pending)
        };

        let count = pending.len();
        for (_, fut) in pending {
            fut.set_error(err.clone());
        }
        count
    }

    /// Flushes the pipe, stops its tasks and closes its connection.
    pub(crate) fn teardown(&self, err: ResponseError) {
        let failed = self.flush(err);
        debug!(peer = %self.peer, failed, "tearing down pipe");

        let tasks = mem::take(&mut *self.tasks.lock().unwrap_or_else(|err| err.into_inner()));
        for task in tasks {
            task.abort();
        }
        if let Some(conn) = self.connection.get().cloned() {
            self.runtime.spawn(async move { conn.close().await });
        }
    }

    pub(crate) fn is_errored(&self) -> bool {
        self.lock().errored.is_some()
    }

    fn track(&self, task: AbortHandle) {
        self.tasks
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push(task);
    }

    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }
}

impl fmt::Debug for ClientPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ClientPipe")
            .field("peer", &self.peer)
            .field("pending", &state.pending.len())
            .field("errored", &state.errored)
            .finish()
    }
}

/// Maps destination workers to their outbound pipe.
pub(crate) struct PipeRegistry {
    pipes: Mutex<HashMap<WorkerId, Arc<ClientPipe>>>,
    next_message_id: AtomicU64,
}

impl PipeRegistry {
    pub(crate) fn new() -> Self {
        PipeRegistry {
            pipes: Mutex::new(HashMap::new()),
            next_message_id: AtomicU64::new(1),
        }
    }

    /// Sends a request to `peer`, opening a pipe first if none is usable.
    ///
    /// Only the table lookup happens under the registry lock; dialing happens on the pipe's writer task.
    pub(crate) fn send(
        &self,
        peer: &WorkerInfo,
        url: &str,
        request: Message,
        env: &PipeEnv,
    ) -> FutureMessage {
        let pipe = {
            let mut pipes = self.lock();
            match pipes.get(&peer.id()) {
                Some(pipe) if !pipe.is_errored() => pipe.clone(),
                existing => {
                    if existing.is_some() {
                        debug!(%peer, "replacing errored pipe");
                    }
                    let pipe = ClientPipe::open(peer.clone(), url.to_string(), env);
                    pipes.insert(peer.id(), pipe.clone());
                    pipe
                }
            }
        };

        pipe.send(request, &self.next_message_id)
    }

    #[cfg(test)]
    fn get(&self, peer: WorkerId) -> Option<Arc<ClientPipe>> {
        self.lock().get(&peer).cloned()
    }

    /// Tears down every pipe, failing their pending requests with `err`.
    pub(crate) fn teardown_all(&self, err: ResponseError) {
        let pipes = mem::take(&mut *self.lock());
        for pipe in pipes.into_values() {
            pipe.teardown(err.clone());
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<WorkerId, Arc<ClientPipe>>> {
        self.pipes.lock().unwrap_or_else(|err| err.into_inner())
    }
}

impl fmt::Debug for PipeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeRegistry")
            .field("pipes", &self.lock().len())
            .field("next_message_id", &self.next_message_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        pin::Pin,
        task::{Context, Poll},
        time::Duration,
    };

    use futures::future::BoxFuture;
    use tokio::io::AsyncWrite;

    use crate::transport::{
        BoxedWriter, MemoryTransport, RawListener, RawStream, TransportBackend, TransportContext,
    };

    use super::*;

    /// In-memory transport whose dialed streams time out after a fixed number of writes.
    struct StallingTransport {
        mem: MemoryTransport,
        writes: usize,
    }

    impl TransportBackend for StallingTransport {
        fn listen<'a>(
            &'a self,
            address: &'a str,
        ) -> BoxFuture<'a, Result<Box<dyn RawListener>, TransportError>> {
            self.mem.listen(address)
        }

        fn connect<'a>(
            &'a self,
            address: &'a str,
        ) -> BoxFuture<'a, Result<RawStream, TransportError>> {
            Box::pin(async move {
                let mut stream = self.mem.connect(address).await?;
                stream.writer = Box::new(StallingWriter {
                    inner: stream.writer,
                    remaining: self.writes,
                });
                Ok(stream)
            })
        }
    }

    struct StallingWriter {
        inner: BoxedWriter,
        remaining: usize,
    }

    impl AsyncWrite for StallingWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.remaining == 0 {
                return Poll::Ready(Err(io::Error::from(io::ErrorKind::TimedOut)));
            }
            self.remaining -= 1;
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    fn env(mem: &MemoryTransport) -> PipeEnv {
        let mut context = TransportContext::with_defaults();
        context.register_transport(10, "mem", mem.clone());
        PipeEnv {
            context: Arc::new(context),
            pool: Arc::new(WorkerPool::new("pipe-test", 1, Handle::current()).unwrap()),
            runtime: Handle::current(),
        }
    }

    #[tokio::test]
    async fn ids_are_distinct_while_pending() {
        let mem = MemoryTransport::new();
        let env = env(&mem);
        let address = format!("mem://{}", MemoryTransport::unique_address());
        let _listener = env.context.listen([address.as_str()]).await.unwrap();

        let registry = PipeRegistry::new();
        let peer = WorkerInfo::new("peer", 1);
        for _ in 0..5 {
            registry.send(&peer, &address, Message::request("x"), &env);
        }

        let pipe = registry.get(1).unwrap();
        let state = pipe.lock();
        assert_eq!(state.pending.len(), 5);
        let mut ids: Vec<_> = state.pending.keys().copied().collect();
        ids.sort_unstable();
        assert_eq!(ids, [1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn dial_failure_fails_pending_and_is_replaced() {
        let mem = MemoryTransport::new();
        let env = env(&mem);
        let registry = PipeRegistry::new();
        let peer = WorkerInfo::new("peer", 1);

        let fut = registry.send(&peer, "mem://nobody", Message::request("x"), &env);
        let err = fut.wait_timeout(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(
            err,
            ResponseError::Transport(TransportError::ConnectionRefused(_))
        ));

        let first = registry.get(1).unwrap();
        assert!(first.is_errored());
        assert!(first.lock().pending.is_empty());

        registry.send(&peer, "mem://nobody", Message::request("y"), &env);
        let second = registry.get(1).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn unknown_response_id_is_a_protocol_violation() {
        let mem = MemoryTransport::new();
        let env = env(&mem);
        let address = format!("mem://{}", MemoryTransport::unique_address());
        let listener = env.context.listen([address.as_str()]).await.unwrap();

        let registry = PipeRegistry::new();
        let peer = WorkerInfo::new("peer", 1);
        let first = registry.send(&peer, &address, Message::request("a"), &env);
        let second = registry.send(&peer, &address, Message::request("b"), &env);

        let server = listener.accept().await.unwrap();
        read_message(&*server).await.unwrap();
        write_message(&*server, Message::response("stray").with_id(999))
            .await
            .unwrap();

        for fut in [first, second] {
            let err = fut.wait_timeout(Duration::from_secs(5)).await.unwrap_err();
            assert!(matches!(err, ResponseError::Protocol(_)), "{err:?}");
        }
        assert!(registry.get(1).unwrap().is_errored());
    }

    #[tokio::test]
    async fn teardown_all_fails_with_given_error() {
        let mem = MemoryTransport::new();
        let env = env(&mem);
        let address = format!("mem://{}", MemoryTransport::unique_address());
        let _listener = env.context.listen([address.as_str()]).await.unwrap();

        let registry = PipeRegistry::new();
        let fut = registry.send(
            &WorkerInfo::new("peer", 1),
            &address,
            Message::request("x"),
            &env,
        );
        registry.teardown_all(ResponseError::Shutdown);

        assert_eq!(fut.result(), Some(Err(ResponseError::Shutdown)));
        assert!(registry.get(1).is_none());
    }

    #[tokio::test]
    async fn write_timeout_mid_frame_replaces_the_pipe() {
        let mem = MemoryTransport::new();
        let mut context = TransportContext::with_defaults();
        // The hello and the request descriptor go through; the payload write times out.
        context.register_transport(
            10,
            "stall",
            StallingTransport {
                mem: mem.clone(),
                writes: 2,
            },
        );
        let env = PipeEnv {
            context: Arc::new(context),
            pool: Arc::new(WorkerPool::new("pipe-test", 1, Handle::current()).unwrap()),
            runtime: Handle::current(),
        };
        let address = format!("stall://{}", MemoryTransport::unique_address());
        let _listener = env.context.listen([address.as_str()]).await.unwrap();

        let registry = PipeRegistry::new();
        let peer = WorkerInfo::new("peer", 1);
        let fut = registry.send(&peer, &address, Message::request("x"), &env);

        let err = fut.wait_timeout(Duration::from_secs(5)).await.unwrap_err();
        match err {
            ResponseError::Transport(TransportError::Io { kind, .. }) => {
                assert_eq!(kind, io::ErrorKind::TimedOut)
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let first = registry.get(1).unwrap();
        assert!(first.is_errored());

        registry.send(&peer, &address, Message::request("y"), &env);
        let second = registry.get(1).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
