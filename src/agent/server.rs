use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use tracing::{debug, trace, warn};

use crate::{
    error::{ResponseError, TransportError},
    future_message::{FutureMessage, ResponseResult},
    message::{Message, MessageId, MessageKind},
    transport::{Connection, Listener},
};

use super::{
    io::{read_message, write_message},
    pool::panic_message,
    AgentInner,
};

/// States of one inbound connection.
#[derive(Debug)]
enum ServerState {
    WaitingForRequest,
    Dispatching(Message),
    Closed(TransportError),
}

/// Capped exponential delay between failed accepts.
#[derive(Debug)]
pub(crate) struct AcceptBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    failures: u32,
}

impl AcceptBackoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        AcceptBackoff {
            initial,
            max,
            current: initial,
            failures: 0,
        }
    }

    /// Records a failure and returns how long to wait before accepting again.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.failures = self.failures.saturating_add(1);
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.initial;
        self.failures = 0;
    }
}

impl AgentInner {
    /// Accepts inbound connections until the listener closes, serving each on its own task.
    ///
    /// A failed accept is retried after a backoff instead of stopping the loop.
    pub(crate) async fn accept_loop(self: Arc<Self>, listener: Listener) {
        let mut backoff = AcceptBackoff::new(
            self.options.accept_backoff_initial,
            self.options.accept_backoff_max,
        );

        loop {
            match listener.accept().await {
                Ok(conn) => {
                    backoff.reset();
                    trace!(worker = %self.info, peer = conn.peer(), "accepted connection");
                    self.serve(conn);
                }
                Err(TransportError::ListenerClosed) => {
                    debug!(worker = %self.info, "listener closed");
                    break;
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    warn!(worker = %self.info, failures = backoff.failures, ?delay, "failed to accept: {err}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Spawns the server loop of an inbound connection.
    fn serve(self: &Arc<Self>, conn: Arc<dyn Connection>) {
        let Some(runtime) = self.runtime.get() else {
            return;
        };
        let mut inbound = self.inbound();
        let key = inbound.next_key;
        inbound.next_key += 1;
        let task = runtime.spawn(self.clone().server_loop(key, conn.clone()));
        inbound.connections.insert(key, (conn, task.abort_handle()));
    }

    async fn server_loop(self: Arc<Self>, key: u64, conn: Arc<dyn Connection>) {
        let mut state = ServerState::WaitingForRequest;
        loop {
            state = match state {
                ServerState::WaitingForRequest => match read_message(&*conn).await {
                    Ok(request) => ServerState::Dispatching(request),
                    Err(err) => ServerState::Closed(err),
                },
                ServerState::Dispatching(request) if request.kind() != MessageKind::Request => {
                    ServerState::Closed(TransportError::MalformedFrame(format!(
                        "expected a request, received a {}",
                        request.kind()
                    )))
                }
                ServerState::Dispatching(request) => {
                    // Handing the request to the pool returns at once, so the next read is armed before the
                    // request is handled.
                    let agent = self.clone();
                    let conn = conn.clone();
                    self.submit(move || agent.handle_request(conn, request));
                    ServerState::WaitingForRequest
                }
                ServerState::Closed(err) => {
                    if err.is_disconnect() {
                        debug!(worker = %self.info, peer = conn.peer(), "inbound connection closed");
                    } else {
                        warn!(worker = %self.info, peer = conn.peer(), "inbound connection failed: {err}");
                    }
                    break;
                }
            };
        }

        self.inbound().connections.remove(&key);
    }

    /// Runs the request handler on a pool thread, writing the response once it completes.
    fn handle_request(self: Arc<Self>, conn: Arc<dyn Connection>, request: Message) {
        let id = request.id();
        trace!(worker = %self.info, message_id = id, "handling request");

        let handler = self.handler.clone();
        let response = match catch_unwind(AssertUnwindSafe(|| handler.handle(request))) {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => FutureMessage::errored(ResponseError::handler(err.to_string())),
            Err(panic) => FutureMessage::errored(ResponseError::handler(panic_message(&*panic))),
        };

        response.add_callback(move |result| self.send_response(conn, id, result));
    }

    fn send_response(&self, conn: Arc<dyn Connection>, id: MessageId, result: &ResponseResult) {
        if !self.running.load(Ordering::Acquire) {
            warn!(
                worker = %self.info,
                message_id = id,
                "rpc is no longer running, skipping response"
            );
            return;
        }

        let response = match result {
            Ok(response) if response.is_request() => {
                let (payload, buffers) = response.clone().into_parts();
                Message::new(MessageKind::Response, payload, buffers).with_id(id)
            }
            Ok(response) => response.clone().with_id(id),
            Err(err) => Message::exception(&err.description(), id),
        };
        let Some(runtime) = self.runtime.get() else {
            return;
        };
        let worker = self.info.clone();
        runtime.spawn(async move {
            match write_message(&*conn, response).await {
                Ok(()) => trace!(%worker, message_id = id, "wrote response"),
                Err(err) => {
                    warn!(%worker, message_id = id, peer = conn.peer(), "failed to write response: {err}")
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::{io, sync::atomic::AtomicUsize};

    use futures::future::BoxFuture;

    use crate::{
        agent::Agent,
        config::AgentOptions,
        error::BoxError,
        store::MemoryStore,
        transport::{MemoryTransport, RawListener, RawStream, TransportBackend, TransportContext},
    };

    use super::*;

    /// In-memory transport whose listeners fail a number of accepts before serving connections.
    struct FlakyTransport {
        mem: MemoryTransport,
        failures: Arc<AtomicUsize>,
        accepts: Arc<AtomicUsize>,
    }

    impl TransportBackend for FlakyTransport {
        fn listen<'a>(
            &'a self,
            address: &'a str,
        ) -> BoxFuture<'a, Result<Box<dyn RawListener>, TransportError>> {
            Box::pin(async move {
                let inner = self.mem.listen(address).await?;
                Ok(Box::new(FlakyListener {
                    inner,
                    failures: self.failures.clone(),
                    accepts: self.accepts.clone(),
                }) as Box<dyn RawListener>)
            })
        }

        fn connect<'a>(
            &'a self,
            address: &'a str,
        ) -> BoxFuture<'a, Result<RawStream, TransportError>> {
            self.mem.connect(address)
        }
    }

    struct FlakyListener {
        inner: Box<dyn RawListener>,
        failures: Arc<AtomicUsize>,
        accepts: Arc<AtomicUsize>,
    }

    impl RawListener for FlakyListener {
        fn local_address(&self) -> String {
            self.inner.local_address()
        }

        fn accept(&self) -> BoxFuture<'_, Result<RawStream, TransportError>> {
            Box::pin(async move {
                self.accepts.fetch_add(1, Ordering::SeqCst);
                let failing = self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if failing {
                    return Err(TransportError::from(io::Error::other("too many open files")));
                }
                self.inner.accept().await
            })
        }
    }

    fn echo(request: Message) -> Result<FutureMessage, BoxError> {
        Ok(FutureMessage::completed(Message::response(
            request.payload().clone(),
        )))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn accept_loop_keeps_accepting_after_errors() {
        let mem = MemoryTransport::new();
        let failures = Arc::new(AtomicUsize::new(2));
        let accepts = Arc::new(AtomicUsize::new(0));
        let context = || {
            let mut context = TransportContext::with_defaults();
            context
                .register_transport(10, "mem", mem.clone())
                .register_transport(
                    5,
                    "flaky",
                    FlakyTransport {
                        mem: mem.clone(),
                        failures: failures.clone(),
                        accepts: accepts.clone(),
                    },
                );
            context
        };
        let options = |name: &str, id, address: String| {
            AgentOptions::new(name, id)
                .with_workers([("client", 0), ("server", 1)])
                .with_listen_addresses([address])
                .with_num_worker_threads(1)
                .with_rendezvous_timeout(Duration::from_secs(5))
        };

        let store = MemoryStore::new();
        let client = Agent::with_context(
            options(
                "client",
                0,
                format!("mem://{}", MemoryTransport::unique_address()),
            ),
            context(),
            store.clone(),
            echo,
        )
        .unwrap();
        let server = Agent::with_context(
            options(
                "server",
                1,
                format!("flaky://{}", MemoryTransport::unique_address()),
            ),
            context(),
            store,
            echo,
        )
        .unwrap();
        tokio::try_join!(client.start(), server.start()).unwrap();

        let to = client.worker_info_by_name("server").unwrap().clone();
        let response = client
            .send(&to, Message::request("still there?"))
            .unwrap()
            .wait_timeout(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(response.payload().as_ref(), b"still there?");
        assert_eq!(failures.load(Ordering::SeqCst), 0);
        assert!(accepts.load(Ordering::SeqCst) >= 3);

        client.shutdown().await;
        server.shutdown().await;
    }

    #[test]
    fn backoff_doubles_up_to_max() {
        let mut backoff = AcceptBackoff::new(Duration::from_millis(10), Duration::from_millis(35));
        let delays: Vec<_> = (0..4).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            [10, 20, 35, 35].map(Duration::from_millis).to_vec()
        );
        assert_eq!(backoff.failures, 4);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }
}
