//! The RPC agent: serves inbound requests and correlates outbound requests with their responses.
//!
//! An [`Agent`] is one worker's endpoint. Starting it binds the configured listen addresses, publishes the bound
//! URL in the rendezvous [`Store`] under the worker's name, and fetches the URL of every other worker. From then
//! on it:
//!
//! - accepts inbound connections, reading requests off each one and running the [`RequestHandler`] on the worker
//!   pool, so a slow handler never stalls reading further requests,
//! - sends outbound requests on one persistent pipe per destination, returning a [`FutureMessage`] completed
//!   when the matching response arrives or the pipe fails.
//!
//! # Example
//!
//! ```no_run
//! use pipe_agent::{error::BoxError, Agent, AgentOptions, FutureMessage, MemoryStore, Message};
//!
//! fn echo(request: Message) -> Result<FutureMessage, BoxError> {
//!     Ok(FutureMessage::completed(Message::response(request.payload().clone())))
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let options = AgentOptions::new("ps", 0).with_workers([("ps", 0), ("trainer", 1)]);
//! let agent = Agent::new(options, MemoryStore::new(), echo)?;
//! agent.start().await?;
//!
//! let trainer = agent.worker_info_by_name("trainer")?.clone();
//! let response = agent.send(&trainer, Message::request("ping"))?.await?;
//! assert_eq!(response.payload().as_ref(), b"ping");
//!
//! agent.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::{
    collections::HashMap,
    fmt, mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use futures::future::try_join_all;
use once_cell::sync::OnceCell;
use tokio::{
    runtime::Handle,
    task::{AbortHandle, JoinHandle},
};
use tracing::{debug, info, warn};

use crate::{
    config::AgentOptions,
    error::{BootstrapError, BoxError, ConfigError, ResponseError, SendError, WorkerKey},
    future_message::FutureMessage,
    message::Message,
    store::Store,
    transport::{Connection, TransportContext},
    worker::{WorkerDirectory, WorkerId, WorkerInfo},
};

use self::{
    pipe::{PipeEnv, PipeRegistry},
    pool::WorkerPool,
};

mod io;
mod pipe;
mod pool;
mod server;

/// User logic turning a request into a response.
///
/// The returned handle may already be complete, or be completed later from any thread. Returning an error, or
/// panicking, answers the request with an exception response carrying the error text.
///
/// Closures taking a [`Message`] implement this trait.
pub trait RequestHandler: Send + Sync + 'static {
    /// Handles one request.
    fn handle(&self, request: Message) -> Result<FutureMessage, BoxError>;
}

impl<F> RequestHandler for F
where
    F: Fn(Message) -> Result<FutureMessage, BoxError> + Send + Sync + 'static,
{
    fn handle(&self, request: Message) -> Result<FutureMessage, BoxError> {
        self(request)
    }
}

/// A handle to a running RPC agent.
///
/// Cloning is cheap; all clones drive the same agent.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

#[derive(Default)]
struct Inbound {
    next_key: u64,
    connections: HashMap<u64, (Arc<dyn Connection>, AbortHandle)>,
}

pub(crate) struct AgentInner {
    info: WorkerInfo,
    options: AgentOptions,
    directory: WorkerDirectory,
    context: Arc<TransportContext>,
    store: Arc<dyn Store>,
    handler: Arc<dyn RequestHandler>,
    started: AtomicBool,
    running: AtomicBool,
    runtime: OnceCell<Handle>,
    pool: OnceCell<Arc<WorkerPool>>,
    url: OnceCell<String>,
    peer_urls: OnceCell<HashMap<String, String>>,
    pipes: PipeRegistry,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    inbound: Mutex<Inbound>,
}

impl Agent {
    /// Creates an agent using the default transports, `tcp` over the `basic` channel.
    pub fn new(
        options: AgentOptions,
        store: impl Store,
        handler: impl RequestHandler,
    ) -> Result<Self, ConfigError> {
        Agent::with_context(options, TransportContext::with_defaults(), store, handler)
    }

    /// Creates an agent using the transports and channels registered in `context`.
    ///
    /// The worker directory is built here, once, and never changes afterwards.
    pub fn with_context(
        options: AgentOptions,
        mut context: TransportContext,
        store: impl Store,
        handler: impl RequestHandler,
    ) -> Result<Self, ConfigError> {
        let directory = options.validate()?;
        let info = WorkerInfo::new(options.worker_name.as_str(), options.worker_id);
        context.set_max_message_size(options.max_message_size);

        Ok(Agent {
            inner: Arc::new(AgentInner {
                info,
                options,
                directory,
                context: Arc::new(context),
                store: Arc::new(store),
                handler: Arc::new(handler),
                started: AtomicBool::new(false),
                running: AtomicBool::new(false),
                runtime: OnceCell::new(),
                pool: OnceCell::new(),
                url: OnceCell::new(),
                peer_urls: OnceCell::new(),
                pipes: PipeRegistry::new(),
                accept_task: Mutex::new(None),
                inbound: Mutex::new(Inbound::default()),
            }),
        })
    }

    /// Binds the listen addresses, exchanges addresses with every worker, and starts accepting requests.
    ///
    /// Waits until every worker in the table has published its address, or the rendezvous timeout elapses.
    pub async fn start(&self) -> Result<(), BootstrapError> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::AcqRel) {
            return Err(BootstrapError::AlreadyStarted);
        }
        let runtime = Handle::try_current().map_err(|_| BootstrapError::NoRuntime)?;
        let pool = WorkerPool::new(
            inner.info.name(),
            inner.options.num_worker_threads,
            runtime.clone(),
        )
        .map_err(BootstrapError::Pool)?;

        let listener = inner.context.listen(&inner.options.listen_addresses).await?;
        let url = listener
            .preferred_url()
            .ok_or(BootstrapError::NoPublishableAddress)?
            .to_string();
        inner
            .store
            .set(inner.info.name(), url.clone().into_bytes())
            .await?;
        debug!(worker = %inner.info, %url, "published address");

        let timeout = inner.options.rendezvous_timeout;
        let peer_urls = try_join_all(inner.directory.iter().map(|worker| async move {
            let address = inner.store.get(worker.name(), timeout).await?;
            let url =
                String::from_utf8(address).map_err(|_| BootstrapError::InvalidPeerAddress {
                    worker: worker.name().to_string(),
                })?;
            Ok::<_, BootstrapError>((worker.name().to_string(), url))
        }))
        .await?
        .into_iter()
        .collect();

        let _ = inner.runtime.set(runtime.clone());
        let _ = inner.pool.set(Arc::new(pool));
        let _ = inner.url.set(url.clone());
        let _ = inner.peer_urls.set(peer_urls);
        inner.running.store(true, Ordering::Release);

        let accept = runtime.spawn(inner.clone().accept_loop(listener));
        *inner.lock_accept_task() = Some(accept);
        info!(worker = %inner.info, %url, "agent started");
        Ok(())
    }

    /// Sends a request, returning a handle completed with the response.
    ///
    /// Fails without any I/O if the agent is not running, the destination is unknown, or the message is not a
    /// request. Failures after that point, including remote exceptions, are delivered through the handle.
    pub fn send(&self, to: &WorkerInfo, request: Message) -> Result<FutureMessage, SendError> {
        let inner = &self.inner;
        if !request.is_request() {
            return Err(SendError::NotARequest(request.kind()));
        }
        if !inner.running.load(Ordering::Acquire) {
            return Err(SendError::NotRunning {
                worker_id: inner.info.id(),
                kind: request.kind(),
            });
        }

        // Addresses are resolved by name; an id alone never picks the destination.
        let unknown = || SendError::UnknownWorker(WorkerKey::Name(to.name().to_string()));
        let peer = inner
            .directory
            .by_name(to.name())
            .ok()
            .filter(|known| known.id() == to.id())
            .ok_or_else(unknown)?;
        let url = inner
            .peer_urls
            .get()
            .and_then(|urls| urls.get(peer.name()))
            .ok_or_else(unknown)?;
        let env = inner.pipe_env().ok_or(SendError::NotRunning {
            worker_id: inner.info.id(),
            kind: request.kind(),
        })?;

        Ok(inner.pipes.send(peer, url, request, &env))
    }

    /// The local worker.
    pub fn worker_info(&self) -> &WorkerInfo {
        &self.inner.info
    }

    /// Looks up a worker by name.
    pub fn worker_info_by_name(&self, name: &str) -> Result<&WorkerInfo, SendError> {
        self.inner
            .directory
            .by_name(name)
            .map_err(SendError::UnknownWorker)
    }

    /// Looks up a worker by id.
    pub fn worker_info_by_id(&self, id: WorkerId) -> Result<&WorkerInfo, SendError> {
        self.inner
            .directory
            .by_id(id)
            .map_err(SendError::UnknownWorker)
    }

    /// Every worker in the group, ordered by id.
    pub fn worker_infos(&self) -> Vec<WorkerInfo> {
        self.inner.directory.iter().cloned().collect()
    }

    /// The URL this agent published, once started.
    pub fn url(&self) -> Option<&str> {
        self.inner.url.get().map(String::as_str)
    }

    /// Returns `true` between a successful [`start`](Agent::start) and [`shutdown`](Agent::shutdown).
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// The configured time callers should wait for a response.
    pub fn rpc_timeout(&self) -> Duration {
        self.inner.options.rpc_timeout
    }

    /// Stops the agent.
    ///
    /// New sends fail and pending response writes are skipped from this point. The accept loop is stopped and the
    /// worker pool drained, waiting for queued and running handlers to finish. Requests still waiting for a
    /// response then fail with [`ResponseError::Shutdown`], and every connection is closed.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!(worker = %inner.info, "shutting down");

        if let Some(accept) = inner.lock_accept_task().take() {
            accept.abort();
        }

        if let Some(pool) = inner.pool.get().cloned() {
            if let Err(err) = tokio::task::spawn_blocking(move || pool.drain()).await {
                warn!(worker = %inner.info, "failed to drain worker pool: {err}");
            }
        }

        inner.pipes.teardown_all(ResponseError::Shutdown);

        let inbound = mem::take(&mut inner.inbound().connections);
        for (conn, task) in inbound.into_values() {
            task.abort();
            conn.close().await;
        }
        info!(worker = %inner.info, "agent shut down");
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("worker", &self.inner.info)
            .field("url", &self.inner.url.get())
            .field("running", &self.is_running())
            .field("pipes", &self.inner.pipes)
            .finish()
    }
}

impl AgentInner {
    fn pipe_env(&self) -> Option<PipeEnv> {
        Some(PipeEnv {
            context: self.context.clone(),
            pool: self.pool.get()?.clone(),
            runtime: self.runtime.get()?.clone(),
        })
    }

    /// Runs a job on the worker pool, or inline before the pool exists.
    fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self.pool.get() {
            Some(pool) => pool.submit(job),
            None => job(),
        }
    }

    fn inbound(&self) -> MutexGuard<'_, Inbound> {
        self.inbound.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn lock_accept_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.accept_task
            .lock()
            .unwrap_or_else(|err| err.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use crate::{message::MessageKind, store::MemoryStore};

    use super::*;

    fn echo(request: Message) -> Result<FutureMessage, BoxError> {
        Ok(FutureMessage::completed(Message::response(
            request.payload().clone(),
        )))
    }

    fn options() -> AgentOptions {
        AgentOptions::new("solo", 0).with_workers([("solo", 0), ("other", 1)])
    }

    #[test]
    fn lookups_use_the_static_table() {
        let agent = Agent::new(options(), MemoryStore::new(), echo).unwrap();
        assert_eq!(agent.worker_info(), &WorkerInfo::new("solo", 0));
        assert_eq!(agent.worker_info_by_id(1).unwrap().name(), "other");
        assert_eq!(
            agent.worker_info_by_name("nobody").unwrap_err(),
            SendError::UnknownWorker(WorkerKey::Name("nobody".into()))
        );
        assert_eq!(agent.worker_infos().len(), 2);
    }

    #[test]
    fn send_before_start_is_not_running() {
        let agent = Agent::new(options(), MemoryStore::new(), echo).unwrap();
        let other = agent.worker_info_by_id(1).unwrap().clone();
        assert_eq!(
            agent.send(&other, Message::request("x")).unwrap_err(),
            SendError::NotRunning {
                worker_id: 0,
                kind: MessageKind::Request
            }
        );
        assert!(!agent.is_running());
    }

    #[test]
    fn only_requests_can_be_sent() {
        let agent = Agent::new(options(), MemoryStore::new(), echo).unwrap();
        let other = agent.worker_info_by_id(1).unwrap().clone();
        assert_eq!(
            agent.send(&other, Message::response("x")).unwrap_err(),
            SendError::NotARequest(MessageKind::Response)
        );
    }

    #[test]
    fn invalid_options_are_rejected() {
        let opts = AgentOptions::new("solo", 0).with_workers([("other", 1)]);
        assert!(Agent::new(opts, MemoryStore::new(), echo).is_err());
    }
}
