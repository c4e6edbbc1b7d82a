#![allow(dead_code)]

use pipe_agent::{
    error::BoxError,
    transport::{MemoryTransport, TransportContext},
    Agent, AgentOptions, FutureMessage, MemoryStore, Message, RequestHandler,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("pipe_agent=warn")
        .with_test_writer()
        .try_init();
}

/// Pins a closure to the handler signature.
pub fn handler<F>(f: F) -> F
where
    F: Fn(Message) -> Result<FutureMessage, BoxError> + Send + Sync + 'static,
{
    f
}

pub fn echo(request: Message) -> Result<FutureMessage, BoxError> {
    let (payload, buffers) = request.into_parts();
    Ok(FutureMessage::completed(Message::new(
        pipe_agent::MessageKind::Response,
        payload,
        buffers,
    )))
}

pub fn mem_context(mem: &MemoryTransport) -> TransportContext {
    let mut context = TransportContext::with_defaults();
    context.register_transport(10, "mem", mem.clone());
    context
}

pub struct Pair {
    pub mem: MemoryTransport,
    pub a: Agent,
    pub b: Agent,
}

impl Pair {
    /// Starts worker `a` (id 0) and worker `b` (id 1) over the in-memory transport.
    pub async fn start(handler_a: impl RequestHandler, handler_b: impl RequestHandler) -> Pair {
        init_tracing();
        let mem = MemoryTransport::new();
        let store = MemoryStore::new();

        let a = Agent::with_context(
            options("a", 0),
            mem_context(&mem),
            store.clone(),
            handler_a,
        )
        .unwrap();
        let b = Agent::with_context(options("b", 1), mem_context(&mem), store, handler_b).unwrap();
        tokio::try_join!(a.start(), b.start()).unwrap();

        Pair { mem, a, b }
    }

    pub fn b_info(&self) -> pipe_agent::WorkerInfo {
        self.a.worker_info_by_name("b").unwrap().clone()
    }

    pub async fn shutdown(self) {
        self.a.shutdown().await;
        self.b.shutdown().await;
    }
}

pub fn options(name: &str, id: u16) -> AgentOptions {
    AgentOptions::new(name, id)
        .with_workers([("a", 0), ("b", 1)])
        .with_listen_addresses([format!("mem://{}", MemoryTransport::unique_address())])
        .with_num_worker_threads(4)
}
