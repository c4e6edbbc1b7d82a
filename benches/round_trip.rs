use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pipe_agent::{
    error::BoxError,
    transport::{MemoryTransport, TransportContext},
    Agent, AgentOptions, FutureMessage, MemoryStore, Message, TypedBuffer, WorkerInfo,
};
use tokio::runtime::{Builder, Runtime};

fn echo(request: Message) -> Result<FutureMessage, BoxError> {
    let (payload, buffers) = request.into_parts();
    Ok(FutureMessage::completed(Message::new(
        pipe_agent::MessageKind::Response,
        payload,
        buffers,
    )))
}

fn options(name: &str, id: u16, address: &str) -> AgentOptions {
    AgentOptions::new(name, id)
        .with_workers([("client", 0), ("server", 1)])
        .with_listen_addresses([address])
        .with_num_worker_threads(2)
}

fn start_pair(rt: &Runtime, scheme: &str) -> (Agent, Agent, WorkerInfo) {
    rt.block_on(async {
        let mem = MemoryTransport::new();
        let context = || {
            let mut context = TransportContext::with_defaults();
            context.register_transport(10, "mem", mem.clone());
            context
        };
        let address = |scheme: &str| match scheme {
            "mem" => format!("mem://{}", MemoryTransport::unique_address()),
            _ => "tcp://127.0.0.1:0".to_string(),
        };

        let store = MemoryStore::new();
        let client = Agent::with_context(
            options("client", 0, &address(scheme)),
            context(),
            store.clone(),
            echo,
        )
        .unwrap();
        let server = Agent::with_context(
            options("server", 1, &address(scheme)),
            context(),
            store,
            echo,
        )
        .unwrap();
        tokio::try_join!(client.start(), server.start()).unwrap();

        let to = client.worker_info_by_name("server").unwrap().clone();
        // Open the pipe before measuring.
        client
            .send(&to, Message::request("warmup"))
            .unwrap()
            .wait()
            .await
            .unwrap();
        (client, server, to)
    })
}

fn round_trip_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("Round Trip");

    for scheme in ["mem", "tcp"] {
        group.bench_function(BenchmarkId::new("empty_request", scheme), |b| {
            let rt = Builder::new_multi_thread().enable_all().build().unwrap();
            let (client, server, to) = start_pair(&rt, scheme);
            b.to_async(&rt).iter(|| async {
                client
                    .send(&to, Message::request(""))
                    .unwrap()
                    .wait()
                    .await
                    .unwrap();
            });
            rt.block_on(async {
                client.shutdown().await;
                server.shutdown().await;
            });
        });
    }

    for size in [4 << 10, 1 << 20] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("tensor_buffer", size), &size, |b, &size| {
            let rt = Builder::new_multi_thread().enable_all().build().unwrap();
            let (client, server, to) = start_pair(&rt, "mem");
            let data = bytes::Bytes::from(vec![0u8; size]);
            b.to_async(&rt).iter(|| async {
                let request = Message::request("tensor")
                    .with_buffer(TypedBuffer::new("f32", data.clone()));
                client.send(&to, request).unwrap().wait().await.unwrap();
            });
            rt.block_on(async {
                client.shutdown().await;
                server.shutdown().await;
            });
        });
    }

    group.finish();
}

criterion_group!(benches, round_trip_benchmarks);
criterion_main!(benches);
