use std::time::Duration;

use pipe_agent::{Agent, AgentOptions, MemoryStore, Message, TypedBuffer};

mod common;

use common::echo;

const WAIT: Duration = Duration::from_secs(10);

async fn tcp_pair() -> (Agent, Agent) {
    common::init_tracing();
    let store = MemoryStore::new();
    let workers = [("a", 0), ("b", 1)];

    let a = Agent::new(
        AgentOptions::new("a", 0)
            .with_workers(workers)
            .with_num_worker_threads(2),
        store.clone(),
        echo,
    )
    .unwrap();
    let b = Agent::new(
        AgentOptions::new("b", 1)
            .with_workers(workers)
            .with_num_worker_threads(2),
        store,
        echo,
    )
    .unwrap();
    tokio::try_join!(a.start(), b.start()).unwrap();
    (a, b)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn agents_exchange_tcp_urls() {
    let (a, b) = tcp_pair().await;

    for agent in [&a, &b] {
        let url = agent.url().unwrap();
        assert!(url.starts_with("tcp://127.0.0.1:"), "{url}");
        assert!(!url.ends_with(":0"), "{url}");
    }

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn large_message_with_buffers_over_tcp() {
    let (a, b) = tcp_pair().await;
    let to = a.worker_info_by_name("b").unwrap().clone();

    let payload: Vec<u8> = (0..(1 << 20)).map(|i| (i % 251) as u8).collect();
    let request = Message::request(payload.clone())
        .with_buffer(TypedBuffer::new("f64", vec![7u8; 3 << 20]))
        .with_buffer(TypedBuffer::new("empty", Vec::<u8>::new()));

    let response = a.send(&to, request).unwrap().wait_timeout(WAIT).await.unwrap();
    assert_eq!(response.payload().as_ref(), payload.as_slice());
    assert_eq!(response.buffers().len(), 2);
    assert_eq!(response.buffers()[0].data.len(), 3 << 20);
    assert!(response.buffers()[0].data.iter().all(|b| *b == 7));
    assert!(response.buffers()[1].data.is_empty());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn many_requests_share_one_pipe() {
    let (a, b) = tcp_pair().await;
    let to = a.worker_info_by_name("b").unwrap().clone();

    let futs: Vec<_> = (0..100)
        .map(|i| a.send(&to, Message::request(format!("req-{i}"))).unwrap())
        .collect();
    for (i, fut) in futs.into_iter().enumerate() {
        let response = fut.wait_timeout(WAIT).await.unwrap();
        assert_eq!(response.payload().as_ref(), format!("req-{i}").as_bytes());
    }

    a.shutdown().await;
    b.shutdown().await;
}
