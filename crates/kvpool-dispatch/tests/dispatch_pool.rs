//! Dispatcher and connection pool working together over loopback TCP.
//!
//! The test stack: client → `WorkerDispatcher` → handler → `ConnectionPool`
//! → `BackendFactory` → TCP → `MockRedisServer` (echo).

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use kvpool_conn::{BackendFactory, ConnectionPool, PoolConfig};
use kvpool_core::{AppConfig, BackendSettings, ResourceType};
use kvpool_dispatch::{RequestHandler, WorkerContext, WorkerDispatcher};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

// ── MockRedisServer ─────────────────────────────────────────────────

/// Accepts any number of connections and echoes every byte back.
struct MockRedisServer {
    addr: SocketAddr,
}

impl MockRedisServer {
    fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind to random port");
        let addr = listener.local_addr().expect("local addr");

        std::thread::spawn(move || {
            while let Ok((mut stream, _)) = listener.accept() {
                std::thread::spawn(move || {
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf) {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        Self { addr }
    }
}

fn loopback() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind to random port");
    let addr = listener.local_addr().expect("local addr");
    (listener, addr)
}

async fn request(addr: SocketAddr, body: &str) -> String {
    let mut client = TcpStream::connect(addr).await.expect("connect to dispatcher");
    client.write_all(body.as_bytes()).await.expect("send request");
    let mut reply = String::new();
    client.read_to_string(&mut reply).await.expect("read reply");
    reply
}

// ── Concurrency bound ───────────────────────────────────────────────

#[derive(Default)]
struct Counters {
    current: AtomicUsize,
    peak: AtomicUsize,
    served: AtomicUsize,
}

struct CountingHandler {
    counters: Arc<Counters>,
}

impl RequestHandler for CountingHandler {
    async fn handle(&self, mut stream: TcpStream, _ctx: WorkerContext) -> anyhow::Result<()> {
        let c = &self.counters;
        let now = c.current.fetch_add(1, Ordering::SeqCst) + 1;
        c.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        c.current.fetch_sub(1, Ordering::SeqCst);
        c.served.fetch_add(1, Ordering::SeqCst);
        stream.write_all(b"ok").await?;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn never_runs_more_than_max_workers() {
    let counters = Arc::new(Counters::default());
    let (listener, addr) = loopback();
    let dispatcher = WorkerDispatcher::new(
        3,
        CountingHandler {
            counters: Arc::clone(&counters),
        },
    );
    dispatcher.start(listener).unwrap();

    let mut clients = tokio::task::JoinSet::new();
    for _ in 0..12 {
        clients.spawn(request(addr, ""));
    }
    while let Some(reply) = clients.join_next().await {
        assert_eq!(reply.unwrap(), "ok");
    }

    assert_eq!(counters.served.load(Ordering::SeqCst), 12);
    let peak = counters.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency {peak} exceeded 3 workers");

    dispatcher.stop().await;
    assert_eq!(dispatcher.running(), 0);
}

// ── Pool usage from workers ─────────────────────────────────────────

struct EchoThroughRedis {
    pool: Arc<ConnectionPool>,
}

impl RequestHandler for EchoThroughRedis {
    async fn handle(&self, mut stream: TcpStream, _ctx: WorkerContext) -> anyhow::Result<()> {
        let mut buf = vec![0u8; 256];
        let n = stream.read(&mut buf).await?;
        buf.truncate(n);

        let conn = self.pool.acquire(ResourceType::Redis).await?;
        let (conn, echoed) = tokio::task::spawn_blocking(move || {
            let mut conn = conn;
            let echoed = conn.send(&buf).and_then(|_| conn.recv(256));
            (conn, echoed)
        })
        .await?;
        let echoed = echoed.map_err(anyhow::Error::msg)?;

        stream.write_all(&echoed).await?;
        stream.write_all(format!(" via {}", conn.name()).as_bytes()).await?;
        self.pool.release(conn);
        Ok(())
    }
}

fn redis_pool(backend: SocketAddr, capacity: usize) -> Arc<ConnectionPool> {
    let mut settings = AppConfig::default();
    settings.redis.insert(
        "test".to_string(),
        BackendSettings {
            host: Some(backend.ip().to_string()),
            port: Some(backend.port()),
            ..BackendSettings::default()
        },
    );
    let config = PoolConfig {
        environment: "test".to_string(),
        capacity,
        ..PoolConfig::default()
    };
    Arc::new(ConnectionPool::new(
        config,
        Arc::new(settings),
        Arc::new(BackendFactory::new(
            Duration::from_secs(2),
            Duration::from_secs(1),
        )),
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn requests_borrow_pooled_backend_connections() {
    let backend = MockRedisServer::start();
    let pool = redis_pool(backend.addr, 2);
    let (listener, addr) = loopback();
    let dispatcher = WorkerDispatcher::new(
        2,
        EchoThroughRedis {
            pool: Arc::clone(&pool),
        },
    );
    dispatcher.start(listener).unwrap();

    let mut clients = tokio::task::JoinSet::new();
    for i in 0..6 {
        clients.spawn(async move { (i, request(addr, &format!("ping-{i}")).await) });
    }

    let mut names = HashSet::new();
    while let Some(res) = clients.join_next().await {
        let (i, reply) = res.unwrap();
        let (echoed, name) = reply.split_once(" via ").expect("reply names the slot");
        assert_eq!(echoed, format!("ping-{i}"));
        names.insert(name.to_string());
    }
    assert!(names.is_subset(&HashSet::from(["kvs01_0".to_string(), "kvs01_1".to_string()])));

    dispatcher.stop().await;
    let stats = pool.stats(ResourceType::Redis).unwrap();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.idle + stats.closed, 2);
    assert_eq!(stats.idle, names.len());
}

// ── Graceful stop ───────────────────────────────────────────────────

struct SlowHandler {
    started: Arc<AtomicUsize>,
}

impl RequestHandler for SlowHandler {
    async fn handle(&self, mut stream: TcpStream, _ctx: WorkerContext) -> anyhow::Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        stream.write_all(b"done").await?;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_drains_in_flight_request() {
    let started = Arc::new(AtomicUsize::new(0));
    let (listener, addr) = loopback();
    let dispatcher = WorkerDispatcher::new(
        2,
        SlowHandler {
            started: Arc::clone(&started),
        },
    )
    .with_drain_timeout(Duration::from_secs(5));
    dispatcher.start(listener).unwrap();

    let client = tokio::spawn(request(addr, ""));
    while started.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    dispatcher.stop().await;
    assert_eq!(client.await.unwrap(), "done");
    assert!(!dispatcher.is_listening());
    assert!(TcpStream::connect(addr).await.is_err());
}

// ── Handler panics ──────────────────────────────────────────────────

/// Panics on `boom`, answers `ok` otherwise.
struct FragileHandler;

impl RequestHandler for FragileHandler {
    async fn handle(&self, mut stream: TcpStream, _ctx: WorkerContext) -> anyhow::Result<()> {
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await?;
        if &buf[..n] == b"boom" {
            panic!("handler blew up");
        }
        stream.write_all(b"ok").await?;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_handler_returns_worker_to_idle() {
    let (listener, addr) = loopback();
    let dispatcher = WorkerDispatcher::new(2, FragileHandler);
    dispatcher.start(listener).unwrap();

    // More panics than workers: each one must hand its worker back.
    for _ in 0..3 {
        assert_eq!(request(addr, "boom").await, "");
    }
    assert_eq!(request(addr, "hello").await, "ok");

    for _ in 0..100 {
        if dispatcher.idle() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(dispatcher.idle(), 2);
    assert_eq!(dispatcher.running(), 0);

    dispatcher.stop().await;
}
