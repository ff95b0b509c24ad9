use std::{
    collections::HashMap,
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use xitca_pool::{
    ConnectionFactory, HandleId, HandleRegistry, MultiplexPool, Pool, ShutdownState,
    error::{Error, StreamCapacity},
};

const TIMEOUT: Duration = Duration::from_secs(5);

// a connection that supports concurrent streams.
struct H2Conn {
    streams: AtomicUsize,
}

#[derive(Default)]
struct Stats {
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

struct Connector(Arc<Stats>);

impl ConnectionFactory for Connector {
    type Resource = H2Conn;
    type Error = io::Error;

    async fn create(&self) -> Result<Self::Resource, Self::Error> {
        self.0.created.fetch_add(1, Ordering::SeqCst);
        Ok(H2Conn {
            streams: AtomicUsize::new(0),
        })
    }

    async fn destroy(&self, _: Self::Resource) {
        self.0.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

fn multiplex(max_size: usize, max_streams: usize) -> (MultiplexPool<Connector>, Arc<Stats>) {
    let stats = Arc::new(Stats::default());
    let pool = Pool::builder(Connector(stats.clone()))
        .max_size(max_size)
        .registry(HandleRegistry::new())
        .multiplex()
        .max_streams(max_streams)
        .build()
        .unwrap();
    (pool, stats)
}

#[tokio::test]
async fn capacity_error() -> Result<(), Error> {
    let (pool, _) = multiplex(1, 2);

    let s1 = pool.acquire_stream().await?;
    let s2 = pool.open_stream(s1.id())?;

    match pool.open_stream(s1.id()) {
        Err(Error::StreamCapacity(StreamCapacity { handle, max_streams })) => {
            assert_eq!(handle, s2.id());
            assert_eq!(max_streams, 2);
        }
        res => panic!("expect stream capacity error. got {res:?}"),
    }

    // closing every stream makes the resource eligible for plain release.
    s1.close();
    s2.close();
    let metrics = pool.pool().metrics();
    assert_eq!(metrics.in_use, 0);
    assert_eq!(metrics.idle, 1);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn streams_never_exceed_limit() -> Result<(), Error> {
    const MAX_STREAMS: usize = 3;

    let (pool, stats) = multiplex(2, MAX_STREAMS);
    let peak = Arc::new(Mutex::new(HashMap::<HandleId, usize>::new()));

    let tasks = (0..12)
        .map(|_| {
            let pool = pool.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                for _ in 0..16 {
                    let stream = pool.acquire_stream().await.unwrap();
                    let n = stream.streams.fetch_add(1, Ordering::SeqCst) + 1;
                    {
                        let mut peak = peak.lock().unwrap();
                        let p = peak.entry(stream.id()).or_default();
                        *p = (*p).max(n);
                    }
                    tokio::task::yield_now().await;
                    stream.streams.fetch_sub(1, Ordering::SeqCst);
                    stream.close();
                }
            })
        })
        .collect::<Vec<_>>();

    for task in tasks {
        tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap();
    }

    for (id, p) in peak.lock().unwrap().iter() {
        assert!(*p <= MAX_STREAMS, "resource {id} served {p} concurrent streams");
    }

    assert!(stats.created.load(Ordering::SeqCst) <= 2);

    let metrics = pool.metrics();
    assert_eq!(metrics.leased_concurrency, 0);
    assert_eq!(metrics.pending_acquires, 0);

    pool.shutdown().drained_timeout(TIMEOUT).await?;
    assert_eq!(pool.pool().registry().live_count(), 0);

    Ok(())
}

#[tokio::test]
async fn shutdown_with_open_streams() -> Result<(), Error> {
    let (pool, stats) = multiplex(1, 2);

    let s1 = pool.acquire_stream().await?;
    let s2 = pool.acquire_stream().await?;
    let waiter = pool.acquire_stream();

    let shutdown = pool.shutdown();
    assert_eq!(shutdown.state(), ShutdownState::Draining);

    assert!(waiter.await.unwrap_err().is_shutting_down());
    assert!(pool.acquire_stream().await.unwrap_err().is_shutting_down());
    assert!(pool.open_stream(s1.id()).unwrap_err().is_shutting_down());

    // open streams keep working until closed.
    assert_eq!(s1.streams.load(Ordering::SeqCst), 0);
    s1.close();
    assert_eq!(shutdown.state(), ShutdownState::Draining);

    s2.close();
    shutdown.drained_timeout(TIMEOUT).await?;
    assert_eq!(stats.destroyed.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
async fn cancel_connect_before_poll() -> Result<(), Error> {
    let (pool, stats) = multiplex(1, 2);

    // first stream on an empty pool takes the connecting slot.
    drop(pool.acquire_stream());
    assert_eq!(pool.pool().metrics().total, 0);

    // connecting slot is given back so the single resource can still be connected.
    let stream = tokio::time::timeout(TIMEOUT, pool.acquire_stream()).await.unwrap()?;
    assert_eq!(stats.created.load(Ordering::SeqCst), 1);
    stream.close();

    pool.shutdown().drained_timeout(TIMEOUT).await?;

    Ok(())
}
