//! concurrent streams on top of pooled resources.
//!
//! a resource leased from [Pool] is shared by up to `max_streams` [StreamLease]. when it's last stream
//! closes the resource goes back to pool with the same semantics as releasing a plain [Lease].

use core::{fmt, future::Future, ops::Deref};

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::{
    error::{Error, StreamCapacity},
    factory::ConnectionFactory,
    pool::{Lease, Pool},
    registry::HandleId,
    shutdown::Shutdown,
};

/// pool where every resource serves concurrent streams. constructed by [crate::MultiplexBuilder].
pub struct MultiplexPool<F>
where
    F: ConnectionFactory,
{
    inner: Arc<Inner<F>>,
}

impl<F> Clone for MultiplexPool<F>
where
    F: ConnectionFactory,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<F>
where
    F: ConnectionFactory,
{
    pool: Pool<F>,
    max_size: usize,
    max_streams: usize,
    ideal_streams: usize,
    streams: Mutex<Streams<F>>,
}

struct Streams<F>
where
    F: ConnectionFactory,
{
    entries: HashMap<HandleId, Entry<F>>,
    waiters: VecDeque<StreamWaiter<F>>,
    // pool acquisitions in flight. each one becomes an entry when it succeeds.
    connecting: usize,
    shutdown: bool,
    next_seq: u64,
}

struct Entry<F>
where
    F: ConnectionFactory,
{
    lease: Arc<Lease<F>>,
    active: usize,
}

enum StreamGrant<F>
where
    F: ConnectionFactory,
{
    // a stream slot on the entry is already counted for receiver.
    Stream(HandleId, Arc<Lease<F>>),
    // receiver owns one connecting slot and acquires a new resource from pool.
    Connect,
}

struct StreamWaiter<F>
where
    F: ConnectionFactory,
{
    seq: u64,
    tx: oneshot::Sender<StreamGrant<F>>,
}

/// snapshot of multiplex pool bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiplexMetrics {
    /// resources currently serving at least one stream.
    pub resources: usize,
    /// streams that can still be opened on current resources.
    pub available_concurrency: usize,
    /// open streams.
    pub leased_concurrency: usize,
    /// queued stream acquirers.
    pub pending_acquires: usize,
}

impl<F> MultiplexPool<F>
where
    F: ConnectionFactory,
{
    pub(crate) fn new(pool: Pool<F>, max_streams: usize, ideal_streams: usize) -> Self {
        let max_size = pool.metrics().max_size;
        Self {
            inner: Arc::new(Inner {
                pool,
                max_size,
                max_streams,
                ideal_streams,
                streams: Mutex::new(Streams {
                    entries: HashMap::new(),
                    waiters: VecDeque::new(),
                    connecting: 0,
                    shutdown: false,
                    next_seq: 0,
                }),
            }),
        }
    }

    /// open a stream on the resource with given id.
    ///
    /// the resource must currently be serving streams of this pool. otherwise [Error::UnknownLease]
    /// is returned. [Error::StreamCapacity] is returned when it's already at max streams.
    pub fn open_stream(&self, id: HandleId) -> Result<StreamLease<F>, Error> {
        let mut streams = self.inner.lock();

        if streams.shutdown {
            return Err(Error::ShuttingDown);
        }

        let entry = streams.entries.get_mut(&id).ok_or(Error::UnknownLease(id))?;

        if entry.active == self.inner.max_streams {
            return Err(StreamCapacity {
                handle: id,
                max_streams: self.inner.max_streams,
            }
            .into());
        }

        entry.active += 1;
        let lease = entry.lease.clone();
        drop(streams);

        trace!(pool = %lease.pool_name(), handle = %id, "open stream");

        Ok(StreamLease {
            inner: self.inner.clone(),
            id,
            lease,
        })
    }

    /// open a stream on any resource.
    ///
    /// the stream lands on the busiest resource that is below ideal streams. when every resource is at
    /// or beyond ideal streams a new resource is acquired from pool if it has room. otherwise the
    /// busiest resource below max streams is used and when none is left the request is queued and
    /// served in order.
    ///
    /// placement happens when this method is called and not when the returned future is polled.
    /// dropping the future cancels the request.
    pub fn acquire_stream(&self) -> impl Future<Output = Result<StreamLease<F>, Error>> + Send + 'static
    where
        F::Resource: Sync,
    {
        let pick = self.inner.pick();

        async move {
            match pick {
                Pick::Ready(res) => res,
                Pick::Connect(connecting) => connecting.connect().await,
                Pick::Wait(mut waiting) => {
                    let Some(rx) = waiting.rx.as_mut() else {
                        unreachable!("StreamWaiting must have a receiver before it's fulfilled")
                    };
                    let grant = rx.await;
                    waiting.rx = None;
                    match grant {
                        Ok(StreamGrant::Stream(id, lease)) => Ok(StreamLease {
                            inner: waiting.inner.clone(),
                            id,
                            lease,
                        }),
                        Ok(StreamGrant::Connect) => Connecting::new(waiting.inner.clone()).connect().await,
                        Err(_) => Err(Error::ShuttingDown),
                    }
                }
            }
        }
    }

    pub fn metrics(&self) -> MultiplexMetrics {
        let streams = self.inner.lock();
        let leased = streams.entries.values().map(|e| e.active).sum::<usize>();
        let resources = streams.entries.len();
        MultiplexMetrics {
            resources,
            available_concurrency: resources * self.inner.max_streams - leased,
            leased_concurrency: leased,
            pending_acquires: streams.waiters.len(),
        }
    }

    /// the pool resources are leased from.
    pub fn pool(&self) -> &Pool<F> {
        &self.inner.pool
    }

    /// reject queued and future stream requests and shutdown the underlying pool.
    ///
    /// open streams are unaffected. a resource is destroyed once it's last stream is closed.
    pub fn shutdown(&self) -> Shutdown<F> {
        let waiters = {
            let mut streams = self.inner.lock();
            streams.shutdown = true;
            streams.waiters.drain(..).collect::<Vec<_>>()
        };

        if !waiters.is_empty() {
            debug!(pool = %self.inner.pool.name(), "reject {} queued stream acquirer(s) on shutdown", waiters.len());
        }

        drop(waiters);

        self.inner.pool.shutdown()
    }
}

enum Pick<F>
where
    F: ConnectionFactory,
{
    Ready(Result<StreamLease<F>, Error>),
    Connect(Connecting<F>),
    Wait(StreamWaiting<F>),
}

impl<F> Inner<F>
where
    F: ConnectionFactory,
{
    fn lock(&self) -> MutexGuard<'_, Streams<F>> {
        self.streams.lock().unwrap()
    }

    fn pick(self: &Arc<Self>) -> Pick<F> {
        let mut guard = self.lock();
        let streams = &mut *guard;

        if streams.shutdown {
            return Pick::Ready(Err(Error::ShuttingDown));
        }

        let can_grow = streams.entries.len() + streams.connecting < self.max_size;

        let busiest_below = |limit: usize| {
            streams
                .entries
                .iter()
                .filter(|(_, e)| e.active < limit)
                .max_by_key(|(id, e)| (e.active, core::cmp::Reverse(**id)))
                .map(|(id, _)| *id)
        };

        // queued acquirers are served before a new one. every entry is at max streams when the queue
        // is not empty so only growing is left.
        let id = if streams.waiters.is_empty() {
            match busiest_below(self.ideal_streams) {
                Some(id) => Some(id),
                None if can_grow => None,
                None => busiest_below(self.max_streams),
            }
        } else {
            None
        };

        if let Some(id) = id {
            let entry = streams.entries.get_mut(&id).expect("entry id is picked from entries");
            entry.active += 1;
            trace!(pool = %self.pool.name(), handle = %id, active = entry.active, "open stream");
            return Pick::Ready(Ok(StreamLease {
                inner: self.clone(),
                id,
                lease: entry.lease.clone(),
            }));
        }

        if streams.waiters.is_empty() && can_grow {
            streams.connecting += 1;
            return Pick::Connect(Connecting::new(self.clone()));
        }

        let seq = streams.next_seq;
        streams.next_seq += 1;
        let (tx, rx) = oneshot::channel();
        streams.waiters.push_back(StreamWaiter { seq, tx });

        Pick::Wait(StreamWaiting {
            inner: self.clone(),
            seq,
            rx: Some(rx),
        })
    }

    // a resource is acquired from pool for a connecting slot.
    fn connected(self: &Arc<Self>, lease: Lease<F>) -> Result<StreamLease<F>, Error> {
        let id = lease.id();
        let lease = Arc::new(lease);

        let mut guard = self.lock();
        let streams = &mut *guard;
        streams.connecting -= 1;

        if streams.shutdown {
            drop(guard);
            return Err(Error::ShuttingDown);
        }

        let mut active = 1;
        while active < self.max_streams {
            let Some(waiter) = streams.waiters.pop_front() else {
                break;
            };
            if waiter.tx.send(StreamGrant::Stream(id, lease.clone())).is_ok() {
                active += 1;
            }
        }

        streams.entries.insert(
            id,
            Entry {
                lease: lease.clone(),
                active,
            },
        );

        drop(guard);

        trace!(pool = %self.pool.name(), handle = %id, active, "resource joined multiplex pool");

        Ok(StreamLease {
            inner: self.clone(),
            id,
            lease,
        })
    }

    // a connecting slot did not produce a resource. the oldest waiter takes it over.
    fn connect_failed(&self) {
        let mut streams = self.lock();
        streams.connecting -= 1;

        if streams.shutdown {
            return;
        }

        while let Some(waiter) = streams.waiters.pop_front() {
            streams.connecting += 1;
            if waiter.tx.send(StreamGrant::Connect).is_ok() {
                break;
            }
            streams.connecting -= 1;
        }
    }

    fn close(&self, id: HandleId) {
        let lease = {
            let mut guard = self.lock();
            let streams = &mut *guard;

            let Some(entry) = streams.entries.get_mut(&id) else {
                unreachable!("resource {id} must stay in multiplex pool while it's streams are open")
            };

            // hand stream slot to the oldest waiter directly.
            while let Some(waiter) = streams.waiters.pop_front() {
                if waiter.tx.send(StreamGrant::Stream(id, entry.lease.clone())).is_ok() {
                    return;
                }
            }

            entry.active -= 1;

            if entry.active > 0 {
                return;
            }

            streams.entries.remove(&id).map(|e| e.lease)
        };

        // last reference of lease may be dropped here and it goes back to pool outside of the lock.
        drop(lease);

        trace!(pool = %self.pool.name(), handle = %id, "resource left multiplex pool");
    }
}

// a connecting slot owned by one acquirer. dropping it before a resource is acquired gives the slot
// to the next waiter.
struct Connecting<F>
where
    F: ConnectionFactory,
{
    inner: Arc<Inner<F>>,
    done: bool,
}

impl<F> Connecting<F>
where
    F: ConnectionFactory,
{
    fn new(inner: Arc<Inner<F>>) -> Self {
        Self { inner, done: false }
    }

    async fn connect(mut self) -> Result<StreamLease<F>, Error> {
        let res = self.inner.pool.acquire().await;
        self.done = true;
        match res {
            Ok(lease) => self.inner.connected(lease),
            Err(e) => {
                self.inner.connect_failed();
                Err(e)
            }
        }
    }
}

impl<F> Drop for Connecting<F>
where
    F: ConnectionFactory,
{
    fn drop(&mut self) {
        if !self.done {
            self.inner.connect_failed();
        }
    }
}

struct StreamWaiting<F>
where
    F: ConnectionFactory,
{
    inner: Arc<Inner<F>>,
    seq: u64,
    rx: Option<oneshot::Receiver<StreamGrant<F>>>,
}

impl<F> Drop for StreamWaiting<F>
where
    F: ConnectionFactory,
{
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };

        let grant = {
            let mut streams = self.inner.lock();
            // queue is ordered by seq.
            if let Ok(idx) = streams.waiters.binary_search_by_key(&self.seq, |w| w.seq) {
                streams.waiters.remove(idx);
                return;
            }
            rx.try_recv().ok()
        };

        match grant {
            Some(StreamGrant::Stream(id, lease)) => drop(StreamLease {
                inner: self.inner.clone(),
                id,
                lease,
            }),
            Some(StreamGrant::Connect) => self.inner.connect_failed(),
            None => {}
        }
    }
}

/// one open stream on a shared resource.
///
/// dereference to the resource. closing or dropping it frees the stream slot exactly once.
pub struct StreamLease<F>
where
    F: ConnectionFactory,
{
    inner: Arc<Inner<F>>,
    id: HandleId,
    lease: Arc<Lease<F>>,
}

impl<F> StreamLease<F>
where
    F: ConnectionFactory,
{
    /// id of the resource this stream is opened on.
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn close(self) {
        drop(self);
    }
}

impl<F> Deref for StreamLease<F>
where
    F: ConnectionFactory,
{
    type Target = F::Resource;

    fn deref(&self) -> &Self::Target {
        &self.lease
    }
}

impl<F> fmt::Debug for StreamLease<F>
where
    F: ConnectionFactory,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamLease").field("id", &self.id).finish()
    }
}

impl<F> Drop for StreamLease<F>
where
    F: ConnectionFactory,
{
    fn drop(&mut self) {
        self.inner.close(self.id);
    }
}

#[cfg(test)]
mod test {
    use core::time::Duration;

    use std::{
        io,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use crate::registry::HandleRegistry;

    use super::*;

    #[derive(Default)]
    struct Conn {
        created: AtomicUsize,
    }

    impl ConnectionFactory for Arc<Conn> {
        type Resource = usize;
        type Error = io::Error;

        async fn create(&self) -> Result<Self::Resource, Self::Error> {
            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }

        async fn destroy(&self, _: Self::Resource) {}
    }

    fn pool(max_size: usize, max_streams: usize, ideal_streams: usize) -> MultiplexPool<Arc<Conn>> {
        Pool::builder(Arc::new(Conn::default()))
            .max_size(max_size)
            .registry(HandleRegistry::new())
            .multiplex()
            .max_streams(max_streams)
            .ideal_streams(ideal_streams)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn packing() {
        let pool = pool(2, 3, 3);

        let s1 = pool.acquire_stream().await.unwrap();
        let s2 = pool.acquire_stream().await.unwrap();
        let s3 = pool.acquire_stream().await.unwrap();

        // every stream lands on the first resource before a second one is created.
        assert_eq!(s1.id(), s2.id());
        assert_eq!(s2.id(), s3.id());
        assert_eq!(pool.pool().metrics().total, 1);

        let s4 = pool.acquire_stream().await.unwrap();
        assert_ne!(s4.id(), s1.id());

        let metrics = pool.metrics();
        assert_eq!(metrics.resources, 2);
        assert_eq!(metrics.leased_concurrency, 4);
        assert_eq!(metrics.available_concurrency, 2);
    }

    #[tokio::test]
    async fn ideal_streams_grow_first() {
        let pool = pool(2, 4, 1);

        let s1 = pool.acquire_stream().await.unwrap();
        let s2 = pool.acquire_stream().await.unwrap();
        assert_ne!(s1.id(), s2.id());

        // pool is full. streams go beyond ideal on the busiest resource.
        let s3 = pool.acquire_stream().await.unwrap();
        assert!(s3.id() == s1.id() || s3.id() == s2.id());
        assert_eq!(pool.pool().metrics().total, 2);
    }

    #[tokio::test]
    async fn open_stream_capacity() {
        let pool = pool(1, 2, 2);

        let s1 = pool.acquire_stream().await.unwrap();
        let id = s1.id();

        let s2 = pool.open_stream(id).unwrap();
        assert_eq!(*s2, *s1);

        let err = pool.open_stream(id).unwrap_err();
        assert!(matches!(err, Error::StreamCapacity(StreamCapacity { max_streams: 2, .. })));

        s2.close();
        let _s2 = pool.open_stream(id).unwrap();
    }

    #[tokio::test]
    async fn last_close_releases_resource() {
        let pool = pool(1, 2, 2);

        let s1 = pool.acquire_stream().await.unwrap();
        let id = s1.id();
        let s2 = pool.open_stream(id).unwrap();

        s1.close();
        assert_eq!(pool.pool().metrics().in_use, 1);

        s2.close();
        assert_eq!(pool.pool().metrics().in_use, 0);
        assert_eq!(pool.pool().metrics().idle, 1);

        assert!(matches!(pool.open_stream(id), Err(Error::UnknownLease(i)) if i == id));
    }

    #[tokio::test]
    async fn queued_stream_served_on_close() {
        let pool = pool(1, 1, 1);

        let s1 = pool.acquire_stream().await.unwrap();
        let id = s1.id();

        let waiter = pool.acquire_stream();
        assert_eq!(pool.metrics().pending_acquires, 1);

        drop(s1);

        let s2 = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(s2.id(), id);
        assert_eq!(pool.metrics().leased_concurrency, 1);
    }

    #[tokio::test]
    async fn cancelled_stream_waiter() {
        let pool = pool(1, 1, 1);

        let s1 = pool.acquire_stream().await.unwrap();
        let first = pool.acquire_stream();
        let second = pool.acquire_stream();

        // slot is handed to first waiter which never observes it.
        drop(s1);
        drop(first);

        let s = tokio::time::timeout(Duration::from_secs(5), second)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pool.metrics().leased_concurrency, 1);
        drop(s);
        assert_eq!(pool.metrics().resources, 0);
    }
}
