//! bounded pool of resources produced by a [ConnectionFactory].
//!
//! resource is uniquely owned and ownership is exchanged between pool and caller through [Lease].
//! all bookkeeping lives behind one lock and the lock is never held when calling into the factory.

mod state;

pub use self::state::ResourceState;

use core::{
    fmt,
    future::Future,
    mem,
    ops::{Deref, DerefMut},
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Notify, oneshot};
use tracing::{debug, trace, warn};

use crate::{
    config::{Config, PoolBuilder},
    error::{BoxError, CreationError, Error},
    factory::ConnectionFactory,
    registry::{HandleId, HandleRegistry, RegistrationToken, ScopeId},
    shutdown::{Shutdown, ShutdownState},
};

use self::state::{Grant, PooledResource, State, Take};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// bounded pool of resources.
///
/// cloning a pool is cheap and every clone operates on the same set of resources.
pub struct Pool<F>
where
    F: ConnectionFactory,
{
    shared: Arc<Shared<F>>,
}

impl<F> Clone for Pool<F>
where
    F: ConnectionFactory,
{
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

pub(crate) struct Shared<F>
where
    F: ConnectionFactory,
{
    factory: F,
    state: Mutex<State<F::Resource>>,
    config: Config,
    name: Arc<str>,
    registry: HandleRegistry,
    scope: ScopeId,
    // notified every time the last resource of a shutting down pool goes away.
    drained: Notify,
}

/// snapshot of pool bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metrics {
    pub max_size: usize,
    /// resources occupying a slot in any state.
    pub total: usize,
    pub creating: usize,
    pub idle: usize,
    pub in_use: usize,
    pub closing: usize,
    /// queued acquirers waiting for a resource.
    pub pending: usize,
}

impl<F> Pool<F>
where
    F: ConnectionFactory,
{
    /// start a builder of pool where it's behavior can be configured.
    pub fn builder(factory: F) -> PoolBuilder<F> {
        PoolBuilder::new(factory)
    }

    pub(crate) fn new(factory: F, config: Config, name: Arc<str>, registry: HandleRegistry) -> Self {
        let scope = registry.new_scope();
        Self {
            shared: Arc::new(Shared {
                factory,
                state: Mutex::new(State::new(config.max_size)),
                config,
                name,
                registry,
                scope,
                drained: Notify::new(),
            }),
        }
    }

    /// acquire a resource from pool.
    ///
    /// the request is taken synchronously: an idle resource is reserved, a slot for creating a new
    /// resource is reserved or the request is queued behind every earlier one. the returned
    /// [Acquire] resolves once the request is served.
    ///
    /// when pool is shutting down the returned [Acquire] resolves to [Error::ShuttingDown].
    pub fn acquire(&self) -> Acquire<F> {
        let mut expired = Vec::new();

        let take = {
            let mut state = self.shared.lock();
            if state.shutdown {
                None
            } else {
                Some(state.take(&self.shared.config, &mut expired))
            }
        };

        for res in expired {
            trace!(pool = %self.shared.name, handle = %res.token().id(), "destroy expired idle resource");
            self.shared.retire(res);
        }

        let state = match take {
            None => AcquireState::Ready(Err(Error::ShuttingDown)),
            Some(Take::Resource(res)) => AcquireState::Ready(Ok(Lease::new(self.shared.clone(), res))),
            Some(Take::Spawn) => AcquireState::Spawn(spawn(self.shared.clone())),
            Some(Take::Wait(seq, rx)) => AcquireState::Wait(Waiting {
                shared: self.shared.clone(),
                seq,
                rx: Some(rx),
            }),
        };

        Acquire { state }
    }

    /// destroy every idle resource that outlived [PoolBuilder::max_idle] or [PoolBuilder::max_lifetime].
    /// return the amount of resources being destroyed.
    pub fn reap_idle(&self) -> usize {
        let expired = self.shared.lock().take_expired(&self.shared.config);
        let len = expired.len();
        for res in expired {
            self.shared.retire(res);
        }
        len
    }

    /// stop handing out resources and start draining the pool.
    ///
    /// queued acquirers are rejected with [Error::ShuttingDown], idle resources are destroyed and
    /// leased resources are destroyed when they are released. calling it more than once is fine and
    /// every call returns a handle observing the same drain.
    pub fn shutdown(&self) -> Shutdown<F> {
        let (idle, waiters, empty) = {
            let mut state = self.shared.lock();
            if state.shutdown {
                (Vec::new(), Vec::new(), state.is_empty())
            } else {
                let (idle, waiters) = state.begin_shutdown();
                (idle, waiters, state.is_empty())
            }
        };

        if !waiters.is_empty() {
            debug!(pool = %self.shared.name, "reject {} queued acquirer(s) on shutdown", waiters.len());
        }

        // dropping senders wakes up waiters with shutdown error.
        drop(waiters);

        for res in idle {
            self.shared.retire(res);
        }

        if empty {
            self.shared.drained.notify_waiters();
        }

        Shutdown::new(self.shared.clone())
    }

    pub fn metrics(&self) -> Metrics {
        self.shared.metrics()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.shared.registry
    }

    /// scope of this pool inside it's [HandleRegistry].
    pub fn scope(&self) -> ScopeId {
        self.shared.scope
    }

    /// current phase of pool's lifecycle.
    pub fn shutdown_state(&self) -> ShutdownState {
        self.shared.shutdown_state()
    }
}

impl<F> Shared<F>
where
    F: ConnectionFactory,
{
    fn lock(&self) -> MutexGuard<'_, State<F::Resource>> {
        self.state.lock().unwrap()
    }

    pub(crate) fn metrics(&self) -> Metrics {
        let state = self.lock();
        Metrics {
            max_size: state.max_size,
            total: state.total,
            creating: state.creating,
            idle: state.idle.len(),
            in_use: state.in_use,
            closing: state.closing,
            pending: state.waiters.len(),
        }
    }

    pub(crate) fn shutdown_state(&self) -> ShutdownState {
        let empty = {
            let state = self.lock();
            if !state.shutdown {
                return ShutdownState::Running;
            }
            state.is_empty()
        };

        if empty && self.registry.live_count_in(self.scope) == 0 {
            ShutdownState::Drained
        } else {
            ShutdownState::Draining
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    pub(crate) fn scope(&self) -> ScopeId {
        self.scope
    }

    pub(crate) fn drained_notify(&self) -> &Notify {
        &self.drained
    }

    fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    // give back a creation slot that did not produce a resource.
    fn unreserve(&self) {
        let drained = {
            let mut state = self.lock();
            state.unreserve();
            state.shutdown && state.is_empty()
        };

        if drained {
            self.drained.notify_waiters();
        }
    }

    // resource went back from caller.
    fn release(self: &Arc<Self>, res: PooledResource<F::Resource>, discard: bool) {
        let retire = {
            let mut state = self.lock();
            debug_assert!(state.in_use > 0, "release resource not tracked as in use");
            state.in_use -= 1;
            if discard {
                state.closing += 1;
                Some(res)
            } else {
                state.dispatch(res, &self.config)
            }
        };

        if let Some(res) = retire {
            self.retire(res);
        }
    }

    // grant received by a cancelled waiter must go back to pool.
    fn recycle(self: &Arc<Self>, grant: Grant<F::Resource>) {
        match grant {
            Grant::Resource(res) => self.release(res, false),
            Grant::Spawn => self.unreserve(),
        }
    }

    // destroy resource in background. state.closing must already account for it.
    fn retire(self: &Arc<Self>, res: PooledResource<F::Resource>) {
        let (resource, token) = res.into_parts();
        let shared = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    shared.factory.destroy(resource).await;
                    shared.destroyed(token);
                });
            }
            Err(_) => {
                warn!(
                    pool = %self.name,
                    handle = %token.id(),
                    "no tokio runtime to destroy resource on. resource is dropped without destroy"
                );
                drop(resource);
                shared.destroyed(token);
            }
        }
    }

    fn destroyed(&self, token: RegistrationToken) {
        let id = token.id();

        // error is already logged by registry. bookkeeping proceeds so the slot is not lost.
        let res = self.registry.unregister(token);
        debug_assert!(res.is_ok(), "resource handle {id} unregistered more than once");

        let drained = {
            let mut state = self.lock();
            state.closing -= 1;
            state.free_slot();
            state.shutdown && state.is_empty()
        };

        trace!(pool = %self.name, handle = %id, "resource destroyed");

        if drained {
            debug!(pool = %self.name, "pool drained");
            self.drained.notify_waiters();
        }
    }
}

// create a new resource on a reserved slot. the slot is owned by the returned future from the
// start so dropping it before first poll gives the slot back as well.
fn spawn<F>(shared: Arc<Shared<F>>) -> BoxFuture<Result<Lease<F>, Error>>
where
    F: ConnectionFactory,
{
    let spawner = Spawner {
        shared,
        fulfilled: false,
    };

    Box::pin(async move {
        if spawner.shared.is_shutdown() {
            trace!(pool = %spawner.shared.name, "pool shut down before resource creation started");
            return Err(Error::ShuttingDown);
        }
        let res = spawner.shared.factory.create().await;
        spawner.spawned(res)
    })
}

// guard of a reserved slot. creation future being dropped before finish gives the slot back.
struct Spawner<F>
where
    F: ConnectionFactory,
{
    shared: Arc<Shared<F>>,
    fulfilled: bool,
}

impl<F> Spawner<F>
where
    F: ConnectionFactory,
{
    fn spawned(mut self, res: Result<F::Resource, F::Error>) -> Result<Lease<F>, Error> {
        self.fulfilled = true;
        let shared = &self.shared;

        let resource = match res {
            Ok(resource) => resource,
            Err(e) => {
                // roll back the reservation. failure is only seen by this acquirer and the next
                // waiter, if any, gets it's own chance of creating.
                shared.unreserve();
                let e: BoxError = e.into();
                debug!(pool = %shared.name, "resource creation failed: {e}");
                return Err(Error::from(CreationError(e)));
            }
        };

        let token = shared.registry.register(shared.scope, shared.name.clone());
        let mut res = PooledResource::new(resource, token);

        let shutdown = {
            let mut state = shared.lock();
            state.creating -= 1;
            if state.shutdown {
                state.closing += 1;
            } else {
                state.in_use += 1;
            }
            state.shutdown
        };

        if shutdown {
            debug!(pool = %shared.name, handle = %res.token().id(), "resource created after shutdown. destroying");
            shared.retire(res);
            return Err(Error::ShuttingDown);
        }

        trace!(pool = %shared.name, handle = %res.token().id(), "resource created");

        res.transition(ResourceState::InUse);
        Ok(Lease::new(shared.clone(), res))
    }
}

impl<F> Drop for Spawner<F>
where
    F: ConnectionFactory,
{
    fn drop(&mut self) {
        if !self.fulfilled {
            trace!(pool = %self.shared.name, "resource creation cancelled");
            self.shared.unreserve();
        }
    }
}

// a queued acquirer. dropping it before it observed it's grant cancels the request.
struct Waiting<F>
where
    F: ConnectionFactory,
{
    shared: Arc<Shared<F>>,
    seq: u64,
    rx: Option<oneshot::Receiver<Grant<F::Resource>>>,
}

impl<F> Drop for Waiting<F>
where
    F: ConnectionFactory,
{
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };

        // pool sends grants while holding the lock. so with the lock held the waiter is either still
        // queued or it's grant(if any) is already in the channel.
        let grant = {
            let mut state = self.shared.lock();
            if state.remove_waiter(self.seq) {
                trace!(pool = %self.shared.name, "queued acquire cancelled");
                return;
            }
            rx.try_recv().ok()
        };

        if let Some(grant) = grant {
            trace!(pool = %self.shared.name, "acquire cancelled after it's been served. giving grant back");
            self.shared.recycle(grant);
        }
    }
}

enum AcquireState<F>
where
    F: ConnectionFactory,
{
    Ready(Result<Lease<F>, Error>),
    Spawn(BoxFuture<Result<Lease<F>, Error>>),
    Wait(Waiting<F>),
    Done,
}

/// pending acquisition of a resource. resolves to a [Lease] or an [Error].
///
/// dropping it or calling [Acquire::cancel] cancels the acquisition. cancellation is race free
/// against pool serving it: a resource or creation slot that is already granted goes back to pool
/// and is offered to the next waiter.
#[must_use = "Acquire does nothing unless polled. dropping it cancels the acquisition"]
pub struct Acquire<F>
where
    F: ConnectionFactory,
{
    state: AcquireState<F>,
}

// resource is never pinned. creation future is pinned on heap.
impl<F> Unpin for Acquire<F> where F: ConnectionFactory {}

impl<F> Acquire<F>
where
    F: ConnectionFactory,
{
    /// cancel the acquisition.
    pub fn cancel(self) {
        drop(self);
    }

    /// true when acquisition is queued behind other acquirers.
    pub fn is_queued(&self) -> bool {
        matches!(self.state, AcquireState::Wait(_))
    }
}

impl<F> fmt::Debug for Acquire<F>
where
    F: ConnectionFactory,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            AcquireState::Ready(_) => "Ready",
            AcquireState::Spawn(_) => "Spawn",
            AcquireState::Wait(_) => "Wait",
            AcquireState::Done => "Done",
        };
        f.debug_struct("Acquire").field("state", &state).finish()
    }
}

impl<F> Future for Acquire<F>
where
    F: ConnectionFactory,
{
    type Output = Result<Lease<F>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match mem::replace(&mut this.state, AcquireState::Done) {
                AcquireState::Ready(res) => return Poll::Ready(res),
                AcquireState::Spawn(mut fut) => {
                    let res = fut.as_mut().poll(cx);
                    if res.is_pending() {
                        this.state = AcquireState::Spawn(fut);
                    }
                    return res;
                }
                AcquireState::Wait(mut waiting) => {
                    let Some(rx) = waiting.rx.as_mut() else {
                        unreachable!("Waiting must have a receiver before it's fulfilled")
                    };
                    match Pin::new(rx).poll(cx) {
                        Poll::Pending => {
                            this.state = AcquireState::Wait(waiting);
                            return Poll::Pending;
                        }
                        Poll::Ready(res) => {
                            // grant observed. waiter is fulfilled and it's drop must not cancel.
                            waiting.rx = None;
                            match res {
                                Ok(Grant::Resource(res)) => {
                                    return Poll::Ready(Ok(Lease::new(waiting.shared.clone(), res)));
                                }
                                Ok(Grant::Spawn) => {
                                    this.state = AcquireState::Spawn(spawn(waiting.shared.clone()));
                                }
                                // sender dropped without grant only happens on shutdown.
                                Err(_) => return Poll::Ready(Err(Error::ShuttingDown)),
                            }
                        }
                    }
                }
                AcquireState::Done => panic!("Acquire polled after finish"),
            }
        }
    }
}

/// exclusive right of using one pooled resource.
///
/// dereference to the resource. releasing or dropping the lease gives the resource back to pool
/// exactly once: it's handed to the oldest queued acquirer, put back to idle or destroyed when pool
/// is shutting down.
pub struct Lease<F>
where
    F: ConnectionFactory,
{
    shared: Arc<Shared<F>>,
    res: Option<PooledResource<F::Resource>>,
    discard: bool,
}

impl<F> Lease<F>
where
    F: ConnectionFactory,
{
    fn new(shared: Arc<Shared<F>>, res: PooledResource<F::Resource>) -> Self {
        debug_assert_eq!(res.state(), ResourceState::InUse);
        Self {
            shared,
            res: Some(res),
            discard: false,
        }
    }

    fn res(&self) -> &PooledResource<F::Resource> {
        self.res
            .as_ref()
            .expect("Lease must contain resource until it's dropped")
    }

    /// id of the resource's handle inside [HandleRegistry].
    pub fn id(&self) -> HandleId {
        self.res().token().id()
    }

    /// time elapsed since the resource is created.
    pub fn age(&self) -> Duration {
        self.res().age()
    }

    /// amount of times the resource has been leased. including current one.
    pub fn uses(&self) -> usize {
        self.res().uses()
    }

    /// give resource back to pool.
    pub fn release(self) {
        drop(self);
    }

    /// give resource back to pool and destroy it instead of recycling. useful when caller observed
    /// the resource is broken.
    pub fn discard(mut self) {
        self.discard = true;
    }

    /// mark resource to be destroyed when lease is dropped.
    pub fn destroy_on_drop(&mut self) {
        self.discard = true;
    }

    pub(crate) fn pool_name(&self) -> &str {
        self.shared.name()
    }
}

impl<F> Deref for Lease<F>
where
    F: ConnectionFactory,
{
    type Target = F::Resource;

    fn deref(&self) -> &Self::Target {
        self.res()
    }
}

impl<F> DerefMut for Lease<F>
where
    F: ConnectionFactory,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.res
            .as_mut()
            .expect("Lease must contain resource until it's dropped")
    }
}

impl<F> fmt::Debug for Lease<F>
where
    F: ConnectionFactory,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("pool", &self.shared.name)
            .field("id", &self.id())
            .finish()
    }
}

impl<F> Drop for Lease<F>
where
    F: ConnectionFactory,
{
    fn drop(&mut self) {
        if let Some(res) = self.res.take() {
            self.shared.release(res, self.discard);
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        io,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[derive(Default)]
    struct Counter {
        created: AtomicUsize,
        destroyed: AtomicUsize,
    }

    impl ConnectionFactory for Arc<Counter> {
        type Resource = usize;
        type Error = io::Error;

        async fn create(&self) -> Result<Self::Resource, Self::Error> {
            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }

        async fn destroy(&self, _: Self::Resource) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool(max_size: usize) -> (Pool<Arc<Counter>>, Arc<Counter>) {
        let counter = Arc::new(Counter::default());
        let pool = Pool::builder(counter.clone())
            .max_size(max_size)
            .registry(HandleRegistry::new())
            .build()
            .unwrap();
        (pool, counter)
    }

    #[tokio::test]
    async fn reuse_idle() {
        let (pool, counter) = pool(1);

        let lease = pool.acquire().await.unwrap();
        let id = lease.id();
        assert_eq!(*lease, 0);
        assert_eq!(lease.uses(), 1);
        lease.release();

        let metrics = pool.metrics();
        assert_eq!(metrics.idle, 1);
        assert_eq!(metrics.in_use, 0);

        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.id(), id);
        assert_eq!(lease.uses(), 2);
        assert_eq!(counter.created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.registry().live_count_in(pool.scope()), 1);
    }

    #[tokio::test]
    async fn queued_acquire_served_on_release() {
        let (pool, _) = pool(1);

        let lease = pool.acquire().await.unwrap();
        let mut acquire = pool.acquire();
        assert!(acquire.is_queued());
        assert_eq!(pool.metrics().pending, 1);

        // nothing available yet.
        assert!(futures_poll(&mut acquire).is_none());

        let id = lease.id();
        drop(lease);

        let lease = acquire.await.unwrap();
        assert_eq!(lease.id(), id);
        assert_eq!(pool.metrics().idle, 0);
    }

    #[tokio::test]
    async fn discard_frees_slot() {
        let (pool, counter) = pool(1);

        let lease = pool.acquire().await.unwrap();
        let waiter = pool.acquire();
        lease.discard();

        // destroy frees the slot and grants creation to queued acquirer.
        let lease = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*lease, 1);
        assert_eq!(counter.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(counter.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancel_after_grant_recycles() {
        let (pool, _) = pool(1);

        let lease = pool.acquire().await.unwrap();
        let first = pool.acquire();
        let second = pool.acquire();

        // resource is granted to first waiter but it's never observed.
        drop(lease);
        first.cancel();

        // the grant moved on to second waiter.
        let lease = tokio::time::timeout(Duration::from_secs(5), second)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pool.metrics().in_use, 1);
        drop(lease);
        assert_eq!(pool.metrics().idle, 1);
    }

    #[tokio::test]
    async fn max_idle_expire() {
        let counter = Arc::new(Counter::default());
        let pool = Pool::builder(counter.clone())
            .max_size(1)
            .max_idle(Duration::from_millis(10))
            .registry(HandleRegistry::new())
            .build()
            .unwrap();

        pool.acquire().await.unwrap().release();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(pool.reap_idle(), 1);
        assert_eq!(pool.metrics().idle, 0);

        pool.registry()
            .wait_scope_empty(pool.scope(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(counter.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_creation_before_poll() {
        let (pool, counter) = pool(1);

        // creation slot is reserved when acquire is called.
        let acquire = pool.acquire();
        assert_eq!(pool.metrics().creating, 1);

        acquire.cancel();
        let metrics = pool.metrics();
        assert_eq!(metrics.total, 0);
        assert_eq!(metrics.creating, 0);

        let lease = tokio::time::timeout(Duration::from_secs(5), pool.acquire())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*lease, 0);
        assert_eq!(counter.created.load(Ordering::SeqCst), 1);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "unregistered more than once")]
    fn destroy_unknown_handle_panics() {
        let (pool, _) = pool(1);

        {
            let mut state = pool.shared.lock();
            state.total += 1;
            state.closing += 1;
        }

        // token issued by another registry is not live in pool's registry.
        let other = HandleRegistry::new();
        pool.shared.destroyed(other.register(other.new_scope(), "foreign"));
    }

    fn futures_poll<F: Future + Unpin>(fut: &mut F) -> Option<F::Output> {
        let waker = std::task::Waker::noop();
        let mut cx = Context::from_waker(waker);
        match Pin::new(fut).poll(&mut cx) {
            Poll::Ready(out) => Some(out),
            Poll::Pending => None,
        }
    }
}
