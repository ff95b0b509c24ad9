//! process wide table of live native-backed handles.
//!
//! registry does not own any resource. it only observes when a handle is born and when it goes away
//! so embedders and test harnesses can count, dump and wait for outstanding handles.

use core::{fmt, time::Duration};

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, OnceLock, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::{Instant, SystemTime},
};

use tokio::{sync::Notify, time::MissedTickBehavior};
use tracing::{debug, error, trace};

use crate::error::{Error, Timeout};

// interval of re-checking live count when waiting. release can race with registration happening
// elsewhere in the process so a single wake up is not trusted.
const RECHECK_INTERVAL: Duration = Duration::from_millis(100);

/// unique id of a registered handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// id grouping handles belonging to the same owner. every pool gets it's own scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u64);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// observation entry of a live handle.
#[derive(Debug, Clone)]
pub struct Handle {
    id: HandleId,
    scope: ScopeId,
    label: Arc<str>,
    born: Instant,
    created_at: SystemTime,
}

impl Handle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// wall clock time of registration.
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// time elapsed since registration.
    pub fn age(&self) -> Duration {
        self.born.elapsed()
    }
}

/// proof of registration. must be handed back to [HandleRegistry::unregister] exactly once.
///
/// token is not clonable and unregister takes it by value. a token that is dropped without being
/// handed back keeps it's entry live forever and shows up as leak.
#[must_use = "RegistrationToken must be handed back to HandleRegistry::unregister"]
#[derive(Debug)]
pub struct RegistrationToken {
    id: HandleId,
    registry: Weak<Inner>,
}

impl RegistrationToken {
    pub fn id(&self) -> HandleId {
        self.id
    }
}

/// table of live handles. cheap to clone and all clones observe the same table.
#[derive(Clone, Default)]
pub struct HandleRegistry {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: Mutex<HashMap<HandleId, Handle>>,
    next_id: AtomicU64,
    next_scope: AtomicU64,
    notify: Notify,
}

impl fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("live", &self.live_count())
            .finish()
    }
}

impl HandleRegistry {
    /// construct a standalone registry. useful for isolating tests from each other.
    pub fn new() -> Self {
        Self::default()
    }

    /// registry shared by the whole process. initialized on first use and never torn down.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<HandleRegistry> = OnceLock::new();
        GLOBAL.get_or_init(HandleRegistry::new)
    }

    /// allocate a new scope. handles registered with it can be counted and awaited separately.
    pub fn new_scope(&self) -> ScopeId {
        ScopeId(self.inner.next_scope.fetch_add(1, Ordering::Relaxed))
    }

    /// add a new handle to live set.
    ///
    /// # Panics
    /// when handle id is already live. ids are allocated by registry itself so this can only happen
    /// when registry's internal state is corrupted.
    pub fn register(&self, scope: ScopeId, label: impl Into<Arc<str>>) -> RegistrationToken {
        let id = HandleId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = Handle {
            id,
            scope,
            label: label.into(),
            born: Instant::now(),
            created_at: SystemTime::now(),
        };

        let live = {
            let mut entries = self.lock();
            if let Some(prev) = entries.insert(id, handle) {
                panic!("handle {} registered twice. previous entry: {prev:?}", prev.id);
            }
            entries.len()
        };

        trace!(handle = %id, scope = %scope, live, "register handle");

        RegistrationToken {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// remove handle from live set and return it's observation entry.
    ///
    /// a token issued by another registry or an id that is no longer live is rejected with
    /// [Error::UnknownLease].
    pub fn unregister(&self, token: RegistrationToken) -> Result<Handle, Error> {
        let RegistrationToken { id, registry } = token;

        if !Weak::ptr_eq(&registry, &Arc::downgrade(&self.inner)) {
            error!(handle = %id, "unregister token issued by another registry");
            return Err(Error::UnknownLease(id));
        }

        let (handle, live) = {
            let mut entries = self.lock();
            let handle = entries.remove(&id);
            (handle, entries.len())
        };

        match handle {
            Some(handle) => {
                trace!(handle = %id, scope = %handle.scope, live, "unregister handle");
                self.inner.notify.notify_waiters();
                Ok(handle)
            }
            None => {
                error!(handle = %id, "unregister handle that is not live. possible double release");
                Err(Error::UnknownLease(id))
            }
        }
    }

    /// true when handle with given id is live.
    pub fn is_live(&self, id: HandleId) -> bool {
        self.lock().contains_key(&id)
    }

    /// number of currently live handles.
    pub fn live_count(&self) -> usize {
        self.lock().len()
    }

    /// number of currently live handles registered with given scope.
    pub fn live_count_in(&self, scope: ScopeId) -> usize {
        self.lock().values().filter(|h| h.scope == scope).count()
    }

    /// copy of every live handle ordered by id.
    pub fn snapshot(&self) -> Vec<Handle> {
        let mut handles = self.lock().values().cloned().collect::<Vec<_>>();
        handles.sort_by_key(|h| h.id);
        handles
    }

    /// dump every live handle with it's label and age as debug level events.
    pub fn log_live_resources(&self) {
        let handles = self.snapshot();
        debug!("dumping live handle set. {} handle(s) live", handles.len());
        for h in handles {
            debug!(
                handle = %h.id,
                scope = %h.scope,
                label = %h.label,
                created_at = ?h.created_at,
                age = ?h.age(),
                "live handle"
            );
        }
    }

    /// wait until no handle is live or timeout elapsed.
    pub async fn wait_empty(&self, timeout: Duration) -> Result<(), Error> {
        self.wait_until(timeout, || self.live_count()).await
    }

    /// wait until no handle of given scope is live or timeout elapsed.
    pub async fn wait_scope_empty(&self, scope: ScopeId, timeout: Duration) -> Result<(), Error> {
        self.wait_until(timeout, || self.live_count_in(scope)).await
    }

    async fn wait_until<F>(&self, timeout: Duration, mut count: F) -> Result<(), Error>
    where
        F: FnMut() -> usize,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut interval = tokio::time::interval(RECHECK_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let remaining = count();
            if remaining == 0 {
                return Ok(());
            }

            tokio::select! {
                _ = notified => {}
                _ = interval.tick() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    let remaining = count();
                    if remaining == 0 {
                        return Ok(());
                    }
                    error!("wait for empty registry timed out. {remaining} handle(s) remaining");
                    self.log_live_resources();
                    return Err(Timeout { remaining }.into());
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<HandleId, Handle>> {
        self.inner.entries.lock().unwrap()
    }
}
