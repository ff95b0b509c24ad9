use core::{
    ops::{Deref, DerefMut},
    time::Duration,
};

use std::{collections::VecDeque, time::Instant};

use tokio::sync::oneshot;

use crate::{config::Config, registry::RegistrationToken};

/// lifecycle state of a pooled resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// connection factory is producing the resource.
    Creating,
    /// resource sits in pool and waits for next acquirer.
    Idle,
    /// resource is leased to exactly one caller.
    InUse,
    /// connection factory is tearing down the resource.
    Closing,
    /// resource is destroyed and it's handle unregistered.
    Closed,
}

impl ResourceState {
    pub(crate) const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Creating, Self::InUse)
                | (Self::Creating, Self::Closing)
                | (Self::InUse, Self::Idle)
                | (Self::InUse, Self::InUse)
                | (Self::InUse, Self::Closing)
                | (Self::Idle, Self::InUse)
                | (Self::Idle, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }
}

/// resource produced by connection factory together with it's registry token and pool bookkeeping.
pub(crate) struct PooledResource<R> {
    resource: R,
    token: RegistrationToken,
    state: ResourceState,
    born: Instant,
    idle_since: Instant,
    uses: usize,
}

impl<R> PooledResource<R> {
    pub(crate) fn new(resource: R, token: RegistrationToken) -> Self {
        let now = Instant::now();
        Self {
            resource,
            token,
            state: ResourceState::Creating,
            born: now,
            idle_since: now,
            uses: 0,
        }
    }

    pub(crate) fn token(&self) -> &RegistrationToken {
        &self.token
    }

    pub(crate) fn state(&self) -> ResourceState {
        self.state
    }

    pub(crate) fn transition(&mut self, to: ResourceState) {
        debug_assert!(
            self.state.can_transition_to(to),
            "invalid resource state transition {:?} -> {to:?}",
            self.state
        );

        match to {
            ResourceState::InUse => self.uses += 1,
            ResourceState::Idle => self.idle_since = Instant::now(),
            _ => {}
        }

        self.state = to;
    }

    pub(crate) fn age(&self) -> Duration {
        self.born.elapsed()
    }

    pub(crate) fn uses(&self) -> usize {
        self.uses
    }

    pub(crate) fn is_expired(&self, config: &Config) -> bool {
        config.max_lifetime.is_some_and(|d| self.born.elapsed() > d)
            || (self.state == ResourceState::Idle && config.max_idle.is_some_and(|d| self.idle_since.elapsed() > d))
    }

    pub(crate) fn into_parts(mut self) -> (R, RegistrationToken) {
        self.transition(ResourceState::Closing);
        (self.resource, self.token)
    }
}

impl<R> Deref for PooledResource<R> {
    type Target = R;

    fn deref(&self) -> &Self::Target {
        &self.resource
    }
}

impl<R> DerefMut for PooledResource<R> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.resource
    }
}

/// what a queued acquirer receives when pool serves it.
pub(crate) enum Grant<R> {
    /// a resource that is ready to use.
    Resource(PooledResource<R>),
    /// a reserved slot. receiver is responsible for creating the resource itself.
    Spawn,
}

pub(crate) struct Waiter<R> {
    pub(crate) seq: u64,
    pub(crate) tx: oneshot::Sender<Grant<R>>,
}

/// outcome of taking the fast path of acquiring.
pub(crate) enum Take<R> {
    Resource(PooledResource<R>),
    Spawn,
    Wait(u64, oneshot::Receiver<Grant<R>>),
}

/// bookkeeping of pool. every field is guarded by pool's single lock.
pub(crate) struct State<R> {
    pub(crate) idle: VecDeque<PooledResource<R>>,
    pub(crate) waiters: VecDeque<Waiter<R>>,
    pub(crate) max_size: usize,
    // resources in any state except Closed. a resource being created or closed still occupies a slot.
    pub(crate) total: usize,
    pub(crate) creating: usize,
    pub(crate) in_use: usize,
    pub(crate) closing: usize,
    pub(crate) shutdown: bool,
    next_seq: u64,
}

impl<R> State<R> {
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            idle: VecDeque::with_capacity(max_size),
            waiters: VecDeque::new(),
            max_size,
            total: 0,
            creating: 0,
            in_use: 0,
            closing: 0,
            shutdown: false,
            next_seq: 0,
        }
    }

    /// fast path of acquiring. idle resources that are expired are moved into `expired` and must be
    /// destroyed by caller after the lock is released.
    pub(crate) fn take(&mut self, config: &Config, expired: &mut Vec<PooledResource<R>>) -> Take<R> {
        debug_assert!(self.idle.is_empty() || self.waiters.is_empty());

        // queued waiters are always served first. a new acquirer never jumps the queue.
        if self.waiters.is_empty() {
            while let Some(mut res) = self.idle.pop_front() {
                if res.is_expired(config) {
                    self.closing += 1;
                    expired.push(res);
                    continue;
                }
                res.transition(ResourceState::InUse);
                self.in_use += 1;
                return Take::Resource(res);
            }

            if self.total < self.max_size {
                self.reserve();
                return Take::Spawn;
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let (tx, rx) = oneshot::channel();
        self.waiters.push_back(Waiter { seq, tx });
        Take::Wait(seq, rx)
    }

    /// reserve a slot for resource creation.
    ///
    /// # Panics
    /// when pool is already at max size. callers must check capacity beforehand.
    pub(crate) fn reserve(&mut self) {
        assert!(
            self.total < self.max_size,
            "resource creation beyond max size {} of pool",
            self.max_size
        );
        self.total += 1;
        self.creating += 1;
    }

    /// give back a slot reserved by [State::reserve] where creation did not produce a resource.
    pub(crate) fn unreserve(&mut self) {
        self.creating -= 1;
        self.free_slot();
    }

    /// hand a resource returned from caller to the oldest waiter or put it back to idle queue.
    ///
    /// resource is handed back to caller when it must be destroyed instead of recycled.
    pub(crate) fn dispatch(
        &mut self,
        mut res: PooledResource<R>,
        config: &Config,
    ) -> Option<PooledResource<R>> {
        if self.shutdown || res.is_expired(config) {
            self.closing += 1;
            return Some(res);
        }

        while let Some(waiter) = self.waiters.pop_front() {
            res.transition(ResourceState::InUse);
            match waiter.tx.send(Grant::Resource(res)) {
                Ok(_) => {
                    self.in_use += 1;
                    return None;
                }
                Err(Grant::Resource(r)) => res = r,
                Err(Grant::Spawn) => unreachable!("Grant::Resource is sent"),
            }
        }

        res.transition(ResourceState::Idle);
        self.idle.push_back(res);
        None
    }

    /// remove a waiter from queue. return false when it's already been popped by pool.
    pub(crate) fn remove_waiter(&mut self, seq: u64) -> bool {
        // queue is ordered by seq.
        match self.waiters.binary_search_by_key(&seq, |w| w.seq) {
            Ok(idx) => {
                self.waiters.remove(idx);
                true
            }
            Err(_) => false,
        }
    }

    /// a resource stopped occupying it's slot. when waiters are queued the oldest one is granted the
    /// right to create a new resource.
    pub(crate) fn free_slot(&mut self) {
        self.total -= 1;

        if self.shutdown {
            return;
        }

        while self.total < self.max_size {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            self.reserve();
            if waiter.tx.send(Grant::Spawn).is_ok() {
                break;
            }
            self.creating -= 1;
            self.total -= 1;
        }
    }

    /// take every idle resource and waiter out of pool and flag it as shutting down.
    pub(crate) fn begin_shutdown(&mut self) -> (Vec<PooledResource<R>>, Vec<Waiter<R>>) {
        self.shutdown = true;
        let idle = self.idle.drain(..).collect::<Vec<_>>();
        self.closing += idle.len();
        let waiters = self.waiters.drain(..).collect();
        (idle, waiters)
    }

    /// move expired idle resources out of pool.
    pub(crate) fn take_expired(&mut self, config: &Config) -> Vec<PooledResource<R>> {
        let (expired, idle): (VecDeque<_>, VecDeque<_>) = self.idle.drain(..).partition(|res| res.is_expired(config));
        self.idle = idle;
        self.closing += expired.len();
        expired.into()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.total == 0
    }
}
