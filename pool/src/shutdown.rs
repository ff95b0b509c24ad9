use core::time::Duration;

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use crate::{
    error::{Error, Timeout},
    factory::ConnectionFactory,
    pool::Shared,
};

// interval of re-checking drain progress next to drained notification.
const RECHECK_INTERVAL: Duration = Duration::from_millis(500);

/// lifecycle phase of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    /// pool hands out resources.
    Running,
    /// pool is shutting down. outstanding resources are destroyed as they come back.
    Draining,
    /// every resource is destroyed and it's handle unregistered.
    Drained,
}

/// handle for observing the drain of a pool that is shutting down.
///
/// obtained from [Pool::shutdown](crate::Pool::shutdown) or
/// [MultiplexPool::shutdown](crate::MultiplexPool::shutdown).
pub struct Shutdown<F>
where
    F: ConnectionFactory,
{
    shared: Arc<Shared<F>>,
}

impl<F> Shutdown<F>
where
    F: ConnectionFactory,
{
    pub(crate) fn new(shared: Arc<Shared<F>>) -> Self {
        Self { shared }
    }

    pub fn state(&self) -> ShutdownState {
        self.shared.shutdown_state()
    }

    /// wait until every resource of the pool is destroyed and unregistered.
    ///
    /// resources still being created when shutdown began are destroyed once their creation finishes
    /// and are waited for as well.
    pub async fn drained(&self) {
        let mut interval = tokio::time::interval(RECHECK_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let notified = self.shared.drained_notify().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state() == ShutdownState::Drained {
                debug!(pool = %self.shared.name(), "shutdown drained");
                return;
            }

            tokio::select! {
                _ = notified => {}
                _ = interval.tick() => {}
            }
        }
    }

    /// [Shutdown::drained] bounded by a timeout. on timeout the live handles of the pool are dumped
    /// and [Error::Timeout] is returned.
    pub async fn drained_timeout(&self, dur: Duration) -> Result<(), Error> {
        if tokio::time::timeout(dur, self.drained()).await.is_ok() {
            return Ok(());
        }

        let registry = self.shared.registry();
        let remaining = registry.live_count_in(self.shared.scope());
        error!(
            pool = %self.shared.name(),
            "shutdown did not drain in {dur:?}. {remaining} handle(s) remaining"
        );
        registry.log_live_resources();

        Err(Timeout { remaining }.into())
    }
}
