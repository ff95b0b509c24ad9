use core::time::Duration;

use std::sync::Arc;

use crate::{
    error::Error, factory::ConnectionFactory, multiplex::MultiplexPool, pool::Pool, registry::HandleRegistry,
};

const DEFAULT_MAX_SIZE: usize = 2;
const DEFAULT_NAME: &str = "pool";

#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) max_size: usize,
    pub(crate) max_idle: Option<Duration>,
    pub(crate) max_lifetime: Option<Duration>,
}

/// builder type for [Pool]. offer configurations before a pool instance is created.
pub struct PoolBuilder<F> {
    factory: F,
    max_size: usize,
    max_idle: Option<Duration>,
    max_lifetime: Option<Duration>,
    name: Arc<str>,
    registry: Option<HandleRegistry>,
}

impl<F> PoolBuilder<F>
where
    F: ConnectionFactory,
{
    pub(crate) fn new(factory: F) -> Self {
        Self {
            factory,
            max_size: DEFAULT_MAX_SIZE,
            max_idle: None,
            max_lifetime: None,
            name: Arc::from(DEFAULT_NAME),
            registry: None,
        }
    }

    /// set max size. pool would create up to amount of max size concurrent resources.
    ///
    /// # Default
    /// max size default to 2
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// set the duration an idle resource can stay in pool. expired resources are destroyed instead
    /// of handed out.
    ///
    /// # Default
    /// idle resources never expire
    pub fn max_idle(mut self, dur: Duration) -> Self {
        self.max_idle = Some(dur);
        self
    }

    /// set the max duration a resource can live since it's creation.
    ///
    /// # Default
    /// resources never expire
    pub fn max_lifetime(mut self, dur: Duration) -> Self {
        self.max_lifetime = Some(dur);
        self
    }

    /// set label attached to every handle this pool registers. shown in leak diagnostics.
    ///
    /// # Default
    /// label default to "pool"
    pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = name.into();
        self
    }

    /// set registry where pool registers it's resources.
    ///
    /// # Default
    /// [HandleRegistry::global]
    pub fn registry(mut self, registry: HandleRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// turn builder into a builder of [MultiplexPool] where every resource can serve concurrent
    /// streams.
    pub fn multiplex(self) -> MultiplexBuilder<F> {
        MultiplexBuilder {
            pool: self,
            max_streams: 1,
            ideal_streams: None,
        }
    }

    /// try convert builder to a pool instance.
    pub fn build(self) -> Result<Pool<F>, Error> {
        if self.max_size == 0 {
            return Err(Error::InvalidConfig("max_size must be greater than zero"));
        }

        let config = Config {
            max_size: self.max_size,
            max_idle: self.max_idle,
            max_lifetime: self.max_lifetime,
        };
        let registry = self.registry.unwrap_or_else(|| HandleRegistry::global().clone());

        Ok(Pool::new(self.factory, config, self.name, registry))
    }
}

/// builder type for [MultiplexPool].
pub struct MultiplexBuilder<F> {
    pool: PoolBuilder<F>,
    max_streams: usize,
    ideal_streams: Option<usize>,
}

impl<F> MultiplexBuilder<F>
where
    F: ConnectionFactory,
    F::Resource: Sync,
{
    /// set max concurrent streams one resource can serve.
    ///
    /// # Default
    /// max streams default to 1
    pub fn max_streams(mut self, max_streams: usize) -> Self {
        self.max_streams = max_streams;
        self
    }

    /// set ideal concurrent streams per resource. when every resource reaches ideal streams and
    /// pool still has room a new resource is acquired before going beyond it.
    ///
    /// # Default
    /// ideal streams default to max streams
    pub fn ideal_streams(mut self, ideal_streams: usize) -> Self {
        self.ideal_streams = Some(ideal_streams);
        self
    }

    /// try convert builder to a multiplex pool instance.
    pub fn build(self) -> Result<MultiplexPool<F>, Error> {
        if self.max_streams == 0 {
            return Err(Error::InvalidConfig("max_streams must be greater than zero"));
        }

        let ideal_streams = self.ideal_streams.unwrap_or(self.max_streams);

        if ideal_streams == 0 || ideal_streams > self.max_streams {
            return Err(Error::InvalidConfig(
                "ideal_streams must be greater than zero and not greater than max_streams",
            ));
        }

        let pool = self.pool.build()?;

        Ok(MultiplexPool::new(pool, self.max_streams, ideal_streams))
    }
}
