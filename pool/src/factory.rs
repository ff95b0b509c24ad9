use core::future::Future;

use crate::error::BoxError;

/// trait for how to produce a new resource and how to tear it down.
///
/// pool never inspects the resource it receives. transport specific layers(tls, http/1, http/2 etc)
/// implement this trait and hand the pool opaque resources.
///
/// # Contract
/// - [ConnectionFactory::create] and [ConnectionFactory::destroy] are each other's inverse.
/// - pool calls destroy at most once for every resource create produced and never uses a resource
///   after it's destroy started.
/// - neither method is called while pool holds it's internal lock.
///
/// # Examples
/// ```rust
/// use std::io;
///
/// use xitca_pool::ConnectionFactory;
///
/// struct Counter;
///
/// impl ConnectionFactory for Counter {
///     type Resource = u32;
///     type Error = io::Error;
///
///     async fn create(&self) -> Result<Self::Resource, Self::Error> {
///         Ok(996)
///     }
///
///     async fn destroy(&self, _: Self::Resource) {}
/// }
/// ```
pub trait ConnectionFactory: Send + Sync + 'static {
    type Resource: Send + 'static;

    type Error: Into<BoxError>;

    /// produce one new resource. failure is reported to the acquirer that triggered creation.
    fn create(&self) -> impl Future<Output = Result<Self::Resource, Self::Error>> + Send;

    /// tear down a resource. completion of returned future signals the resource is gone and it's
    /// handle can be unregistered.
    fn destroy(&self, resource: Self::Resource) -> impl Future<Output = ()> + Send;
}
