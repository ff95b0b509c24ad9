//! strongly typed library error.

use std::{error, fmt};

use crate::registry::HandleId;

/// boxed error type produced by [ConnectionFactory](crate::ConnectionFactory) implementations.
pub type BoxError = Box<dyn error::Error + Send + Sync>;

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// pool is shutting down and does not hand out resources anymore.
    ShuttingDown,
    /// connection factory failed to produce a new resource.
    Creation(CreationError),
    /// resource is already serving the max amount of concurrent streams.
    StreamCapacity(StreamCapacity),
    /// handle is not live in registry. either released twice or it belongs to another registry.
    UnknownLease(HandleId),
    /// waiting for live handles to go away did not finish in time.
    Timeout(Timeout),
    /// pool builder received invalid configuration.
    InvalidConfig(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ShuttingDown => f.write_str("pool is shutting down"),
            Self::Creation(ref e) => fmt::Display::fmt(e, f),
            Self::StreamCapacity(ref e) => fmt::Display::fmt(e, f),
            Self::UnknownLease(id) => write!(f, "handle {id} is not live. possible double release"),
            Self::Timeout(ref e) => fmt::Display::fmt(e, f),
            Self::InvalidConfig(msg) => write!(f, "invalid pool config: {msg}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Self::Creation(ref e) => Some(&*e.0),
            _ => None,
        }
    }
}

impl Error {
    /// true when error is caused by pool shutdown.
    pub fn is_shutting_down(&self) -> bool {
        matches!(self, Self::ShuttingDown)
    }

    /// true when error is caused by connection factory failing to produce resource.
    pub fn is_creation(&self) -> bool {
        matches!(self, Self::Creation(_))
    }
}

/// error wrapping the cause of a failed [ConnectionFactory::create](crate::ConnectionFactory::create) call.
pub struct CreationError(pub BoxError);

impl fmt::Debug for CreationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CreationError").field(&self.0).finish()
    }
}

impl fmt::Display for CreationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to create resource: {}", self.0)
    }
}

impl error::Error for CreationError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&*self.0)
    }
}

impl From<CreationError> for Error {
    fn from(e: CreationError) -> Self {
        Self::Creation(e)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StreamCapacity {
    pub handle: HandleId,
    pub max_streams: usize,
}

impl fmt::Display for StreamCapacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "resource {} already serves max amount of {} concurrent streams",
            self.handle, self.max_streams
        )
    }
}

impl error::Error for StreamCapacity {}

impl From<StreamCapacity> for Error {
    fn from(e: StreamCapacity) -> Self {
        Self::StreamCapacity(e)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    /// amount of handles still live when waiting gave up.
    pub remaining: usize,
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timed out with {} live handle(s) remaining", self.remaining)
    }
}

impl error::Error for Timeout {}

impl From<Timeout> for Error {
    fn from(e: Timeout) -> Self {
        Self::Timeout(e)
    }
}

#[cfg(test)]
mod test {
    use std::io;

    use super::*;

    #[test]
    fn creation_source() {
        let e = Error::from(CreationError(Box::new(io::Error::other("refused"))));
        assert!(e.is_creation());
        assert!(error::Error::source(&e).is_some());
        assert_eq!(e.to_string(), "failed to create resource: refused");
    }
}
