//! Chainable promises for a single-threaded event loop.
//!
//! A [`Promise`] stands for a value that may not exist yet. Continuations
//! registered with [`Promise::then`] never run on the stack that registered
//! them or on the stack that settled the promise; they are handed to a
//! [`Scheduler`] and run on a later turn.
//!
//! # Examples
//!
//! ```
//! use promise_chain::{Resolution, Runtime};
//!
//! let rt = Runtime::new();
//! let deferred = rt.begin_chain::<i32, String>();
//! let doubled = deferred
//!     .promise()
//!     .and_then(|v| Ok(Resolution::Value(v * 2)));
//!
//! deferred.resolve(21);
//! let event_loop = rt.event_loop().unwrap();
//! assert_eq!(event_loop.block_on(doubled), Ok(Ok(42)));
//! ```
pub mod combinators;
pub mod continuation;
pub mod resolve;
pub mod runtime;
pub mod scheduler;
pub mod state;

pub use combinators::Deferred;
pub use continuation::Reaction;
pub use resolve::{Resolution, Resolver, ThenFn, Thenable};
pub use runtime::{Builder, Runtime};
pub use scheduler::{EventLoop, Immediate, Scheduler, Task};
pub use state::{Promise, PromiseId, State};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A promise was resolved with itself.
    #[error("cannot resolve a promise with itself")]
    SelfResolution,
    /// A continuation panicked; carries the panic message when there was one.
    #[error("continuation panicked: {0}")]
    Panicked(String),
    /// [`EventLoop::block_on`] ran out of queued work while its future was
    /// still pending.
    #[error("event loop went idle before the future completed")]
    Stalled,
}

/// A rejection reason.
///
/// The core needs to reject promises on its own (self-resolution, a
/// panicking callback), so every reason type must be buildable from an
/// [`Error`].
pub trait Reason: Clone + 'static {
    fn from_error(error: Error) -> Self;
}

impl Reason for Error {
    fn from_error(error: Error) -> Self {
        error
    }
}

impl Reason for String {
    fn from_error(error: Error) -> Self {
        error.to_string()
    }
}

/// `all` rejects with the first reason wrapped in a one-element sequence.
impl<E: Reason> Reason for Vec<E> {
    fn from_error(error: Error) -> Self {
        vec![E::from_error(error)]
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, Reason};

    #[test]
    fn test_reason_from_error() {
        assert_eq!(Error::from_error(Error::Stalled), Error::Stalled);
        assert_eq!(
            String::from_error(Error::SelfResolution),
            "cannot resolve a promise with itself"
        );
        assert_eq!(
            Vec::<String>::from_error(Error::Panicked("boom".into())),
            vec!["continuation panicked: boom".to_string()]
        );
    }
}
