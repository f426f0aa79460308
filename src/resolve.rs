//! The resolution procedure: turning a fulfillment candidate into a
//! settlement, adopting the eventual state of promises and thenables.
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use log::{debug, trace};

use crate::state::Promise;
use crate::{Error, Reason};

/// A candidate for fulfilling a promise.
pub enum Resolution<T, E> {
    /// A plain value; fulfills immediately.
    Value(T),
    /// Another promise of this crate; its eventual state is adopted.
    Promise(Promise<T, E>),
    /// A promise-like object; adopted if it exposes a `then` operation.
    Thenable(Rc<dyn Thenable<T, E>>),
}

impl<T, E> Resolution<T, E> {
    pub fn thenable<V: Thenable<T, E> + 'static>(thenable: V) -> Self {
        Resolution::Thenable(Rc::new(thenable))
    }
}

impl<T, E> From<Promise<T, E>> for Resolution<T, E> {
    fn from(promise: Promise<T, E>) -> Self {
        Resolution::Promise(promise)
    }
}

impl<T: fmt::Debug, E> fmt::Debug for Resolution<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Resolution::Promise(promise) => f.debug_tuple("Promise").field(promise).finish(),
            Resolution::Thenable(_) => f.write_str("Thenable(..)"),
        }
    }
}

/// The `then` operation of a thenable. It receives one [`Resolver`] whose
/// `resolve` and `reject` share a latch; an `Err` return counts as a
/// rejection unless the resolver was already used.
pub type ThenFn<T, E> = Box<dyn FnOnce(Resolver<T, E>) -> Result<(), E>>;

/// A promise-like object.
///
/// Whether an object actually behaves like a promise is decided at
/// resolution time by asking for its `then` member.
pub trait Thenable<T, E> {
    /// Looks up the `then` operation. `Ok(None)` means there is nothing
    /// callable and the object is used as a plain value; `Err` rejects the
    /// promise being resolved.
    fn then_member(&self) -> Result<Option<ThenFn<T, E>>, E>;

    /// The value to fulfill with when [`then_member`](Self::then_member)
    /// finds nothing callable.
    fn as_value(&self) -> T;
}

/// Write access to a pending promise.
///
/// Clones share one latch: whichever of `resolve`, `resolve_with` or
/// `reject` is called first takes effect and every later call is ignored.
pub struct Resolver<T, E> {
    promise: Promise<T, E>,
    called: Rc<Cell<bool>>,
}

impl<T, E> Clone for Resolver<T, E> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
            called: self.called.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Resolver<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("promise", &self.promise)
            .field("called", &self.called.get())
            .finish()
    }
}

impl<T: Clone + 'static, E: Reason> Resolver<T, E> {
    pub(crate) fn new(promise: Promise<T, E>) -> Self {
        Self {
            promise,
            called: Rc::new(Cell::new(false)),
        }
    }

    pub fn promise(&self) -> &Promise<T, E> {
        &self.promise
    }

    /// Whether any clone of this resolver has been used.
    pub fn is_called(&self) -> bool {
        self.called.get()
    }

    /// Fulfills with a plain value. Returns `false` if the latch was already
    /// taken.
    pub fn resolve(&self, value: T) -> bool {
        self.resolve_with(Resolution::Value(value))
    }

    /// Runs the resolution procedure on `x`, which may be a promise or a
    /// thenable.
    pub fn resolve_with(&self, x: impl Into<Resolution<T, E>>) -> bool {
        if self.called.replace(true) {
            return false;
        }
        resolve_promise(&self.promise, x.into());
        true
    }

    pub fn reject(&self, reason: E) -> bool {
        if self.called.replace(true) {
            return false;
        }
        self.promise.reject(reason);
        true
    }
}

/// Settles `promise` from `x`, flattening nested promises and thenables.
pub(crate) fn resolve_promise<T: Clone + 'static, E: Reason>(
    promise: &Promise<T, E>,
    x: Resolution<T, E>,
) {
    match x {
        Resolution::Value(value) => {
            promise.fulfill(value);
        }
        Resolution::Promise(other) if other.ptr_eq(promise) => {
            debug!("{} resolved with itself", promise.id());
            promise.reject(E::from_error(Error::SelfResolution));
        }
        Resolution::Promise(other) => {
            debug!("{} adopting {}", promise.id(), other.id());
            call_then(promise, adopt(other));
        }
        Resolution::Thenable(thenable) => match thenable.then_member() {
            Err(reason) => {
                promise.reject(reason);
            }
            Ok(None) => {
                promise.fulfill(thenable.as_value());
            }
            Ok(Some(then)) => {
                debug!("{} adopting a thenable", promise.id());
                call_then(promise, then);
            }
        },
    }
}

fn call_then<T: Clone + 'static, E: Reason>(promise: &Promise<T, E>, then: ThenFn<T, E>) {
    let resolver = Resolver::new(promise.clone());
    if let Err(reason) = then(resolver.clone()) {
        if !resolver.reject(reason) {
            trace!("{} ignoring failure after settlement by thenable", promise.id());
        }
    }
}

/// The `then` member of one of our own promises.
fn adopt<T: Clone + 'static, E: Reason>(other: Promise<T, E>) -> ThenFn<T, E> {
    Box::new(move |resolver: Resolver<T, E>| {
        let on_rejected = resolver.clone();
        other.then_or_else(
            move |value| {
                resolver.resolve(value);
                Ok(Resolution::Value(()))
            },
            move |reason| {
                on_rejected.reject(reason);
                Ok(Resolution::Value(()))
            },
        );
        Ok(())
    })
}
