//! Constructors and `all`, built on the public promise operations.
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use log::trace;

use crate::resolve::{Resolution, Resolver};
use crate::runtime::Runtime;
use crate::state::Promise;
use crate::Reason;

/// A pending promise together with the capability to settle it.
///
/// # Examples
///
/// ```
/// use promise_chain::Runtime;
///
/// let rt = Runtime::new();
/// let deferred = rt.begin_chain::<&str, String>();
/// let promise = deferred.promise().clone();
/// assert!(promise.is_pending());
///
/// deferred.resolve("done");
/// assert!(promise.is_fulfilled());
/// ```
pub struct Deferred<T, E> {
    resolver: Resolver<T, E>,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            resolver: self.resolver.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("resolver", &self.resolver)
            .finish()
    }
}

impl<T: Clone + 'static, E: Reason> Deferred<T, E> {
    pub fn promise(&self) -> &Promise<T, E> {
        self.resolver.promise()
    }

    pub fn into_promise(self) -> Promise<T, E> {
        self.resolver.promise().clone()
    }

    /// See [`Resolver::resolve`].
    pub fn resolve(&self, value: T) -> bool {
        self.resolver.resolve(value)
    }

    /// See [`Resolver::resolve_with`].
    pub fn resolve_with(&self, x: impl Into<Resolution<T, E>>) -> bool {
        self.resolver.resolve_with(x)
    }

    /// See [`Resolver::reject`].
    pub fn reject(&self, reason: E) -> bool {
        self.resolver.reject(reason)
    }
}

struct Gather<T> {
    slots: Vec<Option<T>>,
    remaining: usize,
}

impl Runtime {
    /// A pending promise to be settled from outside through the returned
    /// handle.
    pub fn begin_chain<T: Clone + 'static, E: Reason>(&self) -> Deferred<T, E> {
        Deferred {
            resolver: Resolver::new(self.pending()),
        }
    }

    /// A promise settled by `executor`, which runs before this returns.
    ///
    /// An `Err` from the executor rejects the promise unless the resolver
    /// was already used.
    pub fn begin_chain_with<T, E, F>(&self, executor: F) -> Promise<T, E>
    where
        T: Clone + 'static,
        E: Reason,
        F: FnOnce(Resolver<T, E>) -> Result<(), E>,
    {
        let resolver = Resolver::new(self.pending());
        if let Err(reason) = executor(resolver.clone()) {
            if !resolver.reject(reason) {
                trace!("{} executor failed after settling", resolver.promise().id());
            }
        }
        resolver.promise().clone()
    }

    pub fn fulfilled<T: Clone + 'static, E: Reason>(&self, value: T) -> Promise<T, E> {
        let promise = self.pending();
        promise.fulfill(value);
        promise
    }

    /// Returns `x` itself if it is already a promise; otherwise a new promise
    /// fulfilled with it. Thenables are stored as values, not adopted.
    pub fn fulfilled_from<T, E>(&self, x: impl Into<Resolution<T, E>>) -> Promise<T, E>
    where
        T: Clone + 'static,
        E: Reason,
    {
        match x.into() {
            Resolution::Promise(promise) => promise,
            Resolution::Value(value) => self.fulfilled(value),
            Resolution::Thenable(thenable) => self.fulfilled(thenable.as_value()),
        }
    }

    pub fn rejected<T: Clone + 'static, E: Reason>(&self, reason: E) -> Promise<T, E> {
        let promise = self.pending();
        promise.reject(reason);
        promise
    }

    /// Waits for every item.
    ///
    /// Fulfills with the values in input order once all of them fulfilled.
    /// Rejects with a one-element vector holding the first rejection reason;
    /// anything settling afterwards is ignored. Items may be plain values
    /// (`Resolution::Value`) as well as promises.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_chain::Runtime;
    ///
    /// let rt = Runtime::new();
    /// let all = rt.all(vec![
    ///     rt.fulfilled::<i32, String>(1),
    ///     rt.fulfilled(2),
    /// ]);
    /// let event_loop = rt.event_loop().unwrap();
    /// assert_eq!(event_loop.block_on(all), Ok(Ok(vec![1, 2])));
    /// ```
    pub fn all<T, E, I>(&self, items: I) -> Promise<Vec<T>, Vec<E>>
    where
        T: Clone + 'static,
        E: Reason,
        I: IntoIterator,
        I::Item: Into<Resolution<T, E>>,
    {
        let inputs: Vec<Promise<T, E>> = items
            .into_iter()
            .map(|item| self.fulfilled_from(item))
            .collect();
        let deferred = self.begin_chain::<Vec<T>, Vec<E>>();
        if inputs.is_empty() {
            deferred.resolve(vec![]);
            return deferred.into_promise();
        }

        let gather = Rc::new(RefCell::new(Gather {
            slots: vec![None; inputs.len()],
            remaining: inputs.len(),
        }));
        let settled = Rc::new(Cell::new(false));
        for (index, input) in inputs.iter().enumerate() {
            let (gather, on_fulfilled) = (gather.clone(), deferred.clone());
            let (settled_ok, settled_err) = (settled.clone(), settled.clone());
            let on_rejected = deferred.clone();
            input.then_or_else(
                move |value| {
                    let values = {
                        let mut gather = gather.borrow_mut();
                        gather.slots[index] = Some(value);
                        gather.remaining -= 1;
                        if gather.remaining > 0 || settled_ok.replace(true) {
                            return Ok(Resolution::Value(()));
                        }
                        std::mem::take(&mut gather.slots)
                    };
                    on_fulfilled.resolve(values.into_iter().flatten().collect());
                    Ok(Resolution::Value(()))
                },
                move |reason| {
                    if !settled_err.replace(true) {
                        on_rejected.reject(vec![reason]);
                    }
                    Ok(Resolution::Value(()))
                },
            );
        }
        deferred.into_promise()
    }
}
