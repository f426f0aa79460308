//! `then` registrations and the single point where a callback fault turns
//! into a rejection.
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};

use log::{trace, warn};

use crate::resolve::{resolve_promise, Resolution};
use crate::state::{Promise, Relay, Settlement};
use crate::{Error, Reason};

/// What a continuation callback hands back: something to resolve the
/// downstream promise with, or a reason to reject it.
pub type Reaction<U, E> = Result<Resolution<U, E>, E>;

/// Receives an upstream promise's outcome.
pub(crate) trait Waiter<T, E> {
    /// The upstream promise settled just now. Direct follow-up settlements
    /// go onto `relays`.
    fn on_settled(self: Box<Self>, settlement: &Settlement<T, E>, relays: &mut VecDeque<Relay>);
    /// The upstream promise had already settled when this waiter was added.
    fn on_registered_late(self: Box<Self>, settlement: Settlement<T, E>);
}

pub(crate) enum Handler<A, U, E> {
    Callback(Box<dyn FnOnce(A) -> Reaction<U, E>>),
    /// No callback: forward the outcome with the same disposition.
    PassThrough(fn(A) -> Settlement<U, E>),
}

impl<A, U, E> Handler<A, U, E> {
    fn callback<F>(f: F) -> Self
    where
        F: FnOnce(A) -> Reaction<U, E> + 'static,
    {
        let boxed: Box<dyn FnOnce(A) -> Reaction<U, E>> = Box::new(f);
        Handler::Callback(boxed)
    }
}

/// One `then` registration, linking an upstream outcome to `downstream`.
pub(crate) struct Continuation<T, U, E> {
    on_fulfilled: Handler<T, U, E>,
    on_rejected: Handler<E, U, E>,
    downstream: Promise<U, E>,
}

impl<T: 'static, U: Clone + 'static, E: Reason> Continuation<T, U, E> {
    fn run(self, settlement: Settlement<T, E>) {
        match settlement {
            Settlement::Fulfilled(value) => react(self.on_fulfilled, value, &self.downstream),
            Settlement::Rejected(reason) => react(self.on_rejected, reason, &self.downstream),
        }
    }

    fn defer(self, settlement: Settlement<T, E>) {
        let owner = self.downstream.id();
        let scheduler = self.downstream.scheduler().clone();
        trace!("scheduling {:?} continuation for {}", settlement.state(), owner);
        scheduler.schedule(Box::new(move || self.run(settlement)), owner);
    }
}

impl<T: Clone + 'static, U: Clone + 'static, E: Reason> Waiter<T, E> for Continuation<T, U, E> {
    fn on_settled(self: Box<Self>, settlement: &Settlement<T, E>, relays: &mut VecDeque<Relay>) {
        let forwarded = match (settlement, &self.on_fulfilled, &self.on_rejected) {
            (Settlement::Fulfilled(value), Handler::PassThrough(forward), _) => {
                Some(forward(value.clone()))
            }
            (Settlement::Rejected(reason), _, Handler::PassThrough(forward)) => {
                Some(forward(reason.clone()))
            }
            _ => None,
        };
        match forwarded {
            Some(next) => {
                let downstream = self.downstream;
                relays.push_back(Relay::new(move |relays| {
                    downstream.settle_into(next, relays);
                }));
            }
            None => self.defer(settlement.clone()),
        }
    }

    fn on_registered_late(self: Box<Self>, settlement: Settlement<T, E>) {
        self.defer(settlement);
    }
}

fn react<A, U: Clone + 'static, E: Reason>(
    handler: Handler<A, U, E>,
    arg: A,
    downstream: &Promise<U, E>,
) {
    match handler {
        Handler::PassThrough(forward) => {
            downstream.settle(forward(arg));
        }
        Handler::Callback(callback) => {
            // Covers the callback and the adoption of whatever it returned.
            let caught = panic::catch_unwind(AssertUnwindSafe(|| match callback(arg) {
                Ok(resolution) => resolve_promise(downstream, resolution),
                Err(reason) => {
                    downstream.reject(reason);
                }
            }));
            if let Err(payload) = caught {
                let message = panic_message(payload.as_ref());
                warn!("continuation panicked, rejecting {}: {message}", downstream.id());
                downstream.reject(E::from_error(Error::Panicked(message)));
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("<non-string panic payload>")
    }
}

impl<T: Clone + 'static, E: Reason> Promise<T, E> {
    /// Registers callbacks for the promise's outcome and returns a promise
    /// for the callback's result.
    ///
    /// A `None` handler passes that outcome through to the returned promise
    /// unchanged. Callbacks always run on a later scheduler turn, even when
    /// this promise has already settled. An `Err` returned from a callback,
    /// or a panic inside it, rejects the returned promise.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_chain::{Reaction, Resolution, Runtime};
    ///
    /// let rt = Runtime::new();
    /// let p = rt.fulfilled::<i32, String>(4).then(
    ///     Some(|v: i32| Ok(Resolution::Value(v + 1))),
    ///     None::<fn(String) -> Reaction<i32, String>>,
    /// );
    /// assert_eq!(rt.event_loop().unwrap().block_on(p), Ok(Ok(5)));
    /// ```
    pub fn then<F, R>(&self, on_fulfilled: Option<F>, on_rejected: Option<R>) -> Promise<T, E>
    where
        F: FnOnce(T) -> Reaction<T, E> + 'static,
        R: FnOnce(E) -> Reaction<T, E> + 'static,
    {
        let on_fulfilled = match on_fulfilled {
            Some(f) => Handler::callback(f),
            None => Handler::PassThrough(Settlement::Fulfilled as fn(T) -> Settlement<T, E>),
        };
        let on_rejected = match on_rejected {
            Some(r) => Handler::callback(r),
            None => Handler::PassThrough(Settlement::Rejected as fn(E) -> Settlement<T, E>),
        };
        self.register(on_fulfilled, on_rejected)
    }

    /// `then(None, Some(on_rejected))`.
    pub fn catch<R>(&self, on_rejected: R) -> Promise<T, E>
    where
        R: FnOnce(E) -> Reaction<T, E> + 'static,
    {
        self.then(None::<fn(T) -> Reaction<T, E>>, Some(on_rejected))
    }

    /// Like `then` with only a fulfillment callback, but the callback may
    /// produce a different value type. Rejections pass through.
    pub fn and_then<U, F>(&self, on_fulfilled: F) -> Promise<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Reaction<U, E> + 'static,
    {
        self.register(
            Handler::callback(on_fulfilled),
            Handler::PassThrough(Settlement::Rejected as fn(E) -> Settlement<U, E>),
        )
    }

    /// Like `then` with both callbacks, where both produce a new value type.
    pub fn then_or_else<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Promise<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Reaction<U, E> + 'static,
        R: FnOnce(E) -> Reaction<U, E> + 'static,
    {
        self.register(Handler::callback(on_fulfilled), Handler::callback(on_rejected))
    }

    fn register<U: Clone + 'static>(
        &self,
        on_fulfilled: Handler<T, U, E>,
        on_rejected: Handler<E, U, E>,
    ) -> Promise<U, E> {
        let downstream = Promise::pending(self.scheduler().clone());
        self.enqueue(Box::new(Continuation {
            on_fulfilled,
            on_rejected,
            downstream: downstream.clone(),
        }));
        downstream
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    use super::Reaction;
    use crate::resolve::{Resolution, ThenFn, Thenable};
    use crate::scheduler::EventLoop;
    use crate::state::Promise;
    use crate::Error;

    type P = Promise<i32, String>;

    fn setup() -> (Rc<EventLoop>, P) {
        let event_loop = Rc::new(EventLoop::new());
        let p = Promise::pending(event_loop.clone());
        (event_loop, p)
    }

    fn no_reject() -> Option<fn(String) -> Reaction<i32, String>> {
        None
    }

    #[test]
    fn test_callback_waits_for_a_turn() {
        let (event_loop, p) = setup();
        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        let q = p.then(
            Some(move |v: i32| {
                seen.set(seen.get() + 1);
                Ok(Resolution::Value(v * 10))
            }),
            no_reject(),
        );
        p.fulfill(3);
        assert_eq!(calls.get(), 0);
        assert!(q.is_pending());
        assert_eq!(event_loop.run_until_idle(), 1);
        assert_eq!(calls.get(), 1);
        assert_eq!(q.peek(), Some(Ok(30)));
    }

    #[test]
    fn test_pass_through_on_pending_is_direct() {
        let (event_loop, p) = setup();
        let q = p.then(None::<fn(i32) -> Reaction<i32, String>>, no_reject());
        p.fulfill(8);
        assert_eq!(event_loop.pending(), 0);
        assert_eq!(q.peek(), Some(Ok(8)));

        let (_, p) = setup();
        let q = p.and_then(|v: i32| Ok(Resolution::Value(v.to_string())));
        p.reject("nope".into());
        assert_eq!(q.peek(), Some(Err("nope".to_string())));
    }

    #[test]
    fn test_pass_through_on_settled_is_deferred() {
        let (event_loop, p) = setup();
        p.fulfill(8);
        let q = p.then(None::<fn(i32) -> Reaction<i32, String>>, no_reject());
        assert!(q.is_pending());
        event_loop.run_until_idle();
        assert_eq!(q.peek(), Some(Ok(8)));
    }

    #[test]
    fn test_registration_order() {
        let (event_loop, p) = setup();
        let order = Rc::new(RefCell::new(vec![]));
        for i in 0..4 {
            let order = order.clone();
            p.and_then(move |_| {
                order.borrow_mut().push(i);
                Ok(Resolution::Value(()))
            });
        }
        p.fulfill(0);
        event_loop.run_until_idle();
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_err_rejects_downstream() {
        let (event_loop, p) = setup();
        let q = p.and_then(|_| Err::<Resolution<i32, String>, _>("thrown".to_string()));
        p.fulfill(1);
        event_loop.run_until_idle();
        assert_eq!(q.peek(), Some(Err("thrown".to_string())));
    }

    #[test]
    fn test_panic_rejects_downstream() {
        let event_loop = Rc::new(EventLoop::new());
        let p: Promise<i32, Error> = Promise::pending(event_loop.clone());
        let q = p.and_then(|_| -> Reaction<i32, Error> { panic!("kaboom") });
        p.fulfill(1);
        event_loop.run_until_idle();
        assert_eq!(q.peek(), Some(Err(Error::Panicked("kaboom".into()))));
    }

    /// A thenable whose `then` lookup or invocation panics.
    struct Exploding {
        in_lookup: bool,
    }

    impl Thenable<i32, Error> for Exploding {
        fn then_member(&self) -> Result<Option<ThenFn<i32, Error>>, Error> {
            if self.in_lookup {
                panic!("lookup blew up");
            }
            let then: ThenFn<i32, Error> = Box::new(|_| panic!("then blew up"));
            Ok(Some(then))
        }

        fn as_value(&self) -> i32 {
            0
        }
    }

    #[test]
    fn test_panic_while_adopting_returned_thenable() {
        for (in_lookup, message) in [(true, "lookup blew up"), (false, "then blew up")] {
            let event_loop = Rc::new(EventLoop::new());
            let p: Promise<i32, Error> = Promise::pending(event_loop.clone());
            let q: Promise<i32, Error> =
                p.and_then(move |_| Ok(Resolution::thenable(Exploding { in_lookup })));
            p.fulfill(1);
            assert_eq!(event_loop.run_until_idle(), 1);
            assert_eq!(q.peek(), Some(Err(Error::Panicked(message.into()))));
        }
    }

    #[test]
    fn test_long_pass_through_chain() {
        let (event_loop, head) = setup();
        let mut tail = head.clone();
        for _ in 0..10_000 {
            tail = tail
                .catch(|reason: String| Err(reason))
                .then(None::<fn(i32) -> Reaction<i32, String>>, no_reject());
        }
        head.fulfill(5);
        assert_eq!(event_loop.pending(), 0);
        assert_eq!(tail.peek(), Some(Ok(5)));

        let (_, head) = setup();
        let mut tail = head.clone();
        for _ in 0..10_000 {
            tail = tail.and_then(|v: i32| Ok(Resolution::Value(v)));
        }
        head.reject("deep".into());
        assert_eq!(tail.peek(), Some(Err("deep".to_string())));
    }

    #[test]
    fn test_catch_recovers() {
        let (event_loop, p) = setup();
        let q = p.catch(|reason: String| Ok(Resolution::Value(reason.len() as i32)));
        p.reject("four".into());
        event_loop.run_until_idle();
        assert_eq!(q.peek(), Some(Ok(4)));
    }

    #[test]
    fn test_then_or_else_changes_type() {
        let (event_loop, p) = setup();
        let q = p.then_or_else(
            |v: i32| Ok(Resolution::Value(format!("ok {v}"))),
            |e: String| Ok(Resolution::Value(format!("err {e}"))),
        );
        p.reject("x".into());
        event_loop.run_until_idle();
        assert_eq!(q.peek(), Some(Ok("err x".to_string())));
    }
}
