//! The promise state machine.
//!
//! A promise leaves `Pending` at most once. Whatever settles it first wins;
//! every later attempt is ignored.
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use log::trace;

use crate::continuation::Waiter;
use crate::scheduler::Scheduler;
use crate::Reason;

thread_local! {
    static NEXT_ID: Cell<u64> = const { Cell::new(1) };
}

/// Identifies a promise in logs and in [`Scheduler::schedule`] calls.
/// Unique among the promises of one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PromiseId(u64);

impl PromiseId {
    fn next() -> Self {
        NEXT_ID.with(|next| {
            let id = next.get();
            next.set(id + 1);
            PromiseId(id)
        })
    }
}

impl fmt::Display for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "promise#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Pending,
    Fulfilled,
    Rejected,
}

/// A terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Settlement<T, E> {
    Fulfilled(T),
    Rejected(E),
}

impl<T, E> Settlement<T, E> {
    pub(crate) fn state(&self) -> State {
        match self {
            Settlement::Fulfilled(_) => State::Fulfilled,
            Settlement::Rejected(_) => State::Rejected,
        }
    }

    pub(crate) fn into_result(self) -> Result<T, E> {
        match self {
            Settlement::Fulfilled(value) => Ok(value),
            Settlement::Rejected(reason) => Err(reason),
        }
    }
}

/// A pass-through settlement of some downstream promise, queued so that a
/// chain of pass-throughs is walked iteratively.
pub(crate) struct Relay(Box<dyn FnOnce(&mut VecDeque<Relay>)>);

impl Relay {
    pub(crate) fn new<F>(f: F) -> Self
    where
        F: FnOnce(&mut VecDeque<Relay>) + 'static,
    {
        Relay(Box::new(f))
    }
}

struct Shared<T, E> {
    id: PromiseId,
    scheduler: Rc<dyn Scheduler>,
    inner: RefCell<Inner<T, E>>,
}

struct Inner<T, E> {
    outcome: Option<Settlement<T, E>>,
    waiters: Vec<Box<dyn Waiter<T, E>>>,
    wakers: Vec<Waker>,
}

/// The eventual result of an operation: a value `T` or a rejection reason
/// `E`.
///
/// Cloning a `Promise` clones the handle, not the result; all clones observe
/// the same settlement. Awaiting a promise yields `Ok(value)` or
/// `Err(reason)`.
pub struct Promise<T, E> {
    shared: Rc<Shared<T, E>>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl<T, E> Promise<T, E> {
    pub fn id(&self) -> PromiseId {
        self.shared.id
    }

    pub fn state(&self) -> State {
        match &self.shared.inner.borrow().outcome {
            Some(settlement) => settlement.state(),
            None => State::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state() == State::Pending
    }

    pub fn is_fulfilled(&self) -> bool {
        self.state() == State::Fulfilled
    }

    pub fn is_rejected(&self) -> bool {
        self.state() == State::Rejected
    }

    pub(crate) fn scheduler(&self) -> &Rc<dyn Scheduler> {
        &self.shared.scheduler
    }

    /// Whether both handles refer to the same promise.
    pub fn ptr_eq(&self, other: &Promise<T, E>) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }
}

impl<T: Clone + 'static, E: Reason> Promise<T, E> {
    pub(crate) fn pending(scheduler: Rc<dyn Scheduler>) -> Self {
        Self {
            shared: Rc::new(Shared {
                id: PromiseId::next(),
                scheduler,
                inner: RefCell::new(Inner {
                    outcome: None,
                    waiters: vec![],
                    wakers: vec![],
                }),
            }),
        }
    }

    pub(crate) fn fulfill(&self, value: T) -> bool {
        self.settle(Settlement::Fulfilled(value))
    }

    pub(crate) fn reject(&self, reason: E) -> bool {
        self.settle(Settlement::Rejected(reason))
    }

    /// Moves the promise into a terminal state and releases its waiters in
    /// registration order. Returns `false` if it had already settled.
    ///
    /// Pass-through links reached from here are settled before returning.
    pub(crate) fn settle(&self, settlement: Settlement<T, E>) -> bool {
        let mut relays = VecDeque::new();
        let settled = self.settle_into(settlement, &mut relays);
        while let Some(Relay(relay)) = relays.pop_front() {
            relay(&mut relays);
        }
        settled
    }

    /// Like `settle`, but pass-through waiters push their downstream
    /// settlement onto `relays` instead of recursing.
    pub(crate) fn settle_into(
        &self,
        settlement: Settlement<T, E>,
        relays: &mut VecDeque<Relay>,
    ) -> bool {
        let (waiters, wakers) = {
            let mut inner = self.shared.inner.borrow_mut();
            if inner.outcome.is_some() {
                trace!("{} already settled, ignoring {:?}", self.id(), settlement.state());
                return false;
            }
            inner.outcome = Some(settlement.clone());
            (mem::take(&mut inner.waiters), mem::take(&mut inner.wakers))
        };
        trace!(
            "{} settled {:?}, releasing {} waiter(s)",
            self.id(),
            settlement.state(),
            waiters.len()
        );
        for waiter in waiters {
            waiter.on_settled(&settlement, relays);
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// Queues `waiter` while pending. On a settled promise the waiter is
    /// handed the outcome at once and must defer its own work.
    pub(crate) fn enqueue(&self, waiter: Box<dyn Waiter<T, E>>) {
        let settled = {
            let mut inner = self.shared.inner.borrow_mut();
            if inner.outcome.is_none() {
                inner.waiters.push(waiter);
                return;
            }
            inner.outcome.clone()
        };
        if let Some(settlement) = settled {
            waiter.on_registered_late(settlement);
        }
    }

    #[cfg(test)]
    pub(crate) fn peek(&self) -> Option<Result<T, E>> {
        self.shared
            .inner
            .borrow()
            .outcome
            .clone()
            .map(Settlement::into_result)
    }
}

impl<T: Clone + 'static, E: Reason> Future for Promise<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.shared.inner.borrow_mut();
        if let Some(settlement) = &inner.outcome {
            return Poll::Ready(settlement.clone().into_result());
        }
        // Every distinct task awaiting a clone gets woken, not just the last.
        if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            inner.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::{Promise, State};
    use crate::scheduler::EventLoop;

    fn pending() -> Promise<i32, String> {
        Promise::pending(Rc::new(EventLoop::new()))
    }

    #[test]
    fn test_starts_pending() {
        let p = pending();
        assert_eq!(p.state(), State::Pending);
        assert!(p.is_pending());
        assert_eq!(p.peek(), None);
    }

    #[test]
    fn test_fulfill_once() {
        let p = pending();
        assert!(p.fulfill(1));
        assert!(!p.fulfill(2));
        assert!(!p.reject("late".into()));
        assert!(p.is_fulfilled());
        assert_eq!(p.peek(), Some(Ok(1)));
    }

    #[test]
    fn test_reject_once() {
        let p = pending();
        assert!(p.reject("bad".into()));
        assert!(!p.fulfill(3));
        assert!(!p.reject("worse".into()));
        assert!(p.is_rejected());
        assert_eq!(p.peek(), Some(Err("bad".to_string())));
    }

    #[test]
    fn test_clones_share_settlement() {
        let p = pending();
        let q = p.clone();
        p.fulfill(7);
        assert!(q.ptr_eq(&p));
        assert_eq!(q.id(), p.id());
        assert_eq!(q.peek(), Some(Ok(7)));
    }

    #[test]
    fn test_ids_are_distinct() {
        assert_ne!(pending().id(), pending().id());
    }

    #[test]
    fn test_debug_shows_state() {
        let p = pending();
        p.reject("x".into());
        let rendered = format!("{p:?}");
        assert!(rendered.contains("Rejected"), "{rendered}");
    }
}
