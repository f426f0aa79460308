//! Deferred execution of continuations.
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::task::{waker, ArcWake};
use log::trace;

use crate::state::PromiseId;
use crate::Error;

pub type Task = Box<dyn FnOnce()>;

/// Runs work later, off the caller's stack.
///
/// `owner` is the promise whose continuation `task` runs.
pub trait Scheduler {
    fn schedule(&self, task: Task, owner: PromiseId);
}

/// A FIFO run queue driven one turn at a time. The default scheduler.
///
/// Tasks are plain closures run strictly in scheduling order, and an empty
/// queue is observable, which `block_on` relies on to report a stall;
/// `futures::executor::LocalPool` promises neither.
#[derive(Default)]
pub struct EventLoop {
    queue: RefCell<VecDeque<(PromiseId, Task)>>,
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("pending", &self.pending())
            .finish()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Runs the oldest queued task. Returns `false` if there was none.
    pub fn turn(&self) -> bool {
        let next = self.queue.borrow_mut().pop_front();
        match next {
            Some((owner, task)) => {
                trace!("running continuation for {owner}");
                task();
                true
            }
            None => false,
        }
    }

    /// Runs tasks, including ones queued along the way, until the queue is
    /// empty. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.turn() {
            ran += 1;
        }
        ran
    }

    /// Drives the loop until `future` completes.
    ///
    /// Fails with [`Error::Stalled`] if the queue empties while the future
    /// is still pending and nothing has woken it, since no further progress
    /// is possible on this thread.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output, Error> {
        let mut future = pin!(future);
        let woken = Arc::new(Woken(AtomicBool::new(true)));
        let waker = waker(woken.clone());
        let mut cx = Context::from_waker(&waker);
        loop {
            if woken.0.swap(false, Ordering::AcqRel) {
                if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                    return Ok(output);
                }
            }
            if !self.turn() && !woken.0.load(Ordering::Acquire) {
                return Err(Error::Stalled);
            }
        }
    }
}

impl Scheduler for EventLoop {
    fn schedule(&self, task: Task, owner: PromiseId) {
        self.queue.borrow_mut().push_back((owner, task));
    }
}

struct Woken(AtomicBool);

impl ArcWake for Woken {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.store(true, Ordering::Release);
    }
}

/// Runs every task on the spot. Continuations then execute inside the call
/// that settled their promise, so this is only meant for tests that want
/// the whole chain to complete synchronously.
#[derive(Debug, Default, Clone, Copy)]
pub struct Immediate;

impl Scheduler for Immediate {
    fn schedule(&self, task: Task, owner: PromiseId) {
        trace!("running continuation for {owner} immediately");
        task();
    }
}
