//! Where promises get their scheduler from.
use std::fmt;
use std::rc::Rc;

use crate::scheduler::{EventLoop, Scheduler};
use crate::state::Promise;
use crate::Reason;

/// Creates promises bound to one [`Scheduler`]. Promises derived through
/// `then` and friends inherit it.
///
/// `Runtime::new()` owns a fresh [`EventLoop`]; use [`Runtime::builder`] to
/// inject any other scheduler.
#[derive(Clone)]
pub struct Runtime {
    scheduler: Rc<dyn Scheduler>,
    event_loop: Option<Rc<EventLoop>>,
}

impl Runtime {
    pub fn new() -> Self {
        Builder::new().build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    pub fn scheduler(&self) -> &Rc<dyn Scheduler> {
        &self.scheduler
    }

    /// The loop driving this runtime, if it is an [`EventLoop`].
    pub fn event_loop(&self) -> Option<&Rc<EventLoop>> {
        self.event_loop.as_ref()
    }

    pub(crate) fn pending<T: Clone + 'static, E: Reason>(&self) -> Promise<T, E> {
        Promise::pending(self.scheduler.clone())
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("event_loop", &self.event_loop)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct Builder {
    scheduler: Option<Rc<dyn Scheduler>>,
    event_loop: Option<Rc<EventLoop>>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `scheduler` for every continuation.
    pub fn scheduler(mut self, scheduler: Rc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self.event_loop = None;
        self
    }

    /// Shares an existing loop, e.g. between several runtimes.
    pub fn event_loop(mut self, event_loop: Rc<EventLoop>) -> Self {
        let scheduler: Rc<dyn Scheduler> = event_loop.clone();
        self.scheduler = Some(scheduler);
        self.event_loop = Some(event_loop);
        self
    }

    pub fn build(self) -> Runtime {
        match self.scheduler {
            Some(scheduler) => Runtime {
                scheduler,
                event_loop: self.event_loop,
            },
            None => {
                let event_loop = Rc::new(EventLoop::new());
                Runtime {
                    scheduler: event_loop.clone(),
                    event_loop: Some(event_loop),
                }
            }
        }
    }
}
