//! Scheduler running on the default glib main context.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use glib::{ControlFlow, SourceId};
use tracing::trace;

use crate::scheduler::{Scheduler, TaskFlow, TaskId, FRAME_INTERVAL};

/// [`Scheduler`] on top of `glib::timeout_add_local`.
///
/// Next-frame tasks are one-shot timers of one frame interval; the grid only
/// needs "after the next layout", not vsync accuracy.
pub struct GlibScheduler {
    next_id: Cell<TaskId>,
    sources: Rc<RefCell<HashMap<TaskId, SourceId>>>,
}

impl GlibScheduler {
    pub fn new() -> Self {
        Self {
            next_id: Cell::new(1),
            sources: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    /// Tasks registered and not yet fired or cancelled.
    pub fn pending(&self) -> usize {
        self.sources.borrow().len()
    }

    fn allocate(&self) -> TaskId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    fn once(&self, delay: Duration, task: Box<dyn FnOnce()>) -> TaskId {
        let id = self.allocate();
        let sources = Rc::downgrade(&self.sources);
        let source = glib::timeout_add_local_once(delay, move || {
            // Forget the id first; the source is gone once this returns.
            if let Some(sources) = sources.upgrade() {
                sources.borrow_mut().remove(&id);
            }
            task();
        });
        self.sources.borrow_mut().insert(id, source);
        id
    }
}

impl Default for GlibScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for GlibScheduler {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn timeout(&self, delay: Duration, task: Box<dyn FnOnce()>) -> TaskId {
        self.once(delay, task)
    }

    fn interval(&self, period: Duration, mut task: Box<dyn FnMut() -> TaskFlow>) -> TaskId {
        let id = self.allocate();
        let sources = Rc::downgrade(&self.sources);
        let source = glib::timeout_add_local(period, move || match task() {
            TaskFlow::Continue => ControlFlow::Continue,
            TaskFlow::Break => {
                if let Some(sources) = sources.upgrade() {
                    sources.borrow_mut().remove(&id);
                }
                ControlFlow::Break
            }
        });
        self.sources.borrow_mut().insert(id, source);
        id
    }

    fn next_frame(&self, task: Box<dyn FnOnce()>) -> TaskId {
        self.once(FRAME_INTERVAL, task)
    }

    fn cancel(&self, id: TaskId) {
        let source = self.sources.borrow_mut().remove(&id);
        if let Some(source) = source {
            trace!(task = id, "Cancelling glib source");
            source.remove();
        }
    }
}

impl Drop for GlibScheduler {
    fn drop(&mut self) {
        let sources: Vec<SourceId> = self.sources.borrow_mut().drain().map(|(_, s)| s).collect();
        for source in sources {
            source.remove();
        }
    }
}
