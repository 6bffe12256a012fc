use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use log::warn;

type Task = Box<dyn FnOnce()>;

/// Ticks run by [`EventLoop::run`] before it gives up on a loop that keeps
/// scheduling itself
const MAX_TICKS: usize = 1 << 24;

/// FIFO of deferred callbacks standing in for a host event loop
#[derive(Default)]
pub struct EventLoop {
    queue: RefCell<VecDeque<Task>>,
    ticks: Cell<u64>,
}

impl EventLoop {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Schedule `task` to run on a later tick.
    pub fn defer(&self, task: impl FnOnce() + 'static) {
        self.queue.borrow_mut().push_back(Box::new(task));
    }

    /// Run one task. Returns false when nothing was queued.
    pub fn tick(&self) -> bool {
        let task = self.queue.borrow_mut().pop_front();
        match task {
            Some(task) => {
                self.ticks.set(self.ticks.get() + 1);
                task();
                true
            }
            None => false,
        }
    }

    /// Run tasks until the queue is empty; returns how many ran.
    pub fn run(&self) -> usize {
        let mut n = 0;
        while self.tick() {
            n += 1;
            if n >= MAX_TICKS {
                warn!("event loop still busy after {} ticks, stopping", n);
                break;
            }
        }
        n
    }

    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Tasks run since the loop was created.
    pub fn ticks(&self) -> u64 {
        self.ticks.get()
    }
}
