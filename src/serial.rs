use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use log::{debug, trace, warn};

use crate::backend::{Connection, TxHandle};
use crate::error::{Error, Result};
use crate::thread::{
    fire_completion_handlers, validate_scope, CompletionHandler, QueuedTask, ReuseTx, TxThread,
    Work,
};
use crate::transaction::{MutexState, TxMutex};
use crate::types::{CompletionType, TxMode};

struct SerialState {
    mutex: TxMutex,
    queue: VecDeque<QueuedTask>,
    /// Handlers of every request that ran in the current transaction
    handlers: Vec<CompletionHandler>,
    /// A transaction was requested and has not settled yet
    busy: bool,
}

struct SerialInner {
    conn: Rc<dyn Connection>,
    reuse: Rc<dyn ReuseTx>,
    name: String,
    debug: bool,
    state: RefCell<SerialState>,
}

/// Thread keeping one native transaction open at a time
#[derive(Clone)]
pub struct SerialThread {
    inner: Rc<SerialInner>,
}

impl SerialThread {
    pub fn new(
        conn: Rc<dyn Connection>,
        reuse: Rc<dyn ReuseTx>,
        name: impl Into<String>,
        debug: bool,
    ) -> Self {
        SerialThread {
            inner: Rc::new(SerialInner {
                conn,
                reuse,
                name: name.into(),
                debug,
                state: RefCell::new(SerialState {
                    mutex: TxMutex::new(),
                    queue: VecDeque::new(),
                    handlers: Vec::new(),
                    busy: false,
                }),
            }),
        }
    }

    fn from_weak(weak: &Weak<SerialInner>) -> Option<Self> {
        weak.upgrade().map(|inner| SerialThread { inner })
    }

    fn tx_label(&self, mutex: &TxMutex) -> String {
        format!("{}T{}", self.inner.name, mutex.tx_count())
    }

    pub fn mutex_state(&self) -> MutexState {
        self.inner.state.borrow().mutex.state()
    }

    /// Transactions that have settled on this thread.
    pub fn completed_tx_count(&self) -> u64 {
        self.inner.state.borrow().mutex.tx_count()
    }

    fn begin(&self, task: QueuedTask) {
        let QueuedTask {
            work,
            scope,
            mode,
            on_completed,
        } = task;
        {
            let mut st = self.inner.state.borrow_mut();
            st.busy = true;
            st.handlers.extend(on_completed);
        }

        let weak_open = Rc::downgrade(&self.inner);
        let weak_done = weak_open.clone();
        let open_scope = scope.clone();
        let open = Box::new(move |tx: TxHandle| {
            if let Some(thread) = SerialThread::from_weak(&weak_open) {
                thread.on_open(tx, &open_scope, mode, work);
            }
        });
        let done = Box::new(move |completion: CompletionType, err: Option<Error>| {
            if let Some(thread) = SerialThread::from_weak(&weak_done) {
                thread.on_complete(completion, err);
            }
        });
        trace!("{} requesting {} transaction on {:?}", self.inner.name, mode, scope);
        self.inner.conn.transaction(open, &scope, mode, done);
    }

    fn on_open(&self, tx: TxHandle, scope: &[String], mode: TxMode, work: Work) {
        let label = {
            let mut st = self.inner.state.borrow_mut();
            if let Err(e) = st.mutex.up(tx.clone(), scope, mode) {
                warn!("{} native transaction opened twice: {}", self.inner.name, e);
                return;
            }
            if self.inner.reuse.locks_tx() {
                st.mutex.lock().ok();
            }
            self.tx_label(&st.mutex)
        };
        debug!("{} open {} on {:?}", label, mode, scope);
        work(&tx, &label);
        self.inner.state.borrow_mut().mutex.exit();
    }

    fn on_complete(&self, completion: CompletionType, err: Option<Error>) {
        let (label, handlers) = {
            let mut st = self.inner.state.borrow_mut();
            (self.tx_label(&st.mutex), std::mem::take(&mut st.handlers))
        };
        match &err {
            Some(e) => debug!("{} {}: {}", label, completion, e),
            None => debug!("{} {}", label, completion),
        }
        fire_completion_handlers(&label, handlers, completion, err.as_ref(), self.inner.debug);

        let next = {
            let mut st = self.inner.state.borrow_mut();
            if st.mutex.is_active() {
                st.mutex.down(completion).ok();
            }
            st.busy = false;
            st.queue.pop_front()
        };
        if let Some(task) = next {
            trace!("{} dequeued task, {} left", self.inner.name, self.queue_depth());
            self.begin(task);
        }
    }
}

impl TxThread for SerialThread {
    fn run(
        &self,
        work: Work,
        scope: &[String],
        mode: TxMode,
        on_completed: Option<CompletionHandler>,
    ) -> Result<()> {
        validate_scope(scope)?;
        let mut st = self.inner.state.borrow_mut();

        if st.mutex.is_active_and_available() {
            let reused = match st.mutex.mode() {
                Some(active_mode) => {
                    self.inner
                        .reuse
                        .reused_tx(st.mutex.scope(), active_mode, scope, mode)
                }
                None => false,
            };
            let reusable = if reused { st.mutex.tx().cloned() } else { None };
            if let Some(tx) = reusable {
                st.handlers.extend(on_completed);
                let label = self.tx_label(&st.mutex);
                drop(st);
                trace!("{} reusing transaction for {:?}", label, scope);
                work(&tx, &label);
                return Ok(());
            }
        }

        let task = QueuedTask {
            work,
            scope: scope.to_vec(),
            mode,
            on_completed,
        };
        if st.busy || st.mutex.is_active() {
            st.queue.push_back(task);
            trace!("{} queued {:?}, depth {}", self.inner.name, scope, st.queue.len());
            return Ok(());
        }
        drop(st);
        self.begin(task);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn tx_no(&self) -> u64 {
        self.inner.state.borrow().mutex.tx_count()
    }

    fn queue_depth(&self) -> usize {
        self.inner.state.borrow().queue.len()
    }

    fn is_active(&self) -> bool {
        let st = self.inner.state.borrow();
        st.busy || st.mutex.is_active()
    }

    fn lock(&self) -> Result<()> {
        self.inner.state.borrow_mut().mutex.lock()
    }
}
