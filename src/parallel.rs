use std::cell::RefCell;
use std::rc::{Rc, Weak};

use log::{debug, trace};

use crate::backend::{Connection, TxHandle};
use crate::error::{Error, Result};
use crate::thread::{
    fire_completion_handlers, validate_scope, CompletionHandler, ReuseTx, TxThread, Work,
};
use crate::transaction::TxMutex;
use crate::types::{CompletionType, TxMode};

struct TxSlot {
    no: u64,
    mutex: TxMutex,
    handlers: Vec<CompletionHandler>,
}

type SharedSlot = Rc<RefCell<TxSlot>>;

struct ParallelState {
    /// Most recently requested transaction
    current: Option<SharedSlot>,
    /// Transactions created so far
    tx_no: u64,
    /// Transactions requested and not yet settled
    open: usize,
}

struct ParallelInner {
    conn: Rc<dyn Connection>,
    reuse: Rc<dyn ReuseTx>,
    name: String,
    debug: bool,
    max_tx: Option<usize>,
    state: RefCell<ParallelState>,
}

/// Thread allowing several native transactions at once
#[derive(Clone)]
pub struct ParallelThread {
    inner: Rc<ParallelInner>,
}

impl ParallelThread {
    pub fn new(
        conn: Rc<dyn Connection>,
        reuse: Rc<dyn ReuseTx>,
        name: impl Into<String>,
        max_tx: Option<usize>,
        debug: bool,
    ) -> Self {
        ParallelThread {
            inner: Rc::new(ParallelInner {
                conn,
                reuse,
                name: name.into(),
                debug,
                max_tx,
                state: RefCell::new(ParallelState {
                    current: None,
                    tx_no: 0,
                    open: 0,
                }),
            }),
        }
    }

    fn from_weak(weak: &Weak<ParallelInner>) -> Option<Self> {
        weak.upgrade().map(|inner| ParallelThread { inner })
    }

    fn tx_label(&self, no: u64) -> String {
        format!("{}T{}", self.inner.name, no)
    }

    /// Transactions requested and not yet settled.
    pub fn open_tx_count(&self) -> usize {
        self.inner.state.borrow().open
    }

    fn try_reuse(&self, scope: &[String], mode: TxMode) -> Option<(TxHandle, SharedSlot)> {
        let st = self.inner.state.borrow();
        let slot = st.current.as_ref()?;
        let s = slot.borrow();
        let active_mode = s.mutex.mode()?;
        if !self
            .inner
            .reuse
            .reused_tx(s.mutex.scope(), active_mode, scope, mode)
        {
            return None;
        }
        let tx = s.mutex.tx()?.clone();
        Some((tx, slot.clone()))
    }

    fn on_open(&self, slot: &SharedSlot, tx: TxHandle, scope: &[String], mode: TxMode, work: Work) {
        let label = {
            let mut s = slot.borrow_mut();
            if s.mutex.up(tx.clone(), scope, mode).is_err() {
                return;
            }
            if self.inner.reuse.locks_tx() {
                s.mutex.lock().ok();
            }
            self.tx_label(s.no)
        };
        debug!("{} open {} on {:?}", label, mode, scope);
        work(&tx, &label);
        slot.borrow_mut().mutex.exit();
    }

    fn on_complete(&self, slot: &SharedSlot, completion: CompletionType, err: Option<Error>) {
        let (label, handlers) = {
            let mut s = slot.borrow_mut();
            (self.tx_label(s.no), std::mem::take(&mut s.handlers))
        };
        debug!("{} {}", label, completion);
        fire_completion_handlers(&label, handlers, completion, err.as_ref(), self.inner.debug);

        {
            let mut s = slot.borrow_mut();
            if s.mutex.is_active() {
                s.mutex.down(completion).ok();
            }
        }
        let mut st = self.inner.state.borrow_mut();
        st.open = st.open.saturating_sub(1);
        if st
            .current
            .as_ref()
            .map_or(false, |current| Rc::ptr_eq(current, slot))
        {
            st.current = None;
        }
    }
}

impl TxThread for ParallelThread {
    fn run(
        &self,
        work: Work,
        scope: &[String],
        mode: TxMode,
        on_completed: Option<CompletionHandler>,
    ) -> Result<()> {
        validate_scope(scope)?;

        if let Some((tx, slot)) = self.try_reuse(scope, mode) {
            let label = {
                let mut s = slot.borrow_mut();
                s.handlers.extend(on_completed);
                self.tx_label(s.no)
            };
            trace!("{} reusing transaction for {:?}", label, scope);
            work(&tx, &label);
            return Ok(());
        }

        let slot = {
            let mut st = self.inner.state.borrow_mut();
            if let Some(max) = self.inner.max_tx {
                if st.tx_no as usize >= max {
                    return Err(Error::InvalidOperation(format!(
                        "{} exceeded the maximum of {} transactions",
                        self.inner.name, max
                    )));
                }
            }
            let slot = Rc::new(RefCell::new(TxSlot {
                no: st.tx_no,
                mutex: TxMutex::new(),
                handlers: on_completed.into_iter().collect(),
            }));
            st.tx_no += 1;
            st.open += 1;
            st.current = Some(slot.clone());
            slot
        };

        let weak_open = Rc::downgrade(&self.inner);
        let weak_done = weak_open.clone();
        let open_slot = slot.clone();
        let open_scope = scope.to_vec();
        let open = Box::new(move |tx: TxHandle| {
            if let Some(thread) = ParallelThread::from_weak(&weak_open) {
                thread.on_open(&open_slot, tx, &open_scope, mode, work);
            }
        });
        let done = Box::new(move |completion: CompletionType, err: Option<Error>| {
            if let Some(thread) = ParallelThread::from_weak(&weak_done) {
                thread.on_complete(&slot, completion, err);
            }
        });
        self.inner.conn.transaction(open, scope, mode, done);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.inner.name
    }

    fn tx_no(&self) -> u64 {
        self.inner.state.borrow().tx_no
    }

    fn is_active(&self) -> bool {
        self.inner.state.borrow().open > 0
    }

    fn lock(&self) -> Result<()> {
        let st = self.inner.state.borrow();
        match &st.current {
            Some(slot) => slot.borrow_mut().mutex.lock(),
            None => Err(Error::invalid_state("no transaction to lock")),
        }
    }
}
