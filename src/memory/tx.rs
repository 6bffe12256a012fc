use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use log::{debug, trace};

use super::store::{apply_undo, Undo};
use super::DbInner;
use crate::backend::{NativeTx, TxDone};
use crate::constants::TxFlags;
use crate::error::{Error, Result};
use crate::types::{CompletionType, TxMode};

pub(crate) struct MemoryTx {
    id: u64,
    mode: TxMode,
    scope: Vec<String>,
    flags: Cell<TxFlags>,
    /// Operations and cursor moves in flight
    pending: Cell<usize>,
    check_scheduled: Cell<bool>,
    undo: RefCell<Vec<Undo>>,
    on_completed: RefCell<Option<TxDone>>,
    native_abort: bool,
    db: Weak<DbInner>,
    me: Weak<MemoryTx>,
}

impl MemoryTx {
    pub fn new(
        db: &Rc<DbInner>,
        id: u64,
        scope: Vec<String>,
        mode: TxMode,
        native_abort: bool,
        on_completed: TxDone,
    ) -> Rc<Self> {
        let mut flags = TxFlags::empty();
        if mode == TxMode::ReadOnly {
            flags |= TxFlags::RDONLY;
        }
        Rc::new_cyclic(|me| MemoryTx {
            id,
            mode,
            scope,
            flags: Cell::new(flags),
            pending: Cell::new(0),
            check_scheduled: Cell::new(false),
            undo: RefCell::new(Vec::new()),
            on_completed: RefCell::new(Some(on_completed)),
            native_abort,
            db: Rc::downgrade(db),
            me: me.clone(),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.flags.get().contains(TxFlags::FINISHED)
    }

    fn set_flag(&self, flag: TxFlags) {
        self.flags.set(self.flags.get() | flag);
    }

    /// Check that `store` may be touched with `mode` in this transaction.
    pub fn check_access(&self, store: &str, mode: TxMode) -> Result<()> {
        if self.is_finished() {
            return Err(Error::TransactionInactive);
        }
        if !self.scope.iter().any(|s| s == store) {
            return Err(Error::NotFound(format!(
                "store {} is not in the scope of transaction {}",
                store, self.id
            )));
        }
        if !self.mode.covers(mode) {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Register an operation that will finish on a later tick.
    pub fn begin_op(&self) -> Result<()> {
        if self.is_finished() {
            return Err(Error::TransactionInactive);
        }
        self.pending.set(self.pending.get() + 1);
        Ok(())
    }

    pub fn end_op(&self) {
        self.pending.set(self.pending.get().saturating_sub(1));
        self.schedule_check();
    }

    pub fn record(&self, undo: Vec<Undo>) {
        if !undo.is_empty() {
            self.set_flag(TxFlags::DIRTY);
            self.undo.borrow_mut().extend(undo);
        }
    }

    /// Commit on a later tick unless new work arrives first.
    pub fn schedule_check(&self) {
        if self.check_scheduled.get() || self.is_finished() {
            return;
        }
        let (Some(db), Some(me)) = (self.db.upgrade(), self.me.upgrade()) else {
            return;
        };
        self.check_scheduled.set(true);
        db.event_loop.defer(move || me.check_complete());
    }

    fn check_complete(&self) {
        self.check_scheduled.set(false);
        if self.is_finished() || self.pending.get() > 0 {
            return;
        }
        self.set_flag(TxFlags::FINISHED);
        let writes = self.undo.borrow().len();
        self.undo.borrow_mut().clear();
        debug!("memory tx {} committed, {} changes", self.id, writes);
        self.finish(CompletionType::Complete, None);
    }

    fn rollback(&self) {
        let undo = std::mem::take(&mut *self.undo.borrow_mut());
        let Some(db) = self.db.upgrade() else {
            return;
        };
        apply_undo(&mut db.stores.borrow_mut(), undo);
        trace!("memory tx {} rolled back", self.id);
    }

    fn finish(&self, completion: CompletionType, err: Option<Error>) {
        let done = self.on_completed.borrow_mut().take();
        if let Some(db) = self.db.upgrade() {
            db.txs.borrow_mut().remove(&self.id);
        }
        if let Some(done) = done {
            done(completion, err);
        }
    }

    fn fail_with(&self, completion: CompletionType, flag: TxFlags, err: Error) {
        self.set_flag(TxFlags::FINISHED | flag);
        self.rollback();
        debug!("memory tx {} {}: {}", self.id, completion, err);
        let Some(db) = self.db.upgrade() else {
            return self.finish(completion, Some(err));
        };
        let Some(me) = self.me.upgrade() else {
            return;
        };
        db.event_loop.defer(move || me.finish(completion, Some(err)));
    }
}

impl NativeTx for MemoryTx {
    fn id(&self) -> u64 {
        self.id
    }

    fn mode(&self) -> TxMode {
        self.mode
    }

    fn scope(&self) -> Vec<String> {
        self.scope.clone()
    }

    fn is_active(&self) -> bool {
        !self.is_finished()
    }

    fn has_native_abort(&self) -> bool {
        self.native_abort
    }

    fn abort(&self) -> Result<()> {
        if !self.native_abort {
            return Err(Error::NotSupported("abort".into()));
        }
        if self.is_finished() {
            return Err(Error::TransactionInactive);
        }
        self.fail_with(
            CompletionType::Abort,
            TxFlags::ABORTED,
            Error::Aborted(format!("transaction {} aborted", self.id)),
        );
        Ok(())
    }

    fn fail_statement(&self) -> Result<()> {
        self.begin_op()?;
        let (Some(db), Some(me)) = (self.db.upgrade(), self.me.upgrade()) else {
            return Err(Error::TransactionInactive);
        };
        db.event_loop.defer(move || {
            me.pending.set(me.pending.get().saturating_sub(1));
            if !me.is_finished() {
                me.fail_with(
                    CompletionType::Error,
                    TxFlags::ERROR,
                    Error::Backend(format!("statement failed in transaction {}", me.id)),
                );
            }
        });
        Ok(())
    }
}

impl fmt::Debug for MemoryTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTx")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("scope", &self.scope)
            .field("flags", &self.flags.get())
            .field("pending", &self.pending.get())
            .finish()
    }
}
