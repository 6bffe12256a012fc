use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use log::trace;

use crate::backend::{
    CursorDesc, CursorEvent, CursorPosition, CursorProvider, CursorSink, PhysicalCursor, Resume,
    TxHandle,
};
use crate::constants::{CursorFlags, MAX_ADVANCE};
use crate::error::{Error, Result};
use crate::key::Key;
use crate::value::Value;

/// Receives each position, `None` at the end of the range
pub type NextCallback = Box<dyn FnMut(Option<&CursorPosition>)>;

/// Receives a physical cursor failure
pub type FailCallback = Box<dyn FnMut(&Error)>;

#[derive(Default)]
struct CursorState {
    position: Option<CursorPosition>,
    /// Snapshot of the last position seen
    last_key: Option<Key>,
    last_primary_key: Option<Key>,
    /// Events received since open
    count: u64,
    opened: bool,
    /// A move is in flight
    pending: bool,
    done: bool,
    exited: bool,
}

struct CursorInner {
    provider: Rc<dyn CursorProvider>,
    desc: CursorDesc,
    label: String,
    state: RefCell<CursorState>,
    physical: RefCell<Option<Box<dyn PhysicalCursor>>>,
    on_next: RefCell<Option<NextCallback>>,
    on_fail: RefCell<Option<FailCallback>>,
}

/// Logical scan position over a store or index
#[derive(Clone)]
pub struct AbstractCursor {
    inner: Rc<CursorInner>,
}

impl AbstractCursor {
    pub fn new(provider: Rc<dyn CursorProvider>, desc: CursorDesc, label: impl Into<String>) -> Self {
        AbstractCursor {
            inner: Rc::new(CursorInner {
                provider,
                desc,
                label: label.into(),
                state: RefCell::new(CursorState::default()),
                physical: RefCell::new(None),
                on_next: RefCell::new(None),
                on_fail: RefCell::new(None),
            }),
        }
    }

    pub fn set_on_next(&self, cb: impl FnMut(Option<&CursorPosition>) + 'static) {
        *self.inner.on_next.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_on_fail(&self, cb: impl FnMut(&Error) + 'static) {
        *self.inner.on_fail.borrow_mut() = Some(Box::new(cb));
    }

    pub fn desc(&self) -> &CursorDesc {
        &self.inner.desc
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_index_cursor(&self) -> bool {
        self.inner.desc.is_index()
    }

    pub fn is_reverse(&self) -> bool {
        self.inner.desc.is_reverse()
    }

    /// Open the physical cursor. With `resume`, iteration continues from
    /// that position instead of the start of the range.
    pub fn open(&self, tx: &TxHandle, resume: Option<Resume>) -> Result<()> {
        {
            let mut st = self.inner.state.borrow_mut();
            if st.opened && !st.done && !st.exited {
                return Err(Error::invalid_op(format!("{} is already open", self.inner.label)));
            }
            st.position = None;
            st.count = 0;
            st.done = false;
            st.exited = false;
            st.opened = true;
            st.pending = true;
        }
        let weak = Rc::downgrade(&self.inner);
        let sink = CursorSink::new(move |event: CursorEvent| {
            if let Some(inner) = Weak::upgrade(&weak) {
                AbstractCursor { inner }.on_event(event);
            }
        });
        trace!("{} open {} resume={:?}", self.inner.label, self.inner.desc, resume);
        match self
            .inner
            .provider
            .open_cursor(tx, &self.inner.desc, resume.as_ref(), sink)
        {
            Ok(physical) => {
                *self.inner.physical.borrow_mut() = Some(physical);
                Ok(())
            }
            Err(e) => {
                let mut st = self.inner.state.borrow_mut();
                st.pending = false;
                st.opened = false;
                Err(e)
            }
        }
    }

    fn on_event(&self, event: CursorEvent) {
        match event {
            Ok(position) => {
                if let Err(e) = self.on_success(position) {
                    self.notify_fail(&e);
                }
            }
            Err(e) => {
                {
                    let mut st = self.inner.state.borrow_mut();
                    st.pending = false;
                    st.done = true;
                    st.position = None;
                }
                self.notify_fail(&e);
            }
        }
    }

    /// Record a new position reported by the physical cursor and pass it on.
    /// `None` marks the end of the range and may be reported only once.
    pub fn on_success(&self, position: Option<CursorPosition>) -> Result<()> {
        {
            let mut st = self.inner.state.borrow_mut();
            if st.exited {
                trace!("{} ignoring event after exit", self.inner.label);
                return Ok(());
            }
            if st.done {
                return Err(Error::invalid_state(format!(
                    "{} received an event after the end of its range",
                    self.inner.label
                )));
            }
            st.pending = false;
            st.count += 1;
            match position {
                Some(p) => st.position = Some(p),
                None => {
                    st.done = true;
                    st.position = None;
                }
            }
            Self::finalize(&mut st);
        }
        self.notify_next();
        Ok(())
    }

    fn finalize(st: &mut CursorState) {
        if let Some(p) = &st.position {
            st.last_key = Some(p.key.clone());
            st.last_primary_key = Some(p.primary_key.clone());
        }
    }

    fn notify_next(&self) {
        let cb = self.inner.on_next.borrow_mut().take();
        if let Some(mut cb) = cb {
            let position = self.position();
            cb(position.as_ref());
            let mut slot = self.inner.on_next.borrow_mut();
            if slot.is_none() {
                *slot = Some(cb);
            }
        }
    }

    fn notify_fail(&self, err: &Error) {
        trace!("{} failed: {}", self.inner.label, err);
        let cb = self.inner.on_fail.borrow_mut().take();
        if let Some(mut cb) = cb {
            cb(err);
            let mut slot = self.inner.on_fail.borrow_mut();
            if slot.is_none() {
                *slot = Some(cb);
            }
        }
    }

    fn begin_move(&self) -> Result<()> {
        let mut st = self.inner.state.borrow_mut();
        if !st.opened || st.done || st.exited || st.pending || st.position.is_none() {
            return Err(Error::invalid_op(format!(
                "{} has no live position",
                self.inner.label
            )));
        }
        st.pending = true;
        Ok(())
    }

    fn with_physical(&self, f: impl FnOnce(&mut dyn PhysicalCursor) -> Result<()>) -> Result<()> {
        let result = match self.inner.physical.borrow_mut().as_mut() {
            Some(physical) => f(physical.as_mut()),
            None => Err(Error::invalid_op(format!("{} is not open", self.inner.label))),
        };
        if result.is_err() {
            self.inner.state.borrow_mut().pending = false;
        }
        result
    }

    /// Move to the next position, or to the first position at or past `key`.
    pub fn continue_effective_key(&self, key: Option<&Key>) -> Result<()> {
        self.begin_move()?;
        self.with_physical(|p| p.continue_effective_key(key))
    }

    /// Move within the current effective key to the first primary key at or
    /// past `primary_key`; index cursors only.
    pub fn continue_primary_key(&self, primary_key: &Key) -> Result<()> {
        if !self.is_index_cursor() {
            return Err(Error::invalid_op(format!(
                "{} is not an index cursor",
                self.inner.label
            )));
        }
        self.begin_move()?;
        let key = self
            .key()
            .ok_or_else(|| Error::invalid_op(format!("{} has no key", self.inner.label)))?;
        self.with_physical(|p| p.continue_primary_key(&key, primary_key))
    }

    pub fn advance(&self, steps: u32) -> Result<()> {
        if steps == 0 || steps > MAX_ADVANCE {
            return Err(Error::InvalidArgument(format!("cannot advance {} steps", steps)));
        }
        self.begin_move()?;
        self.with_physical(|p| p.advance(steps))
    }

    /// Reopen from scratch in `tx`, skipping past (`key`, `primary_key`) when
    /// given. Used once the transaction the cursor was opened in has ended.
    pub fn restart(&self, tx: &TxHandle, key: Option<Key>, primary_key: Option<Key>) -> Result<()> {
        let resume = key.map(|key| Resume {
            key,
            primary_key,
            inclusive: false,
        });
        self.reopen(tx, resume)
    }

    /// Drop the physical cursor, whatever its state, and open again at `resume`.
    pub fn reopen(&self, tx: &TxHandle, resume: Option<Resume>) -> Result<()> {
        self.close_physical();
        self.inner.state.borrow_mut().opened = false;
        self.open(tx, resume)
    }

    /// Reopen right after the last position this cursor reported.
    pub fn resume(&self, tx: &TxHandle) -> Result<()> {
        let (key, primary_key) = {
            let st = self.inner.state.borrow();
            (st.last_key.clone(), st.last_primary_key.clone())
        };
        self.restart(tx, key, primary_key)
    }

    /// Finish with the cursor, keeping its last position for resumption.
    pub fn exit(&self) {
        {
            let mut st = self.inner.state.borrow_mut();
            if st.exited {
                return;
            }
            Self::finalize(&mut st);
            st.exited = true;
            st.pending = false;
        }
        trace!("{} exit after {} steps", self.inner.label, self.count());
        self.close_physical();
    }

    fn close_physical(&self) {
        let physical = self.inner.physical.borrow_mut().take();
        if let Some(mut physical) = physical {
            physical.close();
        }
    }

    /// An unopened cursor over the same store, index and range that resumes
    /// after this cursor's last position.
    pub fn clone_cursor(&self, reverse: bool) -> AbstractCursor {
        let mut desc = self.inner.desc.clone();
        if reverse {
            desc.flags.toggle(CursorFlags::REVERSE);
        }
        let copy = AbstractCursor::new(
            self.inner.provider.clone(),
            desc,
            format!("{}'", self.inner.label),
        );
        {
            let src = self.inner.state.borrow();
            let mut dst = copy.inner.state.borrow_mut();
            dst.last_key = src.last_key.clone();
            dst.last_primary_key = src.last_primary_key.clone();
        }
        copy
    }

    /// Where a resumed cursor would continue from.
    pub fn resume_position(&self) -> Option<Resume> {
        let st = self.inner.state.borrow();
        st.last_key.clone().map(|key| Resume {
            key,
            primary_key: st.last_primary_key.clone(),
            inclusive: false,
        })
    }

    pub fn position(&self) -> Option<CursorPosition> {
        self.inner.state.borrow().position.clone()
    }

    pub fn key(&self) -> Option<Key> {
        self.inner
            .state
            .borrow()
            .position
            .as_ref()
            .map(|p| p.key.clone())
    }

    pub fn primary_key(&self) -> Option<Key> {
        self.inner
            .state
            .borrow()
            .position
            .as_ref()
            .map(|p| p.primary_key.clone())
    }

    pub fn value(&self) -> Option<Value> {
        self.inner
            .state
            .borrow()
            .position
            .as_ref()
            .and_then(|p| p.value.clone())
    }

    pub fn count(&self) -> u64 {
        self.inner.state.borrow().count
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.borrow().done
    }

    pub fn is_exited(&self) -> bool {
        self.inner.state.borrow().exited
    }

    pub fn is_pending(&self) -> bool {
        self.inner.state.borrow().pending
    }
}

impl fmt::Debug for AbstractCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.borrow();
        f.debug_struct("AbstractCursor")
            .field("label", &self.inner.label)
            .field("desc", &self.inner.desc)
            .field("position", &st.position)
            .field("done", &st.done)
            .field("exited", &st.exited)
            .finish()
    }
}
