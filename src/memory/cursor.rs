use std::cell::Cell;
use std::cmp::Ordering;
use std::rc::{Rc, Weak};

use log::trace;

use super::store::{cmp_dir, Seek};
use super::tx::MemoryTx;
use super::DbInner;
use crate::backend::{CursorDesc, CursorPosition, CursorSink, PhysicalCursor, Resume};
use crate::error::{Error, Result};
use crate::key::Key;
use crate::types::TxMode;

enum Target {
    Start(Option<Resume>),
    Next,
    EffectiveKey(Key),
    PrimaryKey(Key, Key),
}

/// Physical cursor over a memory store or index. Each move computes the
/// next position immediately and reports it on a later tick.
pub(crate) struct MemoryCursor {
    db: Weak<DbInner>,
    tx: Rc<MemoryTx>,
    desc: CursorDesc,
    sink: CursorSink,
    /// (effective key, primary key) of the last position
    current: Option<(Key, Key)>,
    closed: Rc<Cell<bool>>,
}

impl MemoryCursor {
    pub fn open(
        db: &Rc<DbInner>,
        tx: Rc<MemoryTx>,
        desc: &CursorDesc,
        resume: Option<&Resume>,
        sink: CursorSink,
    ) -> Result<Self> {
        tx.check_access(&desc.store, TxMode::ReadOnly)?;
        let mut cursor = MemoryCursor {
            db: Rc::downgrade(db),
            tx,
            desc: desc.clone(),
            sink,
            current: None,
            closed: Rc::new(Cell::new(false)),
        };
        cursor.step(Target::Start(resume.cloned()), 1)?;
        Ok(cursor)
    }

    /// Where a move towards `target` starts reading.
    fn seek_for(&self, target: &Target) -> Seek {
        let reverse = self.desc.is_reverse();
        let past = |current: &(Key, Key)| {
            if self.desc.is_index() {
                Seek::Entry {
                    key: current.0.clone(),
                    primary_key: current.1.clone(),
                    inclusive: false,
                }
            } else {
                Seek::Key {
                    key: current.0.clone(),
                    inclusive: false,
                }
            }
        };
        match target {
            Target::Start(None) => Seek::Start,
            Target::Start(Some(resume)) => match (&resume.primary_key, self.desc.is_index()) {
                (Some(pk), true) => Seek::Entry {
                    key: resume.key.clone(),
                    primary_key: pk.clone(),
                    inclusive: resume.inclusive,
                },
                _ => Seek::Key {
                    key: resume.key.clone(),
                    inclusive: resume.inclusive,
                },
            },
            Target::Next => match &self.current {
                Some(current) if self.desc.is_unique() => Seek::Key {
                    key: current.0.clone(),
                    inclusive: false,
                },
                Some(current) => past(current),
                None => Seek::Start,
            },
            Target::EffectiveKey(key) => match &self.current {
                Some(current) if cmp_dir(&current.0, key, reverse) != Ordering::Less => {
                    past(current)
                }
                _ => Seek::Key {
                    key: key.clone(),
                    inclusive: true,
                },
            },
            Target::PrimaryKey(key, pk) => {
                let target = (key.clone(), pk.clone());
                match &self.current {
                    Some(current) if cmp_dir(current, &target, reverse) != Ordering::Less => {
                        past(current)
                    }
                    _ => Seek::Entry {
                        key: target.0,
                        primary_key: target.1,
                        inclusive: true,
                    },
                }
            }
        }
    }

    fn step(&mut self, target: Target, steps: u32) -> Result<()> {
        if self.closed.get() {
            return Err(Error::invalid_op(format!("cursor on {} is closed", self.desc)));
        }
        self.tx.check_access(&self.desc.store, TxMode::ReadOnly)?;
        let db = self
            .db
            .upgrade()
            .ok_or_else(|| Error::invalid_state("memory database dropped"))?;

        let position = {
            let stores = db.stores.borrow();
            let store = stores
                .get(&self.desc.store)
                .ok_or_else(|| Error::NotFound(format!("store {}", self.desc.store)))?;
            let unique = self.desc.is_unique();
            let mut entries = store.seek(&self.desc, self.seek_for(&target))?;
            let mut found = entries.next();
            for _ in 1..steps {
                let Some(last) = found.take() else { break };
                found = entries.find(|e| !unique || e.0 != last.0);
            }
            self.current = found.clone();
            found.map(|(key, primary_key)| {
                let value = if self.desc.is_key_only() {
                    None
                } else {
                    store.get(&primary_key).cloned()
                };
                CursorPosition {
                    key,
                    primary_key,
                    value,
                }
            })
        };

        self.tx.begin_op()?;
        let tx = self.tx.clone();
        let sink = self.sink.clone();
        let closed = self.closed.clone();
        trace!("memory cursor {} -> {:?}", self.desc, position.as_ref().map(|p| &p.key));
        db.event_loop.defer(move || {
            if !closed.get() {
                sink.deliver(Ok(position));
            }
            tx.end_op();
        });
        Ok(())
    }
}

impl PhysicalCursor for MemoryCursor {
    fn continue_effective_key(&mut self, key: Option<&Key>) -> Result<()> {
        match key {
            Some(key) => self.step(Target::EffectiveKey(key.clone()), 1),
            None => self.step(Target::Next, 1),
        }
    }

    fn continue_primary_key(&mut self, key: &Key, primary_key: &Key) -> Result<()> {
        if !self.desc.is_index() {
            return Err(Error::invalid_op(format!("{} is not an index cursor", self.desc)));
        }
        self.step(Target::PrimaryKey(key.clone(), primary_key.clone()), 1)
    }

    fn advance(&mut self, steps: u32) -> Result<()> {
        self.step(Target::Next, steps)
    }

    fn close(&mut self) {
        self.closed.set(true);
    }
}
