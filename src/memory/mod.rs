//! In-memory back end. Drive it with [`EventLoop::run`].

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};

use log::{debug, trace};

mod cursor;
mod event_loop;
mod store;
mod tx;

use crate::backend::{
    Connection, CursorDesc, CursorProvider, CursorSink, Executor, Operation, Output,
    PhysicalCursor, ResultCallback, Resume, TxDone, TxHandle, TxWork,
};
use crate::error::{Error, Result};
use crate::types::{CompletionType, TxMode};
use crate::value::Value;

pub use self::event_loop::EventLoop;
pub use self::store::{IndexSchema, StoreSchema};

use self::cursor::MemoryCursor;
use self::store::{StoreData, Undo};
use self::tx::MemoryTx;

pub(crate) struct DbInner {
    event_loop: Rc<EventLoop>,
    stores: RefCell<BTreeMap<String, StoreData>>,
    /// Live transactions by id
    txs: RefCell<HashMap<u64, Weak<MemoryTx>>>,
    next_tx: Cell<u64>,
    native_abort: Cell<bool>,
}

/// Ordered-map database driven by an [`EventLoop`]
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Rc<DbInner>,
}

impl MemoryBackend {
    pub fn new(event_loop: Rc<EventLoop>) -> Self {
        MemoryBackend {
            inner: Rc::new(DbInner {
                event_loop,
                stores: RefCell::new(BTreeMap::new()),
                txs: RefCell::new(HashMap::new()),
                next_tx: Cell::new(1),
                native_abort: Cell::new(true),
            }),
        }
    }

    /// Create a back end with the given stores.
    pub fn with_stores(
        event_loop: Rc<EventLoop>,
        schemas: impl IntoIterator<Item = StoreSchema>,
    ) -> Result<Self> {
        let backend = MemoryBackend::new(event_loop);
        for schema in schemas {
            backend.create_store(schema)?;
        }
        Ok(backend)
    }

    pub fn create_store(&self, schema: StoreSchema) -> Result<()> {
        if schema.name.is_empty() {
            return Err(Error::InvalidArgument("store name is empty".into()));
        }
        let mut stores = self.inner.stores.borrow_mut();
        if stores.contains_key(&schema.name) {
            return Err(Error::Constraint(format!("store {} already exists", schema.name)));
        }
        let name = schema.name.clone();
        stores.insert(name.clone(), StoreData::new(schema)?);
        debug!("memory store {} created", name);
        Ok(())
    }

    /// Transactions opened from now on either abort natively or, when
    /// `native` is false, roll back through a failing statement.
    pub fn set_native_abort(&self, native: bool) {
        self.inner.native_abort.set(native);
    }

    pub fn event_loop(&self) -> &Rc<EventLoop> {
        &self.inner.event_loop
    }

    pub fn store_names(&self) -> Vec<String> {
        self.inner.stores.borrow().keys().cloned().collect()
    }

    /// Number of records in `store`.
    pub fn len(&self, store: &str) -> Option<usize> {
        self.inner.stores.borrow().get(store).map(StoreData::len)
    }

    /// Read a record outside of any transaction.
    pub fn peek(&self, store: &str, key: &crate::key::Key) -> Option<Value> {
        self.inner
            .stores
            .borrow()
            .get(store)
            .and_then(|s| s.get(key).cloned())
    }

    /// Transactions that have not settled yet.
    pub fn live_tx_count(&self) -> usize {
        self.inner.txs.borrow().len()
    }

    fn lookup(&self, tx: &TxHandle) -> Result<Rc<MemoryTx>> {
        self.inner
            .txs
            .borrow()
            .get(&tx.id())
            .and_then(Weak::upgrade)
            .ok_or(Error::TransactionInactive)
    }

    fn apply(&self, op: Operation, undo: &mut Vec<Undo>) -> Result<Output> {
        let mut stores = self.inner.stores.borrow_mut();
        let store = stores
            .get_mut(op.store())
            .ok_or_else(|| Error::NotFound(format!("store {}", op.store())))?;
        match op {
            Operation::Add { key, value, .. } => {
                store.insert(key, value, false, undo).map(Output::Key)
            }
            Operation::Put { key, value, .. } => {
                store.insert(key, value, true, undo).map(Output::Key)
            }
            Operation::AddAll { entries, .. } => {
                store.insert_all(entries, false, undo).map(Output::Keys)
            }
            Operation::PutAll { entries, .. } => {
                store.insert_all(entries, true, undo).map(Output::Keys)
            }
            Operation::Get { key, .. } => {
                key.validate()?;
                Ok(Output::Value(store.get(&key).cloned()))
            }
            Operation::GetAll { keys, .. } => {
                let mut records = Vec::with_capacity(keys.len());
                for key in &keys {
                    key.validate()?;
                    records.push(store.get(key).cloned());
                }
                Ok(Output::Records(records))
            }
            Operation::Keys {
                index,
                range,
                reverse,
                limit,
                ..
            } => {
                let rows = store.scan(index.as_deref(), &range, reverse, limit)?;
                Ok(Output::Keys(rows.into_iter().map(|(k, _)| k).collect()))
            }
            Operation::Values {
                index,
                range,
                reverse,
                limit,
                ..
            } => {
                let rows = store.scan(index.as_deref(), &range, reverse, limit)?;
                Ok(Output::Values(rows.into_iter().map(|(_, v)| v.clone()).collect()))
            }
            Operation::Count { index, range, .. } => {
                let rows = store.scan(index.as_deref(), &range, false, None)?;
                Ok(Output::Count(rows.len()))
            }
            Operation::Clear { .. } => {
                store.clear(undo);
                Ok(Output::None)
            }
            Operation::Remove { key, .. } => {
                key.validate()?;
                store.remove(&key, undo);
                Ok(Output::None)
            }
            Operation::RemoveRange { range, .. } => {
                Ok(Output::Count(store.remove_range(&range, undo)))
            }
        }
    }
}

impl Connection for MemoryBackend {
    fn transaction(&self, work: TxWork, store_names: &[String], mode: TxMode, on_completed: TxDone) {
        let missing = {
            let stores = self.inner.stores.borrow();
            store_names.iter().find(|s| !stores.contains_key(*s)).cloned()
        };
        if let Some(name) = missing {
            debug!("memory tx refused, no store {}", name);
            self.inner.event_loop.defer(move || {
                on_completed(
                    CompletionType::Error,
                    Some(Error::NotFound(format!("store {}", name))),
                )
            });
            return;
        }

        let id = self.inner.next_tx.get();
        self.inner.next_tx.set(id + 1);
        let tx = MemoryTx::new(
            &self.inner,
            id,
            store_names.to_vec(),
            mode,
            self.inner.native_abort.get(),
            on_completed,
        );
        self.inner.txs.borrow_mut().insert(id, Rc::downgrade(&tx));
        debug!("memory tx {} {} on {:?}", id, mode, store_names);
        self.inner.event_loop.defer(move || {
            let handle: TxHandle = tx.clone();
            work(handle);
            tx.schedule_check();
        });
    }
}

impl Executor for MemoryBackend {
    fn execute(&self, tx: &TxHandle, label: &str, op: Operation, callback: ResultCallback) {
        let started = self.lookup(tx).and_then(|mtx| {
            mtx.check_access(op.store(), op.mode())?;
            mtx.begin_op()?;
            Ok(mtx)
        });
        let mtx = match started {
            Ok(mtx) => mtx,
            Err(e) => {
                self.inner.event_loop.defer(move || callback(Err(e)));
                return;
            }
        };

        let backend = self.clone();
        let label = label.to_string();
        self.inner.event_loop.defer(move || {
            let result = if mtx.is_finished() {
                Err(Error::Aborted(format!("{} ran after its transaction ended", label)))
            } else {
                let mut undo = Vec::new();
                let result = backend.apply(op, &mut undo);
                mtx.record(undo);
                result
            };
            trace!("{} -> {}", label, if result.is_ok() { "ok" } else { "error" });
            callback(result);
            mtx.end_op();
        });
    }
}

impl CursorProvider for MemoryBackend {
    fn open_cursor(
        &self,
        tx: &TxHandle,
        desc: &CursorDesc,
        resume: Option<&Resume>,
        sink: CursorSink,
    ) -> Result<Box<dyn PhysicalCursor>> {
        let mtx = self.lookup(tx)?;
        let cursor = MemoryCursor::open(&self.inner, mtx, desc, resume, sink)?;
        Ok(Box::new(cursor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{Key, KeyRange};

    fn backend() -> MemoryBackend {
        MemoryBackend::with_stores(
            EventLoop::new(),
            [StoreSchema::new("kv"), StoreSchema::new("log").auto_increment()],
        )
        .unwrap()
    }

    fn put(key: i32, value: i64) -> Operation {
        Operation::Put {
            store: "kv".into(),
            key: Some(Key::from(key)),
            value: Value::from(value),
        }
    }

    fn run_tx(
        db: &MemoryBackend,
        mode: TxMode,
        ops: Vec<Operation>,
    ) -> (Rc<RefCell<Vec<Result<Output>>>>, Rc<RefCell<Option<CompletionType>>>) {
        let results = Rc::new(RefCell::new(Vec::new()));
        let completion = Rc::new(RefCell::new(None));
        let exec = db.clone();
        let sink = results.clone();
        let done = completion.clone();
        db.transaction(
            Box::new(move |tx| {
                for op in ops {
                    let sink = sink.clone();
                    exec.execute(&tx, "test", op, Box::new(move |r| sink.borrow_mut().push(r)));
                }
            }),
            &["kv".to_string()],
            mode,
            Box::new(move |c, _| *done.borrow_mut() = Some(c)),
        );
        (results, completion)
    }

    #[test]
    fn test_commit_after_last_operation() {
        let db = backend();
        let (results, completion) = run_tx(&db, TxMode::ReadWrite, vec![put(1, 10), put(2, 20)]);
        assert_eq!(db.live_tx_count(), 1);
        db.event_loop().run();
        assert_eq!(results.borrow().len(), 2);
        assert_eq!(*completion.borrow(), Some(CompletionType::Complete));
        assert_eq!(db.len("kv"), Some(2));
        assert_eq!(db.live_tx_count(), 0);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let db = backend();
        let (results, completion) = run_tx(&db, TxMode::ReadOnly, vec![put(1, 10)]);
        db.event_loop().run();
        assert_eq!(results.borrow()[0], Err(Error::ReadOnly));
        assert_eq!(*completion.borrow(), Some(CompletionType::Complete));
        assert_eq!(db.len("kv"), Some(0));
    }

    #[test]
    fn test_unknown_store_fails_transaction() {
        let db = backend();
        let completion = Rc::new(RefCell::new(None));
        let done = completion.clone();
        db.transaction(
            Box::new(|_: TxHandle| panic!("must not open")),
            &["nope".to_string()],
            TxMode::ReadOnly,
            Box::new(move |c, e| *done.borrow_mut() = Some((c, e))),
        );
        db.event_loop().run();
        let (c, e) = completion.borrow_mut().take().unwrap();
        assert_eq!(c, CompletionType::Error);
        assert!(matches!(e, Some(Error::NotFound(_))));
    }

    #[test]
    fn test_abort_rolls_back() {
        let db = backend();
        run_tx(&db, TxMode::ReadWrite, vec![put(1, 10)]);
        db.event_loop().run();

        let completion = Rc::new(RefCell::new(None));
        let done = completion.clone();
        let exec = db.clone();
        db.transaction(
            Box::new(move |tx| {
                let again = tx.clone();
                exec.execute(
                    &tx,
                    "w",
                    put(1, 99),
                    Box::new(move |r| {
                        assert!(r.is_ok());
                        again.abort().unwrap();
                    }),
                );
                exec.execute(&tx, "w2", put(2, 20), Box::new(|_| {}));
            }),
            &["kv".to_string()],
            TxMode::ReadWrite,
            Box::new(move |c, _| *done.borrow_mut() = Some(c)),
        );
        db.event_loop().run();
        assert_eq!(*completion.borrow(), Some(CompletionType::Abort));
        assert_eq!(db.peek("kv", &Key::from(1)), Some(Value::from(10i64)));
        assert_eq!(db.peek("kv", &Key::from(2)), None);
    }

    #[test]
    fn test_failing_statement_rolls_back() {
        let db = backend();
        db.set_native_abort(false);
        let completion = Rc::new(RefCell::new(None));
        let done = completion.clone();
        let exec = db.clone();
        db.transaction(
            Box::new(move |tx| {
                assert!(!tx.has_native_abort());
                assert!(tx.abort().is_err());
                let again = tx.clone();
                exec.execute(
                    &tx,
                    "w",
                    put(7, 70),
                    Box::new(move |_| again.fail_statement().unwrap()),
                );
            }),
            &["kv".to_string()],
            TxMode::ReadWrite,
            Box::new(move |c, e| *done.borrow_mut() = Some((c, e.is_some()))),
        );
        db.event_loop().run();
        assert_eq!(*completion.borrow(), Some((CompletionType::Error, true)));
        assert_eq!(db.len("kv"), Some(0));
    }

    #[test]
    fn test_range_operations() {
        let db = backend();
        let ops = (1..=6).map(|i| put(i, i as i64)).collect();
        run_tx(&db, TxMode::ReadWrite, ops);
        db.event_loop().run();

        let (results, _) = run_tx(
            &db,
            TxMode::ReadWrite,
            vec![
                Operation::Keys {
                    store: "kv".into(),
                    index: None,
                    range: KeyRange::bound(2, 5, false, true).unwrap(),
                    reverse: true,
                    limit: None,
                },
                Operation::RemoveRange {
                    store: "kv".into(),
                    range: KeyRange::upper_bound(3, false),
                },
                Operation::Count {
                    store: "kv".into(),
                    index: None,
                    range: KeyRange::all(),
                },
            ],
        );
        db.event_loop().run();
        let results = results.borrow();
        assert_eq!(
            results[0],
            Ok(Output::Keys(vec![Key::from(4), Key::from(3), Key::from(2)]))
        );
        assert_eq!(results[1], Ok(Output::Count(3)));
        assert_eq!(results[2], Ok(Output::Count(3)));
    }
}
