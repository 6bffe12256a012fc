use std::fmt;
use std::rc::Rc;

use crate::constants::CursorFlags;
use crate::error::{Error, Result};
use crate::key::{Key, KeyRange};
use crate::types::{CompletionType, Method, TxMode};
use crate::value::Value;

/// Shared handle to an open native transaction
pub type TxHandle = Rc<dyn NativeTx>;

/// Work to run once a native transaction is open
pub type TxWork = Box<dyn FnOnce(TxHandle)>;

/// Called exactly once when a native transaction settles
pub type TxDone = Box<dyn FnOnce(CompletionType, Option<Error>)>;

/// Called exactly once with the result of an operation
pub type ResultCallback = Box<dyn FnOnce(Result<Output>)>;

/// A native transaction
pub trait NativeTx {
    fn id(&self) -> u64;

    fn mode(&self) -> TxMode;

    fn scope(&self) -> Vec<String>;

    /// Returns true while the transaction accepts new requests.
    fn is_active(&self) -> bool;

    /// Returns false for back ends without an abort primitive.
    fn has_native_abort(&self) -> bool {
        true
    }

    fn abort(&self) -> Result<()>;

    /// Issue a statement that is certain to fail so the surrounding
    /// transaction rolls back.
    fn fail_statement(&self) -> Result<()> {
        Err(Error::NotSupported("failing statement".into()))
    }
}

/// Opens native transactions. A connection still opening holds the first
/// `transaction` call until it can serve it.
pub trait Connection {
    /// Open a transaction over `store_names` and call `work` with it.
    /// `on_completed` fires exactly once, even when the transaction never
    /// opened.
    fn transaction(&self, work: TxWork, store_names: &[String], mode: TxMode, on_completed: TxDone);
}

/// A storage operation
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Add {
        store: String,
        key: Option<Key>,
        value: Value,
    },
    AddAll {
        store: String,
        entries: Vec<(Option<Key>, Value)>,
    },
    Put {
        store: String,
        key: Option<Key>,
        value: Value,
    },
    PutAll {
        store: String,
        entries: Vec<(Option<Key>, Value)>,
    },
    Get {
        store: String,
        key: Key,
    },
    GetAll {
        store: String,
        keys: Vec<Key>,
    },
    Keys {
        store: String,
        index: Option<String>,
        range: KeyRange,
        reverse: bool,
        limit: Option<usize>,
    },
    Values {
        store: String,
        index: Option<String>,
        range: KeyRange,
        reverse: bool,
        limit: Option<usize>,
    },
    Count {
        store: String,
        index: Option<String>,
        range: KeyRange,
    },
    Clear {
        store: String,
    },
    Remove {
        store: String,
        key: Key,
    },
    RemoveRange {
        store: String,
        range: KeyRange,
    },
}

impl Operation {
    pub fn method(&self) -> Method {
        match self {
            Operation::Add { .. } => Method::Add,
            Operation::AddAll { .. } => Method::AddAll,
            Operation::Put { .. } => Method::Put,
            Operation::PutAll { .. } => Method::PutAll,
            Operation::Get { .. } => Method::Get,
            Operation::GetAll { .. } => Method::GetAll,
            Operation::Keys { .. } => Method::Keys,
            Operation::Values { .. } => Method::Values,
            Operation::Count { .. } => Method::Count,
            Operation::Clear { .. } => Method::Clear,
            Operation::Remove { .. } => Method::Remove,
            Operation::RemoveRange { .. } => Method::RemoveRange,
        }
    }

    pub fn store(&self) -> &str {
        match self {
            Operation::Add { store, .. }
            | Operation::AddAll { store, .. }
            | Operation::Put { store, .. }
            | Operation::PutAll { store, .. }
            | Operation::Get { store, .. }
            | Operation::GetAll { store, .. }
            | Operation::Keys { store, .. }
            | Operation::Values { store, .. }
            | Operation::Count { store, .. }
            | Operation::Clear { store }
            | Operation::Remove { store, .. }
            | Operation::RemoveRange { store, .. } => store,
        }
    }

    pub fn mode(&self) -> TxMode {
        self.method().mode()
    }

    /// Check the arguments before the operation is scheduled.
    pub fn validate(&self) -> Result<()> {
        if self.store().is_empty() {
            return Err(Error::InvalidArgument("store name is empty".into()));
        }
        match self {
            Operation::Add { key, .. } | Operation::Put { key, .. } => {
                key.iter().try_for_each(Key::validate)
            }
            Operation::AddAll { entries, .. } | Operation::PutAll { entries, .. } => entries
                .iter()
                .filter_map(|(key, _)| key.as_ref())
                .try_for_each(Key::validate),
            Operation::Get { key, .. } | Operation::Remove { key, .. } => key.validate(),
            Operation::GetAll { keys, .. } => keys.iter().try_for_each(Key::validate),
            Operation::Keys { limit: Some(0), .. } | Operation::Values { limit: Some(0), .. } => {
                Err(Error::InvalidArgument("limit must be positive".into()))
            }
            _ => Ok(()),
        }
    }
}

/// Result of an operation
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    None,
    Key(Key),
    Keys(Vec<Key>),
    Value(Option<Value>),
    Values(Vec<Value>),
    Records(Vec<Option<Value>>),
    Count(usize),
}

impl Output {
    pub fn into_key(self) -> Result<Key> {
        match self {
            Output::Key(key) => Ok(key),
            other => Err(mismatch("key", &other)),
        }
    }

    pub fn into_keys(self) -> Result<Vec<Key>> {
        match self {
            Output::Keys(keys) => Ok(keys),
            other => Err(mismatch("keys", &other)),
        }
    }

    pub fn into_value(self) -> Result<Option<Value>> {
        match self {
            Output::Value(value) => Ok(value),
            other => Err(mismatch("value", &other)),
        }
    }

    pub fn into_values(self) -> Result<Vec<Value>> {
        match self {
            Output::Values(values) => Ok(values),
            other => Err(mismatch("values", &other)),
        }
    }

    pub fn into_count(self) -> Result<usize> {
        match self {
            Output::Count(n) => Ok(n),
            other => Err(mismatch("count", &other)),
        }
    }
}

fn mismatch(expected: &str, got: &Output) -> Error {
    Error::InvalidState(format!("expected {} output, got {:?}", expected, got))
}

/// Runs operations inside an open transaction
pub trait Executor {
    fn execute(&self, tx: &TxHandle, label: &str, op: Operation, callback: ResultCallback);
}

/// What a cursor iterates over
#[derive(Debug, Clone, PartialEq)]
pub struct CursorDesc {
    pub store: String,
    pub index: Option<String>,
    pub range: KeyRange,
    pub flags: CursorFlags,
}

impl CursorDesc {
    pub fn new(store: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            index: None,
            range: KeyRange::all(),
            flags: CursorFlags::empty(),
        }
    }

    pub fn is_reverse(&self) -> bool {
        self.flags.contains(CursorFlags::REVERSE)
    }

    pub fn is_unique(&self) -> bool {
        self.flags.contains(CursorFlags::UNIQUE)
    }

    pub fn is_key_only(&self) -> bool {
        self.flags.contains(CursorFlags::KEY_ONLY)
    }

    pub fn is_index(&self) -> bool {
        self.index.is_some()
    }
}

impl fmt::Display for CursorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.index {
            Some(index) => write!(f, "{}:{}", self.store, index)?,
            None => write!(f, "{}", self.store)?,
        }
        if self.is_reverse() {
            write!(f, "<")?;
        }
        Ok(())
    }
}

/// One cursor position
#[derive(Debug, Clone, PartialEq)]
pub struct CursorPosition {
    /// Effective key: the index key for index cursors, the primary key otherwise
    pub key: Key,
    pub primary_key: Key,
    pub value: Option<Value>,
}

/// Where a reopened cursor continues from
#[derive(Debug, Clone, PartialEq)]
pub struct Resume {
    pub key: Key,
    pub primary_key: Option<Key>,
    /// Include the given position itself instead of skipping it
    pub inclusive: bool,
}

/// Physical cursor event: a position, `None` at the end of the range, or a failure
pub type CursorEvent = Result<Option<CursorPosition>>;

/// Receives events from a physical cursor
#[derive(Clone)]
pub struct CursorSink(Rc<dyn Fn(CursorEvent)>);

impl CursorSink {
    pub fn new(f: impl Fn(CursorEvent) + 'static) -> Self {
        CursorSink(Rc::new(f))
    }

    pub fn deliver(&self, event: CursorEvent) {
        (self.0)(event)
    }
}

impl fmt::Debug for CursorSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CursorSink")
    }
}

/// A native forward-only cursor. Each move eventually produces exactly one
/// event on the sink it was opened with.
pub trait PhysicalCursor {
    /// Move to the next position, or to the first position at or past `key`.
    fn continue_effective_key(&mut self, key: Option<&Key>) -> Result<()>;

    /// Move to the first position at or past (`key`, `primary_key`).
    fn continue_primary_key(&mut self, key: &Key, primary_key: &Key) -> Result<()>;

    fn advance(&mut self, steps: u32) -> Result<()>;

    fn close(&mut self);
}

/// Opens physical cursors. Events must be delivered after `open_cursor` and
/// each move call have returned, never from inside them.
pub trait CursorProvider {
    /// Open a cursor over `desc`. The first event reports the first position
    /// in range, or the first position after `resume` when given.
    fn open_cursor(
        &self,
        tx: &TxHandle,
        desc: &CursorDesc,
        resume: Option<&Resume>,
        sink: CursorSink,
    ) -> Result<Box<dyn PhysicalCursor>>;
}
