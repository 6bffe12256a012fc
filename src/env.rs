use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use log::{debug, warn};

use crate::backend::{Connection, CursorProvider, Executor, Operation, TxHandle};
use crate::constants::{DEFAULT_THREAD_NAME, MAX_TX_LIMIT};
use crate::database::Store;
use crate::error::{Error, Result};
use crate::key::{Key, KeyRange};
use crate::parallel::ParallelThread;
use crate::query::{self, Query};
use crate::request::Request;
use crate::serial::SerialThread;
use crate::thread::{CompletionHandler, ReuseTx, TxThread, Work};
use crate::types::{CompletionType, Method, TxMode, TxPolicy};
use crate::value::Value;

/// How requests are mapped onto native transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadKind {
    /// One transaction at a time, the rest queued in order
    #[default]
    Serial,
    /// Transactions may overlap
    Parallel,
}

/// Environment configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    name: String,
    thread_kind: ThreadKind,
    policy: TxPolicy,
    max_tx: Option<usize>,
    debug: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            name: DEFAULT_THREAD_NAME.to_string(),
            thread_kind: ThreadKind::default(),
            policy: TxPolicy::default(),
            max_tx: None,
            debug: false,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the thread name used as the prefix of request labels
    pub fn set_name(&mut self, name: &str) -> Result<()> {
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(Error::InvalidArgument(format!("invalid thread name {:?}", name)));
        }
        self.name = name.to_string();
        Ok(())
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    /// Choose between a serial and a parallel thread
    pub fn set_thread_kind(&mut self, kind: ThreadKind) -> Result<()> {
        if self.max_tx.is_some() && kind == ThreadKind::Serial {
            return Err(Error::InvalidArgument(
                "a transaction limit needs a parallel thread".into(),
            ));
        }
        self.thread_kind = kind;
        Ok(())
    }

    pub fn get_thread_kind(&self) -> ThreadKind {
        self.thread_kind
    }

    /// Set the transaction reuse policy
    pub fn set_policy(&mut self, policy: TxPolicy) -> Result<()> {
        self.policy = policy;
        Ok(())
    }

    pub fn get_policy(&self) -> TxPolicy {
        self.policy
    }

    /// Limit the number of transactions a parallel thread may create
    ///
    /// Once the limit is reached further requests fail with
    /// `Error::InvalidOperation`.
    pub fn set_max_tx(&mut self, max: usize) -> Result<()> {
        // Validate input
        if max == 0 || max > MAX_TX_LIMIT {
            return Err(Error::InvalidArgument(format!(
                "transaction limit must be between 1 and {}",
                MAX_TX_LIMIT
            )));
        }
        if self.thread_kind != ThreadKind::Parallel {
            return Err(Error::InvalidArgument(
                "a transaction limit needs a parallel thread".into(),
            ));
        }
        self.max_tx = Some(max);
        Ok(())
    }

    pub fn get_max_tx(&self) -> Option<usize> {
        self.max_tx
    }

    /// Panic on completion handler errors instead of logging them
    pub fn set_debug(&mut self, debug: bool) -> Result<()> {
        self.debug = debug;
        Ok(())
    }

    pub fn get_debug(&self) -> bool {
        self.debug
    }
}

struct EnvInner {
    options: Options,
    thread: Rc<dyn TxThread>,
    executor: Rc<dyn Executor>,
    cursors: Rc<dyn CursorProvider>,
    /// Requests issued so far
    request_no: Cell<u64>,
}

/// Entry point: issues requests against a back end through one thread
#[derive(Clone)]
pub struct Environment {
    inner: Rc<EnvInner>,
}

impl Environment {
    /// Create an environment over `backend`
    pub fn new<B>(backend: Rc<B>, options: Options) -> Self
    where
        B: Connection + Executor + CursorProvider + 'static,
    {
        let conn: Rc<dyn Connection> = backend.clone();
        let reuse: Rc<dyn ReuseTx> = Rc::new(options.policy);
        let thread: Rc<dyn TxThread> = match options.thread_kind {
            ThreadKind::Serial => Rc::new(SerialThread::new(
                conn,
                reuse,
                options.name.clone(),
                options.debug,
            )),
            ThreadKind::Parallel => Rc::new(ParallelThread::new(
                conn,
                reuse,
                options.name.clone(),
                options.max_tx,
                options.debug,
            )),
        };
        debug!(
            "environment {} {:?} thread, {:?} policy",
            options.name, options.thread_kind, options.policy
        );
        Environment {
            inner: Rc::new(EnvInner {
                options,
                thread,
                executor: backend.clone(),
                cursors: backend,
                request_no: Cell::new(0),
            }),
        }
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    pub fn thread(&self) -> &Rc<dyn TxThread> {
        &self.inner.thread
    }

    /// Handle on one object store
    pub fn store(&self, name: &str) -> Store {
        Store::new(self.clone(), name)
    }

    fn next_request_no(&self) -> u64 {
        let n = self.inner.request_no.get();
        self.inner.request_no.set(n + 1);
        n
    }

    /// Schedule `op`; the returned request settles with its result.
    pub fn request(&self, op: Operation) -> Request {
        let method = op.method();
        if let Err(e) = op.validate() {
            return Request::settled(method, Err(e));
        }
        let scope = vec![op.store().to_string()];
        let executor = self.inner.executor.clone();
        self.schedule(method, scope, op.mode(), move |req, tx, label| {
            let done = req.clone();
            executor.execute(tx, label, op, Box::new(move |result| done.set_db_value(result)));
        })
    }

    /// Run `query` in a read-only transaction over every store it scans.
    pub fn query(&self, query: Query) -> Request {
        if let Err(e) = query.validate() {
            return Request::settled(Method::Query, Err(e));
        }
        let scope = query.scope();
        let cursors = self.inner.cursors.clone();
        self.schedule(Method::Query, scope, TxMode::ReadOnly, move |req, tx, label| {
            query::start(query, cursors, tx, label, req.clone());
        })
    }

    fn schedule(
        &self,
        method: Method,
        scope: Vec<String>,
        mode: TxMode,
        start: impl FnOnce(&Request, &TxHandle, &str) + 'static,
    ) -> Request {
        let n = self.next_request_no();
        let req = Request::new(method, format!("{}R{}", self.inner.options.name, n));

        let work_req = req.clone();
        let work: Work = Box::new(move |tx, tx_label| {
            let label = format!("{}R{}", tx_label, n);
            if let Err(e) = work_req.set_tx(tx, &label) {
                warn!("{}: {}", work_req.label(), e);
                return;
            }
            start(&work_req, tx, &label);
        });

        let done_req = req.clone();
        let on_completed: CompletionHandler = Box::new(move |completion, err| {
            if completion != CompletionType::Complete && done_req.is_pending() {
                let err = err.cloned().unwrap_or_else(|| {
                    Error::Aborted(format!("transaction ended with {}", completion))
                });
                done_req.set_db_value(Err(err));
            }
            Ok(())
        });

        if let Err(e) = self.inner.thread.run(work, &scope, mode, Some(on_completed)) {
            req.set_db_value(Err(e));
        }
        req
    }

    /// Get a value by key
    pub fn get(&self, store: &str, key: impl Into<Key>) -> Request {
        self.request(Operation::Get {
            store: store.to_string(),
            key: key.into(),
        })
    }

    /// Get several values, `None` for missing keys
    pub fn get_all(&self, store: &str, keys: Vec<Key>) -> Request {
        self.request(Operation::GetAll {
            store: store.to_string(),
            keys,
        })
    }

    /// Insert or replace a record
    pub fn put(&self, store: &str, key: Option<Key>, value: Value) -> Request {
        self.request(Operation::Put {
            store: store.to_string(),
            key,
            value,
        })
    }

    pub fn put_all(&self, store: &str, entries: Vec<(Option<Key>, Value)>) -> Request {
        self.request(Operation::PutAll {
            store: store.to_string(),
            entries,
        })
    }

    /// Insert a record, failing if the key exists
    pub fn add(&self, store: &str, key: Option<Key>, value: Value) -> Request {
        self.request(Operation::Add {
            store: store.to_string(),
            key,
            value,
        })
    }

    pub fn add_all(&self, store: &str, entries: Vec<(Option<Key>, Value)>) -> Request {
        self.request(Operation::AddAll {
            store: store.to_string(),
            entries,
        })
    }

    pub fn count(&self, store: &str, range: KeyRange) -> Request {
        self.request(Operation::Count {
            store: store.to_string(),
            index: None,
            range,
        })
    }

    pub fn keys(&self, store: &str, range: KeyRange) -> Request {
        self.request(Operation::Keys {
            store: store.to_string(),
            index: None,
            range,
            reverse: false,
            limit: None,
        })
    }

    pub fn values(&self, store: &str, range: KeyRange) -> Request {
        self.request(Operation::Values {
            store: store.to_string(),
            index: None,
            range,
            reverse: false,
            limit: None,
        })
    }

    pub fn clear(&self, store: &str) -> Request {
        self.request(Operation::Clear {
            store: store.to_string(),
        })
    }

    /// Delete a record
    pub fn remove(&self, store: &str, key: impl Into<Key>) -> Request {
        self.request(Operation::Remove {
            store: store.to_string(),
            key: key.into(),
        })
    }

    pub fn remove_range(&self, store: &str, range: KeyRange) -> Request {
        self.request(Operation::RemoveRange {
            store: store.to_string(),
            range,
        })
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("options", &self.inner.options)
            .field("requests", &self.inner.request_no.get())
            .field("queued", &self.inner.thread.queue_depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_defaults() {
        let opts = Options::new();
        assert_eq!(opts.get_name(), "T0");
        assert_eq!(opts.get_thread_kind(), ThreadKind::Serial);
        assert_eq!(opts.get_policy(), TxPolicy::Single);
        assert_eq!(opts.get_max_tx(), None);
        assert!(!opts.get_debug());
    }

    #[test]
    fn test_options_validation() {
        let mut opts = Options::new();
        assert!(opts.set_name("").is_err());
        assert!(opts.set_name("two words").is_err());
        opts.set_name("W1").unwrap();
        assert_eq!(opts.get_name(), "W1");

        // a limit only makes sense for overlapping transactions
        assert!(opts.set_max_tx(4).is_err());
        opts.set_thread_kind(ThreadKind::Parallel).unwrap();
        assert!(opts.set_max_tx(0).is_err());
        assert!(opts.set_max_tx(MAX_TX_LIMIT + 1).is_err());
        opts.set_max_tx(4).unwrap();
        assert_eq!(opts.get_max_tx(), Some(4));
        assert!(opts.set_thread_kind(ThreadKind::Serial).is_err());
    }
}
