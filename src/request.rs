use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use log::{debug, warn};
use once_cell::unsync::OnceCell;

use crate::backend::{NativeTx, Output, TxHandle};
use crate::error::{Error, Result};
use crate::types::{Method, ReadyState};

/// Success value or failure of an operation
pub type Outcome = Result<Output>;

/// Re-enters the transformer chain with a new outcome
pub type Continuation = Box<dyn FnOnce(Outcome)>;

/// Post-resolution value transformer
pub type Transformer = Box<dyn FnOnce(Outcome, Continuation)>;

type TxReady = Box<dyn FnOnce(&TxHandle)>;
type Listener = Box<dyn FnOnce(&Outcome)>;

struct RequestState {
    method: Method,
    state: ReadyState,
    tx: Option<Weak<dyn NativeTx>>,
    /// Id of the transaction once attached; set at most once
    attached: OnceCell<u64>,
    label: String,
    transformers: VecDeque<Transformer>,
    txbacks: Vec<TxReady>,
    listeners: Vec<Listener>,
    outcome: Option<Outcome>,
    /// The transformer chain is running
    settling: bool,
}

/// A pending or completed operation
#[derive(Clone)]
pub struct Request {
    inner: Rc<RefCell<RequestState>>,
}

impl Request {
    pub fn new(method: Method, label: impl Into<String>) -> Self {
        Request {
            inner: Rc::new(RefCell::new(RequestState {
                method,
                state: ReadyState::Pending,
                tx: None,
                attached: OnceCell::new(),
                label: label.into(),
                transformers: VecDeque::new(),
                txbacks: Vec::new(),
                listeners: Vec::new(),
                outcome: None,
                settling: false,
            })),
        }
    }

    /// A request that is already settled, for failures detected before any
    /// transaction was involved.
    pub fn settled(method: Method, outcome: Outcome) -> Self {
        let req = Request::new(method, "-");
        req.set_db_value(outcome);
        req
    }

    pub fn method(&self) -> Method {
        self.inner.borrow().method
    }

    pub fn ready_state(&self) -> ReadyState {
        self.inner.borrow().state
    }

    pub fn is_pending(&self) -> bool {
        self.ready_state() == ReadyState::Pending
    }

    /// The settled outcome, if any.
    pub fn outcome(&self) -> Option<Outcome> {
        self.inner.borrow().outcome.clone()
    }

    /// Attach the transaction this request runs in. Queued tx-ready
    /// callbacks fire immediately, in registration order.
    pub fn set_tx(&self, tx: &TxHandle, label: &str) -> Result<()> {
        let txbacks = {
            let mut st = self.inner.borrow_mut();
            if st.state != ReadyState::Pending {
                return Err(Error::invalid_state(format!(
                    "{}:{} already resolved",
                    st.method, st.label
                )));
            }
            if st.attached.set(tx.id()).is_err() {
                return Err(Error::invalid_state(format!(
                    "{}:{} already has a transaction",
                    st.method, st.label
                )));
            }
            st.tx = Some(Rc::downgrade(tx));
            st.label = label.to_string();
            std::mem::take(&mut st.txbacks)
        };
        for txback in txbacks {
            txback(tx);
        }
        Ok(())
    }

    /// Run `f` with the transaction as soon as one is attached.
    pub fn add_txback(&self, f: impl FnOnce(&TxHandle) + 'static) {
        match self.tx() {
            Some(tx) => f(&tx),
            None => self.inner.borrow_mut().txbacks.push(Box::new(f)),
        }
    }

    /// The attached transaction while it is still alive.
    pub fn tx(&self) -> Option<TxHandle> {
        self.inner.borrow().tx.as_ref().and_then(Weak::upgrade)
    }

    /// Register a transformer. Transformers must be added before the
    /// request resolves.
    pub fn await_with(
        &self,
        transformer: impl FnOnce(Outcome, Continuation) + 'static,
    ) -> Result<()> {
        let mut st = self.inner.borrow_mut();
        if st.state != ReadyState::Pending {
            return Err(Error::invalid_state(format!(
                "{}:{} already resolved",
                st.method, st.label
            )));
        }
        st.transformers.push_back(Box::new(transformer));
        Ok(())
    }

    /// Feed the raw back end result into the transformer chain.
    /// Ignored once the request has settled or while the chain is running.
    pub fn set_db_value(&self, outcome: Outcome) {
        {
            let mut st = self.inner.borrow_mut();
            if st.state != ReadyState::Pending || st.settling {
                warn!("{}:{} received a second result, ignored", st.method, st.label);
                return;
            }
            st.settling = true;
        }
        self.settle(outcome);
    }

    fn settle(&self, outcome: Outcome) {
        let next = self.inner.borrow_mut().transformers.pop_front();
        match next {
            Some(transformer) => {
                let me = self.clone();
                transformer(outcome, Box::new(move |o| me.settle(o)));
            }
            None => self.resolve(outcome),
        }
    }

    fn resolve(&self, outcome: Outcome) {
        let listeners = {
            let mut st = self.inner.borrow_mut();
            st.state = if outcome.is_ok() {
                ReadyState::Resolved
            } else {
                ReadyState::Rejected
            };
            st.tx = None;
            st.txbacks.clear();
            st.settling = false;
            st.outcome = Some(outcome.clone());
            std::mem::take(&mut st.listeners)
        };
        for listener in listeners {
            listener(&outcome);
        }
    }

    /// Call `f` with the outcome once settled.
    pub fn always(&self, f: impl FnOnce(&Outcome) + 'static) {
        let settled = self.inner.borrow().outcome.clone();
        match settled {
            Some(outcome) => f(&outcome),
            None => self.inner.borrow_mut().listeners.push(Box::new(f)),
        }
    }

    pub fn done(&self, f: impl FnOnce(&Output) + 'static) {
        self.always(move |outcome| {
            if let Ok(output) = outcome {
                f(output)
            }
        });
    }

    pub fn fail(&self, f: impl FnOnce(&Error) + 'static) {
        self.always(move |outcome| {
            if let Err(err) = outcome {
                f(err)
            }
        });
    }

    pub fn can_abort(&self) -> bool {
        self.tx().is_some()
    }

    /// Abort the attached transaction. Back ends without a native abort get a
    /// failing statement, which rolls the transaction back on a best-effort
    /// basis.
    pub fn abort(&self) -> Result<()> {
        let tx = self.tx().ok_or_else(|| {
            Error::invalid_state(format!("{} has no transaction to abort", self.label()))
        })?;
        debug!("{} aborting transaction {}", self.label(), tx.id());
        if tx.has_native_abort() {
            tx.abort()
        } else {
            tx.fail_statement()
        }
    }

    /// Diagnostic label, e.g. `GET:T0T3R5`.
    pub fn label(&self) -> String {
        let st = self.inner.borrow();
        format!("{}:{}", st.method, st.label)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.borrow();
        f.debug_struct("Request")
            .field("label", &st.label)
            .field("method", &st.method)
            .field("state", &st.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::key::Key;
    use crate::types::TxMode;

    struct StubTx {
        native_abort: bool,
        aborts: Cell<u32>,
        failed_statements: Cell<u32>,
    }

    impl StubTx {
        fn new(native_abort: bool) -> Rc<StubTx> {
            Rc::new(StubTx {
                native_abort,
                aborts: Cell::new(0),
                failed_statements: Cell::new(0),
            })
        }
    }

    impl NativeTx for StubTx {
        fn id(&self) -> u64 {
            7
        }

        fn mode(&self) -> TxMode {
            TxMode::ReadWrite
        }

        fn scope(&self) -> Vec<String> {
            Vec::new()
        }

        fn is_active(&self) -> bool {
            true
        }

        fn has_native_abort(&self) -> bool {
            self.native_abort
        }

        fn abort(&self) -> Result<()> {
            self.aborts.set(self.aborts.get() + 1);
            Ok(())
        }

        fn fail_statement(&self) -> Result<()> {
            self.failed_statements.set(self.failed_statements.get() + 1);
            Ok(())
        }
    }

    #[test]
    fn test_transformers_run_in_push_order() {
        let req = Request::new(Method::Count, "T0T0R0");
        req.await_with(|o, next| next(o.map(|out| match out {
            Output::Count(n) => Output::Count(n * 10),
            other => other,
        })))
        .unwrap();
        req.await_with(|o, next| next(o.map(|out| match out {
            Output::Count(n) => Output::Count(n + 1),
            other => other,
        })))
        .unwrap();

        req.set_db_value(Ok(Output::Count(4)));
        assert_eq!(req.ready_state(), ReadyState::Resolved);
        assert_eq!(req.outcome(), Some(Ok(Output::Count(41))));
    }

    #[test]
    fn test_transformer_can_turn_success_into_failure() {
        let req = Request::new(Method::Get, "r");
        req.await_with(|_, next| next(Err(Error::NotFound("k".into()))))
            .unwrap();
        req.set_db_value(Ok(Output::Value(None)));
        assert_eq!(req.ready_state(), ReadyState::Rejected);
    }

    #[test]
    fn test_deferred_continuation_holds_resolution() {
        let req = Request::new(Method::Get, "r");
        let parked: Rc<RefCell<Option<(Outcome, Continuation)>>> = Rc::new(RefCell::new(None));
        let slot = parked.clone();
        req.await_with(move |o, next| {
            *slot.borrow_mut() = Some((o, next));
        })
        .unwrap();

        req.set_db_value(Ok(Output::Key(Key::from(1))));
        assert!(req.is_pending());

        // a second raw result while the chain is parked is ignored
        req.set_db_value(Ok(Output::Key(Key::from(2))));

        let (o, next) = parked.borrow_mut().take().unwrap();
        next(o);
        assert_eq!(req.outcome(), Some(Ok(Output::Key(Key::from(1)))));
    }

    #[test]
    fn test_single_resolution() {
        let req = Request::new(Method::Get, "r");
        let fired = Rc::new(Cell::new(0));
        let counter = fired.clone();
        req.always(move |_| counter.set(counter.get() + 1));

        req.set_db_value(Ok(Output::None));
        req.set_db_value(Err(Error::Backend("late".into())));

        assert_eq!(fired.get(), 1);
        assert_eq!(req.outcome(), Some(Ok(Output::None)));
        assert!(req.await_with(|o, next| next(o)).is_err());
    }

    #[test]
    fn test_txbacks_fire_in_order_on_set_tx() {
        let req = Request::new(Method::Put, "r");
        let seen = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let seen = seen.clone();
            req.add_txback(move |_| seen.borrow_mut().push(i));
        }
        assert!(seen.borrow().is_empty());

        let tx: TxHandle = StubTx::new(true);
        req.set_tx(&tx, "T0T1R2").unwrap();
        assert_eq!(*seen.borrow(), vec![0, 1, 2]);

        // late registration fires immediately
        let late = seen.clone();
        req.add_txback(move |_| late.borrow_mut().push(9));
        assert_eq!(*seen.borrow(), vec![0, 1, 2, 9]);
        assert_eq!(req.label(), "PUT:T0T1R2");
    }

    #[test]
    fn test_set_tx_twice_fails() {
        let req = Request::new(Method::Put, "r");
        let tx: TxHandle = StubTx::new(true);
        req.set_tx(&tx, "a").unwrap();
        assert!(matches!(req.set_tx(&tx, "b"), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_resolution_disposes_transaction() {
        let req = Request::new(Method::Get, "r");
        let tx: TxHandle = StubTx::new(true);
        req.set_tx(&tx, "a").unwrap();
        assert!(req.can_abort());
        req.set_db_value(Ok(Output::None));
        assert!(!req.can_abort());
        assert!(req.tx().is_none());
        assert!(matches!(req.abort(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_abort_strategies() {
        let native = StubTx::new(true);
        let req = Request::new(Method::Put, "r");
        let handle: TxHandle = native.clone();
        req.set_tx(&handle, "a").unwrap();
        req.abort().unwrap();
        assert_eq!(native.aborts.get(), 1);
        assert_eq!(native.failed_statements.get(), 0);

        let sql_like = StubTx::new(false);
        let req = Request::new(Method::Put, "r");
        let handle: TxHandle = sql_like.clone();
        req.set_tx(&handle, "a").unwrap();
        req.abort().unwrap();
        assert_eq!(sql_like.aborts.get(), 0);
        assert_eq!(sql_like.failed_statements.get(), 1);
    }

    #[test]
    fn test_abort_without_transaction() {
        let req = Request::new(Method::Get, "r");
        assert!(!req.can_abort());
        assert!(matches!(req.abort(), Err(Error::InvalidState(_))));
    }
}
