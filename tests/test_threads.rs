use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tidestore::backend::{TxDone, TxWork};
use tidestore::memory::{EventLoop, MemoryBackend, StoreSchema};
use tidestore::parallel::ParallelThread;
use tidestore::serial::SerialThread;
use tidestore::thread::{CompletionHandler, ReuseTx, TxThread, Work};
use tidestore::transaction::MutexState;
use tidestore::{
    CompletionType, Connection, Error, Executor, Key, Operation, TxMode, TxPolicy, Value,
};

fn setup_backend() -> (Rc<EventLoop>, Rc<MemoryBackend>) {
    let ev = EventLoop::new();
    let backend = MemoryBackend::with_stores(
        ev.clone(),
        [StoreSchema::new("a"), StoreSchema::new("b")],
    )
    .unwrap();
    (ev, Rc::new(backend))
}

fn serial(backend: &Rc<MemoryBackend>, policy: TxPolicy, debug: bool) -> SerialThread {
    let conn: Rc<dyn Connection> = backend.clone();
    let reuse: Rc<dyn ReuseTx> = Rc::new(policy);
    SerialThread::new(conn, reuse, "S0", debug)
}

fn parallel(backend: &Rc<MemoryBackend>, policy: TxPolicy, max_tx: Option<usize>) -> ParallelThread {
    let conn: Rc<dyn Connection> = backend.clone();
    let reuse: Rc<dyn ReuseTx> = Rc::new(policy);
    ParallelThread::new(conn, reuse, "P0", max_tx, false)
}

fn scope(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// Work that writes `i` into store `a` and records the transaction label.
fn put_work(backend: &Rc<MemoryBackend>, i: i32, labels: &Rc<RefCell<Vec<String>>>) -> Work {
    let exec = backend.clone();
    let labels = labels.clone();
    Box::new(move |tx, label| {
        labels.borrow_mut().push(label.to_string());
        let op = Operation::Put {
            store: "a".into(),
            key: Some(Key::from(i)),
            value: Value::from(i as i64),
        };
        exec.execute(tx, label, op, Box::new(|r| assert!(r.is_ok())));
    })
}

fn record(order: &Rc<RefCell<Vec<i32>>>, i: i32) -> Option<CompletionHandler> {
    let order = order.clone();
    Some(Box::new(move |completion, _| {
        assert_eq!(completion, CompletionType::Complete);
        order.borrow_mut().push(i);
        Ok(())
    }))
}

#[test]
fn test_serial_runs_queued_work_in_order() {
    let (ev, backend) = setup_backend();
    let thread = serial(&backend, TxPolicy::Single, false);
    let labels = Rc::new(RefCell::new(Vec::new()));
    let order = Rc::new(RefCell::new(Vec::new()));

    for i in 0..5 {
        thread
            .run(put_work(&backend, i, &labels), &scope(&["a"]), TxMode::ReadWrite, record(&order, i))
            .unwrap();
    }
    assert_eq!(thread.queue_depth(), 4);
    assert!(thread.is_active());

    ev.run();

    assert_eq!(*order.borrow(), vec![0, 1, 2, 3, 4]);
    assert_eq!(
        *labels.borrow(),
        vec!["S0T0", "S0T1", "S0T2", "S0T3", "S0T4"]
    );
    assert_eq!(thread.queue_depth(), 0);
    assert_eq!(thread.tx_no(), 5);
    assert!(!thread.is_active());
    assert_eq!(thread.mutex_state(), MutexState::Idle);
    assert_eq!(backend.len("a"), Some(5));
}

/// Connection that holds transaction calls until `open` is called.
struct Opening {
    backend: Rc<MemoryBackend>,
    held: RefCell<Vec<(TxWork, Vec<String>, TxMode, TxDone)>>,
    ready: Cell<bool>,
}

impl Opening {
    fn open(&self) {
        self.ready.set(true);
        let held: Vec<_> = self.held.borrow_mut().drain(..).collect();
        for (work, stores, mode, done) in held {
            self.backend.transaction(work, &stores, mode, done);
        }
    }
}

impl Connection for Opening {
    fn transaction(&self, work: TxWork, store_names: &[String], mode: TxMode, on_completed: TxDone) {
        if self.ready.get() {
            self.backend.transaction(work, store_names, mode, on_completed);
        } else {
            self.held
                .borrow_mut()
                .push((work, store_names.to_vec(), mode, on_completed));
        }
    }
}

#[test]
fn test_serial_queues_behind_connection_still_opening() {
    let (ev, backend) = setup_backend();
    let opening = Rc::new(Opening {
        backend: backend.clone(),
        held: RefCell::new(Vec::new()),
        ready: Cell::new(false),
    });
    let conn: Rc<dyn Connection> = opening.clone();
    let reuse: Rc<dyn ReuseTx> = Rc::new(TxPolicy::Single);
    let thread = SerialThread::new(conn, reuse, "S0", false);
    let labels = Rc::new(RefCell::new(Vec::new()));

    for i in 0..3 {
        thread
            .run(put_work(&backend, i, &labels), &scope(&["a"]), TxMode::ReadWrite, None)
            .unwrap();
    }
    ev.run();

    // only the first request reached the connection, nothing is open yet
    assert_eq!(opening.held.borrow().len(), 1);
    assert_eq!(thread.queue_depth(), 2);
    assert_eq!(thread.mutex_state(), MutexState::Idle);
    assert!(labels.borrow().is_empty());

    opening.open();
    ev.run();
    assert_eq!(*labels.borrow(), vec!["S0T0", "S0T1", "S0T2"]);
    assert_eq!(thread.queue_depth(), 0);
    assert_eq!(backend.len("a"), Some(3));
}

#[test]
fn test_serial_keeps_one_transaction_open() {
    let (ev, backend) = setup_backend();
    let thread = serial(&backend, TxPolicy::Single, false);
    let open = Rc::new(Cell::new(0));
    let peak = Rc::new(Cell::new(0));

    for (i, mode) in [TxMode::ReadOnly, TxMode::ReadWrite, TxMode::ReadOnly].into_iter().enumerate() {
        let (o, p) = (open.clone(), peak.clone());
        let work: Work = Box::new(move |_, _| {
            o.set(o.get() + 1);
            p.set(p.get().max(o.get()));
        });
        let o = open.clone();
        let done: CompletionHandler = Box::new(move |_, _| {
            o.set(o.get() - 1);
            Ok(())
        });
        let stores = if i % 2 == 0 { scope(&["a"]) } else { scope(&["a", "b"]) };
        thread.run(work, &stores, mode, Some(done)).unwrap();
    }
    ev.run();

    assert_eq!(peak.get(), 1);
    assert_eq!(open.get(), 0);
    assert_eq!(thread.completed_tx_count(), 3);
}

#[test]
fn test_failing_handler_does_not_stall_queue() {
    let (ev, backend) = setup_backend();
    let thread = serial(&backend, TxPolicy::Single, false);
    let labels = Rc::new(RefCell::new(Vec::new()));
    let order = Rc::new(RefCell::new(Vec::new()));

    let failing: CompletionHandler = Box::new(|_, _| Err(Error::Backend("handler".into())));
    thread
        .run(put_work(&backend, 1, &labels), &scope(&["a"]), TxMode::ReadWrite, Some(failing))
        .unwrap();
    thread
        .run(put_work(&backend, 2, &labels), &scope(&["a"]), TxMode::ReadWrite, record(&order, 2))
        .unwrap();
    ev.run();

    assert_eq!(*order.borrow(), vec![2]);
    assert_eq!(thread.queue_depth(), 0);
}

#[test]
#[should_panic(expected = "completion handler failed")]
fn test_failing_handler_panics_in_debug() {
    let (ev, backend) = setup_backend();
    let thread = serial(&backend, TxPolicy::Single, true);
    let labels = Rc::new(RefCell::new(Vec::new()));

    let failing: CompletionHandler = Box::new(|_, _| Err(Error::Backend("handler".into())));
    thread
        .run(put_work(&backend, 1, &labels), &scope(&["a"]), TxMode::ReadWrite, Some(failing))
        .unwrap();
    ev.run();
}

#[test]
fn test_empty_scope_is_rejected() {
    let (_ev, backend) = setup_backend();
    let thread = serial(&backend, TxPolicy::Single, false);
    let err = thread
        .run(Box::new(|_, _| {}), &[], TxMode::ReadOnly, None)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert!(!thread.is_active());
}

/// Issue a nested run from inside the work of an outer run and report the
/// labels both ran under.
fn nested_labels(thread: Rc<dyn TxThread>, ev: &Rc<EventLoop>, lock_first: bool) -> (String, String) {
    let outer = Rc::new(RefCell::new(String::new()));
    let inner = Rc::new(RefCell::new(String::new()));
    let (o, i, t) = (outer.clone(), inner.clone(), thread.clone());
    thread
        .run(
            Box::new(move |_, label| {
                *o.borrow_mut() = label.to_string();
                if lock_first {
                    t.lock().unwrap();
                }
                t.run(
                    Box::new(move |_, label| *i.borrow_mut() = label.to_string()),
                    &scope(&["a"]),
                    TxMode::ReadOnly,
                    None,
                )
                .unwrap();
            }),
            &scope(&["a", "b"]),
            TxMode::ReadWrite,
            None,
        )
        .unwrap();
    ev.run();
    let labels = (outer.borrow().clone(), inner.borrow().clone());
    labels
}

#[test]
fn test_serial_reuse_policies() {
    let (ev, backend) = setup_backend();

    let multi: Rc<dyn TxThread> = Rc::new(serial(&backend, TxPolicy::Multi, false));
    assert_eq!(nested_labels(multi, &ev, false), ("S0T0".into(), "S0T0".into()));

    // exact scope required
    let repeat: Rc<dyn TxThread> = Rc::new(serial(&backend, TxPolicy::Repeat, false));
    assert_eq!(nested_labels(repeat, &ev, false), ("S0T0".into(), "S0T1".into()));

    let atomic: Rc<dyn TxThread> = Rc::new(serial(&backend, TxPolicy::Atomic, false));
    assert_eq!(nested_labels(atomic, &ev, false), ("S0T0".into(), "S0T1".into()));

    let locked: Rc<dyn TxThread> = Rc::new(serial(&backend, TxPolicy::All, false));
    assert_eq!(nested_labels(locked, &ev, true), ("S0T0".into(), "S0T1".into()));
}

#[test]
fn test_parallel_transactions_overlap() {
    let (ev, backend) = setup_backend();
    let thread = parallel(&backend, TxPolicy::Single, None);
    let labels = Rc::new(RefCell::new(Vec::new()));
    let order = Rc::new(RefCell::new(Vec::new()));

    for i in 0..3 {
        thread
            .run(put_work(&backend, i, &labels), &scope(&["a"]), TxMode::ReadWrite, record(&order, i))
            .unwrap();
    }
    assert_eq!(thread.open_tx_count(), 3);
    assert_eq!(thread.queue_depth(), 0);
    ev.run();

    assert_eq!(thread.open_tx_count(), 0);
    assert_eq!(*labels.borrow(), vec!["P0T0", "P0T1", "P0T2"]);
    let mut done = order.borrow().clone();
    done.sort();
    assert_eq!(done, vec![0, 1, 2]);
}

#[test]
fn test_parallel_transaction_limit() {
    let (ev, backend) = setup_backend();
    let thread = parallel(&backend, TxPolicy::Single, Some(2));
    let labels = Rc::new(RefCell::new(Vec::new()));

    for i in 0..2 {
        thread
            .run(put_work(&backend, i, &labels), &scope(&["a"]), TxMode::ReadWrite, None)
            .unwrap();
    }
    let err = thread
        .run(put_work(&backend, 9, &labels), &scope(&["a"]), TxMode::ReadWrite, None)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidOperation(_)));

    ev.run();
    assert_eq!(backend.len("a"), Some(2));
}

#[test]
fn test_parallel_reuse() {
    let (ev, backend) = setup_backend();

    let all: Rc<dyn TxThread> = Rc::new(parallel(&backend, TxPolicy::All, None));
    assert_eq!(nested_labels(all, &ev, false), ("P0T0".into(), "P0T0".into()));

    let single: Rc<dyn TxThread> = Rc::new(parallel(&backend, TxPolicy::Single, None));
    assert_eq!(nested_labels(single, &ev, false), ("P0T0".into(), "P0T1".into()));
}
