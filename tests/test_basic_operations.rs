use std::rc::Rc;

use tidestore::memory::{EventLoop, IndexSchema, MemoryBackend, StoreSchema};
use tidestore::{
    Environment, Error, Key, KeyRange, Options, Output, ReadyState, Request, Value,
};

// Common test setup
fn setup_test_env() -> (Rc<EventLoop>, Rc<MemoryBackend>, Environment) {
    let ev = EventLoop::new();
    let backend = MemoryBackend::with_stores(
        ev.clone(),
        [
            StoreSchema::new("kv"),
            StoreSchema::new("people")
                .key_path("id")
                .auto_increment()
                .index(IndexSchema::new("by_email", "email").unique()),
        ],
    )
    .unwrap();
    let backend = Rc::new(backend);
    let env = Environment::new(backend.clone(), Options::default());
    (ev, backend, env)
}

fn output(req: &Request) -> Output {
    match req.outcome() {
        Some(Ok(output)) => output,
        other => panic!("{} did not succeed: {:?}", req.label(), other),
    }
}

fn error(req: &Request) -> Error {
    match req.outcome() {
        Some(Err(e)) => e,
        other => panic!("{} did not fail: {:?}", req.label(), other),
    }
}

#[test]
fn test_basic_put_get() {
    let (ev, _backend, env) = setup_test_env();
    let kv = env.store("kv");

    // Test putting and getting data
    let put = kv.put_at("test_key", Value::from("test_value"));
    let get = kv.get("test_key");
    assert!(put.is_pending());
    ev.run();

    assert_eq!(output(&put), Output::Key(Key::from("test_key")));
    assert_eq!(output(&get), Output::Value(Some(Value::from("test_value"))));
}

#[test]
fn test_delete_operations() {
    let (ev, _backend, env) = setup_test_env();
    let kv = env.store("kv");

    // Insert and then delete data
    kv.put_at("delete_key", Value::from("delete_value"));
    let before = kv.get("delete_key");
    kv.del("delete_key");
    let after = kv.get("delete_key");
    ev.run();

    assert_eq!(output(&before), Output::Value(Some(Value::from("delete_value"))));
    assert_eq!(output(&after), Output::Value(None));
}

#[test]
fn test_store_stats() {
    let (ev, _backend, env) = setup_test_env();
    let kv = env.store("kv");

    let empty = kv.count(KeyRange::all());
    for i in 0..5 {
        kv.put_at(format!("key_{}", i), Value::from(format!("value_{}", i).as_str()));
    }
    let full = kv.count(KeyRange::all());
    let some = kv.count(KeyRange::bound("key_1", "key_3", false, true).unwrap());
    ev.run();

    assert_eq!(output(&empty), Output::Count(0));
    assert_eq!(output(&full), Output::Count(5));
    assert_eq!(output(&some), Output::Count(2));
}

#[test]
fn test_keys_values_and_ranges() {
    let (ev, backend, env) = setup_test_env();
    let kv = env.store("kv");

    let entries = (1..=6).map(|i| (Some(Key::from(i)), Value::from(i as i64 * 10))).collect();
    env.put_all("kv", entries);
    let keys = kv.keys(KeyRange::lower_bound(4, false));
    let values = kv.values(KeyRange::upper_bound(2, false));
    let gone = kv.del_range(KeyRange::bound(2, 5, false, false).unwrap());
    let many = kv.get_all(vec![Key::from(1), Key::from(3), Key::from(6)]);
    ev.run();

    assert_eq!(output(&keys), Output::Keys(vec![Key::from(4), Key::from(5), Key::from(6)]));
    assert_eq!(output(&values), Output::Values(vec![Value::from(10i64), Value::from(20i64)]));
    assert_eq!(output(&gone), Output::Count(4));
    assert_eq!(
        output(&many),
        Output::Records(vec![Some(Value::from(10i64)), None, Some(Value::from(60i64))])
    );
    assert_eq!(backend.len("kv"), Some(2));

    let cleared = kv.clear();
    ev.run();
    assert_eq!(cleared.ready_state(), ReadyState::Resolved);
    assert_eq!(backend.len("kv"), Some(0));
}

#[test]
fn test_generated_keys_and_constraints() {
    let (ev, backend, env) = setup_test_env();
    let people = env.store("people");

    let ann = Value::object([("email", Value::from("ann@example.com"))]);
    let bob = Value::object([("email", Value::from("bob@example.com"))]);
    let first = people.add(ann.clone());
    let second = people.add(bob);
    let clash = people.add(ann);
    ev.run();

    assert_eq!(output(&first), Output::Key(Key::from(1)));
    assert_eq!(output(&second), Output::Key(Key::from(2)));
    assert!(matches!(error(&clash), Error::Constraint(_)));
    assert_eq!(clash.ready_state(), ReadyState::Rejected);

    let stored = backend.peek("people", &Key::from(2)).unwrap();
    assert_eq!(stored.key_at("id"), Some(Key::from(2)));

    let dup = env.store("kv").add_at(1, Value::from(1i64));
    let dup_again = env.store("kv").add_at(1, Value::from(2i64));
    ev.run();
    assert_eq!(output(&dup), Output::Key(Key::from(1)));
    assert!(matches!(error(&dup_again), Error::Constraint(_)));
}

#[test]
fn test_invalid_arguments_fail_immediately() {
    let (_ev, _backend, env) = setup_test_env();

    let nan = env.get("kv", f64::NAN);
    assert_eq!(nan.ready_state(), ReadyState::Rejected);
    assert!(matches!(error(&nan), Error::InvalidArgument(_)));

    let unnamed = env.get("", 1);
    assert!(matches!(error(&unnamed), Error::InvalidArgument(_)));
}

#[test]
fn test_unknown_store_rejects_request() {
    let (ev, _backend, env) = setup_test_env();

    let req = env.get("missing", 1);
    assert!(req.is_pending());
    ev.run();
    assert!(matches!(error(&req), Error::NotFound(_)));
}

#[test]
fn test_request_labels() {
    let (ev, _backend, env) = setup_test_env();

    let put = env.put("kv", Some(Key::from(1)), Value::from(1i64));
    assert_eq!(put.label(), "PUT:T0R0");
    let get = env.get("kv", 1);
    ev.run();

    assert_eq!(put.label(), "PUT:T0T0R0");
    assert_eq!(get.label(), "GET:T0T1R1");
}
