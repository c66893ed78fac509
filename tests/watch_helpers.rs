//! Tests for watch_group and watch_collection.

use std::sync::Arc;

use parking_lot::Mutex;
use scope_flow::{Getter, ManualScheduler, Scope, TraceCollector, Value};

type Calls = Arc<Mutex<Vec<(Vec<Value>, Vec<Value>)>>>;

fn group_recorder(calls: &Calls) -> impl Fn(&[Value], &[Value], &Scope) + Send + Sync + 'static {
    let calls = calls.clone();
    move |new: &[Value], old: &[Value], _: &Scope| {
        calls.lock().push((new.to_vec(), old.to_vec()));
    }
}

fn key(name: &'static str) -> Getter {
    Getter::new(move |s| s.get(name)).named(name)
}

// =============================================================================
// watch_group
// =============================================================================

#[test]
fn test_group_fires_once_per_digest() {
    let root = Scope::new_root();
    root.set("a", 1).unwrap();
    root.set("b", 2).unwrap();
    let calls: Calls = Arc::default();
    root.watch_group(vec![key("a"), key("b")], group_recorder(&calls));

    root.digest().unwrap();
    assert_eq!(
        *calls.lock(),
        vec![(
            vec![Value::from(1), Value::from(2)],
            vec![Value::from(1), Value::from(2)]
        )]
    );

    root.set("a", 3).unwrap();
    root.set("b", 4).unwrap();
    root.digest().unwrap();
    assert_eq!(calls.lock().len(), 2);
    assert_eq!(
        calls.lock()[1],
        (
            vec![Value::from(3), Value::from(4)],
            vec![Value::from(1), Value::from(2)]
        )
    );

    root.digest().unwrap();
    assert_eq!(calls.lock().len(), 2);
}

#[test]
fn test_group_old_values_track_previous_call() {
    let root = Scope::new_root();
    let calls: Calls = Arc::default();
    root.watch_group(vec![key("a"), key("b")], group_recorder(&calls));
    root.digest().unwrap();

    root.set("a", 1).unwrap();
    root.digest().unwrap();
    root.set("b", 2).unwrap();
    root.digest().unwrap();

    let calls = calls.lock();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[2].0, vec![Value::from(1), Value::from(2)]);
    assert_eq!(calls[2].1, vec![Value::from(1), Value::Undefined]);
}

#[test]
fn test_single_member_group() {
    let root = Scope::new_root();
    root.set("a", 1).unwrap();
    let calls: Calls = Arc::default();
    root.watch_group(vec![key("a")], group_recorder(&calls));
    assert_eq!(root.count_watchers(), 1);

    root.digest().unwrap();
    root.set("a", 2).unwrap();
    root.digest().unwrap();
    assert_eq!(
        *calls.lock(),
        vec![
            (vec![Value::from(1)], vec![Value::from(1)]),
            (vec![Value::from(2)], vec![Value::from(1)]),
        ]
    );
}

#[test]
fn test_empty_group_fires_once_asynchronously() {
    let scheduler = Arc::new(ManualScheduler::new());
    let root = Scope::builder().scheduler(scheduler.clone()).build();
    let calls: Calls = Arc::default();
    root.watch_group(Vec::new(), group_recorder(&calls));
    assert!(calls.lock().is_empty());

    scheduler.flush();
    assert_eq!(*calls.lock(), vec![(Vec::new(), Vec::new())]);

    root.digest().unwrap();
    assert_eq!(calls.lock().len(), 1);
}

#[test]
fn test_empty_group_deregistered_before_firing() {
    let root = Scope::new_root();
    let calls: Calls = Arc::default();
    let handle = root.watch_group(Vec::new(), group_recorder(&calls));
    handle.deregister();
    root.digest().unwrap();
    assert!(calls.lock().is_empty());
}

#[test]
fn test_group_deregistration_removes_every_member() {
    let root = Scope::new_root();
    let calls: Calls = Arc::default();
    let handle = root.watch_group(vec![key("a"), key("b"), key("c")], group_recorder(&calls));
    assert_eq!(root.count_watchers(), 3);
    handle.deregister();
    assert_eq!(root.count_watchers(), 0);
    root.digest().unwrap();
    assert!(calls.lock().is_empty());
}

// =============================================================================
// watch_collection
// =============================================================================

type Seen = Arc<Mutex<Vec<(Value, Value)>>>;

fn watch_items(root: &Scope) -> Seen {
    let seen: Seen = Arc::default();
    let recorder = seen.clone();
    root.watch_collection(
        |s: &Scope| s.get("items"),
        move |new: &Value, old: &Value, _: &Scope| {
            recorder.lock().push((new.clone(), old.clone()));
        },
    );
    seen
}

#[test]
fn test_collection_list_changes() {
    let root = Scope::new_root();
    root.set("items", Value::list([1, 2])).unwrap();
    let seen = watch_items(&root);

    root.digest().unwrap();
    assert_eq!(
        *seen.lock(),
        vec![(Value::list([1, 2]), Value::list([1, 2]))]
    );

    // Same elements in a new container.
    root.set("items", Value::list([1, 2])).unwrap();
    root.digest().unwrap();
    assert_eq!(seen.lock().len(), 1);

    root.set("items", Value::list([1, 2, 3])).unwrap();
    root.digest().unwrap();
    assert_eq!(
        seen.lock()[1],
        (Value::list([1, 2, 3]), Value::list([1, 2]))
    );

    root.set("items", Value::list([1, 5, 3])).unwrap();
    root.digest().unwrap();
    assert_eq!(
        seen.lock()[2],
        (Value::list([1, 5, 3]), Value::list([1, 2, 3]))
    );
}

#[test]
fn test_collection_map_changes() {
    let root = Scope::new_root();
    root.set("items", Value::map([("a", 1)])).unwrap();
    let seen = watch_items(&root);
    root.digest().unwrap();

    root.set("items", Value::map([("a", 1)])).unwrap();
    root.digest().unwrap();
    assert_eq!(seen.lock().len(), 1);

    root.set("items", Value::map([("a", 1), ("b", 2)])).unwrap();
    root.digest().unwrap();
    assert_eq!(seen.lock().len(), 2);

    root.set("items", Value::map([("a", 9), ("b", 2)])).unwrap();
    root.digest().unwrap();
    assert_eq!(seen.lock().len(), 3);

    root.set("items", Value::map([("b", 2)])).unwrap();
    root.digest().unwrap();
    assert_eq!(
        seen.lock()[3],
        (
            Value::map([("b", 2)]),
            Value::map([("a", 9), ("b", 2)])
        )
    );
}

#[test]
fn test_collection_nested_change_is_not_seen() {
    let root = Scope::new_root();
    let inner = Value::map([("x", 1)]);
    root.set("items", Value::list([inner.clone()])).unwrap();
    let seen = watch_items(&root);
    root.digest().unwrap();

    // The element is the same container, so a shallow watch sees nothing.
    root.set("items", Value::list([inner])).unwrap();
    root.digest().unwrap();
    assert_eq!(seen.lock().len(), 1);
}

#[test]
fn test_collection_from_undefined_to_list_and_scalar() {
    let root = Scope::new_root();
    let seen = watch_items(&root);
    root.digest().unwrap();
    assert_eq!(*seen.lock(), vec![(Value::Undefined, Value::Undefined)]);

    root.set("items", Value::list([1])).unwrap();
    root.digest().unwrap();
    assert_eq!(seen.lock()[1], (Value::list([1]), Value::Undefined));

    root.set("items", "scalar").unwrap();
    root.digest().unwrap();
    assert_eq!(seen.lock()[2], (Value::from("scalar"), Value::list([1])));
}

#[test]
fn test_collection_watch_keeps_getter_name() {
    let collector = Arc::new(TraceCollector::new());
    let root = Scope::builder().tracer(collector.clone()).build();
    root.set("items", Value::list([1])).unwrap();
    root.watch_collection(key("items"), |_: &Value, _: &Value, _: &Scope| {});

    root.digest().unwrap();
    assert_eq!(collector.fired_watches(), vec!["items".to_string()]);
}
