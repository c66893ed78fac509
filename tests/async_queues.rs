//! Tests for evalAsync, applyAsync and postDigest.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use scope_flow::{
    CollectingErrorSink, ErrorCause, Locals, ManualScheduler, Scope, TraceCollector, TraceEvent,
    Value,
};

struct Harness {
    root: Scope,
    scheduler: Arc<ManualScheduler>,
    errors: Arc<CollectingErrorSink>,
}

fn harness() -> Harness {
    let scheduler = Arc::new(ManualScheduler::new());
    let errors = Arc::new(CollectingErrorSink::new());
    let root = Scope::builder()
        .scheduler(scheduler.clone())
        .error_sink(errors.clone())
        .build();
    Harness {
        root,
        scheduler,
        errors,
    }
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

fn digest_count(collector: &TraceCollector) -> usize {
    collector
        .events()
        .iter()
        .filter(|event| matches!(event, TraceEvent::DigestStart { .. }))
        .count()
}

// =============================================================================
// evalAsync
// =============================================================================

#[test]
fn test_eval_async_runs_before_watchers() {
    let h = harness();
    let log = Arc::new(Mutex::new(Vec::new()));
    {
        let log = log.clone();
        h.root.watch(|s: &Scope| s.get("a"), move |new: &Value, _: &Value, _: &Scope| {
            log.lock().push(format!("watch {}", new));
        });
    }
    {
        let log = log.clone();
        h.root.eval_async(move |scope| {
            log.lock().push("task".to_string());
            scope.set("a", 1)
        });
    }

    h.root.digest().unwrap();
    assert_eq!(*log.lock(), vec!["task".to_string(), "watch 1".to_string()]);
}

#[test]
fn test_eval_async_from_listener_runs_in_same_digest() {
    let h = harness();
    let ran = counter();
    let scheduled = counter();
    {
        let ran = ran.clone();
        h.root.watch(|_: &Scope| Value::Null, move |_: &Value, _: &Value, scope: &Scope| {
            if scheduled.fetch_add(1, Ordering::SeqCst) == 0 {
                let ran = ran.clone();
                scope.eval_async(move |_| {
                    ran.fetch_add(1, Ordering::SeqCst);
                });
            }
        });
    }

    h.root.digest().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(h.scheduler.pending(), 0);
}

#[test]
fn test_eval_async_schedules_a_deferred_digest() {
    let collector = Arc::new(TraceCollector::new());
    let scheduler = Arc::new(ManualScheduler::new());
    let root = Scope::builder()
        .scheduler(scheduler.clone())
        .tracer(collector.clone())
        .build();
    let calls = counter();
    {
        let calls = calls.clone();
        root.watch(|s: &Scope| s.get("a"), move |_: &Value, _: &Value, _: &Scope| {
            calls.fetch_add(1, Ordering::SeqCst);
        });
    }

    root.eval_async(|scope| scope.set("a", 1));
    root.eval_async(|scope| scope.set("a", 2));
    assert_eq!(scheduler.pending(), 1);

    scheduler.flush();
    assert_eq!(root.get("a"), Value::from(2));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(digest_count(&collector), 1);
}

#[test]
fn test_digest_cancels_the_deferred_digest() {
    let h = harness();
    h.root.eval_async(|_| {});
    assert_eq!(h.scheduler.pending(), 1);
    h.root.digest().unwrap();
    assert_eq!(h.scheduler.pending(), 0);
}

#[test]
fn test_eval_async_on_child_digests_from_root() {
    let h = harness();
    let child = h.root.create_child(false);
    let root_calls = counter();
    {
        let root_calls = root_calls.clone();
        h.root.watch(|_: &Scope| Value::Null, move |_: &Value, _: &Value, _: &Scope| {
            root_calls.fetch_add(1, Ordering::SeqCst);
        });
    }
    child.eval_async(|_| {});
    child.digest().unwrap();
    assert_eq!(root_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_eval_async_expr_and_errors() {
    let h = harness();
    let mut locals = Locals::default();
    locals.insert("x".to_string(), Value::from(1));
    h.root.eval_async_expr("x", Some(locals)).unwrap();
    assert!(h.root.eval_async_expr("x +", None).is_err());
    h.root
        .eval_async(|_| -> anyhow::Result<()> { Err(anyhow::anyhow!("task failed")) });
    let after = counter();
    {
        let after = after.clone();
        h.root.eval_async(move |_| {
            after.fetch_add(1, Ordering::SeqCst);
        });
    }

    h.root.digest().unwrap();
    assert_eq!(after.load(Ordering::SeqCst), 1);
    assert_eq!(h.errors.causes(), vec![ErrorCause::EvalAsync]);
}

#[test]
fn test_eval_async_task_of_destroyed_scope_is_skipped() {
    let h = harness();
    let child = h.root.create_child(false);
    let ran = counter();
    {
        let ran = ran.clone();
        child.eval_async(move |_| {
            ran.fetch_add(1, Ordering::SeqCst);
        });
    }
    child.destroy();
    h.root.digest().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn test_deferred_digest_reports_instability() {
    let h = harness();
    h.root
        .watch(|_: &Scope| Value::list([1]), |_: &Value, _: &Value, _: &Scope| {});
    h.root.eval_async(|_| {});
    h.scheduler.flush();
    assert_eq!(h.errors.causes(), vec![ErrorCause::DeferredDigest]);
}

// =============================================================================
// applyAsync
// =============================================================================

#[test]
fn test_apply_async_coalesces_into_one_digest() {
    let collector = Arc::new(TraceCollector::new());
    let scheduler = Arc::new(ManualScheduler::new());
    let root = Scope::builder()
        .scheduler(scheduler.clone())
        .tracer(collector.clone())
        .build();
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        root.watch(|s: &Scope| s.get("n"), move |new: &Value, _: &Value, _: &Scope| {
            seen.lock().push(new.clone());
        });
    }

    for n in 1..=3 {
        root.apply_async(move |scope| scope.set("n", n));
    }
    assert_eq!(scheduler.pending(), 1);
    assert_eq!(root.get("n"), Value::Undefined);

    scheduler.flush();
    assert_eq!(*seen.lock(), vec![Value::from(3)]);
    assert_eq!(digest_count(&collector), 1);
}

#[test]
fn test_apply_async_failure_does_not_stop_the_rest() {
    let h = harness();
    h.root
        .apply_async(|_| -> anyhow::Result<()> { Err(anyhow::anyhow!("first failed")) });
    h.root.apply_async(|scope| scope.set("b", true));
    h.scheduler.flush();
    assert_eq!(h.root.get("b"), Value::from(true));
    assert_eq!(h.errors.causes(), vec![ErrorCause::ApplyAsync]);
}

#[test]
fn test_root_digest_flushes_apply_async_and_cancels() {
    let h = harness();
    h.root.apply_async(|scope| scope.set("a", 1));
    assert_eq!(h.scheduler.pending(), 1);

    h.root.digest().unwrap();
    assert_eq!(h.root.get("a"), Value::from(1));
    assert_eq!(h.scheduler.pending(), 0);
    assert_eq!(h.scheduler.flush(), 0);
}

#[test]
fn test_child_digest_leaves_apply_async_queued() {
    let h = harness();
    let child = h.root.create_child(false);
    h.root.apply_async(|scope| scope.set("a", 1));
    child.digest().unwrap();
    assert_eq!(h.root.get("a"), Value::Undefined);
    h.scheduler.flush();
    assert_eq!(h.root.get("a"), Value::from(1));
}

#[test]
fn test_apply_async_flush_blocked_by_child_digest_is_rescheduled() {
    let h = harness();
    let child = h.root.create_child(false);
    h.root.apply_async(|scope| scope.set("a", 1));
    {
        // The host loop turns while the child digest is still running.
        let scheduler = h.scheduler.clone();
        child.watch(|_: &Scope| Value::Null, move |_: &Value, _: &Value, _: &Scope| {
            scheduler.flush();
        });
    }

    child.digest().unwrap();
    assert_eq!(h.root.get("a"), Value::Undefined);
    assert_eq!(h.scheduler.pending(), 1);

    h.scheduler.flush();
    assert_eq!(h.root.get("a"), Value::from(1));
    assert_eq!(h.scheduler.pending(), 0);
    assert!(h.errors.is_empty());
}

#[test]
fn test_apply_async_expr() {
    let h = harness();
    h.root.set("a", 1).unwrap();
    h.root.apply_async_expr("a", None).unwrap();
    assert!(h.root.apply_async_expr("", None).is_ok());
    assert!(h.root.apply_async_expr("a b", None).is_err());
    assert_eq!(h.scheduler.flush(), 1);
    assert!(h.errors.is_empty());
}

// =============================================================================
// postDigest
// =============================================================================

#[test]
fn test_post_digest_runs_once_after_the_digest() {
    let h = harness();
    let log = Arc::new(Mutex::new(Vec::new()));
    {
        let log = log.clone();
        h.root.watch(|s: &Scope| s.get("a"), move |_: &Value, _: &Value, _: &Scope| {
            log.lock().push("watch");
        });
    }
    {
        let log = log.clone();
        h.root.post_digest(move || {
            log.lock().push("post");
        });
    }
    assert_eq!(h.scheduler.pending(), 0);

    h.root.digest().unwrap();
    h.root.digest().unwrap();
    assert_eq!(*log.lock(), vec!["watch", "post"]);
}

#[test]
fn test_post_digest_tasks_queued_while_draining_run_in_same_drain() {
    let h = harness();
    let log = Arc::new(Mutex::new(Vec::new()));
    {
        let log = log.clone();
        let scope = h.root.clone();
        h.root.post_digest(move || {
            log.lock().push(1);
            let log = log.clone();
            scope.post_digest(move || {
                log.lock().push(2);
            });
        });
    }
    h.root.digest().unwrap();
    assert_eq!(*log.lock(), vec![1, 2]);
}

#[test]
fn test_post_digest_error_is_reported() {
    let h = harness();
    h.root
        .post_digest(|| -> anyhow::Result<()> { Err(anyhow::anyhow!("post failed")) });
    let ran = counter();
    {
        let ran = ran.clone();
        h.root.post_digest(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        });
    }
    h.root.digest().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(h.errors.causes(), vec![ErrorCause::PostDigest]);
}

#[test]
fn test_post_digest_waits_out_an_unstable_digest() {
    let h = harness();
    let ran = counter();
    {
        let ran = ran.clone();
        h.root.post_digest(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        });
    }
    let unstable = h
        .root
        .watch(|_: &Scope| Value::list([1]), |_: &Value, _: &Value, _: &Scope| {});
    assert!(h.root.digest().is_err());
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    unstable.deregister();
    h.root.digest().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}
