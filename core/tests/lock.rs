use flowline_core::prelude::*;
use flowline_core::FlowState;
use flowline_test::{TestRuntime, wait_until};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn sig(name: &str, returns: ValueKind) -> Signature {
    Signature::new("tests", name, returns)
}

/// Takes the lock, suspends while holding it, unlocks on resume.
fn holder(lock: &ThreadFreeLock) -> Arc<dyn Resumable> {
    let lock = lock.clone();
    from_fn(sig("holder", ValueKind::Unit), move |frame, cx| {
        match frame.resume_point() {
            0 => {
                frame.notify_invoke(1, 0, 0);
                lock.lock(cx)
            }
            1 => {
                frame.notify_invoke(2, 0, 0);
                Ok(cx.suspend("holding"))
            }
            _ => {
                lock.unlock(cx)?;
                Ok(Step::Return(Value::Unit))
            }
        }
    })
}

fn hold(rt: &TestRuntime, lock: &ThreadFreeLock) -> Flow {
    Flow::start(rt.manager(), holder(lock), ())
        .unwrap()
        .into_signal()
        .unwrap()
        .flow()
        .cloned()
        .unwrap()
}

#[test]
fn test_waiters_acquire_in_arrival_order() {
    let lock = ThreadFreeLock::new();
    let order: Arc<Mutex<Vec<i64>>> = Arc::default();

    let waiter = {
        let lock = lock.clone();
        let order = order.clone();
        from_fn(sig("waiter", ValueKind::Bool), move |frame, cx| {
            match frame.resume_point() {
                0 => {
                    let tag = cx.take_result()?.as_int().unwrap_or(-1);
                    frame.notify_invoke(1, 1, 0);
                    frame.save_int(0, tag)?;
                    lock.lock(cx)
                }
                _ => {
                    let acquired = cx.take_result()?;
                    order.lock().unwrap().push(frame.int(0)?);
                    lock.unlock(cx)?;
                    Ok(Step::Return(acquired))
                }
            }
        })
    };

    let rt = TestRuntime::new();
    let held = hold(&rt, &lock);
    assert_eq!(lock.owner(), Some(held.id()));

    let mut waiters = Vec::new();
    for tag in 1..=3i64 {
        let activation = Flow::spawn(rt.manager(), waiter.clone(), tag);
        waiters.push(activation.flow().clone());
        rt.wait(activation).unwrap();
        assert!(wait_until(Duration::from_secs(1), || lock.queue_len() == tag as usize));
    }

    held.resume(()).unwrap();
    for flow in &waiters {
        assert_eq!(rt.join(flow).unwrap(), Value::Bool(true));
    }
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    assert!(!lock.is_locked());
}

fn contender(lock: &ThreadFreeLock, timeout: Duration, entries: Arc<AtomicUsize>) -> Arc<dyn Resumable> {
    let lock = lock.clone();
    from_fn(sig("contender", ValueKind::Bool), move |frame, cx| {
        match frame.resume_point() {
            0 => {
                frame.notify_invoke(1, 0, 0);
                lock.try_lock(cx, timeout)
            }
            _ => {
                entries.fetch_add(1, Ordering::SeqCst);
                let acquired = cx.take_result()?;
                if acquired == Value::Bool(true) {
                    lock.unlock(cx)?;
                }
                Ok(Step::Return(acquired))
            }
        }
    })
}

#[test]
fn test_try_lock_times_out_then_succeeds() {
    let lock = ThreadFreeLock::new();
    let rt = TestRuntime::new();
    let held = hold(&rt, &lock);
    let entries = Arc::new(AtomicUsize::new(0));

    let started = Instant::now();
    let activation = Flow::spawn(
        rt.manager(),
        contender(&lock, Duration::from_millis(100), entries.clone()),
        (),
    );
    let flow = activation.flow().clone();
    rt.wait(activation).unwrap();
    assert_eq!(rt.join(&flow).unwrap(), Value::Bool(false));
    assert!(started.elapsed() >= Duration::from_millis(90));
    assert_eq!(lock.queue_len(), 0);

    held.resume(()).unwrap();
    let outcome = Flow::start(
        rt.manager(),
        contender(&lock, Duration::from_millis(100), entries.clone()),
        (),
    )
    .unwrap();
    assert_eq!(outcome.value(), Some(&Value::Bool(true)));
    assert_eq!(entries.load(Ordering::SeqCst), 2);
}

#[test]
fn test_try_lock_acquires_before_deadline() {
    let lock = ThreadFreeLock::new();
    let rt = TestRuntime::new();
    let held = hold(&rt, &lock);
    let entries = Arc::new(AtomicUsize::new(0));

    let activation = Flow::spawn(
        rt.manager(),
        contender(&lock, Duration::from_secs(2), entries.clone()),
        (),
    );
    let flow = activation.flow().clone();
    rt.wait(activation).unwrap();
    assert!(wait_until(Duration::from_secs(1), || lock.queue_len() == 1));

    let started = Instant::now();
    held.resume(()).unwrap();
    assert_eq!(rt.join(&flow).unwrap(), Value::Bool(true));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(entries.load(Ordering::SeqCst), 1);
}

#[test]
fn test_zero_timeout_never_parks() {
    let lock = ThreadFreeLock::new();
    let rt = TestRuntime::new();
    let _held = hold(&rt, &lock);
    let entries = Arc::new(AtomicUsize::new(0));
    let outcome = Flow::start(rt.manager(), contender(&lock, Duration::ZERO, entries), ()).unwrap();
    assert_eq!(outcome.value(), Some(&Value::Bool(false)));
}

#[test]
fn test_unlock_by_non_owner() {
    let lock = ThreadFreeLock::new();
    let body = {
        let lock = lock.clone();
        from_fn(sig("intruder", ValueKind::Unit), move |_, cx| {
            lock.unlock(cx)?;
            Ok(Step::Return(Value::Unit))
        })
    };
    let rt = TestRuntime::new();
    let held = hold(&rt, &lock);
    let err = Flow::start(rt.manager(), body, ()).unwrap_err();
    assert!(matches!(err, FlowError::NotOwner(_)));
    assert_eq!(lock.owner(), Some(held.id()));
}

#[test]
fn test_reentrant_lock() {
    let lock = ThreadFreeLock::new();
    let body = {
        let lock = lock.clone();
        from_fn(sig("reentrant", ValueKind::Bool), move |frame, cx| {
            match frame.resume_point() {
                0 => {
                    frame.notify_invoke(1, 0, 0);
                    lock.lock(cx)
                }
                1 => {
                    frame.notify_invoke(2, 0, 0);
                    lock.lock(cx)
                }
                _ => {
                    lock.unlock(cx)?;
                    let still_held = lock.owner() == Some(cx.flow().id());
                    lock.unlock(cx)?;
                    Ok(Step::Return(Value::Bool(still_held && !lock.is_locked())))
                }
            }
        })
    };
    let rt = TestRuntime::new();
    let outcome = Flow::start(rt.manager(), body, ()).unwrap();
    assert_eq!(outcome.value(), Some(&Value::Bool(true)));
}

#[test]
fn test_release_hands_lock_straight_to_waiter() {
    let lock = ThreadFreeLock::new();
    let rt = TestRuntime::new();
    let first = hold(&rt, &lock);

    let activation = Flow::spawn(rt.manager(), holder(&lock), ());
    let second = activation.flow().clone();
    rt.wait(activation).unwrap();
    assert!(wait_until(Duration::from_secs(1), || lock.queue_len() == 1));

    first.resume(()).unwrap();
    assert_eq!(lock.owner(), Some(second.id()));
    assert_eq!(lock.queue_len(), 0);

    let entries = Arc::new(AtomicUsize::new(0));
    let outcome = Flow::start(rt.manager(), contender(&lock, Duration::ZERO, entries), ()).unwrap();
    assert_eq!(outcome.value(), Some(&Value::Bool(false)));

    assert!(wait_until(Duration::from_secs(1), || second.state() == FlowState::Suspended));
    assert_eq!(lock.owner(), Some(second.id()));
    second.resume(()).unwrap();
    assert!(!lock.is_locked());
}
