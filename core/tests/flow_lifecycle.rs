use flowline_core::prelude::*;
use flowline_core::{FlowState, FrameError};
use flowline_test::{ListenerEvent, RecordingListener, TestRuntime};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn sig(name: &str, returns: ValueKind) -> Signature {
    Signature::new("tests", name, returns)
}

/// Suspends twice, adding each resume value to its argument.
fn accumulator() -> Arc<dyn Resumable> {
    from_fn(sig("accumulator", ValueKind::Int), |frame, cx| {
        match frame.resume_point() {
            0 => {
                let start = cx.take_result()?.as_int().unwrap_or(0);
                frame.notify_invoke(1, 1, 1);
                frame.save_int(0, start)?;
                frame.save_value(0, "kept")?;
                Ok(cx.suspend("first"))
            }
            1 => {
                assert!(frame.is_restoring());
                assert_eq!(frame.text(0)?, "kept");
                let total = frame.int(0)? + cx.take_result()?.as_int().unwrap_or(0);
                frame.notify_invoke(2, 1, 0);
                frame.save_int(0, total)?;
                Ok(cx.suspend(total))
            }
            _ => {
                let total = frame.int(0)? + cx.take_result()?.as_int().unwrap_or(0);
                Ok(Step::Return(Value::Int(total)))
            }
        }
    })
}

#[test]
fn test_suspend_resume_round_trip() {
    let rt = TestRuntime::new();
    let outcome = Flow::start(rt.manager(), accumulator(), 1).unwrap();
    let signal = outcome.into_signal().expect("first suspension");
    assert_eq!(signal.payload(), &Value::from("first"));
    let flow = signal.flow().cloned().unwrap();
    assert_eq!(flow.state(), FlowState::Suspended);

    let second = flow.resume(10).unwrap().into_signal().unwrap();
    assert_eq!(second.payload(), &Value::Int(11));

    let end = flow.resume(100).unwrap();
    assert_eq!(end.value(), Some(&Value::Int(111)));
    assert_eq!(flow.state(), FlowState::Ended);
    assert_eq!(flow.result().unwrap().unwrap(), Value::Int(111));
}

#[test]
fn test_resume_of_ended_flow_is_illegal() {
    let rt = TestRuntime::new();
    let signal = Flow::start(rt.manager(), accumulator(), 0)
        .unwrap()
        .into_signal()
        .unwrap();
    let flow = signal.flow().cloned().unwrap();
    flow.resume(1).unwrap();
    flow.resume(1).unwrap();
    let err = flow.resume(1).unwrap_err();
    assert!(matches!(
        err,
        FlowError::IllegalState { expected: "suspended", actual: "ended", .. }
    ));
}

#[test]
fn test_resume_throwing_delivers_failure() {
    let body = from_fn(sig("catcher", ValueKind::Text), |frame, cx| {
        match frame.resume_point() {
            0 => {
                frame.notify_invoke(1, 0, 0);
                Ok(cx.suspend(Value::Unit))
            }
            _ => match cx.take_result() {
                Err(FlowError::Resumed(e)) => Ok(Step::Return(Value::from(e.to_string()))),
                other => Err(FlowError::failed(format!("unexpected input {other:?}"))),
            },
        }
    });
    let rt = TestRuntime::new();
    let flow = Flow::start(rt.manager(), body, ())
        .unwrap()
        .into_signal()
        .unwrap()
        .flow()
        .cloned()
        .unwrap();
    let outcome = flow.resume_throwing(anyhow::anyhow!("cancelled by operator")).unwrap();
    assert_eq!(outcome.value(), Some(&Value::from("cancelled by operator")));
}

#[test]
fn test_nested_call_suspends_whole_chain() {
    let inner = accumulator();
    let outer = from_fn(sig("outer", ValueKind::Int), move |frame, cx| {
        match frame.resume_point() {
            0 => {
                frame.notify_invoke(1, 0, 0);
                Ok(cx.call(inner.clone(), 5))
            }
            _ => {
                let inner_total = cx.take_result()?.as_int().unwrap_or_default();
                Ok(Step::Return(Value::Int(inner_total * 2)))
            }
        }
    });
    let rt = TestRuntime::new();
    let flow = Flow::start(rt.manager(), outer, ())
        .unwrap()
        .into_signal()
        .unwrap()
        .flow()
        .cloned()
        .unwrap();
    flow.resume(1).unwrap();
    let end = flow.resume(1).unwrap();
    assert_eq!(end.value(), Some(&Value::Int(14)));
}

#[test]
fn test_exception_propagates_to_caller() {
    let failing = from_fn(sig("failing", ValueKind::Int), |_, _| {
        Err(FlowError::failed("boom"))
    });
    let outer = from_fn(sig("handler", ValueKind::Int), move |frame, cx| {
        match frame.resume_point() {
            0 => {
                frame.notify_invoke(1, 0, 0);
                Ok(cx.call(failing.clone(), ()))
            }
            _ => match cx.take_result() {
                Err(FlowError::Failed(message)) if message == "boom" => Ok(Step::Return(Value::Int(-1))),
                other => Err(FlowError::failed(format!("unexpected {other:?}"))),
            },
        }
    });
    let rt = TestRuntime::new();
    let outcome = Flow::start(rt.manager(), outer, ()).unwrap();
    assert_eq!(outcome.value(), Some(&Value::Int(-1)));
}

#[test]
fn test_invalid_return_value_reaches_caller() {
    let liar = from_fn(sig("liar", ValueKind::Int), |_, _| {
        Ok(Step::Return(Value::from("not a number")))
    });
    let rt = TestRuntime::new();
    let err = Flow::start(rt.manager(), liar, ()).unwrap_err();
    assert!(matches!(
        err,
        FlowError::InvalidReturnValue { expected: ValueKind::Int, actual: ValueKind::Text, .. }
    ));
}

#[test]
fn test_call_without_capture_is_a_frame_fault() {
    let callee = from_fn(sig("callee", ValueKind::Unit), |_, _| Ok(Step::Return(Value::Unit)));
    let careless = from_fn(sig("careless", ValueKind::Unit), move |_, cx| {
        Ok(cx.call(callee.clone(), ()))
    });
    let rt = TestRuntime::new();
    let err = Flow::start(rt.manager(), careless, ()).unwrap_err();
    assert!(matches!(err, FlowError::Frame(FrameError::NotCaptured { .. })));
}

#[test]
fn test_copy_is_independent() {
    let rt = TestRuntime::new();
    let original = Flow::start(rt.manager(), accumulator(), 0)
        .unwrap()
        .into_signal()
        .unwrap()
        .flow()
        .cloned()
        .unwrap();
    let copy = original.copy().unwrap();
    assert_ne!(copy.id(), original.id());
    assert_eq!(copy.state(), FlowState::Suspended);

    original.resume(1).unwrap();
    copy.resume(50).unwrap();
    assert_eq!(original.resume(1).unwrap().value(), Some(&Value::Int(2)));
    assert_eq!(copy.resume(50).unwrap().value(), Some(&Value::Int(100)));
}

#[test]
fn test_current_flow_is_visible_inside_functions() {
    let body = from_fn(sig("whoami", ValueKind::Bool), |_, cx| {
        let current = Flow::current().map(|flow| flow.id());
        Ok(Step::Return(Value::Bool(current == Some(cx.flow().id()))))
    });
    let rt = TestRuntime::new();
    let outcome = Flow::start(rt.manager(), body, ()).unwrap();
    assert_eq!(outcome.value(), Some(&Value::Bool(true)));
    assert!(Flow::current().is_none());
}

#[test]
fn test_activate_runs_on_worker() {
    let rt = TestRuntime::new();
    let flow = Flow::start(rt.manager(), accumulator(), 0)
        .unwrap()
        .into_signal()
        .unwrap()
        .flow()
        .cloned()
        .unwrap();
    let outcome = rt.wait(flow.activate(4).unwrap()).unwrap();
    assert_eq!(outcome.signal().unwrap().payload(), &Value::Int(4));
    let outcome = rt.wait(flow.activate(4).unwrap()).unwrap();
    assert_eq!(outcome.value(), Some(&Value::Int(8)));
}

#[test]
fn test_sleep_reactivates_after_delay() {
    let entries = Arc::new(AtomicUsize::new(0));
    let counter = entries.clone();
    let body = from_fn(sig("sleeper", ValueKind::Text), move |frame, cx| {
        counter.fetch_add(1, Ordering::SeqCst);
        match frame.resume_point() {
            0 => {
                frame.notify_invoke(1, 0, 0);
                Ok(cx.sleep(Duration::from_millis(20)))
            }
            _ => Ok(Step::Return(Value::from("rested"))),
        }
    });
    let rt = TestRuntime::new();
    let task = rt.task("sleepers");
    let activation = task.spawn(body, ());
    let flow = activation.flow().clone();
    let first = rt.wait(activation).unwrap();
    assert!(first.is_suspended());
    assert_eq!(rt.join(&flow).unwrap(), Value::from("rested"));
    assert_eq!(entries.load(Ordering::SeqCst), 2);
}

#[test]
fn test_park_on_future() {
    let body = from_fn(sig("awaiter", ValueKind::Int), |frame, cx| {
        match frame.resume_point() {
            0 => {
                frame.notify_invoke(1, 0, 0);
                cx.park_on(async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Value::Int(9)
                })
            }
            _ => Ok(Step::Return(cx.take_result()?)),
        }
    });
    let rt = TestRuntime::new();
    let activation = Flow::spawn(rt.manager(), body, ());
    let flow = activation.flow().clone();
    rt.wait(activation).unwrap();
    assert_eq!(rt.join(&flow).unwrap(), Value::Int(9));
}

#[test]
fn test_listener_and_counters() {
    let rt = TestRuntime::new();
    let parent = rt.task("parent");
    let child = parent.child("child");
    let listener = RecordingListener::new();
    child.add_listener(listener.clone());

    let flow = child
        .start(accumulator(), 0)
        .unwrap()
        .into_signal()
        .unwrap()
        .flow()
        .cloned()
        .unwrap();
    assert_eq!(child.suspended_count(), 1);
    assert_eq!(parent.suspended_count(), 1);
    assert_eq!(parent.active_count(), 0);
    assert_eq!(child.flows().len(), 1);

    flow.resume(1).unwrap();
    flow.resume(1).unwrap();
    assert_eq!(parent.suspended_count(), 0);
    assert!(child.flows().is_empty());

    let events = listener.events();
    assert_eq!(events.first(), Some(&ListenerEvent::Started(flow.id())));
    assert_eq!(
        listener.count(|event| matches!(event, ListenerEvent::Suspended(..))),
        2
    );
    assert_eq!(
        events.last(),
        Some(&ListenerEvent::Ended { flow: flow.id(), ok: true })
    );
}

#[test]
fn test_interrupted_flow_fails_at_next_blocking_op() {
    let body = from_fn(sig("waiter", ValueKind::Any), |frame, cx| {
        match frame.resume_point() {
            0 => {
                frame.notify_invoke(1, 0, 0);
                Ok(cx.suspend(Value::Unit))
            }
            1 => {
                frame.notify_invoke(2, 0, 0);
                cx.task()?.wait(cx, "never")
            }
            _ => Ok(Step::Return(cx.take_result()?)),
        }
    });
    let rt = TestRuntime::new();
    let task = rt.task("interrupts");
    let flow = task
        .start(body, ())
        .unwrap()
        .into_signal()
        .unwrap()
        .flow()
        .cloned()
        .unwrap();
    flow.interrupt();
    let err = flow.resume(()).unwrap_err();
    assert!(err.is_interrupted());
    assert_eq!(flow.state(), FlowState::Interrupted);
}

#[test]
fn test_interrupt_is_delivered_at_suspend() {
    let body = from_fn(sig("self-interrupt", ValueKind::Any), |frame, cx| {
        match frame.resume_point() {
            0 => {
                cx.flow().interrupt();
                frame.notify_invoke(1, 0, 0);
                Ok(cx.suspend(Value::Unit))
            }
            _ => Ok(Step::Return(cx.take_result()?)),
        }
    });
    let rt = TestRuntime::new();
    let err = Flow::start(rt.manager(), body, ()).unwrap_err();
    assert!(err.is_interrupted());
}
