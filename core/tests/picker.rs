use flowline_core::prelude::*;
use flowline_test::TestRuntime;
use std::sync::Arc;
use std::time::Duration;

fn sig(name: &str) -> Signature {
    Signature::new("tests", name, ValueKind::Any)
}

fn won(cx: &mut FlowContext<'_>) -> FlowResult<bool> {
    Ok(cx.take_result()? == Value::Bool(true))
}

/// Picks between events "a" and "b" and a timeout; returns the winner's label.
fn chooser(picker: &EventPicker, timeout: Duration) -> Arc<dyn Resumable> {
    let picker = picker.clone();
    from_fn(sig("chooser"), move |frame, cx| {
        match frame.resume_point() {
            0 => {
                frame.notify_invoke(1, 0, 0);
                Ok(picker.on_event(cx, "a"))
            }
            1 => {
                if won(cx)? {
                    return Ok(Step::Return(Value::from("a")));
                }
                frame.notify_invoke(2, 0, 0);
                Ok(picker.on_event(cx, "b"))
            }
            2 => {
                if won(cx)? {
                    let message = picker.message().unwrap_or_default();
                    return Ok(Step::Return(Value::List(vec![Value::from("b"), message])));
                }
                frame.notify_invoke(3, 0, 0);
                Ok(picker.on_timeout(cx, timeout))
            }
            3 => {
                if won(cx)? {
                    return Ok(Step::Return(Value::from("timeout")));
                }
                frame.notify_invoke(4, 0, 0);
                picker.pick(cx)
            }
            _ => Err(FlowError::failed("pick resumed past its guards")),
        }
    })
}

#[test]
fn test_event_wins_pick() {
    let rt = TestRuntime::new();
    let task = rt.task("picker");
    let picker = EventPicker::new();
    let flow = task
        .start(chooser(&picker, Duration::from_secs(10)), ())
        .unwrap()
        .into_signal()
        .unwrap()
        .flow()
        .cloned()
        .unwrap();
    assert_eq!(picker.guard_count(), 3);

    assert_eq!(task.notify_all("b", "payload"), 1);
    assert_eq!(
        rt.join(&flow).unwrap(),
        Value::List(vec![Value::from("b"), Value::from("payload")])
    );
    assert_eq!(picker.winner(), Some(1));
    assert_eq!(task.notify_all("a", "late"), 0);
}

#[test]
fn test_timeout_wins_pick() {
    let rt = TestRuntime::new();
    let task = rt.task("picker");
    let picker = EventPicker::new();
    let activation = task.spawn(chooser(&picker, Duration::from_millis(30)), ());
    let flow = activation.flow().clone();
    rt.wait(activation).unwrap();
    assert_eq!(rt.join(&flow).unwrap(), Value::from("timeout"));
    assert_eq!(picker.winner(), Some(2));
    assert_eq!(task.notify_all("b", "too late"), 0);
}

#[test]
fn test_pick_without_guards() {
    let picker = EventPicker::new();
    let body = {
        let picker = picker.clone();
        from_fn(sig("empty"), move |frame, cx| {
            frame.notify_invoke(1, 0, 0);
            picker.pick(cx)
        })
    };
    let rt = TestRuntime::new();
    let err = Flow::start(rt.manager(), body, ()).unwrap_err();
    assert!(matches!(err, FlowError::EmptyPick));
}

#[test]
fn test_event_guard_needs_a_task() {
    let picker = EventPicker::new();
    let rt = TestRuntime::new();
    let err = Flow::start(rt.manager(), chooser(&picker, Duration::from_secs(1)), ()).unwrap_err();
    assert!(matches!(err, FlowError::NoTask));
}
