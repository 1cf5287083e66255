use flowline_core::prelude::*;
use flowline_core::FlowState;
use flowline_test::TestRuntime;
use std::sync::Arc;

/// Suspends once, then waits on an event nobody notifies.
fn idler() -> Arc<dyn Resumable> {
    from_fn(
        Signature::new("tests", "idler", ValueKind::Any),
        |frame, cx| match frame.resume_point() {
            0 => {
                frame.notify_invoke(1, 0, 0);
                Ok(cx.suspend(Value::Unit))
            }
            1 => {
                frame.notify_invoke(2, 0, 0);
                cx.task()?.wait(cx, "never")
            }
            _ => Ok(Step::Return(cx.take_result()?)),
        },
    )
}

fn suspended(task: &Task) -> Flow {
    task.start(idler(), ())
        .unwrap()
        .into_signal()
        .unwrap()
        .flow()
        .cloned()
        .unwrap()
}

#[test]
fn test_task_interrupt_reaches_child_flows() {
    let rt = TestRuntime::new();
    let parent = rt.task("parent");
    let child = parent.child("child");
    let flows = [suspended(&child), suspended(&child)];

    parent.interrupt();
    assert!(child.is_interrupted());
    for flow in &flows {
        assert!(flow.is_interrupted());
        assert!(flow.resume(()).unwrap_err().is_interrupted());
        assert_eq!(flow.state(), FlowState::Interrupted);
    }
    assert!(child.flows().is_empty());
    assert_eq!(parent.suspended_count(), 0);
}

#[test]
fn test_flow_interrupt_is_consumed() {
    let caught = from_fn(
        Signature::new("tests", "catching", ValueKind::Any),
        |frame, cx| match frame.resume_point() {
            0 => {
                frame.notify_invoke(1, 0, 0);
                Ok(cx.suspend(Value::Unit))
            }
            1 => {
                let first = cx.check_interrupted();
                let second = cx.check_interrupted();
                Ok(Step::Return(Value::List(vec![
                    Value::Bool(first.is_err()),
                    Value::Bool(second.is_err()),
                ])))
            }
            _ => Ok(Step::Return(Value::Unit)),
        },
    );
    let rt = TestRuntime::new();
    let flow = Flow::start(rt.manager(), caught, ())
        .unwrap()
        .into_signal()
        .unwrap()
        .flow()
        .cloned()
        .unwrap();
    flow.interrupt();
    let outcome = flow.resume(()).unwrap();
    assert_eq!(
        outcome.value(),
        Some(&Value::List(vec![Value::Bool(true), Value::Bool(false)]))
    );
    assert_eq!(flow.state(), FlowState::Ended);
}
