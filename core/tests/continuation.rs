use flowline_core::prelude::*;
use flowline_test::{TestRuntime, wait_until};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn sig(name: &str) -> Signature {
    Signature::new("tests", name, ValueKind::Any)
}

#[test]
fn test_checkpoint_is_reusable() {
    let checkpoint = Continuation::new();
    let body = {
        let checkpoint = checkpoint.clone();
        from_fn(sig("checkpointed"), move |frame, cx| match frame.resume_point() {
            0 => {
                let base = cx.take_result()?.as_int().unwrap_or_default();
                frame.notify_invoke(1, 1, 0);
                frame.save_int(0, base)?;
                Ok(cx.checkpoint(&checkpoint))
            }
            _ => match cx.take_result()? {
                Value::Bool(false) => Ok(Step::Return(Value::from("captured"))),
                Value::Int(n) => Ok(Step::Return(Value::Int(frame.int(0)? + n))),
                other => Err(FlowError::failed(format!("unexpected {other}"))),
            },
        })
    };

    let rt = TestRuntime::new();
    assert!(!checkpoint.is_captured());
    let outcome = Flow::start(rt.manager(), body, 100).unwrap();
    assert_eq!(outcome.value(), Some(&Value::from("captured")));
    assert!(checkpoint.is_captured());

    assert_eq!(checkpoint.resume(10).unwrap().value(), Some(&Value::Int(110)));
    assert_eq!(checkpoint.resume(20).unwrap().value(), Some(&Value::Int(120)));
    let activation = checkpoint.activate(1).unwrap();
    assert_eq!(rt.wait(activation).unwrap().value(), Some(&Value::Int(101)));
}

#[test]
fn test_uncaptured_continuation() {
    let checkpoint = Continuation::new();
    assert!(matches!(checkpoint.resume(1), Err(FlowError::Uncaptured)));
    assert!(matches!(checkpoint.activate(1), Err(FlowError::Uncaptured)));
}

#[test]
fn test_return_and_continue() {
    let continued: Arc<Mutex<Option<Flow>>> = Arc::default();
    let worker = {
        let continued = continued.clone();
        from_fn(sig("background"), move |frame, cx| match frame.resume_point() {
            0 => {
                frame.notify_invoke(1, 0, 0);
                Ok(cx.return_and_continue(7))
            }
            _ => {
                *continued.lock().unwrap() = Flow::current();
                Ok(Step::Return(Value::from("finished later")))
            }
        })
    };
    let caller = from_fn(sig("foreground"), move |frame, cx| match frame.resume_point() {
        0 => {
            frame.notify_invoke(1, 0, 0);
            Ok(cx.call(worker.clone(), ()))
        }
        _ => {
            let early = cx.take_result()?.as_int().unwrap_or_default();
            Ok(Step::Return(Value::Int(early + 1)))
        }
    });

    let rt = TestRuntime::new();
    let activation = Flow::spawn(rt.manager(), caller, ());
    let original = activation.flow().clone();
    assert_eq!(rt.wait(activation).unwrap().value(), Some(&Value::Int(8)));

    assert!(wait_until(Duration::from_secs(2), || continued.lock().unwrap().is_some()));
    let background = continued.lock().unwrap().clone().unwrap();
    assert_ne!(background.id(), original.id());
    assert_eq!(rt.join(&background).unwrap(), Value::from("finished later"));
}
