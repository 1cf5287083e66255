//! Resumable - The Function Contract
//!
//! A resumable function is an explicit state machine over its frame's
//! resume point. Every time the flow enters or re-enters it, `resume` is
//! called with the function's [`Frame`]; the function returns a [`Step`]
//! telling the flow trampoline what to do next.
//!
//! # Example
//! ```rust,ignore
//! struct Doubler;
//!
//! impl Resumable for Doubler {
//!     fn signature(&self) -> Signature {
//!         Signature::new("demo", "doubler", ValueKind::Int)
//!     }
//!
//!     fn resume(&self, frame: &mut Frame, cx: &mut FlowContext<'_>) -> FlowResult<Step> {
//!         match frame.resume_point() {
//!             0 => {
//!                 let n = cx.take_result()?.as_int().unwrap_or_default();
//!                 frame.notify_invoke(1, 1, 0);
//!                 frame.save_int(0, n)?;
//!                 Ok(cx.suspend("waiting for factor"))
//!             }
//!             _ => {
//!                 let n = frame.int(0)?;
//!                 let factor = cx.take_result()?.as_int().unwrap_or(2);
//!                 Ok(Step::Return(Value::Int(n * factor)))
//!             }
//!         }
//!     }
//! }
//! ```

use crate::context::FlowContext;
use crate::continuation::Continuation;
use crate::error::FlowResult;
use crate::signal::Signal;
use flowline_frame::{Frame, Signature, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub trait Resumable: Send + Sync + 'static {
    /// Identity checked on every re-entry of a frame bound to this function.
    fn signature(&self) -> Signature;

    /// Run from `frame.resume_point()` until the next call, suspension point
    /// or return. An `Err` is a return by exception.
    fn resume(&self, frame: &mut Frame, cx: &mut FlowContext<'_>) -> FlowResult<Step>;
}

/// What a resumable function asks the trampoline to do.
pub enum Step {
    /// Return normally to the caller frame.
    Return(Value),
    /// Invoke another resumable function; its result is the next input.
    Call {
        callee: Arc<dyn Resumable>,
        arg: Value,
    },
    /// A suspension-point operation completed without parking.
    Continue(Value),
    /// Park `SUSPENDED` and hand the signal to the controller.
    Signal(Signal),
    /// Park `BLOCKED` after a primitive registered the flow (see `prepare_park`).
    Park(Signal),
    /// Create branch flows; `join` attaches a merge barrier.
    Fork { branches: u32, join: bool },
    /// Join the innermost fork.
    Merge { timeout: Option<Duration> },
    /// Return to the caller and continue the rest of this body in a new flow.
    ReturnAndContinue(Value),
    /// Capture the whole chain into a continuation, then continue with `false`.
    Checkpoint(Continuation),
    /// Terminate the flow.
    End,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Return(v) => f.debug_tuple("Return").field(v).finish(),
            Step::Call { callee, arg } => f
                .debug_struct("Call")
                .field("callee", &callee.signature())
                .field("arg", arg)
                .finish(),
            Step::Continue(v) => f.debug_tuple("Continue").field(v).finish(),
            Step::Signal(s) => f.debug_tuple("Signal").field(s).finish(),
            Step::Park(s) => f.debug_tuple("Park").field(s).finish(),
            Step::Fork { branches, join } => f
                .debug_struct("Fork")
                .field("branches", branches)
                .field("join", join)
                .finish(),
            Step::Merge { timeout } => f.debug_struct("Merge").field("timeout", timeout).finish(),
            Step::ReturnAndContinue(v) => f.debug_tuple("ReturnAndContinue").field(v).finish(),
            Step::Checkpoint(_) => f.write_str("Checkpoint"),
            Step::End => f.write_str("End"),
        }
    }
}

/// Closure-backed resumable function.
pub struct FnResumable<F> {
    signature: Signature,
    body: F,
}

impl<F> Resumable for FnResumable<F>
where
    F: Fn(&mut Frame, &mut FlowContext<'_>) -> FlowResult<Step> + Send + Sync + 'static,
{
    fn signature(&self) -> Signature {
        self.signature.clone()
    }

    fn resume(&self, frame: &mut Frame, cx: &mut FlowContext<'_>) -> FlowResult<Step> {
        (self.body)(frame, cx)
    }
}

/// Build a resumable function from a closure.
pub fn from_fn<F>(signature: Signature, body: F) -> Arc<dyn Resumable>
where
    F: Fn(&mut Frame, &mut FlowContext<'_>) -> FlowResult<Step> + Send + Sync + 'static,
{
    Arc::new(FnResumable { signature, body })
}
