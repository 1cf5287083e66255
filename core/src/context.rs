use crate::continuation::Continuation;
use crate::error::{FlowError, FlowResult};
use crate::flow::Flow;
use crate::fork;
use crate::manager::BoxFuture;
use crate::resumable::{Resumable, Step};
use crate::signal::{Signal, SignalKind};
use crate::task::Task;
use flowline_frame::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Handle a resumable function gets for the duration of one step.
///
/// Carries the input of the step (call argument, callee result or resume
/// value) and builds the [`Step`]s for flow operations.
pub struct FlowContext<'a> {
    flow: &'a Flow,
    input: Option<FlowResult<Value>>,
}

impl<'a> FlowContext<'a> {
    pub(crate) fn new(flow: &'a Flow, input: FlowResult<Value>) -> Self {
        Self {
            flow,
            input: Some(input),
        }
    }

    pub fn flow(&self) -> &Flow {
        self.flow
    }

    pub fn task(&self) -> FlowResult<Task> {
        self.flow.task().cloned().ok_or(FlowError::NoTask)
    }

    /// Input of this step; an injected failure comes back as `Err`.
    ///
    /// Subsequent calls in the same step yield `Unit`.
    pub fn take_result(&mut self) -> FlowResult<Value> {
        self.input.take().unwrap_or(Ok(Value::Unit))
    }

    /// Peek at the input without consuming it.
    pub fn input(&self) -> Option<&FlowResult<Value>> {
        self.input.as_ref()
    }

    pub fn call(&self, callee: Arc<dyn Resumable>, arg: impl Into<Value>) -> Step {
        Step::Call {
            callee,
            arg: arg.into(),
        }
    }

    /// Park `SUSPENDED` with a plain suspend signal.
    pub fn suspend(&self, payload: impl Into<Value>) -> Step {
        Step::Signal(Signal::suspend(payload))
    }

    pub fn signal(&self, signal: Signal) -> Step {
        Step::Signal(signal)
    }

    /// Park and get re-activated after `duration` by the default disposition.
    pub fn sleep(&self, duration: Duration) -> Step {
        Step::Signal(Signal::delay(duration))
    }

    /// Fork `branches` joinable branches.
    pub fn fork(&self, branches: u32) -> Step {
        Step::Fork {
            branches,
            join: true,
        }
    }

    /// Fork `branches` branches without a merge barrier.
    pub fn split(&self, branches: u32) -> Step {
        Step::Fork {
            branches,
            join: false,
        }
    }

    pub fn merge(&self) -> FlowResult<Step> {
        self.merge_with(None)
    }

    /// Merge, giving up after `timeout`; the creator then sees `false`.
    pub fn merge_timeout(&self, timeout: Duration) -> FlowResult<Step> {
        self.merge_with(Some(timeout))
    }

    fn merge_with(&self, timeout: Option<Duration>) -> FlowResult<Step> {
        let link = self.flow.innermost_fork().ok_or(FlowError::NoActiveFork)?;
        if !link.is_branch() {
            self.check_interrupted()?;
        }
        Ok(Step::Merge { timeout })
    }

    /// Detach from the innermost fork without merging.
    pub fn forget_fork(&self) -> FlowResult<()> {
        fork::forget(self.flow)
    }

    pub fn fork_id(&self) -> Option<u32> {
        self.flow.fork_id()
    }

    pub fn end(&self) -> Step {
        Step::End
    }

    pub fn return_and_continue(&self, value: impl Into<Value>) -> Step {
        Step::ReturnAndContinue(value.into())
    }

    /// Capture the flow into `continuation`; continues with `false` now and
    /// with whatever `Continuation::resume` passes later.
    pub fn checkpoint(&self, continuation: &Continuation) -> Step {
        Step::Checkpoint(continuation.clone())
    }

    /// Park until `future` completes; its output is the result.
    pub fn park_on<F>(&self, future: F) -> FlowResult<Step>
    where
        F: Future<Output = Value> + Send + 'static,
    {
        self.check_interrupted()?;
        self.prepare_park()?;
        let flow = self.flow.clone();
        let ready: BoxFuture<'static, ()> = Box::pin(async move {
            let value = future.await;
            if !flow.wake(Ok(value)) {
                tracing::warn!(flow_id = %flow.id(), "future completed for a flow that is not parked");
            }
        });
        self.flow.manager().spawn(ready);
        Ok(Step::Park(Signal::new(SignalKind::Ready, Value::Unit)))
    }

    /// Fail with `Interrupted` if an interrupt is pending; clears it.
    pub fn check_interrupted(&self) -> FlowResult<()> {
        if self.flow.take_interrupt() {
            return Err(FlowError::Interrupted);
        }
        Ok(())
    }

    pub(crate) fn prepare_park(&self) -> FlowResult<()> {
        self.flow.prepare_park()
    }
}
