//! Continuation - A Reusable Snapshot of a Flow
//!
//! A checkpoint stores a deep copy of the whole frame chain. Every
//! [`Continuation::resume`] starts a new flow from a fresh copy of that
//! snapshot, so the same continuation can be resumed any number of times.

use crate::error::{FlowError, FlowResult};
use crate::flow::{Entry, Flow, FlowState, Stack};
use crate::manager::{Activation, FlowManager};
use crate::signal::FlowOutcome;
use crate::task::Task;
use flowline_frame::Value;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

struct Snapshot {
    stack: Stack,
    task: Option<Task>,
    manager: Arc<dyn FlowManager>,
}

#[derive(Clone, Default)]
pub struct Continuation {
    snapshot: Arc<Mutex<Option<Snapshot>>>,
}

impl Continuation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_captured(&self) -> bool {
        self.snapshot.lock().is_some()
    }

    pub(crate) fn capture(&self, flow: &Flow, stack: &Stack) {
        *self.snapshot.lock() = Some(Snapshot {
            stack: stack.copy(),
            task: flow.task().cloned(),
            manager: flow.manager().clone(),
        });
    }

    /// A fresh copy of the captured chain.
    pub(crate) fn stack(&self) -> Option<Stack> {
        self.snapshot.lock().as_ref().map(|snapshot| snapshot.stack.copy())
    }

    fn instantiate(&self) -> FlowResult<(Flow, Stack)> {
        let guard = self.snapshot.lock();
        let snapshot = guard.as_ref().ok_or(FlowError::Uncaptured)?;
        let flow = Flow::build(
            Uuid::new_v4(),
            snapshot.task.clone(),
            snapshot.manager.clone(),
            FlowState::Active,
            None,
        );
        Ok((flow, snapshot.stack.copy()))
    }

    /// Run a new flow from the checkpoint on the calling thread; `value`
    /// is the checkpoint's result in that flow.
    pub fn resume(&self, value: impl Into<Value>) -> FlowResult<FlowOutcome> {
        let (flow, stack) = self.instantiate()?;
        tracing::debug!(flow_id = %flow.id(), "resuming continuation");
        flow.drive(stack, Ok(value.into()), Entry::Restore)
    }

    /// Like `resume`, on a worker thread.
    pub fn activate(&self, value: impl Into<Value>) -> FlowResult<Activation> {
        let (flow, stack) = self.instantiate()?;
        Ok(flow.launch(stack, Ok(value.into()), Entry::Restore))
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("captured", &self.is_captured())
            .finish()
    }
}
