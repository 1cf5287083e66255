//! Signal - Typed Reasons for Parking
//!
//! A flow never parks silently: every suspension carries a [`Signal`] that
//! is handed to the controller (whoever ran the flow from non-resumable
//! code) inside [`FlowOutcome::Suspended`]. A controller without specific
//! handling calls [`Signal::default_action`].

use crate::error::FlowResult;
use crate::flow::Flow;
use crate::key::Key;
use flowline_frame::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SignalKind {
    /// Plain `suspend`; default disposition does nothing.
    Suspend,
    /// Re-activate the flow after the delay.
    Delay(Duration),
    /// Waiting for a `ThreadFreeLock` hand-off.
    Lock,
    /// Fork creator waiting for its branches.
    Merge,
    Wait(Key),
    Send(Key),
    Call(Key),
    Receive(Key),
    Serve(Key),
    /// Parked in an `EventPicker`.
    Pick,
    /// Waiting for an external future.
    Ready,
    Custom(String),
}

impl SignalKind {
    /// Parks the flow `BLOCKED`: only the primitive that parked it may wake it.
    pub fn is_blocking(&self) -> bool {
        !matches!(
            self,
            SignalKind::Suspend | SignalKind::Delay(_) | SignalKind::Custom(_)
        )
    }

    /// Parked on a mailbox operation, which survives passivation.
    pub fn is_mailbox(&self) -> bool {
        matches!(
            self,
            SignalKind::Wait(_)
                | SignalKind::Send(_)
                | SignalKind::Call(_)
                | SignalKind::Receive(_)
                | SignalKind::Serve(_)
        )
    }
}

#[derive(Clone)]
pub struct Signal {
    kind: SignalKind,
    payload: Value,
    flow: Option<Flow>,
}

impl Signal {
    pub fn new(kind: SignalKind, payload: impl Into<Value>) -> Self {
        Self {
            kind,
            payload: payload.into(),
            flow: None,
        }
    }

    pub fn suspend(payload: impl Into<Value>) -> Self {
        Self::new(SignalKind::Suspend, payload)
    }

    pub fn delay(duration: Duration) -> Self {
        Self::new(SignalKind::Delay(duration), Value::Unit)
    }

    pub fn custom(name: impl Into<String>, payload: impl Into<Value>) -> Self {
        Self::new(SignalKind::Custom(name.into()), payload)
    }

    pub fn kind(&self) -> &SignalKind {
        &self.kind
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// The parked flow; set on every signal delivered to a controller.
    pub fn flow(&self) -> Option<&Flow> {
        self.flow.as_ref()
    }

    pub(crate) fn with_flow(mut self, flow: Flow) -> Self {
        self.flow = Some(flow);
        self
    }

    /// Copy without the flow back-reference, as stored in a parked flow.
    pub(crate) fn detached(&self) -> Self {
        Self::new(self.kind.clone(), self.payload.clone())
    }

    /// Default disposition for controllers with no specific handling.
    pub fn default_action(&self) -> FlowResult<()> {
        match (&self.kind, &self.flow) {
            (SignalKind::Delay(duration), Some(flow)) => {
                flow.activate_after(*duration);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("kind", &self.kind)
            .field("payload", &self.payload)
            .field("flow", &self.flow.as_ref().map(Flow::id))
            .finish()
    }
}

/// What a controller observes when a run of a flow stops.
#[derive(Debug, Clone)]
pub enum FlowOutcome {
    /// The frame chain unwound; the creator call returned this value.
    Ended(Value),
    /// The flow parked; the signal says why and carries the flow.
    Suspended(Signal),
}

impl FlowOutcome {
    pub fn is_ended(&self) -> bool {
        matches!(self, FlowOutcome::Ended(_))
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, FlowOutcome::Suspended(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            FlowOutcome::Ended(value) => Some(value),
            FlowOutcome::Suspended(_) => None,
        }
    }

    pub fn signal(&self) -> Option<&Signal> {
        match self {
            FlowOutcome::Suspended(signal) => Some(signal),
            FlowOutcome::Ended(_) => None,
        }
    }

    pub fn into_signal(self) -> Option<Signal> {
        match self {
            FlowOutcome::Suspended(signal) => Some(signal),
            FlowOutcome::Ended(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_kinds() {
        assert!(!SignalKind::Suspend.is_blocking());
        assert!(!SignalKind::Delay(Duration::from_millis(1)).is_blocking());
        assert!(SignalKind::Lock.is_blocking());
        assert!(SignalKind::Wait(Key::from("k")).is_blocking());
        assert!(SignalKind::Receive(Key::from("k")).is_mailbox());
        assert!(!SignalKind::Merge.is_mailbox());
    }

    #[test]
    fn test_default_action_without_flow_is_noop() {
        let signal = Signal::delay(Duration::from_secs(1));
        assert!(signal.flow().is_none());
        assert!(signal.default_action().is_ok());
    }
}
