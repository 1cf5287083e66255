use crate::key::Key;
use flowline_frame::{FrameError, Signature, ValueKind};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub type FlowResult<T> = Result<T, FlowError>;

/// Every failure a flow operation can report.
///
/// Protocol misuse (`NotInFlow` .. `EmptyPick`) is reported at the call
/// site and never retried. `Resumed` wraps a failure injected through
/// [`crate::Flow::resume_throwing`], so resumed code can tell it apart from
/// a value.
#[derive(Error, Debug, Clone)]
pub enum FlowError {
    #[error("Operation requires a running flow")]
    NotInFlow,

    #[error("Flow does not belong to a task")]
    NoTask,

    #[error("Address {0} already has a registered receiver")]
    AddressConflict(Key),

    #[error("No active fork in the calling flow")]
    NoActiveFork,

    #[error("Flow {flow} is {actual}, expected {expected}")]
    IllegalState {
        flow: Uuid,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Lock is not owned by flow {0}")]
    NotOwner(Uuid),

    #[error("Event picker has no registered guards")]
    EmptyPick,

    #[error("Flow was interrupted")]
    Interrupted,

    #[error("Continuation has not captured a frame chain yet")]
    Uncaptured,

    #[error("Resumed with injected failure: {0}")]
    Resumed(Arc<anyhow::Error>),

    #[error("`{function}` returned {actual}, declared {expected}")]
    InvalidReturnValue {
        function: String,
        expected: ValueKind,
        actual: ValueKind,
    },

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("Flow manager failed to run the flow: {0}")]
    Join(String),

    #[error("Flow failed: {0}")]
    Failed(String),

    #[error("{0}")]
    Other(Arc<anyhow::Error>),
}

impl FlowError {
    pub fn failed(message: impl Into<String>) -> Self {
        FlowError::Failed(message.into())
    }

    /// Wrap an arbitrary failure for delivery through `resume_throwing`.
    pub fn resumed(error: impl Into<anyhow::Error>) -> Self {
        FlowError::Resumed(Arc::new(error.into()))
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, FlowError::Interrupted)
    }
}

impl From<anyhow::Error> for FlowError {
    fn from(error: anyhow::Error) -> Self {
        FlowError::Other(Arc::new(error))
    }
}

/// Faults while passivating or reviving a process.
#[derive(Error, Debug, Clone)]
pub enum PersistenceError {
    #[error("Malformed process image: {0}")]
    Structure(String),

    #[error("Process image holds {actual} flows, header announces {expected}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("Identity tag of flow #{index} does not match the image seed")]
    TagMismatch { index: usize },

    #[error("No registered function for {0}")]
    UnknownFunction(Signature),

    #[error("Flow {flow} cannot be passivated: {reason}")]
    NotPassivatable { flow: Uuid, reason: String },

    #[error("Process is {0}")]
    WrongState(&'static str),

    #[error("{0} flows are still running")]
    Busy(usize),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<serde_json::Error> for PersistenceError {
    fn from(error: serde_json::Error) -> Self {
        PersistenceError::Serialization(error.to_string())
    }
}

/// Failure reported by a [`crate::Storage`] backend.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Nothing stored")]
    Empty,

    #[error("Storage backend error: {0}")]
    Backend(String),
}
