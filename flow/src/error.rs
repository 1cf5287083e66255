use crate::frame::FrameState;
use crate::value::ValueKind;
use thiserror::Error;

/// Frame-level faults raised while capturing or replaying activations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("Frame consistency fault: {0}")]
    Inconsistent(String),

    #[error("Frame of `{function}` is {actual:?}, expected {expected:?}")]
    UnexpectedState {
        function: String,
        expected: FrameState,
        actual: FrameState,
    },

    #[error("Frame of `{function}` was not captured before leaving at a suspension point")]
    NotCaptured { function: String },

    #[error("Save slot {index} is out of range ({len} allocated)")]
    SlotOutOfRange { index: usize, len: usize },

    #[error("Save slot {index} holds {actual}, expected {expected}")]
    SlotType {
        index: usize,
        expected: ValueKind,
        actual: ValueKind,
    },

    #[error("Frame chain is empty")]
    EmptyChain,
}
