//! Flowline Frame - Activation Record Layer
//!
//! This crate defines the **data** side of a suspendable flow:
//! - `Value`: dynamic locals, messages and results
//! - `Frame`: one activation record (resume point + save slots)
//! - `FrameChain`: the per-flow arena of frames, root to leaf
//!
//! **IMPORTANT**: This layer is Pure Rust - no threads, no IO, no Async.

pub mod chain;
pub mod error;
pub mod frame;
pub mod value;

pub use chain::FrameChain;
pub use error::FrameError;
pub use frame::{Exit, Frame, FrameId, FrameState, Signature};
pub use value::{Opaque, Value, ValueKind};
