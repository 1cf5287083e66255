//! Flowline facade crate.
//!
//! This crate re-exports the frame, core and runtime crates with a single entry point.
//! `Runtime::new(RuntimeConfig::from_env()?)` is the usual way in.

pub use flowline_core as core;
pub use flowline_frame as frame;
pub use flowline_runtime as runtime;

pub use flowline_core::{
    Continuation, EventPicker, Flow, FlowContext, FlowError, FlowOutcome, FlowResult, Process,
    Resumable, Signal, Step, Task, ThreadFreeLock,
};
pub use flowline_runtime::{Runtime, RuntimeConfig};

pub mod prelude {
    pub use flowline_core::prelude::*;
    pub use flowline_runtime::prelude::*;
}
