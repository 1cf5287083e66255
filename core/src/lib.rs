//! Flowline core: suspendable flows over explicit frame chains.
//!
//! A [`Flow`] runs [`Resumable`] functions on a trampoline. Functions park
//! at suspension points (signals, locks, mailbox operations, merges,
//! pickers) without holding a thread, and are continued later on any
//! worker of their [`FlowManager`].

pub mod context;
pub mod continuation;
pub mod error;
pub mod flow;
mod fork;
pub mod key;
pub mod lock;
mod mailbox;
pub mod manager;
pub mod picker;
pub mod process;
pub mod registry;
pub mod resumable;
pub mod signal;
pub mod task;

pub use context::FlowContext;
pub use continuation::Continuation;
pub use error::{FlowError, FlowResult, PersistenceError, StorageError};
pub use flow::{Flow, FlowId, FlowState};
pub use key::Key;
pub use lock::ThreadFreeLock;
pub use mailbox::Request;
pub use manager::{Activation, BoxFuture, FlowManager, Job, TimerAction, TimerHandle, TokioManager};
pub use picker::{EventPicker, Interest};
pub use process::{Process, ProcessState, Storage};
pub use registry::FunctionRegistry;
pub use resumable::{FnResumable, Resumable, Step, from_fn};
pub use signal::{FlowOutcome, Signal, SignalKind};
pub use task::{Task, TaskListener};

pub use flowline_frame::{Frame, FrameChain, FrameError, FrameState, Signature, Value, ValueKind};

pub mod prelude {
    pub use crate::{
        Continuation, EventPicker, Flow, FlowContext, FlowError, FlowOutcome, FlowResult, Key,
        Process, Request, Resumable, Signal, SignalKind, Step, Task, ThreadFreeLock, from_fn,
    };
    pub use flowline_frame::{Frame, Signature, Value, ValueKind};
}
