//! Manager - Worker Threads and Timers for Flows
//!
//! A [`FlowManager`] decides where an activated flow runs and fires the
//! timers behind timeout-bearing operations. Flows never pick a thread
//! themselves: `Flow::activate`, lock hand-off, mailbox delivery and fork
//! branches all go through the manager of the flow.
//!
//! [`TokioManager`] runs flows on the blocking pool of a tokio runtime
//! (a running flow executes synchronous code) and timers as async tasks.

use crate::error::{FlowError, FlowResult};
use crate::flow::Flow;
use crate::signal::FlowOutcome;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Type alias for boxed futures handed to the manager.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A unit of flow execution: runs a flow until it parks or ends.
pub type Job = Box<dyn FnOnce() -> FlowResult<FlowOutcome> + Send + 'static>;

/// Deferred action fired by a timer.
pub type TimerAction = Box<dyn FnOnce() + Send + 'static>;

pub trait FlowManager: Send + Sync + 'static {
    /// Run `job` on some worker thread.
    fn execute(&self, job: Job) -> JoinHandle<FlowResult<FlowOutcome>>;

    /// Fire `action` once after `delay` unless cancelled.
    fn schedule(&self, delay: Duration, action: TimerAction) -> TimerHandle;

    /// Drive a future to completion in the background.
    fn spawn(&self, future: BoxFuture<'static, ()>);
}

/// Default manager backed by a tokio runtime.
#[derive(Clone)]
pub struct TokioManager {
    handle: Handle,
}

impl TokioManager {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Manager for the tokio runtime the caller is running in, if any.
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl fmt::Debug for TokioManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioManager")
            .field("runtime", &self.handle.runtime_flavor())
            .finish()
    }
}

impl FlowManager for TokioManager {
    fn execute(&self, job: Job) -> JoinHandle<FlowResult<FlowOutcome>> {
        self.handle.spawn_blocking(job)
    }

    fn schedule(&self, delay: Duration, action: TimerAction) -> TimerHandle {
        let handle = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            action();
        });
        TimerHandle { handle }
    }

    fn spawn(&self, future: BoxFuture<'static, ()>) {
        self.handle.spawn(future);
    }
}

/// Cancellable timer registration.
#[derive(Debug)]
pub struct TimerHandle {
    handle: JoinHandle<()>,
}

impl TimerHandle {
    pub fn from_handle(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    /// Cancel the timer; a no-op once it has fired.
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

/// Future of one asynchronous activation of a flow.
///
/// Resolves when the flow parks again or ends. Recovery has already run by
/// then: new signals got their default disposition and failures were logged.
pub struct Activation {
    flow: Flow,
    handle: JoinHandle<FlowResult<FlowOutcome>>,
}

impl Activation {
    pub(crate) fn new(flow: Flow, handle: JoinHandle<FlowResult<FlowOutcome>>) -> Self {
        Self { flow, handle }
    }

    /// The flow being run.
    pub fn flow(&self) -> &Flow {
        &self.flow
    }
}

impl fmt::Debug for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activation")
            .field("flow", &self.flow.id())
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}

impl Future for Activation {
    type Output = FlowResult<FlowOutcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(e) => Err(FlowError::Join(e.to_string())),
        })
    }
}
