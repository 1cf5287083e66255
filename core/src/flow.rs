//! Flow - The Suspendable Thread of Control
//!
//! A [`Flow`] owns a chain of frames and a state. While `ACTIVE` the frame
//! chain belongs to the worker thread running the trampoline; while parked
//! it is stored inside the flow, and whoever resumes the flow takes it back
//! out. Exactly one of the two holds it at any time.
//!
//! # States
//! ```text
//! ACTIVE ─▶ SUSPENDING ─▶ SUSPENDED   (user signal, external resume)
//!                     └─▶ BLOCKED     (primitive park, internal wake)
//! ACTIVE ─▶ TEMP_SUSPENDED ─▶ ACTIVE  (fork / checkpoint / return-and-continue)
//! any    ─▶ ENDED | INTERRUPTED | PASSIVE
//! ```
//!
//! # Parking handshake
//! A blocking primitive first calls `prepare_park` (ACTIVE → SUSPENDING)
//! while holding its own lock, registers the flow, and returns
//! [`Step::Park`]. A wake that lands before the trampoline completes the
//! park is kept as a pending wake and consumed immediately, so no wake is
//! ever lost and the flow never runs on two threads.

use crate::context::FlowContext;
use crate::error::{FlowError, FlowResult, PersistenceError};
use crate::fork::{self, ForkLink};
use crate::manager::{Activation, FlowManager};
use crate::resumable::{Resumable, Step};
use crate::signal::{FlowOutcome, Signal};
use crate::task::Task;
use flowline_frame::{Exit, Frame, FrameChain, FrameError, Signature, Value};
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub type FlowId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowState {
    Active,
    /// Parking in progress; a wake is recorded as pending.
    Suspending,
    /// Momentarily stopped for a fork, checkpoint or return-and-continue.
    TempSuspended,
    /// Parked by a user signal; `resume` / `activate` continue it.
    Suspended,
    /// Parked by a primitive; only that primitive wakes it.
    Blocked,
    /// Written out by process passivation.
    Passive,
    Interrupted,
    Ended,
}

impl FlowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowState::Active => "active",
            FlowState::Suspending => "suspending",
            FlowState::TempSuspended => "temp-suspended",
            FlowState::Suspended => "suspended",
            FlowState::Blocked => "blocked",
            FlowState::Passive => "passive",
            FlowState::Interrupted => "interrupted",
            FlowState::Ended => "ended",
        }
    }

    /// Counted as active by the owning task.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            FlowState::Active | FlowState::Suspending | FlowState::TempSuspended
        )
    }

    /// Counted as suspended by the owning task.
    pub fn is_parked(&self) -> bool {
        matches!(self, FlowState::Suspended | FlowState::Blocked)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, FlowState::Ended | FlowState::Interrupted)
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Stack
// ============================================================================

/// Frame chain plus the function bound to each frame.
#[derive(Clone, Default)]
pub(crate) struct Stack {
    chain: FrameChain,
    bodies: Vec<Arc<dyn Resumable>>,
}

impl Stack {
    pub(crate) fn root(body: Arc<dyn Resumable>) -> Self {
        let mut stack = Self::default();
        stack.push(body);
        stack
    }

    pub(crate) fn from_parts(chain: FrameChain, bodies: Vec<Arc<dyn Resumable>>) -> Self {
        Self { chain, bodies }
    }

    fn push(&mut self, body: Arc<dyn Resumable>) {
        self.chain.push(body.signature());
        self.bodies.push(body);
    }

    fn pop(&mut self) -> Option<Frame> {
        self.bodies.pop();
        self.chain.pop()
    }

    fn leaf_body(&self) -> Option<Arc<dyn Resumable>> {
        self.bodies.last().cloned()
    }

    fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    pub(crate) fn chain(&self) -> &FrameChain {
        &self.chain
    }

    pub(crate) fn copy(&self) -> Self {
        Self {
            chain: self.chain.copy(),
            bodies: self.bodies.clone(),
        }
    }

    pub(crate) fn shallow_copy(&self) -> Self {
        Self {
            chain: self.chain.shallow_copy(),
            bodies: self.bodies.clone(),
        }
    }

    fn detach_leaf(&self) -> FlowResult<Self> {
        let body = self.leaf_body().ok_or(FrameError::EmptyChain)?;
        Ok(Self {
            chain: self.chain.detach_leaf()?,
            bodies: vec![body],
        })
    }

    pub(crate) fn restore_leaf(&mut self) -> FlowResult<()> {
        self.chain.restore_leaf()?;
        Ok(())
    }

    fn require_captured(&self) -> Result<(), FrameError> {
        let frame = self
            .chain
            .leaf()
            .and_then(|leaf| self.chain.get(leaf))
            .ok_or(FrameError::EmptyChain)?;
        if frame.state() != flowline_frame::FrameState::Invoking {
            return Err(FrameError::NotCaptured {
                function: frame.signature().qualified_name(),
            });
        }
        Ok(())
    }
}

/// How the trampoline enters the leaf frame of a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Entry {
    /// New root frame, run from the top.
    Fresh,
    /// Parked chain; validate it and re-enter the leaf.
    Restore,
}

/// Trampoline decision after one step of the leaf function.
pub(crate) enum Next {
    Enter(FlowResult<Value>),
    Parked(Signal),
    Done(FlowResult<Value>),
}

/// A parked flow lifted out for passivation.
pub(crate) struct Retired {
    pub(crate) state: FlowState,
    pub(crate) stack: Stack,
    pub(crate) signal: Signal,
}

pub(crate) struct Wake {
    input: FlowResult<Value>,
    rewind: Option<Stack>,
}

// ============================================================================
// Current flow
// ============================================================================

thread_local! {
    static CURRENT: RefCell<Option<Flow>> = const { RefCell::new(None) };
}

struct CurrentFlow {
    previous: Option<Flow>,
}

impl CurrentFlow {
    fn enter(flow: &Flow) -> Self {
        let previous = CURRENT.with(|current| current.replace(Some(flow.clone())));
        Self { previous }
    }
}

impl Drop for CurrentFlow {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

// ============================================================================
// Flow
// ============================================================================

struct Shared {
    state: FlowState,
    suspended: Option<Stack>,
    parked: Option<Signal>,
    pending: Option<Wake>,
    forks: Vec<ForkLink>,
    result: Option<FlowResult<Value>>,
}

struct FlowInner {
    id: FlowId,
    task: Option<Task>,
    manager: Arc<dyn FlowManager>,
    interrupted: AtomicBool,
    shared: Mutex<Shared>,
    ended: Condvar,
}

#[derive(Clone)]
pub struct Flow {
    inner: Arc<FlowInner>,
}

impl Flow {
    pub(crate) fn build(
        id: FlowId,
        task: Option<Task>,
        manager: Arc<dyn FlowManager>,
        state: FlowState,
        parked: Option<(Stack, Signal)>,
    ) -> Flow {
        let (suspended, parked) = match parked {
            Some((stack, signal)) => (Some(stack), Some(signal)),
            None => (None, None),
        };
        let flow = Flow {
            inner: Arc::new(FlowInner {
                id,
                task,
                manager,
                interrupted: AtomicBool::new(false),
                shared: Mutex::new(Shared {
                    state,
                    suspended,
                    parked,
                    pending: None,
                    forks: Vec::new(),
                    result: None,
                }),
                ended: Condvar::new(),
            }),
        };
        if let Some(task) = &flow.inner.task {
            task.register(&flow, state);
        }
        flow
    }

    /// A new `ACTIVE` flow in the same task and manager as `self`.
    pub(crate) fn sibling(&self) -> Flow {
        Flow::build(
            Uuid::new_v4(),
            self.inner.task.clone(),
            self.inner.manager.clone(),
            FlowState::Active,
            None,
        )
    }

    /// Run `body` as a new task-less flow on the calling thread.
    ///
    /// Returns when the flow ends or first parks.
    pub fn start(
        manager: Arc<dyn FlowManager>,
        body: Arc<dyn Resumable>,
        arg: impl Into<Value>,
    ) -> FlowResult<FlowOutcome> {
        let flow = Flow::build(Uuid::new_v4(), None, manager, FlowState::Active, None);
        flow.drive(Stack::root(body), Ok(arg.into()), Entry::Fresh)
    }

    /// Run `body` as a new task-less flow on a worker thread.
    pub fn spawn(
        manager: Arc<dyn FlowManager>,
        body: Arc<dyn Resumable>,
        arg: impl Into<Value>,
    ) -> Activation {
        let flow = Flow::build(Uuid::new_v4(), None, manager, FlowState::Active, None);
        flow.launch(Stack::root(body), Ok(arg.into()), Entry::Fresh)
    }

    /// The flow running on this thread, if any.
    pub fn current() -> Option<Flow> {
        CURRENT.with(|current| current.borrow().clone())
    }

    pub fn id(&self) -> FlowId {
        self.inner.id
    }

    pub fn state(&self) -> FlowState {
        self.inner.shared.lock().state
    }

    pub fn task(&self) -> Option<&Task> {
        self.inner.task.as_ref()
    }

    pub fn manager(&self) -> &Arc<dyn FlowManager> {
        &self.inner.manager
    }

    /// Signal of the current park, without the flow back-reference.
    pub fn parked_signal(&self) -> Option<Signal> {
        self.inner.shared.lock().parked.clone()
    }

    /// Final result once the flow has ended.
    pub fn result(&self) -> Option<FlowResult<Value>> {
        self.inner.shared.lock().result.clone()
    }

    /// Block the calling thread until the flow ends or `timeout` elapses.
    pub fn join_timeout(&self, timeout: Duration) -> Option<FlowResult<Value>> {
        let deadline = Instant::now() + timeout;
        let mut shared = self.inner.shared.lock();
        while shared.result.is_none() {
            if self
                .inner
                .ended
                .wait_until(&mut shared, deadline)
                .timed_out()
            {
                break;
            }
        }
        shared.result.clone()
    }

    /// Id of the innermost fork branch this flow runs in (0 for the creator).
    pub fn fork_id(&self) -> Option<u32> {
        self.inner.shared.lock().forks.last().map(ForkLink::id)
    }

    // ------------------------------------------------------------------
    // Controller API
    // ------------------------------------------------------------------

    /// Continue a `SUSPENDED` flow on the calling thread.
    ///
    /// `value` becomes the result of the operation the flow parked in.
    pub fn resume(&self, value: impl Into<Value>) -> FlowResult<FlowOutcome> {
        let stack = self.claim_suspended()?;
        self.drive(stack, Ok(value.into()), Entry::Restore)
    }

    /// Continue a `SUSPENDED` flow with a failure delivered at its park point.
    pub fn resume_throwing(&self, error: impl Into<anyhow::Error>) -> FlowResult<FlowOutcome> {
        let stack = self.claim_suspended()?;
        self.drive(stack, Err(FlowError::resumed(error)), Entry::Restore)
    }

    /// Continue a `SUSPENDED` flow on a worker thread of its manager.
    pub fn activate(&self, value: impl Into<Value>) -> FlowResult<Activation> {
        let stack = self.claim_suspended()?;
        Ok(self.launch(stack, Ok(value.into()), Entry::Restore))
    }

    /// Independent `SUSPENDED` duplicate of a `SUSPENDED` flow.
    pub fn copy(&self) -> FlowResult<Flow> {
        let (stack, signal) = {
            let shared = self.inner.shared.lock();
            if shared.state != FlowState::Suspended {
                return Err(self.illegal_state("suspended", shared.state));
            }
            let stack = shared
                .suspended
                .as_ref()
                .ok_or(FrameError::EmptyChain)?
                .copy();
            let signal = shared
                .parked
                .clone()
                .unwrap_or_else(|| Signal::suspend(Value::Unit));
            (stack, signal)
        };
        let copy = Flow::build(
            Uuid::new_v4(),
            self.inner.task.clone(),
            self.inner.manager.clone(),
            FlowState::Suspended,
            Some((stack, signal)),
        );
        tracing::debug!(flow_id = %self.id(), copy_id = %copy.id(), "flow copied");
        Ok(copy)
    }

    /// Request cooperative interruption.
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::SeqCst);
        tracing::debug!(flow_id = %self.id(), "interrupt requested");
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
            || self.inner.task.as_ref().is_some_and(Task::is_interrupted)
    }

    /// Consume the flow-level interrupt flag; a task interrupt stays set.
    pub(crate) fn take_interrupt(&self) -> bool {
        let own = self.inner.interrupted.swap(false, Ordering::SeqCst);
        own || self.inner.task.as_ref().is_some_and(Task::is_interrupted)
    }

    // ------------------------------------------------------------------
    // Parking handshake
    // ------------------------------------------------------------------

    /// Phase one of a primitive park: ACTIVE → SUSPENDING.
    pub(crate) fn prepare_park(&self) -> FlowResult<()> {
        let mut shared = self.inner.shared.lock();
        if shared.state != FlowState::Active {
            return Err(self.illegal_state("active", shared.state));
        }
        self.transition(&mut shared, FlowState::Suspending);
        Ok(())
    }

    /// Continue a parked flow with `input` at its park point.
    ///
    /// Returns false when the flow is neither parking nor `BLOCKED`, or
    /// already has a pending wake.
    pub(crate) fn wake(&self, input: FlowResult<Value>) -> bool {
        self.wake_with(Wake {
            input,
            rewind: None,
        })
    }

    /// Like `wake`, but replace the parked chain with `stack` first.
    pub(crate) fn rewind(&self, stack: Stack, input: FlowResult<Value>) -> bool {
        self.wake_with(Wake {
            input,
            rewind: Some(stack),
        })
    }

    fn wake_with(&self, wake: Wake) -> bool {
        let mut shared = self.inner.shared.lock();
        match shared.state {
            FlowState::Suspending if shared.pending.is_none() => {
                shared.pending = Some(wake);
                true
            }
            FlowState::Blocked => {
                let Some(parked) = shared.suspended.take() else {
                    return false;
                };
                shared.parked = None;
                self.transition(&mut shared, FlowState::Active);
                drop(shared);
                let stack = wake.rewind.unwrap_or(parked);
                self.launch(stack, wake.input, Entry::Restore);
                true
            }
            _ => false,
        }
    }

    /// Activate a `SUSPENDED` flow once `delay` has elapsed.
    pub(crate) fn activate_after(&self, delay: Duration) {
        let flow = self.clone();
        self.inner.manager.schedule(
            delay,
            Box::new(move || {
                if let Err(e) = flow.activate(Value::Unit) {
                    tracing::warn!(flow_id = %flow.id(), error = %e, "delayed activation skipped");
                }
            }),
        );
    }

    fn claim_suspended(&self) -> FlowResult<Stack> {
        let mut shared = self.inner.shared.lock();
        if shared.state != FlowState::Suspended {
            return Err(self.illegal_state("suspended", shared.state));
        }
        let stack = shared.suspended.take().ok_or(FrameError::EmptyChain)?;
        shared.parked = None;
        self.transition(&mut shared, FlowState::Active);
        Ok(stack)
    }

    fn transition(&self, shared: &mut Shared, state: FlowState) {
        let previous = std::mem::replace(&mut shared.state, state);
        if let Some(task) = &self.inner.task {
            task.account(previous, state);
        }
        tracing::trace!(flow_id = %self.id(), from = previous.as_str(), to = state.as_str(), "flow state");
    }

    pub(crate) fn temp_suspended<R>(&self, f: impl FnOnce() -> R) -> R {
        {
            let mut shared = self.inner.shared.lock();
            self.transition(&mut shared, FlowState::TempSuspended);
        }
        let result = f();
        let mut shared = self.inner.shared.lock();
        self.transition(&mut shared, FlowState::Active);
        result
    }

    fn illegal_state(&self, expected: &'static str, actual: FlowState) -> FlowError {
        FlowError::IllegalState {
            flow: self.id(),
            expected,
            actual: actual.as_str(),
        }
    }

    // ------------------------------------------------------------------
    // Fork stack
    // ------------------------------------------------------------------

    pub(crate) fn push_fork(&self, link: ForkLink) {
        self.inner.shared.lock().forks.push(link);
    }

    pub(crate) fn innermost_fork(&self) -> Option<ForkLink> {
        self.inner.shared.lock().forks.last().cloned()
    }

    pub(crate) fn pop_fork(&self) -> Option<ForkLink> {
        self.inner.shared.lock().forks.pop()
    }

    /// Remove the link of a specific fork, wherever it sits in the stack.
    pub(crate) fn remove_fork(&self, link: &ForkLink) -> bool {
        let mut shared = self.inner.shared.lock();
        match shared.forks.iter().rposition(|held| held.same_fork(link)) {
            Some(position) => {
                shared.forks.remove(position);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Passivation
    // ------------------------------------------------------------------

    /// Take a parked flow out of memory for a process image: the chain and
    /// signal move into the returned [`Retired`] and the flow turns `PASSIVE`.
    ///
    /// Checking and retiring happen under one lock, so a wake racing with
    /// passivation either lands before (the flow is busy) or is refused.
    pub(crate) fn retire(&self) -> Result<Retired, PersistenceError> {
        let mut shared = self.inner.shared.lock();
        if shared.state.is_running() {
            return Err(PersistenceError::Busy(1));
        }
        let not_passivatable = |reason: String| PersistenceError::NotPassivatable {
            flow: self.id(),
            reason,
        };
        let signal = shared
            .parked
            .clone()
            .ok_or_else(|| not_passivatable(format!("flow is {}", shared.state)))?;
        match shared.state {
            FlowState::Suspended => {}
            FlowState::Blocked if signal.kind().is_mailbox() => {}
            state => {
                return Err(not_passivatable(format!(
                    "flow is {state} on {:?}",
                    signal.kind()
                )));
            }
        }
        if !shared.forks.is_empty() {
            return Err(not_passivatable("flow has open forks".into()));
        }
        let stack = shared
            .suspended
            .as_ref()
            .ok_or_else(|| not_passivatable("no parked frame chain".into()))?;
        if !stack.chain().is_serializable() || !signal.payload().is_serializable() {
            return Err(not_passivatable("holds opaque values".into()));
        }
        let state = shared.state;
        let stack = shared.suspended.take().ok_or(PersistenceError::Busy(1))?;
        shared.parked = None;
        self.transition(&mut shared, FlowState::Passive);
        Ok(Retired { state, stack, signal })
    }

    /// Undo [`Flow::retire`] when the image could not be written.
    pub(crate) fn reinstate(&self, retired: Retired) {
        let mut shared = self.inner.shared.lock();
        if shared.state != FlowState::Passive {
            tracing::warn!(flow_id = %self.id(), state = %shared.state, "flow left passive state before reinstatement");
            return;
        }
        shared.suspended = Some(retired.stack);
        shared.parked = Some(retired.signal);
        self.transition(&mut shared, retired.state);
    }

    /// Drop a flow revived from an image that turned out to be unusable.
    pub(crate) fn discard(&self) {
        let mut shared = self.inner.shared.lock();
        shared.suspended = None;
        shared.parked = None;
        self.transition(&mut shared, FlowState::Ended);
    }

    // ------------------------------------------------------------------
    // Trampoline
    // ------------------------------------------------------------------

    pub(crate) fn launch(&self, stack: Stack, input: FlowResult<Value>, entry: Entry) -> Activation {
        let flow = self.clone();
        let handle = self.inner.manager.execute(Box::new(move || {
            let result = flow.drive(stack, input, entry);
            flow.recover(&result);
            result
        }));
        Activation::new(self.clone(), handle)
    }

    fn recover(&self, result: &FlowResult<FlowOutcome>) {
        match result {
            Ok(FlowOutcome::Suspended(signal)) => {
                if let Err(e) = signal.default_action() {
                    tracing::error!(flow_id = %self.id(), error = %e, "default signal action failed");
                }
            }
            Ok(FlowOutcome::Ended(_)) => {}
            Err(e) if e.is_interrupted() => {
                tracing::debug!(flow_id = %self.id(), "flow interrupted");
            }
            Err(e) => {
                tracing::error!(flow_id = %self.id(), error = %e, "flow ended with failure");
            }
        }
    }

    pub(crate) fn drive(
        &self,
        mut stack: Stack,
        input: FlowResult<Value>,
        entry: Entry,
    ) -> FlowResult<FlowOutcome> {
        let span = tracing::debug_span!("flow", flow.id = %self.id());
        let _span = span.enter();
        let _current = CurrentFlow::enter(self);

        if entry == Entry::Restore {
            if let Err(e) = stack.chain.prepare_restore() {
                return self.finish(&mut stack, Err(e.into()));
            }
        }

        let mut input = input;
        loop {
            let next = match self.step(&mut stack, input) {
                Ok(next) => next,
                Err(e) => self.unwind(&mut stack, Err(e), Exit::Throw),
            };
            match next {
                Next::Enter(next_input) => input = next_input,
                Next::Parked(signal) => return Ok(FlowOutcome::Suspended(signal)),
                Next::Done(result) => return self.finish(&mut stack, result),
            }
        }
    }

    /// Run the leaf function once. `Err` means the leaf threw.
    fn step(&self, stack: &mut Stack, input: FlowResult<Value>) -> FlowResult<Next> {
        let Some(body) = stack.leaf_body() else {
            return Ok(Next::Done(Err(FrameError::EmptyChain.into())));
        };
        let signature = body.signature();
        let frame = match stack.chain.leaf_mut() {
            Ok(frame) => frame,
            Err(e) => return Ok(Next::Done(Err(e.into()))),
        };
        if frame.signature() != &signature {
            let fault = FrameError::Inconsistent(format!(
                "frame of `{}` re-entered through `{signature}`",
                frame.signature()
            ));
            return Ok(Next::Done(Err(fault.into())));
        }

        let step = {
            let mut cx = FlowContext::new(self, input);
            body.resume(frame, &mut cx)?
        };

        match step {
            Step::Return(value) => {
                let result = check_return(&signature, value);
                Ok(self.unwind(stack, result, Exit::Return))
            }
            Step::Call { callee, arg } => {
                stack.require_captured()?;
                tracing::trace!(caller = %signature, callee = %callee.signature(), "call");
                stack.push(callee);
                Ok(Next::Enter(Ok(arg)))
            }
            Step::Continue(value) => {
                stack.require_captured()?;
                stack.restore_leaf()?;
                Ok(Next::Enter(Ok(value)))
            }
            Step::Signal(signal) => self.suspend(stack, signal),
            Step::Park(signal) => self.park(stack, signal),
            Step::Fork { branches, join } => {
                stack.require_captured()?;
                fork::fork(self, stack, branches, join)
            }
            Step::Merge { timeout } => {
                stack.require_captured()?;
                fork::merge(self, stack, timeout)
            }
            Step::ReturnAndContinue(value) => {
                stack.require_captured()?;
                let detached = self.temp_suspended(|| stack.detach_leaf())?;
                let continuation = self.sibling();
                tracing::debug!(continuation_id = %continuation.id(), function = %signature, "continuing in new flow");
                continuation.launch(detached, Ok(Value::Unit), Entry::Restore);
                let result = check_return(&signature, value);
                Ok(self.unwind(stack, result, Exit::LeaveFunction))
            }
            Step::Checkpoint(continuation) => {
                stack.require_captured()?;
                self.temp_suspended(|| continuation.capture(self, stack));
                stack.restore_leaf()?;
                Ok(Next::Enter(Ok(Value::Bool(false))))
            }
            Step::End => Ok(Next::Done(Ok(Value::Unit))),
        }
    }

    fn suspend(&self, stack: &mut Stack, signal: Signal) -> FlowResult<Next> {
        stack.require_captured()?;
        if self.take_interrupt() {
            stack.restore_leaf()?;
            return Ok(Next::Enter(Err(FlowError::Interrupted)));
        }
        {
            let mut shared = self.inner.shared.lock();
            self.transition(&mut shared, FlowState::Suspending);
            shared.suspended = Some(std::mem::take(stack));
            shared.parked = Some(signal.detached());
            self.transition(&mut shared, FlowState::Suspended);
        }
        self.notify_suspended(&signal);
        Ok(Next::Parked(signal.with_flow(self.clone())))
    }

    /// Phase two of a primitive park.
    pub(crate) fn park(&self, stack: &mut Stack, signal: Signal) -> FlowResult<Next> {
        stack.require_captured()?;
        let mut shared = self.inner.shared.lock();
        if shared.state != FlowState::Suspending {
            return Err(self.illegal_state("suspending", shared.state));
        }
        if let Some(wake) = shared.pending.take() {
            self.transition(&mut shared, FlowState::Active);
            drop(shared);
            tracing::trace!(flow_id = %self.id(), "wake arrived before park completed");
            match wake.rewind {
                Some(rewind) => {
                    *stack = rewind;
                    stack.chain.prepare_restore()?;
                }
                None => stack.restore_leaf()?,
            }
            return Ok(Next::Enter(wake.input));
        }
        shared.suspended = Some(std::mem::take(stack));
        shared.parked = Some(signal.detached());
        self.transition(&mut shared, FlowState::Blocked);
        drop(shared);
        self.notify_suspended(&signal);
        Ok(Next::Parked(signal.with_flow(self.clone())))
    }

    fn notify_suspended(&self, signal: &Signal) {
        tracing::debug!(flow_id = %self.id(), signal = ?signal.kind(), "flow parked");
        if let Some(task) = &self.inner.task {
            task.flow_suspended(self, signal);
        }
    }

    /// Pop the leaf and hand `result` to its caller.
    fn unwind(&self, stack: &mut Stack, result: FlowResult<Value>, exit: Exit) -> Next {
        if let Some(mut frame) = stack.pop() {
            frame.finish(exit);
            if exit == Exit::LeaveFunction {
                frame.bury();
            }
            tracing::trace!(function = %frame.signature(), ?exit, "frame left");
        }
        if stack.is_empty() {
            return Next::Done(result);
        }
        match stack.restore_leaf() {
            Ok(()) => Next::Enter(result),
            Err(e) => Next::Done(Err(e)),
        }
    }

    fn finish(&self, stack: &mut Stack, result: FlowResult<Value>) -> FlowResult<FlowOutcome> {
        while let Some(mut frame) = stack.pop() {
            frame.finish(Exit::LeaveFlow);
            frame.bury();
        }
        let forks = {
            let mut shared = self.inner.shared.lock();
            let terminal = match &result {
                Err(FlowError::Interrupted) => FlowState::Interrupted,
                _ => FlowState::Ended,
            };
            self.transition(&mut shared, terminal);
            shared.result = Some(result.clone());
            shared.pending = None;
            shared.suspended = None;
            shared.parked = None;
            std::mem::take(&mut shared.forks)
        };
        self.inner.ended.notify_all();
        for link in forks.into_iter().rev() {
            if link.is_branch() {
                link.release();
            }
        }
        match &result {
            Ok(value) => tracing::debug!(flow_id = %self.id(), %value, "flow ended"),
            Err(e) => tracing::debug!(flow_id = %self.id(), error = %e, "flow ended by exception"),
        }
        if let Some(task) = &self.inner.task {
            task.flow_ended(self, &result);
        }
        result.map(FlowOutcome::Ended)
    }
}

fn check_return(signature: &Signature, value: Value) -> FlowResult<Value> {
    if signature.returns.accepts(&value) {
        Ok(value)
    } else {
        Err(FlowError::InvalidReturnValue {
            function: signature.qualified_name(),
            expected: signature.returns,
            actual: value.kind(),
        })
    }
}

impl PartialEq for Flow {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Flow {}

impl Hash for Flow {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_classes() {
        assert!(FlowState::Suspending.is_running());
        assert!(FlowState::TempSuspended.is_running());
        assert!(FlowState::Blocked.is_parked());
        assert!(!FlowState::Passive.is_parked());
        assert!(FlowState::Interrupted.is_finished());
        assert_eq!(FlowState::TempSuspended.to_string(), "temp-suspended");
    }

    #[test]
    fn test_no_current_flow_outside_trampoline() {
        assert!(Flow::current().is_none());
    }
}
