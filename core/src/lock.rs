//! ThreadFreeLock - A Mutex Owned by Flows
//!
//! Ownership belongs to a flow, not a thread: a flow may take the lock,
//! park, get resumed on another worker and still hold it. Waiters park
//! `BLOCKED` in a FIFO queue and are handed the lock directly on release.
//!
//! # Example
//! ```rust,ignore
//! 0 => {
//!     frame.notify_invoke(1, 0, 0);
//!     lock.lock(cx)
//! }
//! 1 => {
//!     // critical section
//!     lock.unlock(cx)?;
//!     Ok(Step::Return(Value::Unit))
//! }
//! ```

use crate::context::FlowContext;
use crate::error::{FlowError, FlowResult};
use crate::flow::{Flow, FlowId};
use crate::manager::TimerHandle;
use crate::resumable::Step;
use crate::signal::{Signal, SignalKind};
use flowline_frame::Value;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct LockWaiter {
    id: u64,
    flow: Flow,
    deadline: Option<Instant>,
    timer: Option<TimerHandle>,
}

#[derive(Default)]
struct LockState {
    owner: Option<Flow>,
    /// Re-acquisitions beyond the first.
    reentrancy: u32,
    waiters: VecDeque<LockWaiter>,
    next_waiter: u64,
}

impl LockState {
    /// Give the lock to the oldest waiter, or free it. Returns the new owner.
    fn hand_over(&mut self) -> Option<Flow> {
        self.reentrancy = 0;
        self.owner = self.waiters.pop_front().map(|waiter| {
            if let Some(timer) = &waiter.timer {
                timer.cancel();
            }
            waiter.flow
        });
        self.owner.clone()
    }
}

#[derive(Clone, Default)]
pub struct ThreadFreeLock {
    state: Arc<Mutex<LockState>>,
}

impl ThreadFreeLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire, parking until the lock is handed over. Result: `true`.
    pub fn lock(&self, cx: &FlowContext<'_>) -> FlowResult<Step> {
        self.acquire(cx, None)
    }

    /// Acquire within `timeout`. Result: whether the lock was acquired.
    /// A zero timeout never parks.
    pub fn try_lock(&self, cx: &FlowContext<'_>, timeout: Duration) -> FlowResult<Step> {
        self.acquire(cx, Some(timeout))
    }

    fn acquire(&self, cx: &FlowContext<'_>, timeout: Option<Duration>) -> FlowResult<Step> {
        cx.check_interrupted()?;
        let flow = cx.flow();
        let mut state = self.state.lock();
        match &state.owner {
            None => {
                state.owner = Some(flow.clone());
                state.reentrancy = 0;
                return Ok(Step::Continue(Value::Bool(true)));
            }
            Some(owner) if owner == flow => {
                state.reentrancy += 1;
                return Ok(Step::Continue(Value::Bool(true)));
            }
            Some(_) => {}
        }
        if timeout == Some(Duration::ZERO) {
            return Ok(Step::Continue(Value::Bool(false)));
        }

        cx.prepare_park()?;
        let id = state.next_waiter;
        state.next_waiter += 1;
        let timer = timeout.map(|timeout| {
            let lock = self.clone();
            flow.manager()
                .schedule(timeout, Box::new(move || lock.expire(id)))
        });
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        tracing::trace!(flow_id = %flow.id(), waiter = id, ?deadline, queued = state.waiters.len(), "lock contended");
        state.waiters.push_back(LockWaiter {
            id,
            flow: flow.clone(),
            deadline,
            timer,
        });
        Ok(Step::Park(Signal::new(SignalKind::Lock, Value::Unit)))
    }

    fn expire(&self, id: u64) {
        let waiter = {
            let mut state = self.state.lock();
            let position = state.waiters.iter().position(|waiter| waiter.id == id);
            position.and_then(|position| state.waiters.remove(position))
        };
        if let Some(waiter) = waiter {
            tracing::trace!(flow_id = %waiter.flow.id(), deadline = ?waiter.deadline, "lock wait timed out");
            waiter.flow.wake(Ok(Value::Bool(false)));
        }
    }

    pub fn unlock(&self, cx: &FlowContext<'_>) -> FlowResult<()> {
        self.release(cx.flow())
    }

    /// Release on behalf of `flow`; hands over to the oldest waiter.
    ///
    /// Ownership passes straight from `flow` to the waiter, so no other flow
    /// can take the lock in between.
    pub fn release(&self, flow: &Flow) -> FlowResult<()> {
        let mut next = {
            let mut state = self.state.lock();
            if state.owner.as_ref() != Some(flow) {
                return Err(FlowError::NotOwner(flow.id()));
            }
            if state.reentrancy > 0 {
                state.reentrancy -= 1;
                return Ok(());
            }
            state.hand_over()
        };
        while let Some(waiter) = next {
            if waiter.wake(Ok(Value::Bool(true))) {
                return Ok(());
            }
            tracing::warn!(flow_id = %waiter.id(), "lock waiter vanished, handing over to next");
            let mut state = self.state.lock();
            if state.owner.as_ref() != Some(&waiter) {
                return Ok(());
            }
            next = state.hand_over();
        }
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    pub fn owner(&self) -> Option<FlowId> {
        self.state.lock().owner.as_ref().map(Flow::id)
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

impl fmt::Debug for ThreadFreeLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ThreadFreeLock")
            .field("owner", &state.owner.as_ref().map(Flow::id))
            .field("reentrancy", &state.reentrancy)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}
