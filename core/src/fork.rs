//! Fork / Merge
//!
//! `fork(n)` turns one flow into `n + 1`: the creator continues with
//! result 0 and branch `i` starts with result `i`, each on a shallow copy
//! of the creator's frame chain. A joinable fork attaches a barrier; a
//! branch reaching `merge` ends itself and releases the barrier, the
//! creator's `merge` parks until every branch has released it.

use crate::error::{FlowError, FlowResult};
use crate::flow::{Entry, Flow, Next, Stack};
use crate::manager::TimerHandle;
use crate::signal::{Signal, SignalKind};
use flowline_frame::Value;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

struct Barrier {
    remaining: u32,
    waiter: Option<Flow>,
    timer: Option<TimerHandle>,
}

pub(crate) struct ForkBarrier {
    state: Mutex<Barrier>,
}

impl ForkBarrier {
    fn new(branches: u32) -> Self {
        Self {
            state: Mutex::new(Barrier {
                remaining: branches,
                waiter: None,
                timer: None,
            }),
        }
    }

    fn expire(&self) {
        let waiter = {
            let mut state = self.state.lock();
            state.timer = None;
            state.waiter.take()
        };
        if let Some(creator) = waiter {
            tracing::debug!(flow_id = %creator.id(), "merge timed out");
            creator.wake(Ok(Value::Bool(false)));
        }
    }
}

/// One flow's membership in a fork: id 0 is the creator.
#[derive(Clone)]
pub(crate) struct ForkLink {
    barrier: Arc<ForkBarrier>,
    id: u32,
}

impl ForkLink {
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn is_branch(&self) -> bool {
        self.id != 0
    }

    pub(crate) fn same_fork(&self, other: &ForkLink) -> bool {
        Arc::ptr_eq(&self.barrier, &other.barrier)
    }

    /// Count one branch out; the last release wakes a waiting creator.
    pub(crate) fn release(&self) {
        let waiter = {
            let mut state = self.barrier.state.lock();
            state.remaining = state.remaining.saturating_sub(1);
            if state.remaining > 0 {
                return;
            }
            if let Some(timer) = state.timer.take() {
                timer.cancel();
            }
            state.waiter.take()
        };
        if let Some(creator) = waiter {
            let creator_link = ForkLink {
                barrier: self.barrier.clone(),
                id: 0,
            };
            creator.remove_fork(&creator_link);
            creator.wake(Ok(Value::Bool(true)));
        }
    }
}

pub(crate) fn fork(flow: &Flow, stack: &mut Stack, branches: u32, join: bool) -> FlowResult<Next> {
    let barrier = join.then(|| Arc::new(ForkBarrier::new(branches)));
    let spawned = flow.temp_suspended(|| {
        let mut spawned = Vec::with_capacity(branches as usize);
        for id in 1..=branches {
            let branch = flow.sibling();
            if let Some(barrier) = &barrier {
                branch.push_fork(ForkLink {
                    barrier: barrier.clone(),
                    id,
                });
            }
            spawned.push((branch, stack.shallow_copy(), id));
        }
        if let Some(barrier) = barrier {
            flow.push_fork(ForkLink { barrier, id: 0 });
        }
        spawned
    });
    tracing::debug!(flow_id = %flow.id(), branches, join, "fork");
    for (branch, chain, id) in spawned {
        branch.launch(chain, Ok(Value::Int(i64::from(id))), Entry::Restore);
    }
    stack.restore_leaf()?;
    Ok(Next::Enter(Ok(Value::Int(0))))
}

pub(crate) fn merge(flow: &Flow, stack: &mut Stack, timeout: Option<Duration>) -> FlowResult<Next> {
    let link = flow.innermost_fork().ok_or(FlowError::NoActiveFork)?;
    if link.is_branch() {
        // Ending the flow releases the barrier once the branch is ENDED.
        tracing::trace!(flow_id = %flow.id(), branch = link.id, "branch merged");
        return Ok(Next::Done(Ok(Value::Unit)));
    }

    let mut state = link.barrier.state.lock();
    if state.remaining == 0 {
        drop(state);
        flow.pop_fork();
        stack.restore_leaf()?;
        return Ok(Next::Enter(Ok(Value::Bool(true))));
    }
    flow.prepare_park()?;
    state.waiter = Some(flow.clone());
    if let Some(timeout) = timeout {
        let barrier = link.barrier.clone();
        state.timer = Some(
            flow.manager()
                .schedule(timeout, Box::new(move || barrier.expire())),
        );
    }
    drop(state);
    flow.park(stack, Signal::new(SignalKind::Merge, Value::Unit))
}

/// Leave the innermost fork without merging.
pub(crate) fn forget(flow: &Flow) -> FlowResult<()> {
    let link = flow.pop_fork().ok_or(FlowError::NoActiveFork)?;
    if link.is_branch() {
        link.release();
    }
    Ok(())
}
