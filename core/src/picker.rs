//! EventPicker - Wait for the First of Several Events
//!
//! Each guard (`on_event`, `on_timeout`) checkpoints the flow and returns
//! `false`, so the function just records interest and moves on to the next
//! guard. `pick` then parks the flow. When one guard fires, every other
//! registration is cancelled and the flow is rewound to the winning guard's
//! checkpoint, which now returns `true`.
//!
//! ```rust,ignore
//! 0 => { frame.notify_invoke(1, 0, 1); frame.save_value(0, Value::opaque(picker.clone()))?; picker.on_event(cx, "ready") }
//! 1 => { if cx.take_result()?.as_bool() == Some(true) { /* "ready" won */ }
//!        frame.notify_invoke(2, 0, 1); ...; picker.on_timeout(cx, Duration::from_secs(1)) }
//! 2 => { if cx.take_result()?.as_bool() == Some(true) { /* timed out */ }
//!        frame.notify_invoke(3, 0, 1); ...; picker.pick(cx) }
//! ```

use crate::context::FlowContext;
use crate::continuation::Continuation;
use crate::error::{FlowError, FlowResult};
use crate::flow::Flow;
use crate::key::Key;
use crate::manager::TimerHandle;
use crate::resumable::Step;
use crate::signal::{Signal, SignalKind};
use crate::task::Task;
use flowline_frame::Value;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum Interest {
    Event(Key),
    Timeout(Duration),
}

struct Guard {
    interest: Interest,
    checkpoint: Continuation,
}

#[derive(Default)]
struct PickerState {
    guards: Vec<Guard>,
    armed: bool,
    winner: Option<usize>,
    message: Option<Value>,
    flow: Option<Flow>,
    task: Option<Task>,
    timers: Vec<TimerHandle>,
}

#[derive(Clone, Default)]
pub struct EventPicker {
    state: Arc<Mutex<PickerState>>,
}

impl EventPicker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Guard on a task event; result is `false` now, `true` if it wins.
    pub fn on_event(&self, _cx: &FlowContext<'_>, key: impl Into<Key>) -> Step {
        self.guard(Interest::Event(key.into()))
    }

    /// Guard that wins when nothing else fired within `timeout`.
    pub fn on_timeout(&self, _cx: &FlowContext<'_>, timeout: Duration) -> Step {
        self.guard(Interest::Timeout(timeout))
    }

    fn guard(&self, interest: Interest) -> Step {
        let mut state = self.state.lock();
        if state.winner.is_some() {
            // A new round after a completed pick.
            state.guards.clear();
            state.winner = None;
            state.message = None;
        }
        let checkpoint = Continuation::new();
        state.guards.push(Guard {
            interest,
            checkpoint: checkpoint.clone(),
        });
        Step::Checkpoint(checkpoint)
    }

    /// Park until one guard fires.
    pub fn pick(&self, cx: &FlowContext<'_>) -> FlowResult<Step> {
        cx.check_interrupted()?;
        let mut state = self.state.lock();
        if state.guards.is_empty() {
            return Err(FlowError::EmptyPick);
        }
        let needs_task = state
            .guards
            .iter()
            .any(|guard| matches!(guard.interest, Interest::Event(_)));
        let task = if needs_task { Some(cx.task()?) } else { None };

        cx.prepare_park()?;
        state.armed = true;
        state.flow = Some(cx.flow().clone());
        let interests: Vec<(usize, Interest)> = state
            .guards
            .iter()
            .enumerate()
            .map(|(index, guard)| (index, guard.interest.clone()))
            .collect();
        for (index, interest) in interests {
            match interest {
                Interest::Event(key) => {
                    if let Some(task) = &task {
                        task.register_picker(key, self.clone(), index);
                    }
                }
                Interest::Timeout(timeout) => {
                    let picker = self.clone();
                    let timer = cx.flow().manager().schedule(
                        timeout,
                        Box::new(move || {
                            picker.fire(index, Value::Unit);
                        }),
                    );
                    state.timers.push(timer);
                }
            }
        }
        state.task = task;
        tracing::trace!(flow_id = %cx.flow().id(), guards = state.guards.len(), "pick armed");
        Ok(Step::Park(Signal::new(SignalKind::Pick, Value::Unit)))
    }

    /// Fire guard `index` with `message`; only the first firing wins.
    pub(crate) fn fire(&self, index: usize, message: Value) -> bool {
        let (flow, stack, task, timers) = {
            let mut state = self.state.lock();
            if !state.armed || state.winner.is_some() {
                return false;
            }
            state.armed = false;
            state.winner = Some(index);
            state.message = Some(message);
            let stack = state
                .guards
                .get(index)
                .and_then(|guard| guard.checkpoint.stack());
            (
                state.flow.take(),
                stack,
                state.task.take(),
                std::mem::take(&mut state.timers),
            )
        };
        for timer in timers {
            timer.cancel();
        }
        if let Some(task) = task {
            task.cancel_picker(self);
        }
        match (flow, stack) {
            (Some(flow), Some(stack)) => {
                tracing::trace!(flow_id = %flow.id(), winner = index, "pick fired");
                flow.rewind(stack, Ok(Value::Bool(true)))
            }
            _ => false,
        }
    }

    /// Message delivered with the winning event.
    pub fn message(&self) -> Option<Value> {
        self.state.lock().message.clone()
    }

    /// Index of the winning guard, in registration order.
    pub fn winner(&self) -> Option<usize> {
        self.state.lock().winner
    }

    pub fn guard_count(&self) -> usize {
        self.state.lock().guards.len()
    }

    pub(crate) fn ptr_eq(&self, other: &EventPicker) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl fmt::Debug for EventPicker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("EventPicker")
            .field(
                "guards",
                &state
                    .guards
                    .iter()
                    .map(|guard| &guard.interest)
                    .collect::<Vec<_>>(),
            )
            .field("armed", &state.armed)
            .field("winner", &state.winner)
            .finish()
    }
}
