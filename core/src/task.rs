//! Task - A Group of Flows Sharing a Mailbox
//!
//! A task owns the flows started in it, keeps active/suspended counters
//! (propagated to parent tasks), notifies listeners of flow life-cycle
//! events, and hosts the mailbox for wait/notify, send/receive and
//! call/serve rendezvous.
//!
//! Lock order: task state before flow state. Flows are only woken after the
//! task lock is released.

use crate::context::FlowContext;
use crate::error::{FlowError, FlowResult, PersistenceError};
use crate::flow::{Entry, Flow, FlowState, Stack};
use crate::key::Key;
use crate::mailbox::{envelope, Mailbox, PendingSend, Receiver, Waiter};
use crate::manager::{Activation, FlowManager};
use crate::picker::EventPicker;
use crate::resumable::{Resumable, Step};
use crate::signal::{FlowOutcome, Signal, SignalKind};
use flowline_frame::Value;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use uuid::Uuid;

/// Observer of flow life-cycle events within one task.
///
/// Called outside all flow and task locks, on whichever thread caused the
/// event.
pub trait TaskListener: Send + Sync + 'static {
    fn flow_started(&self, _task: &Task, _flow: &Flow) {}

    fn flow_suspended(&self, _task: &Task, _flow: &Flow, _signal: &Signal) {}

    fn flow_ended(&self, _task: &Task, _flow: &Flow, _result: &FlowResult<Value>) {}
}

struct TaskState {
    flows: Vec<Flow>,
    mailbox: Mailbox,
}

struct TaskInner {
    id: Uuid,
    name: String,
    manager: Arc<dyn FlowManager>,
    parent: Option<Task>,
    active: AtomicUsize,
    suspended: AtomicUsize,
    interrupted: AtomicBool,
    /// Mailbox batches taken off the tables but not yet delivered.
    delivering: AtomicUsize,
    state: Mutex<TaskState>,
    listeners: RwLock<Vec<Arc<dyn TaskListener>>>,
}

/// Ends an in-flight delivery batch, even if a wake panics.
struct DeliveryDone<'a>(&'a AtomicUsize);

impl Drop for DeliveryDone<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Deferred effect of a mailbox operation, run after unlocking.
enum Delivery {
    Wake(Flow, Value),
    Spawn(Arc<dyn Resumable>, Value),
    Fire(EventPicker, usize, Value),
}

#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    pub fn new(name: impl Into<String>, manager: Arc<dyn FlowManager>) -> Task {
        Self::with_parent(name.into(), manager, None)
    }

    fn with_parent(name: String, manager: Arc<dyn FlowManager>, parent: Option<Task>) -> Task {
        Task {
            inner: Arc::new(TaskInner {
                id: Uuid::new_v4(),
                name,
                manager,
                parent,
                active: AtomicUsize::new(0),
                suspended: AtomicUsize::new(0),
                interrupted: AtomicBool::new(false),
                delivering: AtomicUsize::new(0),
                state: Mutex::new(TaskState {
                    flows: Vec::new(),
                    mailbox: Mailbox::default(),
                }),
                listeners: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Subtask whose counters also count in `self`.
    pub fn child(&self, name: impl Into<String>) -> Task {
        Self::with_parent(name.into(), self.inner.manager.clone(), Some(self.clone()))
    }

    /// Task of the flow running on this thread.
    pub fn current() -> Option<Task> {
        Flow::current().and_then(|flow| flow.task().cloned())
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn parent(&self) -> Option<&Task> {
        self.inner.parent.as_ref()
    }

    pub fn manager(&self) -> &Arc<dyn FlowManager> {
        &self.inner.manager
    }

    pub fn add_listener(&self, listener: Arc<dyn TaskListener>) {
        self.inner.listeners.write().push(listener);
    }

    // ------------------------------------------------------------------
    // Flows
    // ------------------------------------------------------------------

    /// Run `body` as a new flow of this task on the calling thread.
    pub fn start(&self, body: Arc<dyn Resumable>, arg: impl Into<Value>) -> FlowResult<FlowOutcome> {
        let flow = self.new_flow();
        flow.drive(Stack::root(body), Ok(arg.into()), Entry::Fresh)
    }

    /// Run `body` as a new flow of this task on a worker thread.
    pub fn spawn(&self, body: Arc<dyn Resumable>, arg: impl Into<Value>) -> Activation {
        let flow = self.new_flow();
        flow.launch(Stack::root(body), Ok(arg.into()), Entry::Fresh)
    }

    fn new_flow(&self) -> Flow {
        Flow::build(
            Uuid::new_v4(),
            Some(self.clone()),
            self.inner.manager.clone(),
            FlowState::Active,
            None,
        )
    }

    /// Live (not yet ended) flows, in creation order.
    pub fn flows(&self) -> Vec<Flow> {
        self.inner.state.lock().flows.clone()
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn suspended_count(&self) -> usize {
        self.inner.suspended.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.active_count() == 0
    }

    /// Interrupt every flow of this task at its next blocking operation.
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::SeqCst);
        tracing::debug!(task = %self.inner.name, "task interrupted");
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
            || self.inner.parent.as_ref().is_some_and(Task::is_interrupted)
    }

    pub(crate) fn register(&self, flow: &Flow, state: FlowState) {
        self.account_new(state);
        self.inner.state.lock().flows.push(flow.clone());
        for listener in self.listeners() {
            listener.flow_started(self, flow);
        }
    }

    fn account_new(&self, state: FlowState) {
        let mut task = Some(self);
        while let Some(current) = task {
            if state.is_running() {
                current.inner.active.fetch_add(1, Ordering::SeqCst);
            } else if state.is_parked() {
                current.inner.suspended.fetch_add(1, Ordering::SeqCst);
            }
            task = current.parent();
        }
    }

    /// Move one flow between counter classes, here and in every parent.
    pub(crate) fn account(&self, from: FlowState, to: FlowState) {
        if from.is_running() == to.is_running() && from.is_parked() == to.is_parked() {
            return;
        }
        let mut task = Some(self);
        while let Some(current) = task {
            if from.is_running() {
                current.inner.active.fetch_sub(1, Ordering::SeqCst);
            } else if from.is_parked() {
                current.inner.suspended.fetch_sub(1, Ordering::SeqCst);
            }
            if to.is_running() {
                current.inner.active.fetch_add(1, Ordering::SeqCst);
            } else if to.is_parked() {
                current.inner.suspended.fetch_add(1, Ordering::SeqCst);
            }
            task = current.parent();
        }
    }

    pub(crate) fn flow_suspended(&self, flow: &Flow, signal: &Signal) {
        for listener in self.listeners() {
            listener.flow_suspended(self, flow, signal);
        }
    }

    pub(crate) fn flow_ended(&self, flow: &Flow, result: &FlowResult<Value>) {
        self.inner.state.lock().flows.retain(|held| held != flow);
        for listener in self.listeners() {
            listener.flow_ended(self, flow, result);
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn TaskListener>> {
        self.inner.listeners.read().clone()
    }

    // ------------------------------------------------------------------
    // Wait / notify
    // ------------------------------------------------------------------

    /// Park until `notify_all(key, ..)`; the notification message is the result.
    pub fn wait(&self, cx: &FlowContext<'_>, key: impl Into<Key>) -> FlowResult<Step> {
        cx.check_interrupted()?;
        let key = key.into();
        let mut state = self.inner.state.lock();
        cx.prepare_park()?;
        state
            .mailbox
            .waiters
            .entry(key.clone())
            .or_default()
            .push(Waiter::Flow(cx.flow().clone()));
        Ok(Step::Park(Signal::new(SignalKind::Wait(key), Value::Unit)))
    }

    /// Start a new flow running `body` for every notification of `key`.
    pub fn wait_many(&self, key: impl Into<Key>, body: Arc<dyn Resumable>) {
        self.inner
            .state
            .lock()
            .mailbox
            .waiters
            .entry(key.into())
            .or_default()
            .push(Waiter::Spawn(body));
    }

    /// Deliver `message` to everything waiting on `key`. Returns how many
    /// parties were reached.
    pub fn notify_all(&self, key: impl Into<Key>, message: impl Into<Value>) -> usize {
        let key = key.into();
        let message = message.into();
        let deliveries: Vec<Delivery> = {
            let mut state = self.inner.state.lock();
            let Some(waiters) = state.mailbox.waiters.remove(&key) else {
                return 0;
            };
            let mut repeating = Vec::new();
            let mut deliveries = Vec::with_capacity(waiters.len());
            for waiter in waiters {
                match waiter {
                    Waiter::Flow(flow) => deliveries.push(Delivery::Wake(flow, message.clone())),
                    Waiter::Picker(picker, index) => {
                        deliveries.push(Delivery::Fire(picker, index, message.clone()))
                    }
                    Waiter::Spawn(body) => {
                        deliveries.push(Delivery::Spawn(body.clone(), message.clone()));
                        repeating.push(Waiter::Spawn(body));
                    }
                }
            }
            if !repeating.is_empty() {
                state.mailbox.waiters.insert(key.clone(), repeating);
            }
            self.begin_delivery();
            deliveries
        };
        let reached = self.deliver(deliveries);
        tracing::debug!(task = %self.inner.name, %key, reached, "notify_all");
        reached
    }

    pub(crate) fn register_picker(&self, key: Key, picker: EventPicker, index: usize) {
        self.inner
            .state
            .lock()
            .mailbox
            .waiters
            .entry(key)
            .or_default()
            .push(Waiter::Picker(picker, index));
    }

    pub(crate) fn cancel_picker(&self, picker: &EventPicker) {
        let mut state = self.inner.state.lock();
        state.mailbox.waiters.retain(|_, waiters| {
            waiters.retain(|waiter| !matches!(waiter, Waiter::Picker(held, _) if held.ptr_eq(picker)));
            !waiters.is_empty()
        });
    }

    // ------------------------------------------------------------------
    // Send / receive, call / serve
    // ------------------------------------------------------------------

    /// Hand `message` to the receiver of `address`; parks until it is taken.
    pub fn send(&self, cx: &FlowContext<'_>, address: impl Into<Key>, message: impl Into<Value>) -> FlowResult<Step> {
        self.put(cx, address.into(), message.into(), false)
    }

    /// Send `message` and park until the server responds; the response is
    /// the result. A plain receiver acknowledges with `Unit`.
    pub fn call(&self, cx: &FlowContext<'_>, address: impl Into<Key>, message: impl Into<Value>) -> FlowResult<Step> {
        self.put(cx, address.into(), message.into(), true)
    }

    fn put(&self, cx: &FlowContext<'_>, address: Key, message: Value, reply: bool) -> FlowResult<Step> {
        cx.check_interrupted()?;
        let flow = cx.flow();
        let mut deliveries = Vec::new();
        let step = {
            let mut state = self.inner.state.lock();
            let serve = match state.mailbox.receivers.get(&address) {
                Some(Receiver::Flow { serve, .. }) | Some(Receiver::Spawn { serve, .. }) => Some(*serve),
                None => None,
            };
            let must_park = match serve {
                Some(serve) => reply && serve,
                None => true,
            };
            if must_park {
                cx.prepare_park()?;
            }
            let sender = (reply && must_park).then(|| flow.clone());
            match serve {
                None => {
                    state.mailbox.push_sender(
                        address.clone(),
                        PendingSend {
                            message,
                            sender: Some(flow.clone()),
                            reply,
                        },
                    );
                }
                Some(serve) => {
                    let (value, _) = envelope(serve, message, sender, reply);
                    let receiver = state.mailbox.receivers.remove(&address);
                    match receiver {
                        Some(Receiver::Flow { flow: receiver, .. }) => {
                            deliveries.push(Delivery::Wake(receiver, value));
                        }
                        Some(Receiver::Spawn { body, serve }) => {
                            deliveries.push(Delivery::Spawn(body.clone(), value));
                            state
                                .mailbox
                                .receivers
                                .insert(address.clone(), Receiver::Spawn { body, serve });
                        }
                        None => {}
                    }
                }
            }
            self.begin_delivery();
            if must_park {
                let kind = if reply {
                    SignalKind::Call(address)
                } else {
                    SignalKind::Send(address)
                };
                Step::Park(Signal::new(kind, Value::Unit))
            } else {
                Step::Continue(Value::Unit)
            }
        };
        self.deliver(deliveries);
        Ok(step)
    }

    /// Queue `message` for `address` from outside any flow. Returns whether
    /// a receiver took it immediately.
    pub fn post(&self, address: impl Into<Key>, message: impl Into<Value>) -> bool {
        let address = address.into();
        let message = message.into();
        let deliveries = {
            let mut state = self.inner.state.lock();
            self.begin_delivery();
            match state.mailbox.receivers.remove(&address) {
                Some(Receiver::Flow { flow, serve }) => {
                    vec![Delivery::Wake(flow, envelope(serve, message, None, false).0)]
                }
                Some(Receiver::Spawn { body, serve }) => {
                    let delivery = Delivery::Spawn(body.clone(), envelope(serve, message, None, false).0);
                    state
                        .mailbox
                        .receivers
                        .insert(address, Receiver::Spawn { body, serve });
                    vec![delivery]
                }
                None => {
                    state.mailbox.push_sender(
                        address,
                        PendingSend {
                            message,
                            sender: None,
                            reply: false,
                        },
                    );
                    Vec::new()
                }
            }
        };
        self.deliver(deliveries) > 0
    }

    /// Take the next message for `address`, parking until one arrives.
    pub fn receive(&self, cx: &FlowContext<'_>, address: impl Into<Key>) -> FlowResult<Step> {
        self.take(cx, address.into(), false)
    }

    /// Like `receive`, but the result is a [`crate::Request`] to respond to.
    pub fn serve(&self, cx: &FlowContext<'_>, address: impl Into<Key>) -> FlowResult<Step> {
        self.take(cx, address.into(), true)
    }

    fn take(&self, cx: &FlowContext<'_>, address: Key, serve: bool) -> FlowResult<Step> {
        cx.check_interrupted()?;
        let pending = {
            let mut state = self.inner.state.lock();
            if state.mailbox.receivers.contains_key(&address) {
                return Err(FlowError::AddressConflict(address));
            }
            match state.mailbox.pop_sender(&address) {
                Some(pending) => {
                    self.begin_delivery();
                    pending
                }
                None => {
                    cx.prepare_park()?;
                    state.mailbox.receivers.insert(
                        address.clone(),
                        Receiver::Flow {
                            flow: cx.flow().clone(),
                            serve,
                        },
                    );
                    let kind = if serve {
                        SignalKind::Serve(address)
                    } else {
                        SignalKind::Receive(address)
                    };
                    return Ok(Step::Park(Signal::new(kind, Value::Unit)));
                }
            }
        };
        let (value, ack) = envelope(serve, pending.message, pending.sender, pending.reply);
        let deliveries = ack
            .map(|sender| Delivery::Wake(sender, Value::Unit))
            .into_iter()
            .collect();
        self.deliver(deliveries);
        Ok(Step::Continue(value))
    }

    /// Start a new flow running `body` for every message sent to `address`.
    pub fn receive_many(&self, address: impl Into<Key>, body: Arc<dyn Resumable>) -> FlowResult<()> {
        self.take_many(address.into(), body, false)
    }

    /// Start a new flow running `body` for every request to `address`.
    pub fn serve_many(&self, address: impl Into<Key>, body: Arc<dyn Resumable>) -> FlowResult<()> {
        self.take_many(address.into(), body, true)
    }

    fn take_many(&self, address: Key, body: Arc<dyn Resumable>, serve: bool) -> FlowResult<()> {
        let queued = {
            let mut state = self.inner.state.lock();
            if state.mailbox.receivers.contains_key(&address) {
                return Err(FlowError::AddressConflict(address));
            }
            let queued = state.mailbox.drain_senders(&address);
            state.mailbox.receivers.insert(
                address,
                Receiver::Spawn {
                    body: body.clone(),
                    serve,
                },
            );
            self.begin_delivery();
            queued
        };
        let mut deliveries = Vec::with_capacity(queued.len() * 2);
        for pending in queued {
            let (value, ack) = envelope(serve, pending.message, pending.sender, pending.reply);
            deliveries.push(Delivery::Spawn(body.clone(), value));
            if let Some(sender) = ack {
                deliveries.push(Delivery::Wake(sender, Value::Unit));
            }
        }
        self.deliver(deliveries);
        Ok(())
    }

    /// Drop the `*_many` registrations of `address`. Parked flows stay.
    pub fn unregister(&self, address: impl Into<Key>) -> bool {
        let address = address.into();
        let mut state = self.inner.state.lock();
        let mut removed = false;
        if matches!(state.mailbox.receivers.get(&address), Some(Receiver::Spawn { .. })) {
            state.mailbox.receivers.remove(&address);
            removed = true;
        }
        if let Some(waiters) = state.mailbox.waiters.get_mut(&address) {
            let before = waiters.len();
            waiters.retain(|waiter| !matches!(waiter, Waiter::Spawn(_)));
            removed |= waiters.len() != before;
            if waiters.is_empty() {
                state.mailbox.waiters.remove(&address);
            }
        }
        removed
    }

    /// Mark one batch as in flight; called under the task lock and paired
    /// with [`Task::deliver`].
    fn begin_delivery(&self) {
        self.inner.delivering.fetch_add(1, Ordering::SeqCst);
    }

    fn deliver(&self, deliveries: Vec<Delivery>) -> usize {
        let _done = DeliveryDone(&self.inner.delivering);
        let mut reached = 0;
        for delivery in deliveries {
            let delivered = match delivery {
                Delivery::Wake(flow, value) => flow.wake(Ok(value)),
                Delivery::Fire(picker, index, value) => picker.fire(index, value),
                Delivery::Spawn(body, value) => {
                    self.spawn(body, value);
                    true
                }
            };
            if delivered {
                reached += 1;
            }
        }
        reached
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Run `capture` over the flows and mailbox with the task locked and
    /// no mailbox delivery in flight; on success the task forgets both.
    pub(crate) fn passivate_with<R>(
        &self,
        capture: impl FnOnce(&[Flow], &Mailbox) -> Result<R, PersistenceError>,
    ) -> Result<R, PersistenceError> {
        let mut state = self.inner.state.lock();
        let in_flight = self.inner.delivering.load(Ordering::SeqCst);
        if in_flight > 0 {
            return Err(PersistenceError::Busy(in_flight));
        }
        let captured = capture(&state.flows, &state.mailbox)?;
        state.flows.clear();
        state.mailbox = Mailbox::default();
        Ok(captured)
    }

    pub(crate) fn install_mailbox(&self, mailbox: Mailbox) {
        self.inner.state.lock().mailbox = mailbox;
    }

    pub(crate) fn forget(&self, flow: &Flow) {
        self.inner.state.lock().flows.retain(|held| held != flow);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("active", &self.active_count())
            .field("suspended", &self.suspended_count())
            .finish()
    }
}
