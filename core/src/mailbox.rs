//! Mailbox - Per-Task Rendezvous Tables
//!
//! Three tables keyed by [`Key`]:
//! - waiters: flows (or pickers, or spawn registrations) waiting for `notify_all`
//! - receivers: the single receiving/serving party of an address
//! - senders: queued `send`/`call` messages with no receiver yet
//!
//! The tables only hold registrations; wake-ups happen in `Task` after the
//! task lock is released.

use crate::error::{FlowError, PersistenceError};
use crate::flow::{Flow, FlowId};
use crate::key::Key;
use crate::picker::EventPicker;
use crate::registry::FunctionRegistry;
use crate::resumable::Resumable;
use flowline_frame::{Signature, Value};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub(crate) enum Waiter {
    Flow(Flow),
    Picker(EventPicker, usize),
    /// Spawn a new flow per notification; stays registered.
    Spawn(Arc<dyn Resumable>),
}

pub(crate) enum Receiver {
    Flow { flow: Flow, serve: bool },
    /// Spawn a new flow per message; stays registered.
    Spawn { body: Arc<dyn Resumable>, serve: bool },
}

pub(crate) struct PendingSend {
    pub(crate) message: Value,
    pub(crate) sender: Option<Flow>,
    /// Sent with `call`: the sender waits for a reply.
    pub(crate) reply: bool,
}

#[derive(Default)]
pub(crate) struct Mailbox {
    pub(crate) waiters: HashMap<Key, Vec<Waiter>>,
    pub(crate) receivers: HashMap<Key, Receiver>,
    pub(crate) senders: HashMap<Key, VecDeque<PendingSend>>,
}

impl Mailbox {
    pub(crate) fn pop_sender(&mut self, address: &Key) -> Option<PendingSend> {
        let queue = self.senders.get_mut(address)?;
        let pending = queue.pop_front();
        if queue.is_empty() {
            self.senders.remove(address);
        }
        pending
    }

    pub(crate) fn drain_senders(&mut self, address: &Key) -> VecDeque<PendingSend> {
        self.senders.remove(address).unwrap_or_default()
    }

    pub(crate) fn push_sender(&mut self, address: Key, pending: PendingSend) {
        self.senders.entry(address).or_default().push_back(pending);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.is_empty() && self.receivers.is_empty() && self.senders.is_empty()
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    pub(crate) fn image(&self) -> Result<MailboxImage, PersistenceError> {
        let mut image = MailboxImage::default();
        for (key, waiters) in &self.waiters {
            let mut entries = Vec::with_capacity(waiters.len());
            for waiter in waiters {
                entries.push(match waiter {
                    Waiter::Flow(flow) => WaiterImage::Flow(flow.id()),
                    Waiter::Spawn(body) => WaiterImage::Spawn(body.signature()),
                    Waiter::Picker(..) => {
                        return Err(PersistenceError::Structure(format!(
                            "event picker waiting on {key} cannot be written out"
                        )));
                    }
                });
            }
            image.waiters.push((key.clone(), entries));
        }
        for (key, receiver) in &self.receivers {
            let entry = match receiver {
                Receiver::Flow { flow, serve } => ReceiverImage::Flow {
                    flow: flow.id(),
                    serve: *serve,
                },
                Receiver::Spawn { body, serve } => ReceiverImage::Spawn {
                    function: body.signature(),
                    serve: *serve,
                },
            };
            image.receivers.push((key.clone(), entry));
        }
        for (key, queue) in &self.senders {
            let mut entries = Vec::with_capacity(queue.len());
            for pending in queue {
                if !pending.message.is_serializable() {
                    return Err(PersistenceError::Structure(format!(
                        "message queued on {key} holds an opaque value"
                    )));
                }
                entries.push(PendingImage {
                    message: pending.message.clone(),
                    sender: pending.sender.as_ref().map(Flow::id),
                    reply: pending.reply,
                });
            }
            image.senders.push((key.clone(), entries));
        }
        Ok(image)
    }

    pub(crate) fn from_image(
        image: MailboxImage,
        flows: &HashMap<FlowId, Flow>,
        registry: &FunctionRegistry,
    ) -> Result<Mailbox, PersistenceError> {
        let flow = |id: &FlowId| {
            flows.get(id).cloned().ok_or_else(|| {
                PersistenceError::Structure(format!("mailbox refers to unknown flow {id}"))
            })
        };
        let mut mailbox = Mailbox::default();
        for (key, entries) in image.waiters {
            let mut waiters = Vec::with_capacity(entries.len());
            for entry in entries {
                waiters.push(match entry {
                    WaiterImage::Flow(id) => Waiter::Flow(flow(&id)?),
                    WaiterImage::Spawn(signature) => Waiter::Spawn(registry.lookup(&signature)?),
                });
            }
            mailbox.waiters.insert(key, waiters);
        }
        for (key, entry) in image.receivers {
            let receiver = match entry {
                ReceiverImage::Flow { flow: id, serve } => Receiver::Flow {
                    flow: flow(&id)?,
                    serve,
                },
                ReceiverImage::Spawn { function, serve } => Receiver::Spawn {
                    body: registry.lookup(&function)?,
                    serve,
                },
            };
            mailbox.receivers.insert(key, receiver);
        }
        for (key, entries) in image.senders {
            let mut queue = VecDeque::with_capacity(entries.len());
            for entry in entries {
                queue.push_back(PendingSend {
                    message: entry.message,
                    sender: entry.sender.as_ref().map(flow).transpose()?,
                    reply: entry.reply,
                });
            }
            mailbox.senders.insert(key, queue);
        }
        Ok(mailbox)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct MailboxImage {
    waiters: Vec<(Key, Vec<WaiterImage>)>,
    receivers: Vec<(Key, ReceiverImage)>,
    senders: Vec<(Key, Vec<PendingImage>)>,
}

#[derive(Debug, Serialize, Deserialize)]
enum WaiterImage {
    Flow(FlowId),
    Spawn(Signature),
}

#[derive(Debug, Serialize, Deserialize)]
enum ReceiverImage {
    Flow { flow: FlowId, serve: bool },
    Spawn { function: Signature, serve: bool },
}

#[derive(Debug, Serialize, Deserialize)]
struct PendingImage {
    message: Value,
    sender: Option<FlowId>,
    reply: bool,
}

// ============================================================================
// Request
// ============================================================================

/// What a serving flow receives: the message plus a way to answer it.
///
/// Delivered as an opaque [`Value`]; recover it with [`Request::from_value`].
pub struct Request {
    message: Value,
    caller: Option<Flow>,
    responded: AtomicBool,
}

impl Request {
    pub(crate) fn new(message: Value, caller: Option<Flow>) -> Self {
        Self {
            message,
            caller,
            responded: AtomicBool::new(false),
        }
    }

    pub fn from_value(value: &Value) -> Result<Arc<Request>, FlowError> {
        value
            .downcast::<Request>()
            .ok_or_else(|| FlowError::failed(format!("expected a request, got {}", value.kind())))
    }

    pub fn request(&self) -> &Value {
        &self.message
    }

    /// Whether a caller is waiting for `respond`.
    pub fn expects_reply(&self) -> bool {
        self.caller.is_some()
    }

    /// Resume the caller with `value`. Only the first response counts.
    pub fn respond(&self, value: impl Into<Value>) -> bool {
        if self.responded.swap(true, Ordering::SeqCst) {
            return false;
        }
        match &self.caller {
            Some(caller) => caller.wake(Ok(value.into())),
            None => false,
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("message", &self.message)
            .field("caller", &self.caller.as_ref().map(Flow::id))
            .field("responded", &self.responded.load(Ordering::SeqCst))
            .finish()
    }
}

/// Turn a queued message into what the receiving side gets, plus the
/// sender to acknowledge with `Unit` (if any).
pub(crate) fn envelope(
    serve: bool,
    message: Value,
    sender: Option<Flow>,
    reply: bool,
) -> (Value, Option<Flow>) {
    match (serve, reply) {
        (true, true) => (Value::shared(Arc::new(Request::new(message, sender))), None),
        (true, false) => (Value::shared(Arc::new(Request::new(message, None))), sender),
        (false, _) => (message, sender),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_without_serving() {
        let (value, ack) = envelope(false, Value::from("hi"), None, true);
        assert_eq!(value, Value::from("hi"));
        assert!(ack.is_none());
    }

    #[test]
    fn test_envelope_serve_wraps_request() {
        let (value, ack) = envelope(true, Value::Int(7), None, false);
        assert!(ack.is_none());
        let request = Request::from_value(&value).unwrap();
        assert_eq!(request.request(), &Value::Int(7));
        assert!(!request.expects_reply());
        assert!(!request.respond(1));
    }

    #[test]
    fn test_request_from_plain_value_fails() {
        assert!(Request::from_value(&Value::Int(1)).is_err());
    }

    #[test]
    fn test_sender_queue_cleanup() {
        let mut mailbox = Mailbox::default();
        let key = Key::from("inbox");
        mailbox.push_sender(
            key.clone(),
            PendingSend {
                message: Value::Int(1),
                sender: None,
                reply: false,
            },
        );
        assert!(!mailbox.is_empty());
        let pending = mailbox.pop_sender(&key).unwrap();
        assert_eq!(pending.message, Value::Int(1));
        assert!(mailbox.is_empty());
    }
}
