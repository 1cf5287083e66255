//! Process - Passivation and Revival of a Task
//!
//! A process is a task whose parked flows can be written to [`Storage`]
//! and later revived, possibly in another run of the program.
//!
//! # Image format
//! A JSON document holding a version, a random seed, the flow count, one
//! record per flow (id, identity tag, park state, signal, frame chain) and
//! the mailbox tables. Identity tags are drawn from a PRNG seeded with the
//! stored seed; revival regenerates them and rejects images whose tags or
//! count do not match.

use crate::error::{FlowResult, PersistenceError, StorageError};
use crate::flow::{Flow, FlowId, FlowState, Retired, Stack};
use crate::mailbox::{Mailbox, MailboxImage};
use crate::registry::FunctionRegistry;
use crate::signal::{Signal, SignalKind};
use crate::task::Task;
use flowline_frame::{FrameChain, Value};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

const IMAGE_VERSION: u32 = 1;

/// Byte store for process images.
pub trait Storage: Send + Sync + 'static {
    fn store(&self, image: &[u8]) -> Result<(), StorageError>;

    fn load(&self) -> Result<Vec<u8>, StorageError>;

    fn discard(&self) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Live,
    Passive,
    /// Revival failed part-way; the stored image is kept.
    Corrupt,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Live => "live",
            ProcessState::Passive => "passive",
            ProcessState::Corrupt => "corrupt",
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ProcessImage {
    version: u32,
    seed: u64,
    count: usize,
    flows: Vec<FlowImage>,
    mailbox: MailboxImage,
}

#[derive(Serialize, Deserialize)]
struct FlowImage {
    id: FlowId,
    tag: u64,
    blocked: bool,
    signal: SignalKind,
    payload: Value,
    chain: FrameChain,
}

pub struct Process {
    task: Task,
    storage: Arc<dyn Storage>,
    registry: Arc<FunctionRegistry>,
    state: Mutex<ProcessState>,
}

impl Process {
    pub fn new(task: Task, storage: Arc<dyn Storage>, registry: Arc<FunctionRegistry>) -> Self {
        Self {
            task,
            storage,
            registry,
            state: Mutex::new(ProcessState::Live),
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    /// Write every flow of the task to storage and drop them from memory.
    ///
    /// All flows must be parked: `SUSPENDED`, or `BLOCKED` on a mailbox
    /// operation. Flows are retired under the task lock; if any flow cannot
    /// be retired or the image cannot be stored, the retired flows are put
    /// back and the process stays `LIVE`. Returns the number of flows written.
    pub fn passivate(&self) -> FlowResult<usize> {
        let mut state = self.state.lock();
        if *state != ProcessState::Live {
            return Err(PersistenceError::WrongState(state.as_str()).into());
        }
        let running = self.task.active_count();
        if running > 0 {
            return Err(PersistenceError::Busy(running).into());
        }

        let seed: u64 = rand::random();
        let written = self.task.passivate_with(|flows, mailbox| {
            let mut tags = StdRng::seed_from_u64(seed);
            let mut retired = Vec::with_capacity(flows.len());
            let stored = self.write_image(flows, mailbox, seed, &mut tags, &mut retired);
            if stored.is_err() {
                for (flow, parts) in retired {
                    flow.reinstate(parts);
                }
            }
            stored
        })?;
        *state = ProcessState::Passive;
        tracing::info!(task = %self.task.name(), flows = written.0, bytes = written.1, "process passivated");
        Ok(written.0)
    }

    /// Retire every flow into `retired` and store the resulting image.
    /// Returns the flow count and image size.
    fn write_image(
        &self,
        flows: &[Flow],
        mailbox: &Mailbox,
        seed: u64,
        tags: &mut StdRng,
        retired: &mut Vec<(Flow, Retired)>,
    ) -> Result<(usize, usize), PersistenceError> {
        let mut images = Vec::with_capacity(flows.len());
        for flow in flows {
            let parts = flow.retire()?;
            images.push(FlowImage {
                id: flow.id(),
                tag: tags.next_u64(),
                blocked: parts.state == FlowState::Blocked,
                signal: parts.signal.kind().clone(),
                payload: parts.signal.payload().clone(),
                chain: parts.stack.chain().copy(),
            });
            retired.push((flow.clone(), parts));
        }
        let image = ProcessImage {
            version: IMAGE_VERSION,
            seed,
            count: images.len(),
            flows: images,
            mailbox: mailbox.image()?,
        };
        let bytes = serde_json::to_vec(&image)?;
        self.storage.store(&bytes)?;
        Ok((image.count, bytes.len()))
    }

    /// Load the stored image and bring its flows back, parked as they were.
    ///
    /// A malformed image or failed validation leaves the process `PASSIVE`;
    /// a failure while restoring functions marks it `CORRUPT`.
    pub fn revive(&self) -> FlowResult<Vec<Flow>> {
        let mut state = self.state.lock();
        if *state != ProcessState::Passive {
            return Err(PersistenceError::WrongState(state.as_str()).into());
        }
        let bytes = self.storage.load().map_err(PersistenceError::from)?;
        let image: ProcessImage = serde_json::from_slice(&bytes)
            .map_err(|e| PersistenceError::Structure(e.to_string()))?;
        validate(&image)?;

        let mut revived: Vec<Flow> = Vec::with_capacity(image.count);
        for record in image.flows {
            match self.restore(record) {
                Ok(flow) => revived.push(flow),
                Err(e) => {
                    self.roll_back(&revived);
                    *state = ProcessState::Corrupt;
                    tracing::error!(task = %self.task.name(), error = %e, "process revival failed");
                    return Err(e.into());
                }
            }
        }
        let by_id: HashMap<FlowId, Flow> = revived
            .iter()
            .map(|flow| (flow.id(), flow.clone()))
            .collect();
        match Mailbox::from_image(image.mailbox, &by_id, &self.registry) {
            Ok(mailbox) => self.task.install_mailbox(mailbox),
            Err(e) => {
                self.roll_back(&revived);
                *state = ProcessState::Corrupt;
                tracing::error!(task = %self.task.name(), error = %e, "process revival failed");
                return Err(e.into());
            }
        }

        if let Err(e) = self.storage.discard() {
            tracing::warn!(task = %self.task.name(), error = %e, "stored image not discarded");
        }
        *state = ProcessState::Live;
        for flow in &revived {
            if let Some(signal) = flow.parked_signal() {
                if let SignalKind::Delay(delay) = signal.kind() {
                    flow.activate_after(*delay);
                }
            }
        }
        tracing::info!(task = %self.task.name(), flows = revived.len(), "process revived");
        Ok(revived)
    }

    fn restore(&self, record: FlowImage) -> Result<Flow, PersistenceError> {
        let bodies = record
            .chain
            .frames()
            .map(|frame| self.registry.lookup(frame.signature()))
            .collect::<Result<Vec<_>, _>>()?;
        let state = if record.blocked {
            FlowState::Blocked
        } else {
            FlowState::Suspended
        };
        let signal = Signal::new(record.signal, record.payload);
        Ok(Flow::build(
            record.id,
            Some(self.task.clone()),
            self.task.manager().clone(),
            state,
            Some((Stack::from_parts(record.chain, bodies), signal)),
        ))
    }

    fn roll_back(&self, revived: &[Flow]) {
        for flow in revived {
            flow.discard();
            self.task.forget(flow);
        }
    }
}

fn validate(image: &ProcessImage) -> Result<(), PersistenceError> {
    if image.version != IMAGE_VERSION {
        return Err(PersistenceError::Structure(format!(
            "unsupported image version {}",
            image.version
        )));
    }
    if image.flows.len() != image.count {
        return Err(PersistenceError::CountMismatch {
            expected: image.count,
            actual: image.flows.len(),
        });
    }
    let mut tags = StdRng::seed_from_u64(image.seed);
    for (index, flow) in image.flows.iter().enumerate() {
        if flow.tag != tags.next_u64() {
            return Err(PersistenceError::TagMismatch { index });
        }
    }
    Ok(())
}
