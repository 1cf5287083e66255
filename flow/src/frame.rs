//! Frame - Activation Records Off the Native Stack
//!
//! A `Frame` is the saved state of one resumable function activation:
//! which function it belongs to, where to re-enter it, and the locals that
//! were live at that point.
//!
//! # Protocol
//! ```text
//! ACTIVE ──notify_invoke──▶ INVOKING ──enter_restoring──▶ RESTORING
//!    │                                                        │
//!    └──────────────finish(Return | Throw)──▶ DEAD ◀──────────┘
//! ```
//! A function calls [`Frame::notify_invoke`] right before calling another
//! resumable function or reaching a suspension point, then saves its locals
//! with the typed `save_*` accessors. When the frame is re-entered it is in
//! `RESTORING` state; the function reads its locals back and jumps to
//! [`Frame::resume_point`].

use crate::error::FrameError;
use crate::value::{Value, ValueKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a frame inside its flow's frame arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameId(pub usize);

/// Identity of a resumable function: owner, name and declared result kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    pub owner: String,
    pub name: String,
    pub returns: ValueKind,
}

impl Signature {
    pub fn new(owner: impl Into<String>, name: impl Into<String>, returns: ValueKind) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            returns,
        }
    }

    /// Lookup key ignoring the result kind.
    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.owner, self.name)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{} -> {}", self.owner, self.name, self.returns)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameState {
    /// Running fresh code (no pending re-entry).
    Active,
    /// Locals captured; waiting on a callee or a suspension point.
    Invoking,
    /// Being re-entered; locals must be read back from the save slots.
    Restoring,
    /// Returned normally or by exception.
    Dead,
    /// Returned to its caller while a continuation carries on the body.
    LeavingFunction,
    /// The whole flow is ending.
    LeavingFlow,
}

/// How a function left its frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Return,
    Throw,
    LeaveFunction,
    LeaveFlow,
}

/// One activation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    signature: Signature,
    state: FrameState,
    resume_point: u32,
    prims: Vec<i64>,
    refs: Vec<Value>,
    #[serde(skip)]
    prim_cursor: usize,
    #[serde(skip)]
    ref_cursor: usize,
    prior: Option<FrameId>,
    #[serde(skip)]
    next: Option<FrameId>,
}

impl Frame {
    /// A fresh frame about to run its function from the top.
    pub fn new(signature: Signature, prior: Option<FrameId>) -> Self {
        Self {
            signature,
            state: FrameState::Active,
            resume_point: 0,
            prims: Vec::new(),
            refs: Vec::new(),
            prim_cursor: 0,
            ref_cursor: 0,
            prior,
            next: None,
        }
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Where to re-enter the function; 0 means "from the top".
    pub fn resume_point(&self) -> u32 {
        self.resume_point
    }

    pub fn is_restoring(&self) -> bool {
        self.state == FrameState::Restoring
    }

    pub fn prior(&self) -> Option<FrameId> {
        self.prior
    }

    pub fn next(&self) -> Option<FrameId> {
        self.next
    }

    pub(crate) fn set_prior(&mut self, prior: Option<FrameId>) {
        self.prior = prior;
    }

    pub(crate) fn set_next(&mut self, next: Option<FrameId>) {
        self.next = next;
    }

    /// Capture point: the function is about to invoke a callee or park.
    ///
    /// Switches the frame to `INVOKING`, records the resume point and
    /// (re)allocates `n_prims` primitive and `n_refs` reference save slots.
    pub fn notify_invoke(&mut self, resume_point: u32, n_prims: usize, n_refs: usize) {
        debug_assert!(resume_point > 0, "resume point 0 is reserved for fresh entry");
        self.state = FrameState::Invoking;
        self.resume_point = resume_point;
        self.prims.clear();
        self.prims.resize(n_prims, 0);
        self.refs.clear();
        self.refs.resize(n_refs, Value::Unit);
        self.prim_cursor = 0;
        self.ref_cursor = 0;
        self.next = None;
    }

    /// INVOKING → RESTORING, checking the re-entry invariant.
    pub fn enter_restoring(&mut self) -> Result<(), FrameError> {
        if self.state != FrameState::Invoking {
            return Err(FrameError::UnexpectedState {
                function: self.signature.qualified_name(),
                expected: FrameState::Invoking,
                actual: self.state,
            });
        }
        if self.resume_point == 0 {
            return Err(FrameError::Inconsistent(format!(
                "`{}` captured without a resume point",
                self.signature.qualified_name()
            )));
        }
        self.state = FrameState::Restoring;
        self.prim_cursor = 0;
        self.ref_cursor = 0;
        Ok(())
    }

    /// Record how the function left this frame.
    pub fn finish(&mut self, exit: Exit) {
        self.state = match exit {
            Exit::Return | Exit::Throw => FrameState::Dead,
            Exit::LeaveFunction => FrameState::LeavingFunction,
            Exit::LeaveFlow => FrameState::LeavingFlow,
        };
        self.resume_point = 0;
        self.next = None;
    }

    /// A frame left by `LeaveFunction`/`LeaveFlow` is dead once unlinked.
    pub fn bury(&mut self) {
        self.state = FrameState::Dead;
    }

    // ------------------------------------------------------------------
    // Primitive slots
    // ------------------------------------------------------------------

    pub fn save_int(&mut self, index: usize, value: i64) -> Result<(), FrameError> {
        let len = self.prims.len();
        let slot = self
            .prims
            .get_mut(index)
            .ok_or(FrameError::SlotOutOfRange { index, len })?;
        *slot = value;
        Ok(())
    }

    pub fn save_float(&mut self, index: usize, value: f64) -> Result<(), FrameError> {
        self.save_int(index, value.to_bits() as i64)
    }

    pub fn save_bool(&mut self, index: usize, value: bool) -> Result<(), FrameError> {
        self.save_int(index, i64::from(value))
    }

    pub fn int(&self, index: usize) -> Result<i64, FrameError> {
        self.prims
            .get(index)
            .copied()
            .ok_or(FrameError::SlotOutOfRange {
                index,
                len: self.prims.len(),
            })
    }

    pub fn float(&self, index: usize) -> Result<f64, FrameError> {
        self.int(index).map(|bits| f64::from_bits(bits as u64))
    }

    pub fn bool(&self, index: usize) -> Result<bool, FrameError> {
        self.int(index).map(|v| v != 0)
    }

    /// Append to the primitive slots at the cursor.
    pub fn push_int(&mut self, value: i64) -> Result<(), FrameError> {
        let index = self.prim_cursor;
        self.save_int(index, value)?;
        self.prim_cursor += 1;
        Ok(())
    }

    /// Read the primitive slots in capture order.
    pub fn next_int(&mut self) -> Result<i64, FrameError> {
        let value = self.int(self.prim_cursor)?;
        self.prim_cursor += 1;
        Ok(value)
    }

    // ------------------------------------------------------------------
    // Reference slots
    // ------------------------------------------------------------------

    pub fn save_value(&mut self, index: usize, value: impl Into<Value>) -> Result<(), FrameError> {
        let len = self.refs.len();
        let slot = self
            .refs
            .get_mut(index)
            .ok_or(FrameError::SlotOutOfRange { index, len })?;
        *slot = value.into();
        Ok(())
    }

    pub fn value(&self, index: usize) -> Result<&Value, FrameError> {
        self.refs.get(index).ok_or(FrameError::SlotOutOfRange {
            index,
            len: self.refs.len(),
        })
    }

    /// Move a value out of its slot, leaving `Unit` behind.
    pub fn take_value(&mut self, index: usize) -> Result<Value, FrameError> {
        let len = self.refs.len();
        self.refs
            .get_mut(index)
            .map(std::mem::take)
            .ok_or(FrameError::SlotOutOfRange { index, len })
    }

    /// Read a text slot.
    pub fn text(&self, index: usize) -> Result<&str, FrameError> {
        let value = self.value(index)?;
        value.as_text().ok_or(FrameError::SlotType {
            index,
            expected: ValueKind::Text,
            actual: value.kind(),
        })
    }

    pub fn push_value(&mut self, value: impl Into<Value>) -> Result<(), FrameError> {
        let index = self.ref_cursor;
        self.save_value(index, value)?;
        self.ref_cursor += 1;
        Ok(())
    }

    pub fn next_value(&mut self) -> Result<Value, FrameError> {
        let value = self.value(self.ref_cursor)?.clone();
        self.ref_cursor += 1;
        Ok(value)
    }

    /// True when every reference slot can be written to a snapshot.
    pub fn is_serializable(&self) -> bool {
        self.refs.iter().all(Value::is_serializable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig() -> Signature {
        Signature::new("tests", "counter", ValueKind::Int)
    }

    #[test]
    fn test_capture_and_restore_locals() {
        let mut frame = Frame::new(sig(), None);
        assert_eq!(frame.state(), FrameState::Active);
        assert_eq!(frame.resume_point(), 0);

        frame.notify_invoke(3, 2, 1);
        frame.save_int(0, 41).unwrap();
        frame.save_float(1, 2.5).unwrap();
        frame.save_value(0, "hello").unwrap();
        assert_eq!(frame.state(), FrameState::Invoking);

        frame.enter_restoring().unwrap();
        assert!(frame.is_restoring());
        assert_eq!(frame.resume_point(), 3);
        assert_eq!(frame.int(0).unwrap(), 41);
        assert_eq!(frame.float(1).unwrap(), 2.5);
        assert_eq!(frame.text(0).unwrap(), "hello");
    }

    #[test]
    fn test_cursor_accessors_follow_capture_order() {
        let mut frame = Frame::new(sig(), None);
        frame.notify_invoke(1, 2, 2);
        frame.push_int(7).unwrap();
        frame.push_int(8).unwrap();
        frame.push_value(Value::Bool(true)).unwrap();
        frame.push_value("x").unwrap();

        frame.enter_restoring().unwrap();
        assert_eq!(frame.next_int().unwrap(), 7);
        assert_eq!(frame.next_int().unwrap(), 8);
        assert_eq!(frame.next_value().unwrap(), Value::Bool(true));
        assert_eq!(frame.next_value().unwrap(), Value::from("x"));
        assert!(frame.next_int().is_err());
    }

    #[test]
    fn test_restoring_requires_invoking() {
        let mut frame = Frame::new(sig(), None);
        let err = frame.enter_restoring().unwrap_err();
        assert!(matches!(err, FrameError::UnexpectedState { .. }));
    }

    #[test]
    fn test_slot_out_of_range() {
        let mut frame = Frame::new(sig(), None);
        frame.notify_invoke(1, 1, 0);
        assert_eq!(
            frame.save_value(0, 1),
            Err(FrameError::SlotOutOfRange { index: 0, len: 0 })
        );
    }

    #[test]
    fn test_finish_clears_resume_point() {
        let mut frame = Frame::new(sig(), None);
        frame.notify_invoke(2, 0, 0);
        frame.finish(Exit::LeaveFlow);
        assert_eq!(frame.state(), FrameState::LeavingFlow);
        assert_eq!(frame.resume_point(), 0);
        frame.bury();
        assert_eq!(frame.state(), FrameState::Dead);
    }
}
