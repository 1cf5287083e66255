//! FrameChain - The Per-Flow Frame Arena
//!
//! Frames of one flow live in an arena indexed by [`FrameId`]; index 0 is
//! the root (the creator call) and the last index is the leaf (the frame
//! that is running or parked). `prior` links always point one slot down.
//!
//! Frames are stored behind `Arc` and cloned on write, so a
//! [`FrameChain::shallow_copy`] can share every prior frame with the chain
//! it was copied from while owning its own leaf.

use crate::error::FrameError;
use crate::frame::{Frame, FrameId, FrameState, Signature};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct FrameChain {
    frames: Vec<Arc<Frame>>,
}

impl FrameChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn root(&self) -> Option<FrameId> {
        (!self.frames.is_empty()).then_some(FrameId(0))
    }

    pub fn leaf(&self) -> Option<FrameId> {
        self.frames.len().checked_sub(1).map(FrameId)
    }

    /// Push a fresh `ACTIVE` frame on top of the current leaf.
    pub fn push(&mut self, signature: Signature) -> FrameId {
        let prior = self.leaf();
        self.frames.push(Arc::new(Frame::new(signature, prior)));
        FrameId(self.frames.len() - 1)
    }

    /// Unlink and return the leaf frame.
    pub fn pop(&mut self) -> Option<Frame> {
        self.frames
            .pop()
            .map(|frame| Arc::try_unwrap(frame).unwrap_or_else(|shared| (*shared).clone()))
    }

    pub fn get(&self, id: FrameId) -> Option<&Frame> {
        self.frames.get(id.0).map(Arc::as_ref)
    }

    /// Mutable access, detaching the frame from any chain it is shared with.
    pub fn get_mut(&mut self, id: FrameId) -> Option<&mut Frame> {
        self.frames.get_mut(id.0).map(Arc::make_mut)
    }

    pub fn leaf_mut(&mut self) -> Result<&mut Frame, FrameError> {
        let leaf = self.leaf().ok_or(FrameError::EmptyChain)?;
        self.get_mut(leaf).ok_or(FrameError::EmptyChain)
    }

    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter().map(Arc::as_ref)
    }

    /// Independent duplicate of every frame. Opaque values stay shared.
    pub fn copy(&self) -> Self {
        Self {
            frames: self
                .frames
                .iter()
                .map(|frame| Arc::new(Frame::clone(frame)))
                .collect(),
        }
    }

    /// Duplicate only the leaf; prior frames are shared until written.
    pub fn shallow_copy(&self) -> Self {
        let mut frames = self.frames.clone();
        if let Some(leaf) = frames.last_mut() {
            *leaf = Arc::new(Frame::clone(leaf));
        }
        Self { frames }
    }

    /// A one-frame chain holding a copy of the leaf as its root.
    pub fn detach_leaf(&self) -> Result<Self, FrameError> {
        let leaf = self.frames.last().ok_or(FrameError::EmptyChain)?;
        let mut frame = Frame::clone(leaf);
        frame.set_prior(None);
        frame.set_next(None);
        Ok(Self {
            frames: vec![Arc::new(frame)],
        })
    }

    /// Prepare a parked chain for re-entry.
    ///
    /// Walks from the root to the leaf, checking that every frame is
    /// `INVOKING` with a resume point and wiring the transient `next` links,
    /// then switches the leaf to `RESTORING`.
    pub fn prepare_restore(&mut self) -> Result<FrameId, FrameError> {
        let leaf = self.leaf().ok_or(FrameError::EmptyChain)?;
        for index in 0..self.frames.len() {
            let frame = &self.frames[index];
            if frame.state() != FrameState::Invoking || frame.resume_point() == 0 {
                return Err(FrameError::Inconsistent(format!(
                    "frame {index} of `{}` is {:?} at resume point {}",
                    frame.signature().qualified_name(),
                    frame.state(),
                    frame.resume_point()
                )));
            }
            let expected_prior = index.checked_sub(1).map(FrameId);
            if frame.prior() != expected_prior {
                return Err(FrameError::Inconsistent(format!(
                    "frame {index} links to {:?}",
                    frame.prior()
                )));
            }
            let next = (index + 1 < self.frames.len()).then_some(FrameId(index + 1));
            if frame.next() != next {
                Arc::make_mut(&mut self.frames[index]).set_next(next);
            }
        }
        self.leaf_mut()?.enter_restoring()?;
        Ok(leaf)
    }

    /// Re-enter the caller of a frame that just returned.
    pub fn restore_leaf(&mut self) -> Result<FrameId, FrameError> {
        let leaf = self.leaf().ok_or(FrameError::EmptyChain)?;
        let frame = self.leaf_mut()?;
        frame.set_next(None);
        frame.enter_restoring()?;
        Ok(leaf)
    }

    /// True when every frame can be written to a snapshot.
    pub fn is_serializable(&self) -> bool {
        self.frames.iter().all(|frame| frame.is_serializable())
    }
}

impl Serialize for FrameChain {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.frames.iter().map(Arc::as_ref))
    }
}

impl<'de> Deserialize<'de> for FrameChain {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let frames = Vec::<Frame>::deserialize(deserializer)?;
        Ok(Self {
            frames: frames.into_iter().map(Arc::new).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Value, ValueKind};

    fn sig(name: &str) -> Signature {
        Signature::new("tests", name, ValueKind::Any)
    }

    fn parked_chain() -> FrameChain {
        let mut chain = FrameChain::new();
        let root = chain.push(sig("outer"));
        chain.get_mut(root).unwrap().notify_invoke(1, 1, 0);
        chain.get_mut(root).unwrap().save_int(0, 10).unwrap();
        let leaf = chain.push(sig("inner"));
        chain.get_mut(leaf).unwrap().notify_invoke(2, 0, 1);
        chain
            .get_mut(leaf)
            .unwrap()
            .save_value(0, Value::from("leaf"))
            .unwrap();
        chain
    }

    #[test]
    fn test_prepare_restore_wires_next_links() {
        let mut chain = parked_chain();
        let leaf = chain.prepare_restore().unwrap();
        assert_eq!(leaf, FrameId(1));
        assert_eq!(chain.get(FrameId(0)).unwrap().next(), Some(FrameId(1)));
        assert_eq!(chain.get(FrameId(0)).unwrap().state(), FrameState::Invoking);
        assert_eq!(chain.get(leaf).unwrap().state(), FrameState::Restoring);
        assert_eq!(chain.get(leaf).unwrap().prior(), Some(FrameId(0)));
    }

    #[test]
    fn test_prepare_restore_rejects_running_frame() {
        let mut chain = FrameChain::new();
        chain.push(sig("fresh"));
        assert!(matches!(
            chain.prepare_restore(),
            Err(FrameError::Inconsistent(_))
        ));
    }

    #[test]
    fn test_shallow_copy_shares_priors_until_written() {
        let chain = parked_chain();
        let mut branch = chain.shallow_copy();

        branch.leaf_mut().unwrap().save_value(0, "branch").unwrap();
        branch
            .get_mut(FrameId(0))
            .unwrap()
            .save_int(0, 99)
            .unwrap();

        assert_eq!(chain.get(FrameId(1)).unwrap().text(0).unwrap(), "leaf");
        assert_eq!(chain.get(FrameId(0)).unwrap().int(0).unwrap(), 10);
        assert_eq!(branch.get(FrameId(0)).unwrap().int(0).unwrap(), 99);
    }

    #[test]
    fn test_detach_leaf_becomes_root() {
        let chain = parked_chain();
        let detached = chain.detach_leaf().unwrap();
        assert_eq!(detached.len(), 1);
        assert_eq!(detached.get(FrameId(0)).unwrap().prior(), None);
        assert_eq!(detached.get(FrameId(0)).unwrap().resume_point(), 2);
    }

    #[test]
    fn test_serde_round_trip_preserves_slots() {
        let chain = parked_chain();
        let bytes = serde_json::to_vec(&chain).unwrap();
        let mut back: FrameChain = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.len(), 2);
        back.prepare_restore().unwrap();
        assert_eq!(back.get(FrameId(0)).unwrap().int(0).unwrap(), 10);
        assert_eq!(back.get(FrameId(1)).unwrap().text(0).unwrap(), "leaf");
    }
}
