// Single-slot mailbox between the G-code dispatcher and the motion subsystem.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use crate::axis::{Drive, DriveArray};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveFlags {
    /// Stop the axis when its endstop triggers.
    pub check_endstops: bool,
    /// Stop the move when the Z probe triggers.
    pub probe: bool,
}

/// An absolute move request. Inactive drives hold their current position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingMove {
    pub target: DriveArray<f64>,
    pub active: DriveArray<bool>,
    /// mm/min
    pub feedrate: f64,
    pub flags: MoveFlags,
}

impl PendingMove {
    /// A move that keeps every drive where it is.
    pub fn hold(position: &DriveArray<f64>, feedrate: f64) -> Self {
        PendingMove {
            target: *position,
            active: DriveArray::default(),
            feedrate,
            flags: MoveFlags::default(),
        }
    }

    pub fn set(&mut self, drive: impl Into<Drive>, target: f64) {
        let drive = drive.into();
        self.target[drive] = target;
        self.active[drive] = true;
    }

    pub fn is_active(&self, drive: impl Into<Drive>) -> bool {
        self.active[drive.into()]
    }

    pub fn active_drives(&self) -> impl Iterator<Item = Drive> + '_ {
        self.active.iter().filter(|(_, on)| **on).map(|(d, _)| d)
    }

    pub fn is_empty(&self) -> bool {
        self.active_drives().next().is_none()
    }
}

#[derive(Debug, Error)]
#[error("a staged move has not been pulled yet")]
pub struct SlotOccupied(pub PendingMove);

/// Dispatcher is the only writer, the motion side the only reader.
#[derive(Debug, Clone, Default)]
pub struct MoveSlot {
    inner: Arc<Mutex<Option<PendingMove>>>,
}

impl MoveSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<PendingMove>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publishes a move. An unpulled move is never overwritten.
    pub fn stage(&self, mv: PendingMove) -> Result<(), SlotOccupied> {
        let mut slot = self.lock();
        if slot.is_some() {
            return Err(SlotOccupied(mv));
        }
        *slot = Some(mv);
        Ok(())
    }

    /// Takes the staged move, freeing the slot.
    pub fn pull(&self) -> Option<PendingMove> {
        self.lock().take()
    }

    /// Nothing staged; the dispatcher may publish a move.
    pub fn is_empty(&self) -> bool {
        self.lock().is_none()
    }

    pub fn peek(&self) -> Option<PendingMove> {
        *self.lock()
    }

    /// Drops an unpulled move (aborts).
    pub fn clear(&self) -> Option<PendingMove> {
        let dropped = self.lock().take();
        if dropped.is_some() {
            tracing::debug!("discarded staged move");
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::Axis;

    #[test]
    fn stage_refuses_to_overwrite() {
        let slot = MoveSlot::new();
        let mut first = PendingMove::hold(&DriveArray::default(), 3000.0);
        first.set(Axis::X, 10.0);
        let second = PendingMove::hold(&DriveArray::default(), 1000.0);

        slot.stage(first).unwrap();
        let err = slot.stage(second).unwrap_err();
        assert_eq!(err.0.feedrate, 1000.0);
        assert_eq!(slot.peek(), Some(first));
    }

    #[test]
    fn pull_empties_the_slot() {
        let slot = MoveSlot::new();
        let reader = slot.clone();
        slot.stage(PendingMove::hold(&DriveArray::default(), 600.0)).unwrap();
        assert!(!slot.is_empty());
        assert!(reader.pull().is_some());
        assert!(slot.is_empty());
        assert!(reader.pull().is_none());
    }

    #[test]
    fn held_drives_are_inactive() {
        let mut position = DriveArray::default();
        position[Axis::Y] = 4.0;
        let mut mv = PendingMove::hold(&position, 1200.0);
        mv.set(Axis::X, 10.0);
        assert!(mv.is_active(Axis::X));
        assert!(!mv.is_active(Axis::Y));
        assert_eq!(mv.target[Axis::Y], 4.0);
        assert_eq!(mv.active_drives().count(), 1);
    }
}
