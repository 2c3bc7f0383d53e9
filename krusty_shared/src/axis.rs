// Axis and drive indexing shared by the dispatcher and every motion backend.
//
// Drives 0..AXES are the cartesian axes, the rest are extruders. Arrays over
// drives are fixed size and only indexable by a validated `Drive`.

use std::fmt;
use std::ops::{Index, IndexMut};
use thiserror::Error;

pub const AXES: usize = 3;
pub const MAX_EXTRUDERS: usize = 5;
pub const MAX_DRIVES: usize = AXES + MAX_EXTRUDERS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    /// Homing and reporting order.
    pub const ALL: [Axis; AXES] = [Axis::X, Axis::Y, Axis::Z];

    pub fn letter(self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
        }
    }

    pub fn from_letter(letter: char) -> Option<Axis> {
        match letter.to_ascii_uppercase() {
            'X' => Some(Axis::X),
            'Y' => Some(Axis::Y),
            'Z' => Some(Axis::Z),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DriveError {
    #[error("drive index {0} out of range")]
    OutOfRange(usize),
    #[error("extruder index {0} out of range")]
    ExtruderOutOfRange(usize),
}

/// A drive index checked against `MAX_DRIVES` at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Drive(u8);

impl Drive {
    pub fn new(index: usize) -> Result<Self, DriveError> {
        if index < MAX_DRIVES {
            Ok(Drive(index as u8))
        } else {
            Err(DriveError::OutOfRange(index))
        }
    }

    pub fn axis(axis: Axis) -> Self {
        Drive(axis.index() as u8)
    }

    pub fn extruder(extruder: usize) -> Result<Self, DriveError> {
        if extruder < MAX_EXTRUDERS {
            Ok(Drive((AXES + extruder) as u8))
        } else {
            Err(DriveError::ExtruderOutOfRange(extruder))
        }
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn as_axis(self) -> Option<Axis> {
        Axis::ALL.get(self.index()).copied()
    }

    /// Extruder number for drives past the axes.
    pub fn as_extruder(self) -> Option<usize> {
        self.index().checked_sub(AXES)
    }

    pub fn all() -> impl Iterator<Item = Drive> {
        (0..MAX_DRIVES as u8).map(Drive)
    }
}

impl From<Axis> for Drive {
    fn from(axis: Axis) -> Self {
        Drive::axis(axis)
    }
}

impl fmt::Display for Drive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.as_axis(), self.as_extruder()) {
            (Some(axis), _) => write!(f, "{axis}"),
            (None, Some(e)) => write!(f, "E{e}"),
            (None, None) => write!(f, "drive{}", self.0),
        }
    }
}

/// One value per drive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriveArray<T>([T; MAX_DRIVES]);

impl<T: Copy + Default> Default for DriveArray<T> {
    fn default() -> Self {
        DriveArray([T::default(); MAX_DRIVES])
    }
}

impl<T> DriveArray<T> {
    pub fn from_array(values: [T; MAX_DRIVES]) -> Self {
        DriveArray(values)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Drive, &T)> {
        self.0.iter().enumerate().map(|(i, v)| (Drive(i as u8), v))
    }

    pub fn as_slice(&self) -> &[T] {
        &self.0
    }

    /// The axis portion of the array.
    pub fn axes(&self) -> &[T] {
        &self.0[..AXES]
    }
}

impl<T> Index<Drive> for DriveArray<T> {
    type Output = T;

    fn index(&self, drive: Drive) -> &T {
        &self.0[drive.index()]
    }
}

impl<T> IndexMut<Drive> for DriveArray<T> {
    fn index_mut(&mut self, drive: Drive) -> &mut T {
        &mut self.0[drive.index()]
    }
}

impl<T> Index<Axis> for DriveArray<T> {
    type Output = T;

    fn index(&self, axis: Axis) -> &T {
        &self.0[axis.index()]
    }
}

impl<T> IndexMut<Axis> for DriveArray<T> {
    fn index_mut(&mut self, axis: Axis) -> &mut T {
        &mut self.0[axis.index()]
    }
}
