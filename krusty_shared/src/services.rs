// Service interfaces for everything the G-code dispatcher does not own.
//
// All calls are non-blocking: the dispatcher polls these once per tick.

use std::time::Duration;
use thiserror::Error;

use crate::axis::{Axis, DriveArray};
use crate::bed::BedEquation;

pub trait MotionSubsystem {
    /// True once every pulled move has been executed.
    fn all_moves_finished(&self) -> bool;
    fn is_probe_triggered(&self) -> bool;
    /// Whether the axis endstop stopped the most recent move.
    fn endstop_triggered(&self, axis: Axis) -> bool;
    fn current_position(&self) -> DriveArray<f64>;
    fn set_position(&mut self, position: &DriveArray<f64>);
    fn set_bed_equation(&mut self, equation: BedEquation);
    fn disable_drives(&mut self);
}

pub trait HeaterSubsystem {
    fn set_target(&mut self, heater: usize, temperature: f64);
    fn is_at_temperature(&self, heater: usize) -> bool;
    fn temperature(&self, heater: usize) -> f64;
    /// A heater that has faulted stays faulted until reset.
    fn is_faulted(&self, heater: usize) -> bool;
    fn reset_fault(&mut self, heater: usize);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

#[derive(Debug, Error)]
pub enum FileError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("stale file handle {0:?}")]
    BadHandle(FileHandle),
    #[error("file handle {0:?} not open for {1:?}")]
    WrongMode(FileHandle, OpenMode),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait FileStore {
    fn open(&mut self, path: &str, mode: OpenMode) -> Result<FileHandle, FileError>;
    /// Next line without its terminator, `None` at end of file.
    fn read_line(&mut self, handle: FileHandle) -> Result<Option<Vec<u8>>, FileError>;
    fn write(&mut self, handle: FileHandle, bytes: &[u8]) -> Result<(), FileError>;
    /// 0.0 ..= 1.0
    fn fraction_read(&self, handle: FileHandle) -> f64;
    fn close(&mut self, handle: FileHandle);
    fn delete(&mut self, path: &str) -> bool;
}

/// Line-oriented origin (web front end).
pub trait NetworkSource {
    fn has_pending(&self) -> bool;
    fn next_line(&mut self) -> Option<Vec<u8>>;
    fn reply(&mut self, line: &str);
}

/// Byte-oriented origin (USB serial).
pub trait SerialLine {
    fn byte_available(&self) -> bool;
    fn read_byte(&mut self) -> Option<u8>;
    fn write_line(&mut self, line: &str);
}

pub trait Clock {
    /// Monotonic time since an arbitrary origin.
    fn now(&self) -> Duration;
}

/// Borrowed collaborators handed to one dispatcher tick.
pub struct Peripherals<'a> {
    pub motion: &'a mut dyn MotionSubsystem,
    pub heaters: &'a mut dyn HeaterSubsystem,
    pub files: &'a mut dyn FileStore,
    pub network: &'a mut dyn NetworkSource,
    pub serial: &'a mut dyn SerialLine,
    pub clock: &'a dyn Clock,
}

impl Peripherals<'_> {
    /// No staged-but-unexecuted moves on the motion side.
    pub fn motion_idle(&self) -> bool {
        self.motion.all_moves_finished()
    }
}
