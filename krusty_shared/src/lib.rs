// krusty_shared: drive indexing, move staging and the service traits shared by host and simulator

pub mod axis;
pub mod bed;
pub mod moves;
pub mod services;

pub use axis::{AXES, Axis, Drive, DriveArray, DriveError, MAX_DRIVES, MAX_EXTRUDERS};
pub use bed::{BedEquation, BedError, ProbePoint};
pub use moves::{MoveFlags, MoveSlot, PendingMove, SlotOccupied};
pub use services::{
    Clock, FileError, FileHandle, FileStore, HeaterSubsystem, MotionSubsystem, NetworkSource, OpenMode,
    Peripherals, SerialLine,
};
