// src/gcode/error.rs - error taxonomy for command parsing and execution
use thiserror::Error;

use krusty_shared::{Axis, BedError, FileError};

use super::stack::StackError;
use super::tool::ToolError;

/// Field extraction failures. A missing letter is not a malformed value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("{0} parameter not found")]
    MissingField(char),
    #[error("malformed value for {letter}: '{value}'")]
    Malformed { letter: char, value: String },
    #[error("too many values for {letter}, at most {capacity}")]
    TooManyValues { letter: char, capacity: usize },
    #[error("expected {expected} values for {letter}, got {found}")]
    WrongCount { letter: char, expected: usize, found: usize },
    #[error("string expected")]
    StringExpected,
    #[error("no G, M or T command on line")]
    NoCommand,
    #[error("G-code buffer length overflow")]
    Overflow,
}

/// Reasons a multi-tick procedure is abandoned.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProcedureFault {
    #[error("{0} endstop not reached while homing")]
    EndstopNotReached(Axis),
    #[error("homing {0} timed out")]
    HomingTimeout(Axis),
    #[error("probe did not trigger within its travel")]
    ProbeNotTriggered,
    #[error("probing timed out")]
    ProbeTimeout,
    #[error("invalid tool number {0}")]
    InvalidTool(i64),
    #[error("heaters did not reach temperature in time")]
    HeaterTimeout,
    #[error("motion did not settle in time")]
    MotionTimeout,
    #[error("emergency stop")]
    EmergencyStop,
    #[error(transparent)]
    Stack(#[from] StackError),
    #[error("bed equation: {0}")]
    Bed(#[from] BedError),
}

#[derive(Debug, Error)]
pub enum GCodeError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("checksum mismatch, resend line {line}")]
    Checksum { line: i64 },
    #[error("{axis} target {target:.3} outside travel {min:.3}..{max:.3}")]
    Limit { axis: Axis, target: f64, min: f64, max: f64 },
    #[error(transparent)]
    Procedure(#[from] ProcedureFault),
    #[error(transparent)]
    Resource(#[from] FileError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error("unsupported command {0}")]
    Unsupported(String),
    #[error("{0} cannot run while another command is in progress")]
    Busy(String),
    #[error("M29 while no file is being written from this source")]
    NotWriting,
}

impl GCodeError {
    /// Faults drop any staged move. Limit violations count as faults.
    pub fn is_fault(&self) -> bool {
        matches!(self, GCodeError::Limit { .. } | GCodeError::Procedure(_))
    }
}

impl From<StackError> for GCodeError {
    fn from(e: StackError) -> Self {
        GCodeError::Procedure(ProcedureFault::Stack(e))
    }
}

impl From<BedError> for GCodeError {
    fn from(e: BedError) -> Self {
        GCodeError::Procedure(ProcedureFault::Bed(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_and_stack_errors_are_faults() {
        let limit = GCodeError::Limit { axis: Axis::X, target: 500.0, min: 0.0, max: 200.0 };
        assert!(limit.is_fault());
        assert!(GCodeError::from(StackError::Full).is_fault());
        assert!(GCodeError::from(StackError::Empty).is_fault());
        assert!(GCodeError::from(ProcedureFault::InvalidTool(5)).is_fault());
        assert!(!GCodeError::from(ParseError::MissingField('S')).is_fault());
        assert!(!GCodeError::Busy("M28".to_string()).is_fault());
    }
}
