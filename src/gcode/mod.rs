//! G-code command buffers and the single-tick dispatcher.
//!
//! Bytes from each origin are assembled by a [`CommandBuffer`]; the
//! [`Dispatcher`] arbitrates between them, runs immediate commands, and
//! advances the one active [`Procedure`] per call to [`Dispatcher::spin`].

pub mod buffer;
pub mod dispatcher;
pub mod error;
mod handlers;
pub mod machine;
pub mod procedure;
pub mod source;
pub mod stack;
pub mod tool;

pub use buffer::{CaptureMode, CommandBuffer, CommandWord, GCODE_LENGTH, LineStatus, checksum};
pub use dispatcher::{Dispatcher, Reply};
pub use error::{GCodeError, ParseError, ProcedureFault};
pub use machine::{AxisLimits, MachineState};
pub use procedure::Procedure;
pub use source::{SourceId, SourceSet, arbitration_order};
pub use stack::{FrameKind, ModalState, ModalStateStack, STACK_DEPTH, StackError};
pub use tool::{Tool, ToolError, ToolTable};
