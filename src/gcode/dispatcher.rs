//! The spin-tick dispatcher.
//!
//! [`Dispatcher::spin`] is called repeatedly by the host. Each call does one
//! bounded unit of work: advance the active procedure, or dispatch one ready
//! line, or pull input from the origins and dispatch the first line that
//! completes. It never blocks and never recurses into itself.

use std::fmt;

use krusty_shared::{FileError, FileHandle, MoveSlot, OpenMode, Peripherals};

use crate::config::{Config, ConfigError};
use crate::print_job::{PrintJob, PrintStatus};

use super::buffer::{CaptureMode, CommandBuffer, CommandWord, LineStatus};
use super::error::{GCodeError, ParseError, ProcedureFault};
use super::machine::MachineState;
use super::procedure::{Procedure, Step};
use super::source::{SourceId, SourceSet, arbitration_order};
use super::stack::{FrameKind, ModalStateStack};

/// Serial bytes consumed per tick at most.
const SERIAL_BYTES_PER_TICK: usize = 64;

/// What a handler did with its line.
#[derive(Debug)]
pub(super) enum Outcome {
    /// Finished; reply `ok` with optional text.
    Done(Option<String>),
    /// Finished without a reply (raw capture chunks).
    Quiet,
    /// Ask the host to resend a line.
    Resend(i64),
    /// Continue as a procedure on the following ticks.
    Started(Procedure),
    /// Completed when the macro it opened reaches end of file.
    AwaitMacro,
}

/// One reply line to an interactive source.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok(Option<String>),
    Error(String),
    Resend(i64),
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok(None) => f.write_str("ok"),
            Reply::Ok(Some(text)) => write!(f, "ok {}", text),
            Reply::Error(text) => write!(f, "Error: {}", text),
            Reply::Resend(line) => write!(f, "rs {}", line),
        }
    }
}

/// File handles for printing and capture.
#[derive(Debug, Default)]
pub(super) struct PrintFiles {
    /// Selected by M23, or paused by M25.
    pub to_print: Option<FileHandle>,
    pub printing: Option<FileHandle>,
    /// Target of M28 or M560 capture.
    pub writing: Option<FileHandle>,
    pub job: Option<PrintJob>,
}

pub struct Dispatcher {
    pub(super) config: Config,
    pub(super) sources: SourceSet,
    pub(super) stack: ModalStateStack,
    pub(super) machine: MachineState,
    pub(super) slot: MoveSlot,
    pub(super) procedure: Procedure,
    pub(super) owner: Option<SourceId>,
    pub(super) macro_file: Option<FileHandle>,
    pub(super) print: PrintFiles,
}

impl Dispatcher {
    /// `slot` must be the one the motion subsystem pulls from.
    pub fn new(config: Config, slot: MoveSlot) -> Result<Self, ConfigError> {
        config.validate()?;
        let machine = MachineState::new(&config).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(Dispatcher {
            config,
            sources: SourceSet::new(),
            stack: ModalStateStack::new(),
            machine,
            slot,
            procedure: Procedure::Idle,
            owner: None,
            macro_file: None,
            print: PrintFiles::default(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn machine(&self) -> &MachineState {
        &self.machine
    }

    pub fn procedure(&self) -> &Procedure {
        &self.procedure
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.depth()
    }

    pub fn buffer(&self, id: SourceId) -> &CommandBuffer {
        self.sources.get(id)
    }

    pub fn macro_running(&self) -> bool {
        self.macro_file.is_some()
    }

    pub fn is_printing(&self) -> bool {
        self.print.printing.is_some()
    }

    pub fn print_job(&self) -> Option<&PrintJob> {
        self.print.job.as_ref()
    }

    /// Nothing running, queued or half-dispatched.
    pub fn is_idle(&self) -> bool {
        self.procedure.is_idle()
            && self.macro_file.is_none()
            && self.slot.is_empty()
            && SourceId::ALL.iter().all(|id| !self.sources.get(*id).is_ready())
    }

    pub(super) fn motion_idle(&self, io: &Peripherals<'_>) -> bool {
        self.slot.is_empty() && io.motion_idle()
    }

    /// Adopts the motion side's idea of where the drives are.
    pub(super) fn sync_position(&mut self, io: &Peripherals<'_>) {
        self.machine.position = io.motion.current_position();
    }

    /// Drops an unpulled move. The planned position falls back to the
    /// motion side's once nothing else is in flight.
    pub(super) fn discard_staged_move(&mut self, io: &Peripherals<'_>) {
        if self.slot.clear().is_some() && io.motion_idle() {
            self.sync_position(io);
        }
    }

    /// Runs the configuration macro. Nothing waits for it to finish.
    pub fn run_configuration(&mut self, io: &mut Peripherals<'_>) -> Result<(), GCodeError> {
        let path = self.config.files.macro_file(&self.config.files.config_macro);
        tracing::info!(%path, "running configuration macro");
        self.open_macro(&path, None, io)
    }

    /// Selects a file and starts printing it, as M23 followed by M24.
    pub fn queue_file_to_print(&mut self, name: &str, io: &mut Peripherals<'_>) -> Result<(), GCodeError> {
        self.select_file(name, io)?;
        self.start_print()?;
        Ok(())
    }

    pub fn fraction_printed(&self, io: &Peripherals<'_>) -> Option<f64> {
        self.print.printing.or(self.print.to_print).map(|h| io.files.fraction_read(h))
    }

    /// One cooperative tick.
    pub fn spin(&mut self, io: &mut Peripherals<'_>) {
        self.poll_heater_faults(io);
        if !self.procedure.is_idle() {
            if !self.poll_emergency(io) {
                self.advance_procedure(io);
            }
            return;
        }
        let order = arbitration_order(self.macro_file.is_some());
        if let Some(id) = self.sources.next_ready(order) {
            self.dispatch(id, io);
            return;
        }
        for &id in order {
            if self.fill(id, io) {
                self.dispatch(id, io);
                return;
            }
        }
    }

    fn advance_procedure(&mut self, io: &mut Peripherals<'_>) {
        let procedure = std::mem::replace(&mut self.procedure, Procedure::Idle);
        match self.advance(procedure, io) {
            Step::Continue(next) => self.procedure = next,
            Step::Done(text) => {
                if let Some(owner) = self.owner.take() {
                    self.complete(owner, Reply::Ok(text), io);
                }
            }
            Step::Fault(fault) => self.abort(fault, io),
        }
    }

    /// Clears the procedure and any staged move, then reports to the owner.
    pub(super) fn abort(&mut self, fault: ProcedureFault, io: &mut Peripherals<'_>) {
        tracing::error!(%fault, "procedure aborted");
        self.procedure = Procedure::Idle;
        self.discard_staged_move(io);
        if let Some(owner) = self.owner.take() {
            self.complete(owner, Reply::Error(GCodeError::from(fault).to_string()), io);
        }
    }

    /// Marks the source's line executed and sends its reply.
    fn complete(&mut self, id: SourceId, reply: Reply, io: &mut Peripherals<'_>) {
        self.sources.get_mut(id).mark_executed(true);
        self.send_reply(id, reply, io);
    }

    pub(super) fn send_reply(&mut self, id: SourceId, reply: Reply, io: &mut Peripherals<'_>) {
        let line = reply.to_string();
        match id {
            SourceId::Network => io.network.reply(&line),
            SourceId::Serial => io.serial.write_line(&line),
            SourceId::Macro | SourceId::File => match reply {
                Reply::Ok(Some(text)) => tracing::debug!(source = %id, "{}", text),
                Reply::Ok(None) => {}
                _ => tracing::warn!(source = %id, "{}", line),
            },
        }
    }

    /// Pulls input for one source. True when a line completed.
    fn fill(&mut self, id: SourceId, io: &mut Peripherals<'_>) -> bool {
        if !self.sources.get(id).accepts_input() {
            return false;
        }
        // Lines left over from an earlier multi-line chunk come first.
        if self.sources.get_mut(id).feed_pending() {
            return true;
        }
        match id {
            SourceId::Macro => {
                let Some(handle) = self.macro_file else {
                    return false;
                };
                match io.files.read_line(handle) {
                    Ok(Some(line)) => self.sources.get_mut(id).append_line(&line),
                    Ok(None) => {
                        self.finish_macro(None, io);
                        false
                    }
                    Err(e) => {
                        self.finish_macro(Some(e), io);
                        false
                    }
                }
            }
            SourceId::Network => {
                if !io.network.has_pending() {
                    return false;
                }
                match io.network.next_line() {
                    Some(line) => self.sources.get_mut(id).append_line(&line),
                    None => false,
                }
            }
            SourceId::Serial => {
                let buffer = self.sources.get_mut(id);
                for _ in 0..SERIAL_BYTES_PER_TICK {
                    if !io.serial.byte_available() {
                        break;
                    }
                    match io.serial.read_byte() {
                        Some(byte) if buffer.append(byte) => return true,
                        Some(_) => {}
                        None => break,
                    }
                }
                false
            }
            SourceId::File => {
                let Some(handle) = self.print.printing else {
                    return false;
                };
                match io.files.read_line(handle) {
                    Ok(Some(line)) => self.sources.get_mut(id).append_line(&line),
                    Ok(None) => {
                        self.finish_print(PrintStatus::Completed, io);
                        false
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "print file read failed");
                        self.finish_print(PrintStatus::Error, io);
                        false
                    }
                }
            }
        }
    }

    /// Disables tools whose heaters have failed. M562 re-enables them.
    fn poll_heater_faults(&mut self, io: &Peripherals<'_>) {
        for heater in 0..self.config.machine.heaters {
            if !io.heaters.is_faulted(heater) {
                continue;
            }
            for tool in self.machine.tools.flag_heater_fault(heater) {
                tracing::error!(tool, heater, "heater fault, tool disabled");
            }
        }
    }

    /// Re-enables tools disabled by a fault on `heater` (M562).
    pub(super) fn clear_heater_fault(&mut self, heater: usize, io: &mut Peripherals<'_>) {
        io.heaters.reset_fault(heater);
        for tool in self.machine.tools.clear_heater_fault(heater) {
            tracing::info!(tool, heater, "heater fault cleared");
        }
    }

    /// Lets M112 through while a procedure holds the dispatcher.
    fn poll_emergency(&mut self, io: &mut Peripherals<'_>) -> bool {
        for id in [SourceId::Network, SourceId::Serial] {
            if !self.sources.get(id).is_ready() {
                self.fill(id, io);
            }
            let buffer = self.sources.get(id);
            let is_stop = buffer.is_ready()
                && buffer.status() == LineStatus::Ready
                && *buffer.capture() == CaptureMode::Off
                && buffer.command() == Ok(CommandWord { letter: 'M', code: Some(112) });
            if is_stop {
                self.emergency_stop(Some(id), io);
                self.complete(id, Reply::Ok(Some("Emergency stop".to_string())), io);
                return true;
            }
        }
        false
    }

    fn dispatch(&mut self, id: SourceId, io: &mut Peripherals<'_>) {
        let status = self.sources.get(id).status();
        let saving = *self.sources.get(id).capture() == CaptureMode::GCodeFile;
        let result = match status {
            LineStatus::Filling => return,
            LineStatus::Resend { line } if id.is_interactive() => Ok(Outcome::Resend(line)),
            LineStatus::Resend { line } => Err(GCodeError::Checksum { line }),
            LineStatus::Overflow => Err(ParseError::Overflow.into()),
            LineStatus::Captured { last } => self.write_captured(id, last, io),
            LineStatus::Ready if saving => self.write_gcode_line(id, io),
            LineStatus::Ready => {
                let line = self.sources.get(id).text().into_owned();
                if self.machine.debug {
                    tracing::info!(source = %id, %line, "dispatch");
                } else {
                    tracing::debug!(source = %id, %line, "dispatch");
                }
                let mut buffer = std::mem::take(self.sources.get_mut(id));
                let result = self.act_on_code(id, &mut buffer, io);
                *self.sources.get_mut(id) = buffer;
                result
            }
        };
        match result {
            Ok(Outcome::Done(text)) => self.complete(id, Reply::Ok(text), io),
            Ok(Outcome::Quiet) => self.sources.get_mut(id).mark_executed(true),
            Ok(Outcome::Resend(line)) => self.complete(id, Reply::Resend(line), io),
            Ok(Outcome::Started(procedure)) => {
                tracing::debug!(source = %id, procedure = procedure.name(), "procedure started");
                self.procedure = procedure;
                self.owner = Some(id);
            }
            Ok(Outcome::AwaitMacro) => {}
            Err(e) => {
                if e.is_fault() {
                    self.discard_staged_move(io);
                }
                self.complete(id, Reply::Error(e.to_string()), io);
            }
        }
    }

    /// Opens a macro, saving modal state. `caller` is completed at end of file.
    pub(super) fn open_macro(&mut self, path: &str, caller: Option<SourceId>, io: &mut Peripherals<'_>) -> Result<(), GCodeError> {
        let frame = self.machine.modal(self.macro_file, FrameKind::Macro { caller });
        self.stack.push(frame)?;
        match io.files.open(path, OpenMode::Read) {
            Ok(handle) => {
                self.macro_file = Some(handle);
                self.sources.get_mut(SourceId::Macro).rearm();
                tracing::info!(%path, depth = self.stack.macro_depth(), "macro started");
                Ok(())
            }
            Err(e) => {
                let _ = self.stack.pop();
                Err(e.into())
            }
        }
    }

    /// End of a macro file: restore the state saved when it opened.
    fn finish_macro(&mut self, error: Option<FileError>, io: &mut Peripherals<'_>) {
        if let Some(handle) = self.macro_file.take() {
            io.files.close(handle);
        }
        self.sources.get_mut(SourceId::Macro).rearm();
        loop {
            let frame = match self.stack.pop() {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(error = %e, "macro finished without a saved state");
                    return;
                }
            };
            let FrameKind::Macro { caller } = frame.kind else {
                tracing::warn!("discarding M120 state left by a macro");
                continue;
            };
            self.machine.restore(&frame);
            self.macro_file = frame.file;
            tracing::info!(depth = self.stack.macro_depth(), "macro finished");
            if let Some(caller) = caller {
                let reply = match &error {
                    None => Reply::Ok(None),
                    Some(e) => Reply::Error(e.to_string()),
                };
                self.complete(caller, reply, io);
            } else if let Some(e) = &error {
                tracing::warn!(error = %e, "macro aborted");
            }
            return;
        }
    }

    fn finish_print(&mut self, status: PrintStatus, io: &mut Peripherals<'_>) {
        if let Some(handle) = self.print.printing.take() {
            io.files.close(handle);
        }
        if let Some(job) = self.print.job.as_mut() {
            job.finish(status);
        }
    }

    pub(super) fn select_file(&mut self, name: &str, io: &mut Peripherals<'_>) -> Result<(), GCodeError> {
        let path = self.config.files.gcode(name);
        let handle = io.files.open(&path, OpenMode::Read)?;
        if let Some(old) = self.print.to_print.replace(handle) {
            io.files.close(old);
        }
        self.print.job = Some(PrintJob::new(&path));
        tracing::info!(%path, "file selected for printing");
        Ok(())
    }

    pub(super) fn start_print(&mut self) -> Result<(), GCodeError> {
        if self.print.printing.is_some() {
            return Ok(());
        }
        let handle = self
            .print
            .to_print
            .take()
            .ok_or_else(|| FileError::NotFound("no file selected for printing".to_string()))?;
        self.print.printing = Some(handle);
        if let Some(job) = self.print.job.as_mut() {
            job.start();
        }
        Ok(())
    }

    /// Stops printing, keeping the file open for M24.
    pub(super) fn pause_print(&mut self, io: &Peripherals<'_>) -> Option<f64> {
        let handle = self.print.printing.take()?;
        self.print.to_print = Some(handle);
        let fraction = io.files.fraction_read(handle);
        if let Some(job) = self.print.job.as_mut() {
            job.progress = fraction;
            job.pause();
        }
        Some(fraction)
    }

    /// Ends a print early (M0 / M1 / M112).
    pub(super) fn cancel_print(&mut self, io: &mut Peripherals<'_>) {
        let handles = [self.print.printing.take(), self.print.to_print.take()];
        if handles.iter().any(Option::is_some) {
            if let Some(job) = self.print.job.as_mut() {
                job.finish(PrintStatus::Cancelled);
            }
        }
        for handle in handles.into_iter().flatten() {
            io.files.close(handle);
        }
    }

    fn write_gcode_line(&mut self, id: SourceId, io: &mut Peripherals<'_>) -> Result<Outcome, GCodeError> {
        let buffer = self.sources.get(id);
        let end = buffer.command() == Ok(CommandWord { letter: 'M', code: Some(29) });
        let mut line = buffer.as_bytes().to_vec();
        let Some(handle) = self.print.writing else {
            self.sources.get_mut(id).set_capture(CaptureMode::Off);
            return Err(FileError::NotFound("no file open for writing".to_string()).into());
        };
        if end {
            self.end_capture(id, handle, io);
            return Ok(Outcome::Done(Some("Done saving file.".to_string())));
        }
        line.push(b'\n');
        if let Err(e) = io.files.write(handle, &line) {
            self.end_capture(id, handle, io);
            return Err(e.into());
        }
        Ok(Outcome::Done(None))
    }

    fn write_captured(&mut self, id: SourceId, last: bool, io: &mut Peripherals<'_>) -> Result<Outcome, GCodeError> {
        let Some(handle) = self.print.writing else {
            self.sources.get_mut(id).set_capture(CaptureMode::Off);
            return Err(FileError::NotFound("no file open for writing".to_string()).into());
        };
        let chunk = self.sources.get(id).as_bytes().to_vec();
        if let Err(e) = io.files.write(handle, &chunk) {
            self.end_capture(id, handle, io);
            return Err(e.into());
        }
        if last {
            self.end_capture(id, handle, io);
            return Ok(Outcome::Done(Some("Done saving file.".to_string())));
        }
        Ok(Outcome::Quiet)
    }

    fn end_capture(&mut self, id: SourceId, handle: FileHandle, io: &mut Peripherals<'_>) {
        io.files.close(handle);
        self.print.writing = None;
        self.sources.get_mut(id).set_capture(CaptureMode::Off);
        tracing::info!(source = %id, "file capture finished");
    }

    /// Stops everything: procedure, staged move, heaters, drives, macros, prints.
    pub fn emergency_stop(&mut self, except: Option<SourceId>, io: &mut Peripherals<'_>) {
        tracing::error!("emergency stop");
        if !self.procedure.is_idle() {
            self.abort(ProcedureFault::EmergencyStop, io);
        }
        self.discard_staged_move(io);
        for heater in 0..self.config.machine.heaters {
            io.heaters.set_target(heater, 0.0);
        }
        io.motion.disable_drives();
        self.machine.homed = [false; krusty_shared::AXES];

        if let Some(handle) = self.macro_file.take() {
            io.files.close(handle);
        }
        while let Ok(frame) = self.stack.pop() {
            if let Some(handle) = frame.file {
                io.files.close(handle);
            }
            if let FrameKind::Macro { caller: Some(caller) } = frame.kind {
                self.complete(caller, Reply::Error(ProcedureFault::EmergencyStop.to_string()), io);
            }
        }
        self.cancel_print(io);
        if let Some(handle) = self.print.writing.take() {
            io.files.close(handle);
        }
        for id in SourceId::ALL {
            if Some(id) != except {
                let buffer = self.sources.get_mut(id);
                buffer.rearm();
                buffer.set_capture(CaptureMode::Off);
            }
        }
    }

    pub fn diagnostics(&self) -> String {
        let sources = SourceId::ALL
            .iter()
            .map(|id| {
                let b = self.sources.get(*id);
                format!("{}={}", id, if b.is_ready() { "ready" } else if b.is_executed() { "idle" } else { "filling" })
            })
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "procedure: {}; macro depth: {}; stack depth: {}; move slot: {}; printing: {}; sources: {}",
            self.procedure.name(),
            self.stack.macro_depth(),
            self.stack.depth(),
            if self.slot.is_empty() { "empty" } else { "move staged" },
            self.is_printing(),
            sources
        )
    }
}
