// src/gcode/handlers.rs - the immediate G, M and T command set
use serde::Serialize;

use krusty_shared::{AXES, Axis, Drive, DriveArray, MAX_EXTRUDERS, OpenMode, Peripherals, PendingMove, ProbePoint, SlotOccupied};

use crate::config::{LimitMode, MAX_PROBE_POINTS};
use crate::print_job::PrintStatus;

use super::buffer::{CaptureMode, CommandBuffer};
use super::dispatcher::{Dispatcher, Outcome};
use super::error::{GCodeError, ParseError, ProcedureFault};
use super::machine::{INCH_TO_MM, MachineState};
use super::procedure::{Dwell, HeatWait, Homing, HomingStep, ProbeMode, Probing, Procedure, ToolChange, ToolChangeStep};
use super::source::SourceId;
use super::stack::{FrameKind, StackError};
use super::tool::{Tool, ToolError};

/// `G30 P.. Z..` at or below this means "probe for the height".
const PROBE_FOR_HEIGHT: f64 = -9999.0;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    /// I idle, B busy, P printing, S paused
    status: char,
    coords: CoordsReport,
    current_tool: Option<i64>,
    heaters: Vec<f64>,
    feedrate: f64,
    fraction_printed: Option<f64>,
    job: Option<JobReport>,
    bed_equation: Option<[f64; 3]>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CoordsReport {
    axes_homed: [bool; AXES],
    xyz: [f64; AXES],
    extr: Vec<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobReport {
    id: String,
    file: String,
    status: String,
    started_at: Option<String>,
}

fn non_negative(letter: char, values: Vec<i64>) -> Result<Vec<usize>, ParseError> {
    values
        .into_iter()
        .map(|v| usize::try_from(v).map_err(|_| ParseError::Malformed { letter, value: v.to_string() }))
        .collect()
}

impl Dispatcher {
    pub(super) fn act_on_code(&mut self, id: SourceId, gb: &mut CommandBuffer, io: &mut Peripherals<'_>) -> Result<Outcome, GCodeError> {
        let command = gb.command()?;
        match (command.letter, command.code) {
            ('G', Some(code)) => self.handle_gcode(code, gb, io),
            ('M', Some(code)) => self.handle_mcode(code, id, gb, io),
            ('T', code) => self.handle_tcode(code, io),
            _ => Err(GCodeError::Unsupported(command.to_string())),
        }
    }

    fn handle_gcode(&mut self, code: i64, gb: &CommandBuffer, io: &mut Peripherals<'_>) -> Result<Outcome, GCodeError> {
        match code {
            0 | 1 => self.setup_move(gb, io),
            4 => {
                let duration = if gb.has_field('P') {
                    gb.float_field('P')? / 1000.0
                } else if gb.has_field('S') {
                    gb.float_field('S')?
                } else {
                    0.0
                };
                if duration <= 0.0 {
                    return Ok(Outcome::Done(None));
                }
                Ok(Outcome::Started(Procedure::Dwell(Dwell {
                    duration: std::time::Duration::from_secs_f64(duration),
                    started: None,
                })))
            }
            10 => self.set_tool_parameters(gb, io),
            20 => {
                self.machine.distance_scale = INCH_TO_MM;
                Ok(Outcome::Done(None))
            }
            21 => {
                self.machine.distance_scale = 1.0;
                Ok(Outcome::Done(None))
            }
            28 => {
                let mut axes = Axis::ALL.map(|a| gb.has_field(a.letter()));
                if !axes.contains(&true) {
                    axes = [true; AXES];
                }
                for axis in Axis::ALL {
                    if axes[axis.index()] {
                        self.machine.homed[axis.index()] = false;
                    }
                }
                Ok(Outcome::Started(Procedure::Homing(Homing { axes, step: HomingStep::Settle, started: io.clock.now() })))
            }
            30 => self.single_probe(gb, io),
            31 => {
                if gb.has_field('Z') {
                    self.machine.probe_trigger_height = gb.float_field('Z')?;
                    return Ok(Outcome::Done(None));
                }
                Ok(Outcome::Done(Some(format!("Z probe trigger height {:.2}", self.machine.probe_trigger_height))))
            }
            32 => {
                let points = self.config.probe.points.clone();
                Ok(Outcome::Started(Procedure::Probing(Probing::new(ProbeMode::Series { points }, io.clock.now()))))
            }
            90 => {
                self.machine.axes_relative = false;
                Ok(Outcome::Done(None))
            }
            91 => {
                self.machine.axes_relative = true;
                Ok(Outcome::Done(None))
            }
            92 => self.set_positions(gb, io),
            _ => Err(GCodeError::Unsupported(format!("G{}", code))),
        }
    }

    fn handle_mcode(&mut self, code: i64, id: SourceId, gb: &mut CommandBuffer, io: &mut Peripherals<'_>) -> Result<Outcome, GCodeError> {
        match code {
            0 | 1 => {
                self.cancel_print(io);
                if let Some(number) = self.machine.tools.current_number() {
                    if let Some(tool) = self.machine.tools.get_mut(number) {
                        tool.standby(io.heaters);
                    }
                }
                io.motion.disable_drives();
                Ok(Outcome::Done(None))
            }
            18 | 84 => {
                io.motion.disable_drives();
                self.machine.homed = [false; AXES];
                Ok(Outcome::Done(None))
            }
            23 => {
                let name = gb.unkeyed_string()?;
                self.select_file(name, io)?;
                Ok(Outcome::Done(Some(format!("File {} selected", name))))
            }
            24 => {
                self.start_print()?;
                Ok(Outcome::Done(None))
            }
            25 => Ok(Outcome::Done(self.pause_print(io).map(|f| format!("Print paused at {:.1}%", f * 100.0)))),
            27 => Ok(Outcome::Done(Some(match self.fraction_printed(io) {
                Some(f) if self.is_printing() => format!("SD printing byte {:.1}%", f * 100.0),
                Some(f) => format!("Print paused at {:.1}%", f * 100.0),
                None => "Not SD printing.".to_string(),
            }))),
            28 => {
                if self.print.writing.is_some() {
                    return Err(GCodeError::Busy("M28".to_string()));
                }
                let name = gb.unkeyed_string()?.to_string();
                let handle = io.files.open(&self.config.files.gcode(&name), OpenMode::Write)?;
                self.print.writing = Some(handle);
                gb.set_capture(CaptureMode::GCodeFile);
                tracing::info!(source = %id, file = %name, "capturing G-code to file");
                Ok(Outcome::Done(Some(format!("Writing to file: {}", name))))
            }
            // A capturing buffer ends its upload before reaching here.
            29 => Err(GCodeError::NotWriting),
            30 => {
                let path = self.config.files.gcode(gb.unkeyed_string()?);
                if !io.files.delete(&path) {
                    return Err(krusty_shared::FileError::NotFound(path).into());
                }
                Ok(Outcome::Done(None))
            }
            82 => {
                self.machine.drives_relative = false;
                Ok(Outcome::Done(None))
            }
            83 => {
                self.machine.drives_relative = true;
                Ok(Outcome::Done(None))
            }
            98 => {
                let path = self.config.files.macro_file(gb.string_field('P')?);
                if id == SourceId::Macro {
                    self.open_macro(&path, None, io)?;
                    Ok(Outcome::Done(None))
                } else {
                    self.open_macro(&path, Some(id), io)?;
                    Ok(Outcome::AwaitMacro)
                }
            }
            104 | 109 => {
                let tool = self.set_tool_temperature(gb, io)?;
                if code == 104 {
                    return Ok(Outcome::Done(None));
                }
                let heaters = self.machine.tools.get(tool).map(|t| t.heaters().to_vec()).unwrap_or_default();
                Ok(self.heat_wait(heaters, io))
            }
            110 => {
                let line = if gb.has_field('N') { gb.long_field('N')? } else { 0 };
                gb.set_last_line_number(line);
                Ok(Outcome::Done(None))
            }
            111 => {
                if gb.has_field('S') {
                    self.machine.debug = gb.long_field('S')? != 0;
                    tracing::info!(debug = self.machine.debug, "debug output");
                    return Ok(Outcome::Done(None));
                }
                Ok(Outcome::Done(Some(format!("Debugging {}", if self.machine.debug { "enabled" } else { "disabled" }))))
            }
            112 => {
                self.emergency_stop(Some(id), io);
                Ok(Outcome::Done(Some("Emergency stop".to_string())))
            }
            114 => {
                let position = io.motion.current_position();
                Ok(Outcome::Done(Some(MachineState::coordinates_report(&position, self.config.machine.extruders))))
            }
            115 => Ok(Outcome::Done(Some(format!(
                "FIRMWARE_NAME: {} FIRMWARE_VERSION: {} MACHINE_NAME: {} EXTRUDER_COUNT: {}",
                self.config.machine.firmware_name,
                env!("CARGO_PKG_VERSION"),
                self.config.machine.name.as_deref().unwrap_or("unnamed"),
                self.config.machine.extruders
            )))),
            116 => {
                let mut heaters: Vec<usize> = self.machine.tools.iter().flat_map(|t| t.heaters().iter().copied()).collect();
                heaters.sort_unstable();
                heaters.dedup();
                Ok(self.heat_wait(heaters, io))
            }
            120 => {
                self.stack.push(self.machine.modal(None, FrameKind::Explicit))?;
                Ok(Outcome::Done(None))
            }
            121 => {
                if let Some(FrameKind::Macro { .. }) = self.stack.peek().map(|f| f.kind) {
                    return Err(StackError::MacroFrame.into());
                }
                let frame = self.stack.pop()?;
                self.machine.restore(&frame);
                Ok(Outcome::Done(None))
            }
            122 => Ok(Outcome::Done(Some(self.diagnostics()))),
            140 | 190 => {
                let temperature = gb.float_field('S')?;
                io.heaters.set_target(0, temperature);
                if code == 140 {
                    return Ok(Outcome::Done(None));
                }
                Ok(self.heat_wait(vec![0], io))
            }
            208 => self.set_axis_limits(gb),
            302 => {
                if gb.has_field('S') {
                    self.machine.hot_enough_to_extrude = gb.float_field('S')?;
                }
                if gb.has_field('P') {
                    self.machine.cold_extrusion = gb.long_field('P')? != 0;
                    tracing::info!(allowed = self.machine.cold_extrusion, "cold extrusion");
                }
                if gb.has_field('P') || gb.has_field('S') {
                    return Ok(Outcome::Done(None));
                }
                Ok(Outcome::Done(Some(format!(
                    "Cold extrusion is {}, minimum extrusion temperature {:.1}C",
                    if self.machine.cold_extrusion { "allowed" } else { "not allowed" },
                    self.machine.hot_enough_to_extrude
                ))))
            }
            408 => Ok(Outcome::Done(Some(self.status_report(io)))),
            560 => {
                if id != SourceId::Serial {
                    return Err(GCodeError::Unsupported(format!("M560 from {}", id)));
                }
                if self.print.writing.is_some() {
                    return Err(GCodeError::Busy("M560".to_string()));
                }
                let handle = io.files.open(&self.config.files.web("reprap.htm"), OpenMode::Write)?;
                self.print.writing = Some(handle);
                gb.set_capture(CaptureMode::RawUntil { marker: b"</html>".to_vec(), matched: 0 });
                tracing::info!("receiving web file");
                Ok(Outcome::Done(None))
            }
            503 => Ok(Outcome::Done(Some(self.configuration_text(io)?))),
            562 => {
                let heater = gb.long_field('P')?;
                let heater = usize::try_from(heater)
                    .ok()
                    .filter(|h| *h < self.config.machine.heaters)
                    .ok_or(ParseError::Malformed { letter: 'P', value: heater.to_string() })?;
                self.clear_heater_fault(heater, io);
                Ok(Outcome::Done(None))
            }
            563 => {
                let number = gb.long_field('P')?;
                let drives = if gb.has_field('D') { non_negative('D', gb.long_array('D', MAX_EXTRUDERS)?)? } else { Vec::new() };
                let heaters = if gb.has_field('H') {
                    non_negative('H', gb.long_array('H', self.config.machine.heaters)?)?
                } else {
                    Vec::new()
                };
                let tool = Tool::new(number, drives, heaters, self.config.machine.extruders, self.config.machine.heaters)?;
                self.machine.tools.add(tool)?;
                Ok(Outcome::Done(None))
            }
            564 => {
                if gb.has_field('S') {
                    self.machine.limit_axes = gb.long_field('S')? != 0;
                    return Ok(Outcome::Done(None));
                }
                Ok(Outcome::Done(Some(format!("Axis limits {}", if self.machine.limit_axes { "enabled" } else { "disabled" }))))
            }
            998 => Ok(Outcome::Resend(gb.long_field('P')?)),
            _ => Err(GCodeError::Unsupported(format!("M{}", code))),
        }
    }

    fn handle_tcode(&mut self, code: Option<i64>, io: &mut Peripherals<'_>) -> Result<Outcome, GCodeError> {
        let current = self.machine.tools.current_number();
        let Some(code) = code else {
            return Ok(Outcome::Done(Some(match current {
                Some(n) => format!("Tool {} is selected", n),
                None => "No tool is selected".to_string(),
            })));
        };
        let to = (code >= 0).then_some(code);
        if let Some(n) = to {
            if !self.machine.tools.contains(n) {
                return Err(ProcedureFault::InvalidTool(n).into());
            }
        }
        if to == current {
            return Ok(Outcome::Done(None));
        }
        Ok(Outcome::Started(Procedure::ToolChange(ToolChange {
            from: current,
            to,
            step: ToolChangeStep::Drain,
            started: io.clock.now(),
        })))
    }

    /// Applies travel limits to an axis target.
    fn check_limits(&self, axis: Axis, target: f64) -> Result<f64, GCodeError> {
        let require_homing = self.config.limits.require_homing;
        if !self.machine.limit_axes || (require_homing && !self.machine.axis_has_been_homed(axis)) {
            return Ok(target);
        }
        let limits = self.machine.limits(axis);
        if (limits.min..=limits.max).contains(&target) {
            return Ok(target);
        }
        match self.machine.limit_mode {
            LimitMode::Clamp => {
                let clamped = target.clamp(limits.min, limits.max);
                tracing::warn!(%axis, target, clamped, "target clamped to axis limits");
                Ok(clamped)
            }
            LimitMode::Reject => Err(GCodeError::Limit { axis, target, min: limits.min, max: limits.max }),
        }
    }

    /// Extruder drives of the current tool paired with the values of `E`.
    fn extruder_values(&self, gb: &CommandBuffer) -> Result<Vec<(Drive, f64)>, GCodeError> {
        let tool = self.machine.tools.current().ok_or(ToolError::NoneSelected)?;
        let values = gb.float_array('E', MAX_EXTRUDERS)?;
        if values.len() != tool.drives().len() {
            return Err(ParseError::WrongCount { letter: 'E', expected: tool.drives().len(), found: values.len() }.into());
        }
        tool.drives()
            .iter()
            .zip(values)
            .map(|(&d, v)| {
                Drive::extruder(d)
                    .map(|drive| (drive, v))
                    .map_err(|_| GCodeError::from(ToolError::BadDrive { tool: tool.number(), drive: d }))
            })
            .collect()
    }

    /// Refuses extruder motion on a faulted tool, or a cold one unless M302 allows it.
    fn check_extrusion(&self, io: &Peripherals<'_>) -> Result<(), GCodeError> {
        let tool = self.machine.tools.current().ok_or(ToolError::NoneSelected)?;
        tool.check_can_drive(&*io.heaters, self.machine.cold_extrusion, self.machine.hot_enough_to_extrude)?;
        Ok(())
    }

    /// G0 / G1
    fn setup_move(&mut self, gb: &CommandBuffer, io: &Peripherals<'_>) -> Result<Outcome, GCodeError> {
        let scale = self.machine.distance_scale;
        let feedrate = if gb.has_field('F') { gb.float_field('F')? * scale } else { self.machine.feedrate };
        let endstop_move = gb.has_field('S') && gb.long_field('S')? == 1;
        let mut mv = PendingMove::hold(&self.machine.position, feedrate);
        mv.flags.check_endstops = endstop_move;

        for axis in Axis::ALL {
            if !gb.has_field(axis.letter()) {
                continue;
            }
            let mut target = gb.float_field(axis.letter())? * scale;
            if self.machine.axes_relative {
                target += self.machine.position[axis];
            }
            if !endstop_move {
                target = self.check_limits(axis, target)?;
            }
            mv.set(axis, target);
        }
        if gb.has_field('E') {
            let mut extruding = false;
            for (drive, value) in self.extruder_values(gb)? {
                let mut target = value * scale;
                if self.machine.drives_relative {
                    target += self.machine.position[drive];
                }
                extruding |= target != self.machine.position[drive];
                mv.set(drive, target);
            }
            if extruding {
                self.check_extrusion(io)?;
            }
        }
        // Only an accepted line changes the modal feedrate.
        self.machine.feedrate = feedrate;
        if mv.is_empty() {
            return Ok(Outcome::Done(None));
        }
        self.machine.position = mv.target;
        match self.slot.stage(mv) {
            Ok(()) => Ok(Outcome::Done(None)),
            Err(SlotOccupied(pending)) => Ok(Outcome::Started(Procedure::StageMove { pending })),
        }
    }

    /// G92
    fn set_positions(&mut self, gb: &CommandBuffer, io: &mut Peripherals<'_>) -> Result<Outcome, GCodeError> {
        let mut target = self.machine.position;
        let mut active = DriveArray::default();
        for axis in Axis::ALL {
            if gb.has_field(axis.letter()) {
                target[axis] = gb.float_field(axis.letter())? * self.machine.distance_scale;
                active[axis] = true;
            }
        }
        if gb.has_field('E') {
            for (drive, value) in self.extruder_values(gb)? {
                target[drive] = value * self.machine.distance_scale;
                active[drive] = true;
            }
        }
        if !active.as_slice().contains(&true) {
            return Ok(Outcome::Done(None));
        }
        if !self.motion_idle(io) {
            return Ok(Outcome::Started(Procedure::SetPosition { target, active }));
        }
        self.sync_position(io);
        self.apply_position(&target, &active, io);
        Ok(Outcome::Done(None))
    }

    /// Overwrites the active drives; a set axis counts as homed.
    pub(super) fn apply_position(&mut self, target: &DriveArray<f64>, active: &DriveArray<bool>, io: &mut Peripherals<'_>) {
        for (drive, &on) in active.iter() {
            if !on {
                continue;
            }
            self.machine.position[drive] = target[drive];
            if let Some(axis) = drive.as_axis() {
                self.machine.homed[axis.index()] = true;
            }
        }
        io.motion.set_position(&self.machine.position);
    }

    /// G30
    fn single_probe(&mut self, gb: &CommandBuffer, io: &mut Peripherals<'_>) -> Result<Outcome, GCodeError> {
        let now = io.clock.now();
        if !gb.has_field('P') {
            return Ok(Outcome::Started(Procedure::Probing(Probing::new(ProbeMode::Here, now))));
        }
        let p = gb.long_field('P')?;
        let index = usize::try_from(p)
            .ok()
            .filter(|i| *i < MAX_PROBE_POINTS)
            .ok_or(ParseError::Malformed { letter: 'P', value: p.to_string() })?;
        let scale = self.machine.distance_scale;
        let x = if gb.has_field('X') { gb.float_field('X')? * scale } else { self.machine.position[Axis::X] };
        let y = if gb.has_field('Y') { gb.float_field('Y')? * scale } else { self.machine.position[Axis::Y] };
        let fit = gb.has_field('S');

        let z = if gb.has_field('Z') { gb.float_field('Z')? } else { PROBE_FOR_HEIGHT };
        if z > PROBE_FOR_HEIGHT {
            self.machine.probe_points[index] = Some(ProbePoint { x, y, z: z * scale });
            if !fit {
                return Ok(Outcome::Done(None));
            }
            let points = self.machine.recorded_probe_points();
            return Ok(Outcome::Done(Some(self.fit_bed(&points, io)?)));
        }
        Ok(Outcome::Started(Procedure::Probing(Probing::new(ProbeMode::AtPoint { index, x, y, fit }, now))))
    }

    /// G10
    fn set_tool_parameters(&mut self, gb: &CommandBuffer, io: &mut Peripherals<'_>) -> Result<Outcome, GCodeError> {
        let number = if gb.has_field('P') {
            gb.long_field('P')?
        } else {
            self.machine.tools.current_number().ok_or(ToolError::NoneSelected)?
        };
        let scale = self.machine.distance_scale;
        let heater_count = self.config.machine.heaters;
        let tool = self.machine.tools.get_mut(number).ok_or(ToolError::Unknown(number))?;
        let mut changed = false;
        for axis in Axis::ALL {
            if gb.has_field(axis.letter()) {
                tool.set_offset(axis.index(), gb.float_field(axis.letter())? * scale);
                changed = true;
            }
        }
        if gb.has_field('R') {
            tool.set_standby_temperatures(&gb.float_array('R', heater_count)?)?;
            changed = true;
        }
        if gb.has_field('S') {
            tool.set_active_temperatures(&gb.float_array('S', heater_count)?)?;
            changed = true;
        }
        if !changed {
            return Ok(Outcome::Done(Some(tool.describe())));
        }
        if tool.is_active() {
            tool.activate(io.heaters);
        }
        Ok(Outcome::Done(None))
    }

    /// M104 / M109: one temperature for every heater of the tool. Returns the tool.
    fn set_tool_temperature(&mut self, gb: &CommandBuffer, io: &mut Peripherals<'_>) -> Result<i64, GCodeError> {
        let temperature = gb.float_field('S')?;
        let number = if gb.has_field('T') {
            gb.long_field('T')?
        } else {
            self.machine.tools.current_number().ok_or(ToolError::NoneSelected)?
        };
        let tool = self.machine.tools.get_mut(number).ok_or(ToolError::Unknown(number))?;
        let count = tool.heaters().len();
        tool.set_active_temperatures(&vec![temperature; count])?;
        if tool.is_active() {
            tool.activate(io.heaters);
        }
        Ok(number)
    }

    fn heat_wait(&self, heaters: Vec<usize>, io: &Peripherals<'_>) -> Outcome {
        if heaters.is_empty() {
            return Outcome::Done(None);
        }
        Outcome::Started(Procedure::HeatWait(HeatWait {
            heaters,
            started: io.clock.now(),
            timeout: self.config.heaters.wait_timeout(),
        }))
    }

    /// M208
    fn set_axis_limits(&mut self, gb: &CommandBuffer) -> Result<Outcome, GCodeError> {
        let minimum = gb.has_field('S') && gb.long_field('S')? == 1;
        let mut changed = false;
        for axis in Axis::ALL {
            if !gb.has_field(axis.letter()) {
                continue;
            }
            let value = gb.float_field(axis.letter())? * self.machine.distance_scale;
            let limits = &mut self.machine.limits[axis.index()];
            if minimum {
                limits.min = value;
            } else {
                limits.max = value;
            }
            changed = true;
        }
        if changed {
            return Ok(Outcome::Done(None));
        }
        let report = Axis::ALL
            .iter()
            .map(|a| {
                let l = self.machine.limits(*a);
                format!("{} {:.1}..{:.1}", a, l.min, l.max)
            })
            .collect::<Vec<_>>()
            .join(", ");
        Ok(Outcome::Done(Some(format!("Axis limits {}", report))))
    }

    /// M503 body: the configuration macro as written.
    fn configuration_text(&self, io: &mut Peripherals<'_>) -> Result<String, GCodeError> {
        let path = self.config.files.macro_file(&self.config.files.config_macro);
        let handle = io.files.open(&path, OpenMode::Read)?;
        let mut lines = Vec::new();
        let result = loop {
            match io.files.read_line(handle) {
                Ok(Some(line)) => lines.push(String::from_utf8_lossy(&line).into_owned()),
                Ok(None) => break Ok(lines.join("\n")),
                Err(e) => break Err(e.into()),
            }
        };
        io.files.close(handle);
        result
    }

    /// M408 body.
    fn status_report(&self, io: &Peripherals<'_>) -> String {
        let position = io.motion.current_position();
        let paused = self.print.to_print.is_some()
            && self.print.job.as_ref().is_some_and(|j| j.status == PrintStatus::Paused);
        let status = if self.is_printing() {
            'P'
        } else if paused {
            'S'
        } else if !self.procedure.is_idle() || !self.motion_idle(io) {
            'B'
        } else {
            'I'
        };
        let report = StatusReport {
            status,
            coords: CoordsReport {
                axes_homed: self.machine.homed,
                xyz: Axis::ALL.map(|a| position[a]),
                extr: (0..self.config.machine.extruders)
                    .filter_map(|e| Drive::extruder(e).ok())
                    .map(|d| position[d])
                    .collect(),
            },
            current_tool: self.machine.tools.current_number(),
            heaters: (0..self.config.machine.heaters).map(|h| io.heaters.temperature(h)).collect(),
            feedrate: self.machine.feedrate,
            fraction_printed: self.fraction_printed(io),
            job: self.print.job.as_ref().map(|j| JobReport {
                id: j.id.to_string(),
                file: j.file_path.clone(),
                status: format!("{:?}", j.status),
                started_at: j.started_at.map(|t| t.to_rfc3339()),
            }),
            bed_equation: self.machine.bed_equation.map(|e| [e.a, e.b, e.c]),
        };
        serde_json::to_string(&report).unwrap_or_else(|e| {
            tracing::error!(error = %e, "status report serialisation failed");
            "{}".to_string()
        })
    }
}
