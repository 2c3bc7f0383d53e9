// src/gcode/machine.rs - modal and positional state owned by the dispatcher
use krusty_shared::{AXES, Axis, BedEquation, Drive, DriveArray, FileHandle, ProbePoint};

use crate::config::{Config, LimitMode, MAX_PROBE_POINTS};

use super::stack::{FrameKind, ModalState};
use super::tool::{ToolError, ToolTable};

pub const INCH_TO_MM: f64 = 25.4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisLimits {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone)]
pub struct MachineState {
    /// Last commanded position per drive.
    pub position: DriveArray<f64>,
    /// mm/min
    pub feedrate: f64,
    pub axes_relative: bool,
    pub drives_relative: bool,
    /// 1.0 for mm, 25.4 for inches.
    pub distance_scale: f64,
    pub homed: [bool; AXES],
    pub limits: [AxisLimits; AXES],
    pub limit_axes: bool,
    pub limit_mode: LimitMode,
    pub tools: ToolTable,
    pub probe_points: [Option<ProbePoint>; MAX_PROBE_POINTS],
    pub bed_equation: Option<BedEquation>,
    /// Z reported when the probe triggers.
    pub probe_trigger_height: f64,
    /// M302: extruders may move below `hot_enough_to_extrude`.
    pub cold_extrusion: bool,
    pub hot_enough_to_extrude: f64,
    pub debug: bool,
}

impl MachineState {
    pub fn new(config: &Config) -> Result<Self, ToolError> {
        let limits = Axis::ALL.map(|axis| {
            let a = config.axes.get(axis);
            AxisLimits { min: a.min, max: a.max }
        });
        Ok(MachineState {
            position: DriveArray::default(),
            feedrate: 3000.0,
            axes_relative: false,
            drives_relative: true,
            distance_scale: 1.0,
            homed: [false; AXES],
            limits,
            limit_axes: config.limits.enabled,
            limit_mode: config.limits.mode,
            tools: ToolTable::from_config(&config.tools, config.machine.extruders, config.machine.heaters)?,
            probe_points: [None; MAX_PROBE_POINTS],
            bed_equation: None,
            probe_trigger_height: config.probe.trigger_height,
            cold_extrusion: config.heaters.allow_cold_extrusion,
            hot_enough_to_extrude: config.heaters.hot_enough_to_extrude,
            debug: false,
        })
    }

    pub fn axis_has_been_homed(&self, axis: Axis) -> bool {
        self.homed[axis.index()]
    }

    pub fn limits(&self, axis: Axis) -> AxisLimits {
        self.limits[axis.index()]
    }

    /// Snapshot for the modal stack.
    pub fn modal(&self, file: Option<FileHandle>, kind: FrameKind) -> ModalState {
        ModalState {
            feedrate: self.feedrate,
            axes_relative: self.axes_relative,
            drives_relative: self.drives_relative,
            file,
            kind,
        }
    }

    pub fn restore(&mut self, state: &ModalState) {
        self.feedrate = state.feedrate;
        self.axes_relative = state.axes_relative;
        self.drives_relative = state.drives_relative;
    }

    pub fn recorded_probe_points(&self) -> Vec<ProbePoint> {
        self.probe_points.iter().flatten().copied().collect()
    }

    /// `X:.. Y:.. Z:.. E0:..` for M114.
    pub fn coordinates_report(position: &DriveArray<f64>, extruders: usize) -> String {
        let mut report = Axis::ALL
            .iter()
            .map(|a| format!("{}:{:.2}", a, position[*a]))
            .collect::<Vec<_>>()
            .join(" ");
        for e in 0..extruders {
            if let Ok(drive) = Drive::extruder(e) {
                report.push_str(&format!(" E{}:{:.1}", e, position[drive]));
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modal_round_trip() {
        let mut machine = MachineState::new(&Config::default()).unwrap();
        machine.feedrate = 1200.0;
        machine.axes_relative = true;
        let saved = machine.modal(None, FrameKind::Explicit);

        machine.feedrate = 6000.0;
        machine.axes_relative = false;
        machine.drives_relative = false;
        machine.restore(&saved);
        assert_eq!(machine.feedrate, 1200.0);
        assert!(machine.axes_relative);
        assert!(machine.drives_relative);
    }

    #[test]
    fn coordinates_report_lists_axes_and_extruders() {
        let mut position = DriveArray::default();
        position[Axis::X] = 10.0;
        position[Drive::extruder(0).unwrap()] = 2.5;
        assert_eq!(MachineState::coordinates_report(&position, 1), "X:10.00 Y:0.00 Z:0.00 E0:2.5");
    }
}
