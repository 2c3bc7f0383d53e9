// Simulated motion subsystem: pulls staged moves, finishes them after a fixed
// number of steps, and models endstop switches and a probe surface.

use krusty_shared::{AXES, Axis, BedEquation, DriveArray, MotionSubsystem, MoveSlot, PendingMove};

#[derive(Debug)]
pub struct SimMotion {
    slot: MoveSlot,
    position: DriveArray<f64>,
    active: Option<(PendingMove, u32)>,
    move_steps: u32,
    endstops: [Option<f64>; AXES],
    endstop_hit: [bool; AXES],
    probe_surface: Option<BedEquation>,
    probe_hit: bool,
    stalled: bool,
    drives_enabled: bool,
    executed: Vec<PendingMove>,
    bed_equation: Option<BedEquation>,
    bed_equation_updates: usize,
}

fn span(a: f64, b: f64) -> (f64, f64) {
    if a <= b { (a, b) } else { (b, a) }
}

impl SimMotion {
    /// Endstops sit at 0 on every axis and the head starts at (100, 100, 100).
    pub fn new(slot: MoveSlot) -> Self {
        let mut position = DriveArray::default();
        for axis in Axis::ALL {
            position[axis] = 100.0;
        }
        SimMotion {
            slot,
            position,
            active: None,
            move_steps: 1,
            endstops: [Some(0.0); AXES],
            endstop_hit: [false; AXES],
            probe_surface: Some(BedEquation::FLAT),
            probe_hit: false,
            stalled: false,
            drives_enabled: false,
            executed: Vec::new(),
            bed_equation: None,
            bed_equation_updates: 0,
        }
    }

    pub fn with_move_steps(mut self, steps: u32) -> Self {
        self.move_steps = steps.max(1);
        self
    }

    pub fn set_endstop(&mut self, axis: Axis, switch: Option<f64>) {
        self.endstops[axis.index()] = switch;
    }

    pub fn set_probe_surface(&mut self, surface: Option<BedEquation>) {
        self.probe_surface = surface;
    }

    /// Moves are still pulled but never finish.
    pub fn stall(&mut self) {
        self.stalled = true;
    }

    /// Raises the probe input outside of any probing move.
    pub fn trigger_probe(&mut self) {
        self.probe_hit = true;
    }

    pub fn executed(&self) -> &[PendingMove] {
        &self.executed
    }

    pub fn bed_equation(&self) -> Option<BedEquation> {
        self.bed_equation
    }

    pub fn bed_equation_updates(&self) -> usize {
        self.bed_equation_updates
    }

    pub fn drives_enabled(&self) -> bool {
        self.drives_enabled
    }

    /// Advances the simulation by one step.
    pub fn step(&mut self) {
        match self.active.take() {
            Some(running) if self.stalled => self.active = Some(running),
            Some((mv, remaining)) if remaining > 1 => self.active = Some((mv, remaining - 1)),
            Some((mv, _)) => self.complete(&mv),
            None => {
                if let Some(mv) = self.slot.pull() {
                    self.begin(mv);
                }
            }
        }
    }

    fn begin(&mut self, mv: PendingMove) {
        tracing::trace!(feedrate = mv.feedrate, "sim move started");
        self.endstop_hit = [false; AXES];
        self.probe_hit = false;
        self.drives_enabled = true;
        self.executed.push(mv);
        self.active = Some((mv, self.move_steps));
    }

    fn complete(&mut self, mv: &PendingMove) {
        let start = self.position;
        let mut end = start;
        for drive in mv.active_drives() {
            end[drive] = mv.target[drive];
        }
        if mv.flags.check_endstops {
            for axis in Axis::ALL {
                let Some(switch) = self.endstops[axis.index()] else {
                    continue;
                };
                let (lo, hi) = span(start[axis], end[axis]);
                if mv.is_active(axis) && switch >= lo && switch <= hi {
                    end[axis] = switch;
                    self.endstop_hit[axis.index()] = true;
                }
            }
        }
        if mv.flags.probe && mv.is_active(Axis::Z) {
            if let Some(surface) = self.probe_surface {
                let height = surface.height_at(end[Axis::X], end[Axis::Y]);
                let (lo, hi) = span(start[Axis::Z], end[Axis::Z]);
                if height >= lo && height <= hi {
                    end[Axis::Z] = height;
                    self.probe_hit = true;
                }
            }
        }
        self.position = end;
    }
}

impl MotionSubsystem for SimMotion {
    fn all_moves_finished(&self) -> bool {
        self.active.is_none()
    }

    fn is_probe_triggered(&self) -> bool {
        self.probe_hit
    }

    fn endstop_triggered(&self, axis: Axis) -> bool {
        self.endstop_hit[axis.index()]
    }

    fn current_position(&self) -> DriveArray<f64> {
        self.position
    }

    fn set_position(&mut self, position: &DriveArray<f64>) {
        self.position = *position;
    }

    fn set_bed_equation(&mut self, equation: BedEquation) {
        self.bed_equation = Some(equation);
        self.bed_equation_updates += 1;
    }

    fn disable_drives(&mut self) {
        self.drives_enabled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krusty_shared::MoveFlags;

    fn seek(slot: &MoveSlot, from: &DriveArray<f64>, axis: Axis, target: f64) {
        let mut mv = PendingMove::hold(from, 1200.0);
        mv.set(axis, target);
        mv.flags = MoveFlags { check_endstops: true, probe: false };
        slot.stage(mv).unwrap();
    }

    #[test]
    fn seek_stops_at_endstop() {
        let slot = MoveSlot::new();
        let mut sim = SimMotion::new(slot.clone());
        seek(&slot, &sim.current_position(), Axis::X, -200.0);
        sim.step();
        assert!(!sim.all_moves_finished());
        sim.step();
        assert!(sim.all_moves_finished());
        assert!(sim.endstop_triggered(Axis::X));
        assert_eq!(sim.current_position()[Axis::X], 0.0);
    }

    #[test]
    fn missing_endstop_runs_to_target() {
        let slot = MoveSlot::new();
        let mut sim = SimMotion::new(slot.clone());
        sim.set_endstop(Axis::Y, None);
        seek(&slot, &sim.current_position(), Axis::Y, -50.0);
        sim.step();
        sim.step();
        assert!(!sim.endstop_triggered(Axis::Y));
        assert_eq!(sim.current_position()[Axis::Y], -50.0);
    }

    #[test]
    fn stalled_moves_never_finish() {
        let slot = MoveSlot::new();
        let mut sim = SimMotion::new(slot.clone());
        sim.stall();
        seek(&slot, &sim.current_position(), Axis::Z, 0.0);
        for _ in 0..10 {
            sim.step();
        }
        assert!(slot.is_empty());
        assert!(!sim.all_moves_finished());
    }
}
