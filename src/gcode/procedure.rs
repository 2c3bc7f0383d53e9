//! Multi-tick procedures.
//!
//! A handler that cannot finish in one tick returns a [`Procedure`]. The
//! dispatcher advances it once per tick through one exhaustive match; every
//! wait is a predicate checked on the next tick plus the step to resume at.
//! Nothing here blocks.

use std::time::Duration;

use krusty_shared::{AXES, Axis, BedEquation, DriveArray, MoveFlags, Peripherals, PendingMove, ProbePoint};

use super::dispatcher::Dispatcher;
use super::error::ProcedureFault;

#[derive(Debug, Clone, PartialEq)]
pub enum Procedure {
    Idle,
    /// A move waiting for the motion side to pull the previous one.
    StageMove { pending: PendingMove },
    Dwell(Dwell),
    /// G92 waiting for motion to drain before the position is overwritten.
    SetPosition { target: DriveArray<f64>, active: DriveArray<bool> },
    Homing(Homing),
    Probing(Probing),
    ToolChange(ToolChange),
    HeatWait(HeatWait),
}

impl Procedure {
    pub fn name(&self) -> &'static str {
        match self {
            Procedure::Idle => "idle",
            Procedure::StageMove { .. } => "staging move",
            Procedure::Dwell(_) => "dwell",
            Procedure::SetPosition { .. } => "set position",
            Procedure::Homing(_) => "homing",
            Procedure::Probing(_) => "probing",
            Procedure::ToolChange(_) => "tool change",
            Procedure::HeatWait(_) => "heat wait",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Procedure::Idle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dwell {
    pub duration: Duration,
    /// Set once motion has drained.
    pub started: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomingStep {
    /// Wait for motion to drain, then start the next axis.
    Settle,
    /// Seek move toward the endstop is running.
    Seek(Axis),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homing {
    /// Axes still to home.
    pub axes: [bool; AXES],
    pub step: HomingStep,
    pub started: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeMode {
    /// G30: probe below the current position and set Z.
    Here,
    /// G30 P<n>: probe at a point and record it, optionally fitting the bed.
    AtPoint { index: usize, x: f64, y: f64, fit: bool },
    /// G32: probe every point, then fit the bed.
    Series { points: Vec<[f64; 2]> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStep {
    Settle,
    Travel,
    Dive,
    Lift,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Probing {
    pub mode: ProbeMode,
    pub step: ProbeStep,
    pub point: usize,
    pub samples: Vec<ProbePoint>,
    pub started: Duration,
}

impl Probing {
    pub fn new(mode: ProbeMode, now: Duration) -> Self {
        Probing { mode, step: ProbeStep::Settle, point: 0, samples: Vec::new(), started: now }
    }

    fn target(&self) -> Option<[f64; 2]> {
        match &self.mode {
            ProbeMode::Here => None,
            ProbeMode::AtPoint { x, y, .. } => Some([*x, *y]),
            ProbeMode::Series { points } => points.get(self.point).copied(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolChangeStep {
    /// Wait for motion, then put the old tool on standby.
    Drain,
    AwaitPark,
    Select,
    AwaitHeat,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToolChange {
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub step: ToolChangeStep,
    pub started: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeatWait {
    pub heaters: Vec<usize>,
    pub started: Duration,
    pub timeout: Duration,
}

/// Result of advancing a procedure by one tick.
#[derive(Debug)]
pub(super) enum Step {
    Continue(Procedure),
    Done(Option<String>),
    Fault(ProcedureFault),
}

fn elapsed(now: Duration, since: Duration) -> Duration {
    now.saturating_sub(since)
}

impl Dispatcher {
    pub(super) fn advance(&mut self, procedure: Procedure, io: &mut Peripherals<'_>) -> Step {
        match procedure {
            Procedure::Idle => Step::Done(None),
            Procedure::StageMove { pending } => match self.slot.stage(pending) {
                Ok(()) => Step::Done(None),
                Err(_) => Step::Continue(Procedure::StageMove { pending }),
            },
            Procedure::Dwell(dwell) => self.advance_dwell(dwell, io),
            Procedure::SetPosition { target, active } => {
                if !self.motion_idle(io) {
                    return Step::Continue(Procedure::SetPosition { target, active });
                }
                self.sync_position(io);
                self.apply_position(&target, &active, io);
                Step::Done(None)
            }
            Procedure::Homing(homing) => self.advance_homing(homing, io),
            Procedure::Probing(probing) => self.advance_probing(probing, io),
            Procedure::ToolChange(change) => self.advance_tool_change(change, io),
            Procedure::HeatWait(wait) => {
                if wait.heaters.iter().all(|&h| io.heaters.is_at_temperature(h)) {
                    tracing::info!(heaters = ?wait.heaters, "heaters at temperature");
                    Step::Done(None)
                } else if elapsed(io.clock.now(), wait.started) > wait.timeout {
                    Step::Fault(ProcedureFault::HeaterTimeout)
                } else {
                    Step::Continue(Procedure::HeatWait(wait))
                }
            }
        }
    }

    fn advance_dwell(&mut self, mut dwell: Dwell, io: &mut Peripherals<'_>) -> Step {
        let now = io.clock.now();
        match dwell.started {
            None if self.motion_idle(io) => {
                dwell.started = Some(now);
                Step::Continue(Procedure::Dwell(dwell))
            }
            Some(started) if elapsed(now, started) >= dwell.duration => Step::Done(None),
            _ => Step::Continue(Procedure::Dwell(dwell)),
        }
    }

    fn advance_homing(&mut self, mut homing: Homing, io: &mut Peripherals<'_>) -> Step {
        let now = io.clock.now();
        let timed_out = elapsed(now, homing.started) > self.config.homing.timeout();
        match homing.step {
            HomingStep::Settle => {
                if !self.motion_idle(io) {
                    return if timed_out {
                        Step::Fault(ProcedureFault::MotionTimeout)
                    } else {
                        Step::Continue(Procedure::Homing(homing))
                    };
                }
                self.sync_position(io);
                let Some(axis) = Axis::ALL.into_iter().find(|a| homing.axes[a.index()]) else {
                    return Step::Done(None);
                };
                let limits = self.machine.limits(axis);
                let travel = (limits.max - limits.min) * self.config.homing.overshoot;
                let mut seek = PendingMove::hold(&self.machine.position, self.config.axes.get(axis).home_feedrate);
                seek.set(axis, self.machine.position[axis] - travel);
                seek.flags = MoveFlags { check_endstops: true, probe: false };
                if self.slot.stage(seek).is_err() {
                    return Step::Continue(Procedure::Homing(homing));
                }
                tracing::info!(%axis, "homing axis");
                homing.step = HomingStep::Seek(axis);
                homing.started = now;
                Step::Continue(Procedure::Homing(homing))
            }
            HomingStep::Seek(axis) => {
                if !self.motion_idle(io) {
                    return if timed_out {
                        Step::Fault(ProcedureFault::HomingTimeout(axis))
                    } else {
                        Step::Continue(Procedure::Homing(homing))
                    };
                }
                if !io.motion.endstop_triggered(axis) {
                    return Step::Fault(ProcedureFault::EndstopNotReached(axis));
                }
                self.sync_position(io);
                self.machine.position[axis] = self.machine.limits(axis).min;
                io.motion.set_position(&self.machine.position);
                self.machine.homed[axis.index()] = true;
                homing.axes[axis.index()] = false;
                homing.step = HomingStep::Settle;
                tracing::info!(%axis, "axis homed");
                Step::Continue(Procedure::Homing(homing))
            }
        }
    }

    fn stage_probe_move(&mut self, xy: Option<[f64; 2]>, z: f64, feedrate: f64, probe: bool) -> bool {
        let mut mv = PendingMove::hold(&self.machine.position, feedrate);
        if let Some([x, y]) = xy {
            mv.set(Axis::X, x);
            mv.set(Axis::Y, y);
        }
        mv.set(Axis::Z, z);
        mv.flags.probe = probe;
        self.slot.stage(mv).is_ok()
    }

    fn advance_probing(&mut self, mut probing: Probing, io: &mut Peripherals<'_>) -> Step {
        let now = io.clock.now();
        if !self.motion_idle(io) && probing.step != ProbeStep::Dive {
            if elapsed(now, probing.started) > self.config.probe.timeout() {
                return Step::Fault(ProcedureFault::ProbeTimeout);
            }
            return Step::Continue(Procedure::Probing(probing));
        }
        let probe = self.config.probe.clone();
        match probing.step {
            ProbeStep::Settle => {
                self.sync_position(io);
                probing.started = now;
                if let ProbeMode::Here = probing.mode {
                    if !self.stage_probe_move(None, -probe.max_depth, probe.feedrate, true) {
                        return Step::Continue(Procedure::Probing(probing));
                    }
                    probing.step = ProbeStep::Dive;
                    return Step::Continue(Procedure::Probing(probing));
                }
                let Some(xy) = probing.target() else {
                    return self.finish_series(probing, io);
                };
                if self.stage_probe_move(Some(xy), probe.dive_height, probe.travel_feedrate, false) {
                    probing.step = ProbeStep::Travel;
                }
                Step::Continue(Procedure::Probing(probing))
            }
            ProbeStep::Travel => {
                self.sync_position(io);
                if self.stage_probe_move(None, -probe.max_depth, probe.feedrate, true) {
                    probing.step = ProbeStep::Dive;
                    probing.started = now;
                }
                Step::Continue(Procedure::Probing(probing))
            }
            ProbeStep::Dive => {
                let idle = self.motion_idle(io);
                if io.motion.is_probe_triggered() {
                    if !idle {
                        // Wait for the triggered move to stop.
                        return Step::Continue(Procedure::Probing(probing));
                    }
                    self.sync_position(io);
                    let sample = ProbePoint {
                        x: self.machine.position[Axis::X],
                        y: self.machine.position[Axis::Y],
                        z: self.machine.position[Axis::Z],
                    };
                    tracing::info!(x = sample.x, y = sample.y, z = sample.z, "probe triggered");
                    if let ProbeMode::Here = probing.mode {
                        self.machine.position[Axis::Z] = self.machine.probe_trigger_height;
                        io.motion.set_position(&self.machine.position);
                        self.machine.homed[Axis::Z.index()] = true;
                    }
                    probing.samples.push(sample);
                    if self.stage_probe_move(None, probe.dive_height, probe.travel_feedrate, false) {
                        probing.step = ProbeStep::Lift;
                    }
                    Step::Continue(Procedure::Probing(probing))
                } else if idle {
                    Step::Fault(ProcedureFault::ProbeNotTriggered)
                } else if elapsed(now, probing.started) > probe.timeout() {
                    Step::Fault(ProcedureFault::ProbeTimeout)
                } else {
                    Step::Continue(Procedure::Probing(probing))
                }
            }
            ProbeStep::Lift => {
                self.sync_position(io);
                probing.point += 1;
                match probing.mode {
                    ProbeMode::Here => {
                        Step::Done(Some(format!("Z set to {:.3}", self.machine.probe_trigger_height)))
                    }
                    ProbeMode::AtPoint { index, fit, .. } => {
                        let Some(sample) = probing.samples.last().copied() else {
                            return Step::Fault(ProcedureFault::ProbeNotTriggered);
                        };
                        self.machine.probe_points[index] = Some(sample);
                        if !fit {
                            return Step::Done(Some(format!("Point {} Z = {:.3}", index, sample.z)));
                        }
                        let points = self.machine.recorded_probe_points();
                        match self.fit_bed(&points, io) {
                            Ok(text) => Step::Done(Some(text)),
                            Err(fault) => Step::Fault(fault),
                        }
                    }
                    ProbeMode::Series { .. } => {
                        probing.step = ProbeStep::Settle;
                        Step::Continue(Procedure::Probing(probing))
                    }
                }
            }
        }
    }

    fn finish_series(&mut self, probing: Probing, io: &mut Peripherals<'_>) -> Step {
        for (slot, sample) in self.machine.probe_points.iter_mut().zip(&probing.samples) {
            *slot = Some(*sample);
        }
        match self.fit_bed(&probing.samples, io) {
            Ok(text) => Step::Done(Some(text)),
            Err(fault) => Step::Fault(fault),
        }
    }

    pub(super) fn fit_bed(&mut self, points: &[ProbePoint], io: &mut Peripherals<'_>) -> Result<String, ProcedureFault> {
        let equation = BedEquation::fit(points)?;
        self.machine.bed_equation = Some(equation);
        io.motion.set_bed_equation(equation);
        tracing::info!(%equation, points = points.len(), "bed equation set");
        Ok(format!("Bed equation fits points: {}", equation))
    }

    fn advance_tool_change(&mut self, mut change: ToolChange, io: &mut Peripherals<'_>) -> Step {
        let now = io.clock.now();
        let timed_out = elapsed(now, change.started) > self.config.tool_change.timeout();
        match change.step {
            ToolChangeStep::Drain | ToolChangeStep::AwaitPark if !self.motion_idle(io) => {
                if timed_out {
                    Step::Fault(ProcedureFault::MotionTimeout)
                } else {
                    Step::Continue(Procedure::ToolChange(change))
                }
            }
            ToolChangeStep::Drain => {
                self.sync_position(io);
                if let Some(old) = change.from.and_then(|n| self.machine.tools.get_mut(n)) {
                    old.standby(io.heaters);
                    tracing::info!(tool = old.number(), "tool on standby");
                }
                change.step = ToolChangeStep::Select;
                if let (Some([x, y]), Some(_)) = (self.config.tool_change.park, change.from) {
                    let mut park = PendingMove::hold(&self.machine.position, self.config.probe.travel_feedrate);
                    park.set(Axis::X, x);
                    park.set(Axis::Y, y);
                    if self.slot.stage(park).is_ok() {
                        change.step = ToolChangeStep::AwaitPark;
                    }
                }
                Step::Continue(Procedure::ToolChange(change))
            }
            ToolChangeStep::AwaitPark => {
                self.sync_position(io);
                change.step = ToolChangeStep::Select;
                Step::Continue(Procedure::ToolChange(change))
            }
            ToolChangeStep::Select => {
                if self.machine.tools.select(change.to).is_err() {
                    return Step::Fault(ProcedureFault::InvalidTool(change.to.unwrap_or(-1)));
                }
                let Some(tool) = change.to.and_then(|n| self.machine.tools.get_mut(n)) else {
                    tracing::info!("tools deselected");
                    return Step::Done(None);
                };
                tool.activate(io.heaters);
                tracing::info!(tool = tool.number(), "tool selected");
                if self.config.tool_change.wait_for_temperature && !tool.heaters().is_empty() {
                    change.step = ToolChangeStep::AwaitHeat;
                    change.started = now;
                    return Step::Continue(Procedure::ToolChange(change));
                }
                Step::Done(None)
            }
            ToolChangeStep::AwaitHeat => {
                let ready = self.machine.tools.current().is_some_and(|t| t.heaters_at_temperature(&*io.heaters));
                if ready {
                    Step::Done(None)
                } else if timed_out {
                    Step::Fault(ProcedureFault::HeaterTimeout)
                } else {
                    Step::Continue(Procedure::ToolChange(change))
                }
            }
        }
    }
}
