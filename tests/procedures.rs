// Multi-tick procedures: homing, probing, tool change, heat waits, macros.
mod common;

use std::time::Duration;

use common::Rig;
use krusty_gcodes::config::{Config, ToolConfig};
use krusty_gcodes::gcode::{Procedure, STACK_DEPTH};
use krusty_shared::{Axis, BedEquation, HeaterSubsystem};
use krusty_simulator::SimHeaters;

#[test]
fn homing_seeks_each_axis_to_its_endstop() {
    let mut rig = Rig::new();
    assert_eq!(rig.command("G28 X"), "ok");
    let machine = rig.dispatcher.machine();
    assert!(machine.axis_has_been_homed(Axis::X));
    assert!(!machine.axis_has_been_homed(Axis::Y));
    assert_eq!(machine.position[Axis::X], 0.0);

    let seek = rig.sim.motion.executed()[0];
    assert!(seek.flags.check_endstops);
    assert!(seek.target[Axis::X] < 0.0);

    assert_eq!(rig.command("G28"), "ok");
    assert!(Axis::ALL.iter().all(|a| rig.dispatcher.machine().axis_has_been_homed(*a)));
    assert_eq!(rig.sim.motion.executed().len(), 4);
}

#[test]
fn homing_without_endstop_faults_and_leaves_axis_unhomed() {
    let mut rig = Rig::new();
    rig.sim.motion.set_endstop(Axis::Y, None);
    let reply = rig.command("G28 Y");
    assert_eq!(reply, "Error: Y endstop not reached while homing");
    assert!(!rig.dispatcher.machine().axis_has_been_homed(Axis::Y));
    assert!(rig.dispatcher.procedure().is_idle());
}

#[test]
fn stalled_homing_times_out() {
    let mut config = Config::default();
    config.homing.timeout_secs = 0.5;
    let mut rig = Rig::with_config(config);
    rig.sim.motion.stall();
    rig.sim.network.push("G28 Z");
    rig.until_replies(1, 200);
    assert_eq!(rig.sim.network.replies, vec!["Error: homing Z timed out"]);
    assert!(!rig.dispatcher.machine().axis_has_been_homed(Axis::Z));
    assert!(rig.sim.slot.is_empty());
}

#[test]
fn homing_timeout_drops_the_unpulled_seek() {
    let mut config = Config::default();
    config.homing.timeout_secs = 0.5;
    let mut rig = Rig::with_config(config);
    // Motion never runs, so the seek stays staged.
    rig.sim.network.push("G28 Z");
    rig.spin();
    rig.spin();
    let seek = rig.sim.slot.peek().expect("seek staged");
    assert!(seek.flags.check_endstops);

    rig.sim.clock.advance(Duration::from_secs(1));
    rig.spin();
    assert_eq!(rig.sim.network.replies, vec!["Error: homing Z timed out"]);
    assert!(rig.sim.slot.peek().is_none());
    assert!(rig.dispatcher.procedure().is_idle());
    assert_eq!(rig.dispatcher.machine().position[Axis::Z], 100.0);
}

#[test]
fn probe_series_fits_the_bed_once() {
    let mut rig = Rig::new();
    let tilted = BedEquation { a: 0.005, b: -0.01, c: 0.5 };
    rig.sim.motion.set_probe_surface(Some(tilted));

    let reply = rig.command("G32");
    assert!(reply.starts_with("ok Bed equation fits points"), "{}", reply);
    let points = rig.dispatcher.machine().recorded_probe_points();
    assert_eq!(points.len(), 3);
    let fitted = rig.dispatcher.machine().bed_equation.expect("equation");
    assert!((fitted.a - tilted.a).abs() < 1e-6);
    assert!((fitted.b - tilted.b).abs() < 1e-6);
    assert!((fitted.c - tilted.c).abs() < 1e-6);
    assert_eq!(rig.sim.motion.bed_equation_updates(), 1);

    // A late trigger changes nothing.
    rig.sim.motion.trigger_probe();
    rig.ticks(10);
    assert_eq!(rig.sim.motion.bed_equation_updates(), 1);
    assert_eq!(rig.dispatcher.machine().recorded_probe_points(), points);
    assert!(rig.dispatcher.procedure().is_idle());
}

#[test]
fn probe_that_never_triggers_faults() {
    let mut rig = Rig::new();
    rig.sim.motion.set_probe_surface(None);
    assert_eq!(rig.command("G30"), "Error: probe did not trigger within its travel");
    assert!(rig.dispatcher.machine().bed_equation.is_none());
}

#[test]
fn single_probe_sets_z_to_trigger_height() {
    let mut rig = Rig::new();
    assert_eq!(rig.command("G30"), "ok Z set to 0.700");
    let machine = rig.dispatcher.machine();
    assert!(machine.axis_has_been_homed(Axis::Z));
    // Lifted back to the dive height after the trigger.
    assert_eq!(machine.position[Axis::Z], 5.0);
}

#[test]
fn recorded_points_fit_without_probing() {
    let mut rig = Rig::new();
    assert_eq!(rig.command("G30 P0 X10 Y10 Z0.5"), "ok");
    assert_eq!(rig.command("G30 P1 X150 Y10 Z0.5"), "ok");
    let reply = rig.command("G30 P2 X80 Y150 Z0.5 S");
    assert!(reply.starts_with("ok Bed equation"), "{}", reply);
    let equation = rig.dispatcher.machine().bed_equation.expect("equation");
    assert!((equation.c - 0.5).abs() < 1e-6);
    assert!(rig.sim.motion.executed().is_empty());
}

fn two_tool_config() -> Config {
    let mut config = Config::default();
    config.machine.extruders = 2;
    config.machine.heaters = 3;
    config.tools = vec![
        ToolConfig {
            number: 0,
            drives: vec![0],
            heaters: vec![1],
            active_temperatures: vec![200.0],
            standby_temperatures: vec![150.0],
            offsets: [0.0; 3],
        },
        ToolConfig {
            number: 1,
            drives: vec![1],
            heaters: vec![2],
            active_temperatures: vec![210.0],
            standby_temperatures: vec![160.0],
            offsets: [0.0; 3],
        },
    ];
    config
}

#[test]
fn tool_change_heats_new_tool_and_parks_old() {
    let mut rig = Rig::with_config(two_tool_config());
    assert_eq!(rig.command("T0"), "ok");
    assert!(rig.sim.heaters.is_at_temperature(1));
    assert_eq!(rig.sim.heaters.targets(), &[0.0, 200.0, 0.0]);

    assert_eq!(rig.command("T1"), "ok");
    assert_eq!(rig.sim.heaters.targets(), &[0.0, 150.0, 210.0]);
    assert!(rig.sim.heaters.is_at_temperature(2));
    assert_eq!(rig.dispatcher.machine().tools.current_number(), Some(1));
    assert_eq!(rig.command("T"), "ok Tool 1 is selected");

    assert_eq!(rig.command("T-1"), "ok");
    assert_eq!(rig.dispatcher.machine().tools.current_number(), None);
}

#[test]
fn invalid_tool_faults() {
    let mut rig = Rig::with_config(two_tool_config());
    assert_eq!(rig.command("T5"), "Error: invalid tool number 5");
    assert_eq!(rig.dispatcher.machine().tools.current_number(), None);
}

#[test]
fn invalid_tool_drops_the_staged_move() {
    let mut rig = Rig::with_config(two_tool_config());
    rig.sim.network.push("G1 X10");
    rig.spin();
    assert!(rig.sim.slot.peek().is_some());
    rig.sim.network.push("T5");
    rig.spin();
    assert_eq!(rig.sim.network.replies, vec!["ok", "Error: invalid tool number 5"]);
    assert!(rig.sim.slot.peek().is_none());
    rig.ticks(3);
    assert!(rig.sim.motion.executed().is_empty());
}

#[test]
fn tool_change_parks_when_configured() {
    let mut config = two_tool_config();
    config.tool_change.park = Some([190.0, 190.0]);
    let mut rig = Rig::with_config(config);
    rig.command("T0");
    assert!(rig.sim.motion.executed().is_empty());
    rig.command("T1");
    let park = rig.last_move();
    assert_eq!(park.target[Axis::X], 190.0);
    assert_eq!(park.target[Axis::Y], 190.0);
}

#[test]
fn heater_wait_completes_when_settled() {
    let mut rig = Rig::new();
    assert_eq!(rig.command("T0"), "ok");
    rig.sim.network.push("M109 S210 T0");
    rig.tick();
    assert!(matches!(rig.dispatcher.procedure(), Procedure::HeatWait(_)));
    rig.until_replies(2, 50);
    assert_eq!(rig.sim.network.replies, vec!["ok", "ok"]);
    assert!((rig.sim.heaters.temperature(1) - 210.0).abs() <= 1.0);

    assert_eq!(rig.command("M190 S60"), "ok");
    assert!(rig.sim.heaters.is_at_temperature(0));
}

#[test]
fn heater_wait_times_out() {
    let mut config = Config::default();
    config.heaters.wait_timeout_secs = 0.05;
    let mut rig = Rig::with_config(config);
    rig.sim.heaters = SimHeaters::new(2).with_rate(1.0);
    assert_eq!(rig.command("M190 S100"), "Error: heaters did not reach temperature in time");
}

fn nested_macros(rig: &mut Rig, depth: usize) {
    for n in 1..=depth {
        rig.sim.files.insert(&format!("sys/m{}.g", n), &format!("M98 Pm{}.g\nG1 X{}\n", n + 1, n));
    }
}

#[test]
fn sixth_nested_macro_fails_and_fifth_continues() {
    let mut rig = Rig::new();
    nested_macros(&mut rig, 6);
    assert_eq!(rig.command("M98 Pm1.g"), "ok");
    rig.ticks(5);

    // m6 never ran; m5..m1 finished their moves innermost first.
    assert_eq!(rig.executed_x(), vec![5.0, 4.0, 3.0, 2.0, 1.0]);
    assert_eq!(rig.dispatcher.stack_depth(), 0);
    assert!(!rig.dispatcher.macro_running());
    assert_eq!(rig.sim.files.open_count(), 0);
}

#[test]
fn macro_overflow_drops_the_staged_move() {
    let mut rig = Rig::new();
    for n in 1..=4 {
        rig.sim.files.insert(&format!("sys/m{}.g", n), &format!("M98 Pm{}.g\n", n + 1));
    }
    rig.sim.files.insert("sys/m5.g", "G1 X50\nM98 Pm6.g\nG1 X5\n");
    rig.sim.files.insert("sys/m6.g", "G1 X60\n");
    rig.sim.network.push("M98 Pm1.g");
    // One line per tick: m1..m5 open, then m5 stages its first move.
    for _ in 0..6 {
        rig.spin();
    }
    assert_eq!(rig.dispatcher.stack_depth(), STACK_DEPTH);
    assert_eq!(rig.sim.slot.peek().map(|m| m.target[Axis::X]), Some(50.0));

    rig.spin();
    assert!(rig.sim.slot.peek().is_none());
    rig.until_replies(1, 50);
    assert_eq!(rig.sim.network.replies, vec!["ok"]);
    assert_eq!(rig.executed_x(), vec![5.0]);
    assert_eq!(rig.dispatcher.stack_depth(), 0);
}

#[test]
fn carriage_return_only_macro_runs_every_line() {
    let mut rig = Rig::new();
    rig.sim.files.insert("sys/cr.g", "G1 X4\rG1 X5\rG1 X6");
    assert_eq!(rig.command("M98 Pcr.g"), "ok");
    rig.ticks(3);
    assert_eq!(rig.executed_x(), vec![4.0, 5.0, 6.0]);
}

#[test]
fn missing_macro_reports_and_leaves_stack_alone() {
    let mut rig = Rig::new();
    assert_eq!(rig.command("M98 Pnope.g"), "Error: file not found: sys/nope.g");
    assert_eq!(rig.dispatcher.stack_depth(), 0);
}

#[test]
fn macro_restores_modal_state_and_blocks_other_sources() {
    let mut rig = Rig::new();
    rig.sim.files.insert("sys/slow.g", "G91\nG1 F100\nG4 P100\n");
    rig.sim.network.push("M98 Pslow.g");
    rig.tick();
    rig.sim.serial.send("M115\n");
    rig.ticks(5);
    assert!(rig.dispatcher.macro_running());
    assert!(rig.sim.serial.replies.is_empty());

    rig.until_replies(1, 100);
    assert_eq!(rig.sim.network.replies, vec!["ok"]);
    let machine = rig.dispatcher.machine();
    assert!(!machine.axes_relative);
    assert_eq!(machine.feedrate, 3000.0);
    rig.ticks(2);
    assert_eq!(rig.sim.serial.replies.len(), 1);
}

#[test]
fn macro_cannot_pop_its_own_frame() {
    let mut rig = Rig::new();
    rig.sim.files.insert("sys/pop.g", "M121\nG1 X3\n");
    assert_eq!(rig.command("M98 Ppop.g"), "ok");
    rig.ticks(3);
    assert_eq!(rig.executed_x(), vec![3.0]);
    assert_eq!(rig.dispatcher.stack_depth(), 0);
}

#[test]
fn configuration_macro_runs_at_start() {
    let mut rig = Rig::new();
    rig.sim.files.insert("sys/config.g", "M563 P3 D0 H1\nG10 P3 S190\n");
    let mut io = rig.sim.peripherals();
    rig.dispatcher.run_configuration(&mut io).unwrap();
    drop(io);
    rig.ticks(5);
    assert!(rig.dispatcher.machine().tools.contains(3));
    assert_eq!(rig.dispatcher.machine().tools.get(3).unwrap().active_temperatures(), &[190.0]);
}

#[test]
fn emergency_stop_interrupts_a_procedure() {
    let mut rig = Rig::new();
    rig.sim.motion.stall();
    rig.command("M104 S200 T0");
    rig.command("T0");
    rig.sim.network.push("G28");
    rig.ticks(3);
    assert!(matches!(rig.dispatcher.procedure(), Procedure::Homing(_)));

    rig.sim.serial.send("M112\n");
    rig.tick();
    assert_eq!(rig.sim.serial.replies, vec!["ok Emergency stop"]);
    assert_eq!(rig.sim.network.replies.last().map(String::as_str), Some("Error: emergency stop"));
    assert!(rig.dispatcher.procedure().is_idle());
    assert!(rig.sim.slot.is_empty());
    assert!(rig.sim.heaters.targets().iter().all(|t| *t == 0.0));
    assert!(!rig.sim.motion.drives_enabled());
}
