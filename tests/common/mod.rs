// Shared rig: a dispatcher wired to a simulated machine.
#![allow(dead_code)]

use krusty_gcodes::config::Config;
use krusty_gcodes::gcode::Dispatcher;
use krusty_shared::{Axis, PendingMove};
use krusty_simulator::SimMachine;

pub struct Rig {
    pub sim: SimMachine,
    pub dispatcher: Dispatcher,
}

impl Rig {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let sim = SimMachine::new(config.machine.heaters);
        let dispatcher = Dispatcher::new(config, sim.slot.clone()).expect("valid config");
        Rig { sim, dispatcher }
    }

    /// One dispatcher tick without advancing the simulation.
    pub fn spin(&mut self) {
        let mut io = self.sim.peripherals();
        self.dispatcher.spin(&mut io);
    }

    /// One dispatcher tick followed by one simulation step.
    pub fn tick(&mut self) {
        self.spin();
        self.sim.step();
    }

    pub fn ticks(&mut self, n: usize) {
        for _ in 0..n {
            self.tick();
        }
    }

    /// Ticks until `count` network replies have arrived.
    pub fn until_replies(&mut self, count: usize, limit: usize) {
        for _ in 0..limit {
            if self.sim.network.replies.len() >= count {
                return;
            }
            self.tick();
        }
        panic!("only {:?} after {} ticks", self.sim.network.replies, limit);
    }

    /// Sends one network line and ticks until it is answered.
    pub fn command(&mut self, line: &str) -> String {
        let before = self.sim.network.replies.len();
        self.sim.network.push(line);
        self.until_replies(before + 1, 2000);
        self.sim.network.replies[before].clone()
    }

    pub fn executed_x(&self) -> Vec<f64> {
        self.sim.motion.executed().iter().filter(|m| m.is_active(Axis::X)).map(|m| m.target[Axis::X]).collect()
    }

    pub fn last_move(&self) -> PendingMove {
        *self.sim.motion.executed().last().expect("a move was executed")
    }
}
