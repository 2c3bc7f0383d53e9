// SimMachine bundles one of each simulated collaborator around a shared move slot.

use std::cell::Cell;
use std::time::Duration;

use krusty_shared::{Clock, MoveSlot, Peripherals};

use crate::{MemoryFiles, ScriptedNetwork, ScriptedSerial, SimHeaters, SimMotion};

#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<Duration>,
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.get()
    }
}

pub struct SimMachine {
    pub slot: MoveSlot,
    pub motion: SimMotion,
    pub heaters: SimHeaters,
    pub files: MemoryFiles,
    pub network: ScriptedNetwork,
    pub serial: ScriptedSerial,
    pub clock: ManualClock,
    /// Simulated time per `step`.
    pub tick: Duration,
}

impl SimMachine {
    pub fn new(heater_count: usize) -> Self {
        let slot = MoveSlot::new();
        SimMachine {
            motion: SimMotion::new(slot.clone()),
            slot,
            heaters: SimHeaters::new(heater_count),
            files: MemoryFiles::new(),
            network: ScriptedNetwork::default(),
            serial: ScriptedSerial::default(),
            clock: ManualClock::default(),
            tick: Duration::from_millis(10),
        }
    }

    pub fn peripherals(&mut self) -> Peripherals<'_> {
        Peripherals {
            motion: &mut self.motion,
            heaters: &mut self.heaters,
            files: &mut self.files,
            network: &mut self.network,
            serial: &mut self.serial,
            clock: &self.clock,
        }
    }

    /// Advances motion, heaters and the clock by one tick.
    pub fn step(&mut self) {
        self.motion.step();
        self.heaters.step();
        self.clock.advance(self.tick);
    }
}
