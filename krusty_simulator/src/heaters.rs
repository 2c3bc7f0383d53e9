// Heaters that ramp linearly toward their targets.

use krusty_shared::HeaterSubsystem;

pub const AMBIENT: f64 = 20.0;

#[derive(Debug, Clone)]
pub struct SimHeaters {
    current: Vec<f64>,
    target: Vec<f64>,
    /// degrees per step
    rate: f64,
    tolerance: f64,
    faults: Vec<bool>,
}

impl SimHeaters {
    pub fn new(count: usize) -> Self {
        SimHeaters {
            current: vec![AMBIENT; count],
            target: vec![0.0; count],
            rate: 50.0,
            tolerance: 1.0,
            faults: vec![false; count],
        }
    }

    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = rate;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn targets(&self) -> &[f64] {
        &self.target
    }

    /// Marks a heater as failed; it cools to ambient until reset.
    pub fn set_fault(&mut self, heater: usize) {
        if let Some(fault) = self.faults.get_mut(heater) {
            *fault = true;
        }
    }

    pub fn step(&mut self) {
        for ((current, target), fault) in self.current.iter_mut().zip(&self.target).zip(&self.faults) {
            let goal = if *fault { AMBIENT } else { target.max(AMBIENT) };
            let delta = (goal - *current).clamp(-self.rate, self.rate);
            *current += delta;
        }
    }
}

impl HeaterSubsystem for SimHeaters {
    fn set_target(&mut self, heater: usize, temperature: f64) {
        match self.target.get_mut(heater) {
            Some(target) => *target = temperature,
            None => tracing::warn!(heater, "sim: no such heater"),
        }
    }

    fn is_at_temperature(&self, heater: usize) -> bool {
        match (self.current.get(heater), self.target.get(heater)) {
            (Some(_), Some(target)) if *target <= AMBIENT => true,
            (Some(current), Some(target)) => (current - target).abs() <= self.tolerance,
            _ => false,
        }
    }

    fn temperature(&self, heater: usize) -> f64 {
        self.current.get(heater).copied().unwrap_or(AMBIENT)
    }

    fn is_faulted(&self, heater: usize) -> bool {
        self.faults.get(heater).copied().unwrap_or(false)
    }

    fn reset_fault(&mut self, heater: usize) {
        if let Some(fault) = self.faults.get_mut(heater) {
            *fault = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramps_to_target() {
        let mut heaters = SimHeaters::new(2).with_rate(100.0);
        heaters.set_target(1, 200.0);
        assert!(!heaters.is_at_temperature(1));
        heaters.step();
        assert!(!heaters.is_at_temperature(1));
        heaters.step();
        assert!(heaters.is_at_temperature(1));
        assert_eq!(heaters.temperature(1), 200.0);
        assert!(heaters.is_at_temperature(0));
    }

    #[test]
    fn faulted_heater_cools_until_reset() {
        let mut heaters = SimHeaters::new(2).with_rate(100.0);
        heaters.set_target(1, 200.0);
        heaters.step();
        heaters.set_fault(1);
        assert!(heaters.is_faulted(1));
        heaters.step();
        assert_eq!(heaters.temperature(1), AMBIENT);

        heaters.reset_fault(1);
        assert!(!heaters.is_faulted(1));
        heaters.step();
        heaters.step();
        assert_eq!(heaters.temperature(1), 200.0);
    }

    #[test]
    fn unknown_heater_is_never_ready() {
        let heaters = SimHeaters::new(1);
        assert!(!heaters.is_at_temperature(3));
    }
}
