// src/gcode/tool.rs - tool table: extruder drives, heaters and offsets per tool
use thiserror::Error;

use krusty_shared::{AXES, HeaterSubsystem, MAX_EXTRUDERS};

use crate::config::ToolConfig;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ToolError {
    #[error("tool number {0} already in use")]
    Duplicate(i64),
    #[error("tool {0} not defined")]
    Unknown(i64),
    #[error("tool {tool}: extruder {drive} out of range")]
    BadDrive { tool: i64, drive: usize },
    #[error("tool {tool}: heater {heater} out of range")]
    BadHeater { tool: i64, heater: usize },
    #[error("no tool selected")]
    NoneSelected,
    #[error("tool {tool} has {expected} heaters, got {found} temperatures")]
    TemperatureCount { tool: i64, expected: usize, found: usize },
    #[error("tool {0} is disabled by a heater fault")]
    HeaterFault(i64),
    #[error("tool {tool}: heater {heater} at {temperature:.1}C is too cold to extrude (minimum {minimum:.1}C)")]
    TooCold { tool: i64, heater: usize, temperature: f64, minimum: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tool {
    number: i64,
    drives: Vec<usize>,
    heaters: Vec<usize>,
    active_temperatures: Vec<f64>,
    standby_temperatures: Vec<f64>,
    offsets: [f64; AXES],
    active: bool,
    heater_fault: bool,
}

impl Tool {
    pub fn new(number: i64, drives: Vec<usize>, heaters: Vec<usize>, extruders: usize, heater_count: usize) -> Result<Self, ToolError> {
        if let Some(&drive) = drives.iter().find(|d| **d >= extruders.min(MAX_EXTRUDERS)) {
            return Err(ToolError::BadDrive { tool: number, drive });
        }
        if let Some(&heater) = heaters.iter().find(|h| **h >= heater_count) {
            return Err(ToolError::BadHeater { tool: number, heater });
        }
        let zeros = vec![0.0; heaters.len()];
        Ok(Tool {
            number,
            drives,
            heaters,
            active_temperatures: zeros.clone(),
            standby_temperatures: zeros,
            offsets: [0.0; AXES],
            active: false,
            heater_fault: false,
        })
    }

    pub fn from_config(config: &ToolConfig, extruders: usize, heater_count: usize) -> Result<Self, ToolError> {
        let mut tool = Tool::new(config.number, config.drives.clone(), config.heaters.clone(), extruders, heater_count)?;
        if !config.active_temperatures.is_empty() {
            tool.set_active_temperatures(&config.active_temperatures)?;
        }
        if !config.standby_temperatures.is_empty() {
            tool.set_standby_temperatures(&config.standby_temperatures)?;
        }
        tool.offsets = config.offsets;
        Ok(tool)
    }

    pub fn number(&self) -> i64 {
        self.number
    }

    pub fn drives(&self) -> &[usize] {
        &self.drives
    }

    pub fn heaters(&self) -> &[usize] {
        &self.heaters
    }

    pub fn offsets(&self) -> [f64; AXES] {
        self.offsets
    }

    pub fn set_offset(&mut self, axis: usize, offset: f64) {
        if let Some(o) = self.offsets.get_mut(axis) {
            *o = offset;
        }
    }

    pub fn active_temperatures(&self) -> &[f64] {
        &self.active_temperatures
    }

    pub fn standby_temperatures(&self) -> &[f64] {
        &self.standby_temperatures
    }

    fn check_count(&self, temps: &[f64]) -> Result<(), ToolError> {
        if temps.len() != self.heaters.len() {
            return Err(ToolError::TemperatureCount { tool: self.number, expected: self.heaters.len(), found: temps.len() });
        }
        Ok(())
    }

    pub fn set_active_temperatures(&mut self, temps: &[f64]) -> Result<(), ToolError> {
        self.check_count(temps)?;
        self.active_temperatures = temps.to_vec();
        Ok(())
    }

    pub fn set_standby_temperatures(&mut self, temps: &[f64]) -> Result<(), ToolError> {
        self.check_count(temps)?;
        self.standby_temperatures = temps.to_vec();
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Selects the tool and drives its heaters to operating temperature.
    pub fn activate(&mut self, heaters: &mut dyn HeaterSubsystem) {
        self.active = true;
        for (&h, &t) in self.heaters.iter().zip(&self.active_temperatures) {
            heaters.set_target(h, t);
        }
    }

    /// Deselects the tool and drops its heaters to standby.
    pub fn standby(&mut self, heaters: &mut dyn HeaterSubsystem) {
        self.active = false;
        for (&h, &t) in self.heaters.iter().zip(&self.standby_temperatures) {
            heaters.set_target(h, t);
        }
    }

    pub fn heaters_at_temperature(&self, heaters: &dyn HeaterSubsystem) -> bool {
        self.heaters.iter().all(|&h| heaters.is_at_temperature(h))
    }

    pub fn has_heater_fault(&self) -> bool {
        self.heater_fault
    }

    /// Sets or clears the fault flag if this tool uses `heater`. True when
    /// the flag changed.
    fn set_heater_fault(&mut self, heater: usize, faulted: bool) -> bool {
        if !self.heaters.contains(&heater) || self.heater_fault == faulted {
            return false;
        }
        self.heater_fault = faulted;
        true
    }

    /// Whether the extruder drives may move. A faulted tool never may; a cold
    /// one only when `cold` extrusion is allowed.
    pub fn check_can_drive(&self, heaters: &dyn HeaterSubsystem, cold: bool, minimum: f64) -> Result<(), ToolError> {
        if self.heater_fault {
            return Err(ToolError::HeaterFault(self.number));
        }
        if cold {
            return Ok(());
        }
        for &heater in &self.heaters {
            let temperature = heaters.temperature(heater);
            if temperature < minimum {
                return Err(ToolError::TooCold { tool: self.number, heater, temperature, minimum });
            }
        }
        Ok(())
    }

    pub fn describe(&self) -> String {
        let drives = self.drives.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(",");
        let heaters = self
            .heaters
            .iter()
            .zip(self.active_temperatures.iter().zip(&self.standby_temperatures))
            .map(|(h, (a, s))| format!("{} ({:.1}/{:.1})", h, a, s))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "Tool {} - drives: {}; heaters (active/standby temps): {}; offsets: {:.2}, {:.2}, {:.2}; status: {}{}",
            self.number,
            drives,
            heaters,
            self.offsets[0],
            self.offsets[1],
            self.offsets[2],
            if self.active { "selected" } else { "standby" },
            if self.heater_fault { " (heater fault)" } else { "" }
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolTable {
    tools: Vec<Tool>,
    current: Option<i64>,
}

impl ToolTable {
    pub fn from_config(configs: &[ToolConfig], extruders: usize, heater_count: usize) -> Result<Self, ToolError> {
        let mut table = ToolTable::default();
        for config in configs {
            table.add(Tool::from_config(config, extruders, heater_count)?)?;
        }
        Ok(table)
    }

    pub fn add(&mut self, tool: Tool) -> Result<(), ToolError> {
        if self.get(tool.number).is_some() {
            return Err(ToolError::Duplicate(tool.number));
        }
        tracing::info!(tool = tool.number, "tool defined");
        self.tools.push(tool);
        Ok(())
    }

    pub fn get(&self, number: i64) -> Option<&Tool> {
        self.tools.iter().find(|t| t.number == number)
    }

    pub fn get_mut(&mut self, number: i64) -> Option<&mut Tool> {
        self.tools.iter_mut().find(|t| t.number == number)
    }

    pub fn contains(&self, number: i64) -> bool {
        self.get(number).is_some()
    }

    pub fn current(&self) -> Option<&Tool> {
        self.current.and_then(|n| self.get(n))
    }

    pub fn current_number(&self) -> Option<i64> {
        self.current
    }

    /// Records the selection; heaters are handled by the caller.
    pub fn select(&mut self, number: Option<i64>) -> Result<(), ToolError> {
        if let Some(n) = number {
            if !self.contains(n) {
                return Err(ToolError::Unknown(n));
            }
        }
        self.current = number;
        Ok(())
    }

    /// Disables every tool using `heater`. Returns the tools newly disabled.
    pub fn flag_heater_fault(&mut self, heater: usize) -> Vec<i64> {
        self.tools.iter_mut().filter_map(|t| t.set_heater_fault(heater, true).then_some(t.number)).collect()
    }

    /// Re-enables the tools disabled by `heater`.
    pub fn clear_heater_fault(&mut self, heater: usize) -> Vec<i64> {
        self.tools.iter_mut().filter_map(|t| t.set_heater_fault(heater, false).then_some(t.number)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tool> {
        self.tools.iter()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krusty_simulator::SimHeaters;

    #[test]
    fn rejects_out_of_range_resources() {
        assert_eq!(Tool::new(0, vec![2], vec![1], 2, 3), Err(ToolError::BadDrive { tool: 0, drive: 2 }));
        assert_eq!(Tool::new(0, vec![0], vec![3], 2, 3), Err(ToolError::BadHeater { tool: 0, heater: 3 }));
    }

    #[test]
    fn duplicate_numbers_are_refused() {
        let mut table = ToolTable::default();
        table.add(Tool::new(1, vec![0], vec![1], 1, 2).unwrap()).unwrap();
        assert_eq!(table.add(Tool::new(1, vec![0], vec![1], 1, 2).unwrap()), Err(ToolError::Duplicate(1)));
        assert_eq!(table.select(Some(4)), Err(ToolError::Unknown(4)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn activate_and_standby_set_heater_targets() {
        let mut heaters = SimHeaters::new(3);
        let mut tool = Tool::new(0, vec![0], vec![1, 2], 1, 3).unwrap();
        tool.set_active_temperatures(&[200.0, 210.0]).unwrap();
        tool.set_standby_temperatures(&[150.0, 160.0]).unwrap();
        assert!(tool.set_active_temperatures(&[1.0]).is_err());

        tool.activate(&mut heaters);
        assert!(tool.is_active());
        assert_eq!(heaters.targets(), &[0.0, 200.0, 210.0]);

        tool.standby(&mut heaters);
        assert_eq!(heaters.targets(), &[0.0, 150.0, 160.0]);
        assert!(tool.describe().contains("status: standby"));
    }

    #[test]
    fn heater_fault_disables_every_tool_on_that_heater() {
        let mut table = ToolTable::default();
        table.add(Tool::new(0, vec![0], vec![1], 2, 3).unwrap()).unwrap();
        table.add(Tool::new(1, vec![1], vec![1, 2], 2, 3).unwrap()).unwrap();
        table.add(Tool::new(2, vec![1], vec![2], 2, 3).unwrap()).unwrap();

        assert_eq!(table.flag_heater_fault(1), vec![0, 1]);
        // Already flagged: nothing new to report.
        assert!(table.flag_heater_fault(1).is_empty());
        assert!(table.get(1).unwrap().has_heater_fault());
        assert!(!table.get(2).unwrap().has_heater_fault());
        assert!(table.get(0).unwrap().describe().ends_with("(heater fault)"));

        assert_eq!(table.clear_heater_fault(1), vec![0, 1]);
        assert!(table.iter().all(|t| !t.has_heater_fault()));
    }

    #[test]
    fn cold_or_faulted_tools_cannot_drive() {
        let mut heaters = SimHeaters::new(2).with_rate(200.0);
        let mut tool = Tool::new(0, vec![0], vec![1], 1, 2).unwrap();
        assert_eq!(
            tool.check_can_drive(&heaters, false, 160.0),
            Err(ToolError::TooCold { tool: 0, heater: 1, temperature: 20.0, minimum: 160.0 })
        );
        assert_eq!(tool.check_can_drive(&heaters, true, 160.0), Ok(()));

        heaters.set_target(1, 200.0);
        heaters.step();
        assert_eq!(tool.check_can_drive(&heaters, false, 160.0), Ok(()));

        tool.set_heater_fault(1, true);
        assert_eq!(tool.check_can_drive(&heaters, true, 160.0), Err(ToolError::HeaterFault(0)));
    }
}
