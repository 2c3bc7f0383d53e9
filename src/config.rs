//! # Machine configuration
//!
//! Every section is optional; missing keys fall back to the defaults below.
//!
//! ```toml
//! [machine]
//! name = "bench rig"
//! extruders = 2
//! heaters = 3
//!
//! [axes.z]
//! max = 180.0
//! home_feedrate = 300.0
//!
//! [limits]
//! mode = "reject"
//!
//! [[tools]]
//! number = 0
//! drives = [0]
//! heaters = [1]
//! active_temperatures = [205.0]
//! standby_temperatures = [150.0]
//!
//! [tool_change]
//! park = [0.0, 190.0]
//!
//! [heaters]
//! hot_enough_to_extrude = 170.0
//! ```

// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

use krusty_shared::{AXES, Axis, MAX_EXTRUDERS};

/// Most probe points a `G32` series may use.
pub const MAX_PROBE_POINTS: usize = 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub machine: MachineConfig,
    #[serde(default)]
    pub axes: AxesConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub homing: HomingConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default = "default_tools")]
    pub tools: Vec<ToolConfig>,
    #[serde(default)]
    pub tool_change: ToolChangeConfig,
    #[serde(default)]
    pub heaters: HeatersConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub host: HostConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            machine: MachineConfig::default(),
            axes: AxesConfig::default(),
            limits: LimitsConfig::default(),
            homing: HomingConfig::default(),
            probe: ProbeConfig::default(),
            tools: default_tools(),
            tool_change: ToolChangeConfig::default(),
            heaters: HeatersConfig::default(),
            files: FilesConfig::default(),
            host: HostConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MachineConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_firmware_name")]
    pub firmware_name: String,
    #[serde(default = "default_extruders")]
    pub extruders: usize,
    /// Heater 0 is the bed.
    #[serde(default = "default_heater_count")]
    pub heaters: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            name: None,
            firmware_name: default_firmware_name(),
            extruders: default_extruders(),
            heaters: default_heater_count(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AxisConfig {
    #[serde(default)]
    pub min: f64,
    #[serde(default = "default_axis_max")]
    pub max: f64,
    /// mm/min
    #[serde(default = "default_home_feedrate")]
    pub home_feedrate: f64,
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self { min: 0.0, max: default_axis_max(), home_feedrate: default_home_feedrate() }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AxesConfig {
    #[serde(default)]
    pub x: AxisConfig,
    #[serde(default)]
    pub y: AxisConfig,
    #[serde(default = "default_z_axis")]
    pub z: AxisConfig,
}

impl Default for AxesConfig {
    fn default() -> Self {
        Self { x: AxisConfig::default(), y: AxisConfig::default(), z: default_z_axis() }
    }
}

impl AxesConfig {
    pub fn get(&self, axis: Axis) -> &AxisConfig {
        match axis {
            Axis::X => &self.x,
            Axis::Y => &self.y,
            Axis::Z => &self.z,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LimitMode {
    /// Out-of-range targets are pulled back to the nearest limit.
    Clamp,
    /// Out-of-range moves fail with a limit error.
    Reject,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_limit_mode")]
    pub mode: LimitMode,
    /// Only enforce limits on axes that have been homed.
    #[serde(default = "default_true")]
    pub require_homing: bool,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self { enabled: true, mode: default_limit_mode(), require_homing: true }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HomingConfig {
    #[serde(default = "default_homing_timeout")]
    pub timeout_secs: f64,
    /// Seek distance as a multiple of the axis length.
    #[serde(default = "default_overshoot")]
    pub overshoot: f64,
}

impl Default for HomingConfig {
    fn default() -> Self {
        Self { timeout_secs: default_homing_timeout(), overshoot: default_overshoot() }
    }
}

impl HomingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.max(0.0))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeConfig {
    /// Z height the probe travels at between points.
    #[serde(default = "default_dive_height")]
    pub dive_height: f64,
    /// How far below Z=0 a dive may go before giving up.
    #[serde(default = "default_max_depth")]
    pub max_depth: f64,
    #[serde(default = "default_probe_feedrate")]
    pub feedrate: f64,
    #[serde(default = "default_travel_feedrate")]
    pub travel_feedrate: f64,
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: f64,
    /// Z reported when the probe triggers (G31 Z).
    #[serde(default = "default_trigger_height")]
    pub trigger_height: f64,
    #[serde(default = "default_probe_points")]
    pub points: Vec<[f64; 2]>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            dive_height: default_dive_height(),
            max_depth: default_max_depth(),
            feedrate: default_probe_feedrate(),
            travel_feedrate: default_travel_feedrate(),
            timeout_secs: default_probe_timeout(),
            trigger_height: default_trigger_height(),
            points: default_probe_points(),
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.max(0.0))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolConfig {
    pub number: i64,
    /// Extruder indices, in the order of the E vector.
    #[serde(default)]
    pub drives: Vec<usize>,
    #[serde(default)]
    pub heaters: Vec<usize>,
    #[serde(default)]
    pub active_temperatures: Vec<f64>,
    #[serde(default)]
    pub standby_temperatures: Vec<f64>,
    #[serde(default)]
    pub offsets: [f64; AXES],
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolChangeConfig {
    /// XY park position visited between deselecting and selecting.
    #[serde(default)]
    pub park: Option<[f64; 2]>,
    #[serde(default = "default_true")]
    pub wait_for_temperature: bool,
    #[serde(default = "default_tool_change_timeout")]
    pub timeout_secs: f64,
}

impl Default for ToolChangeConfig {
    fn default() -> Self {
        Self { park: None, wait_for_temperature: true, timeout_secs: default_tool_change_timeout() }
    }
}

impl ToolChangeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.max(0.0))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeatersConfig {
    #[serde(default = "default_heat_timeout")]
    pub wait_timeout_secs: f64,
    /// Used by the simulated heaters.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Extruder drives refuse to move while a tool heater is below this.
    #[serde(default = "default_hot_enough_to_extrude")]
    pub hot_enough_to_extrude: f64,
    /// Starting value of the M302 switch.
    #[serde(default)]
    pub allow_cold_extrusion: bool,
}

impl Default for HeatersConfig {
    fn default() -> Self {
        Self {
            wait_timeout_secs: default_heat_timeout(),
            tolerance: default_tolerance(),
            hot_enough_to_extrude: default_hot_enough_to_extrude(),
            allow_cold_extrusion: false,
        }
    }
}

impl HeatersConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.wait_timeout_secs.max(0.0))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilesConfig {
    #[serde(default = "default_root")]
    pub root: String,
    #[serde(default = "default_gcode_dir")]
    pub gcode_dir: String,
    #[serde(default = "default_macro_dir")]
    pub macro_dir: String,
    #[serde(default = "default_web_dir")]
    pub web_dir: String,
    #[serde(default = "default_config_macro")]
    pub config_macro: String,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            gcode_dir: default_gcode_dir(),
            macro_dir: default_macro_dir(),
            web_dir: default_web_dir(),
            config_macro: default_config_macro(),
        }
    }
}

/// Joins `name` onto `dir` unless it already carries a directory.
pub fn resolve(dir: &str, name: &str) -> String {
    if name.contains('/') || dir.is_empty() {
        name.trim_start_matches('/').to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

impl FilesConfig {
    pub fn gcode(&self, name: &str) -> String {
        resolve(&self.gcode_dir, name)
    }

    pub fn macro_file(&self, name: &str) -> String {
        resolve(&self.macro_dir, name)
    }

    pub fn web(&self, name: &str) -> String {
        resolve(&self.web_dir, name)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default = "default_baud")]
    pub baud: u32,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self { tick_interval_ms: default_tick_interval(), serial: None, baud: default_baud() }
    }
}

impl Config {
    /// Cross-section consistency checks serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.machine.extruders > MAX_EXTRUDERS {
            return invalid(format!("at most {} extruders are supported", MAX_EXTRUDERS));
        }
        if self.machine.heaters == 0 {
            return invalid("at least one heater (the bed) is required".to_string());
        }
        for axis in Axis::ALL {
            let a = self.axes.get(axis);
            if a.min >= a.max {
                return invalid(format!("axis {} min {} must be below max {}", axis, a.min, a.max));
            }
            if a.home_feedrate <= 0.0 {
                return invalid(format!("axis {} home_feedrate must be > 0", axis));
            }
        }
        let mut numbers = HashSet::new();
        for tool in &self.tools {
            if tool.number < 0 {
                return invalid(format!("tool number {} must not be negative", tool.number));
            }
            if !numbers.insert(tool.number) {
                return invalid(format!("tool number {} defined twice", tool.number));
            }
            if let Some(d) = tool.drives.iter().find(|d| **d >= self.machine.extruders) {
                return invalid(format!("tool {} uses extruder {} beyond the {} configured", tool.number, d, self.machine.extruders));
            }
            if let Some(h) = tool.heaters.iter().find(|h| **h >= self.machine.heaters) {
                return invalid(format!("tool {} uses heater {} beyond the {} configured", tool.number, h, self.machine.heaters));
            }
            for (name, temps) in [("active", &tool.active_temperatures), ("standby", &tool.standby_temperatures)] {
                if !temps.is_empty() && temps.len() != tool.heaters.len() {
                    return invalid(format!("tool {} {} temperatures must match its {} heaters", tool.number, name, tool.heaters.len()));
                }
            }
        }
        if self.probe.points.len() < 3 || self.probe.points.len() > MAX_PROBE_POINTS {
            return invalid(format!("between 3 and {} probe points required, got {}", MAX_PROBE_POINTS, self.probe.points.len()));
        }
        if self.heaters.hot_enough_to_extrude < 0.0 {
            return invalid("heaters hot_enough_to_extrude must not be negative".to_string());
        }
        if self.host.tick_interval_ms == 0 {
            return invalid("host tick_interval_ms must be > 0".to_string());
        }
        Ok(())
    }
}

// Default value functions
fn default_true() -> bool { true }
fn default_firmware_name() -> String { "krusty-gcodes".to_string() }
fn default_extruders() -> usize { 1 }
fn default_heater_count() -> usize { 2 }
fn default_axis_max() -> f64 { 200.0 }
fn default_home_feedrate() -> f64 { 1800.0 }
fn default_z_axis() -> AxisConfig { AxisConfig { min: 0.0, max: 180.0, home_feedrate: 300.0 } }
fn default_limit_mode() -> LimitMode { LimitMode::Clamp }
fn default_homing_timeout() -> f64 { 30.0 }
fn default_overshoot() -> f64 { 1.5 }
fn default_dive_height() -> f64 { 5.0 }
fn default_max_depth() -> f64 { 2.0 }
fn default_probe_feedrate() -> f64 { 120.0 }
fn default_travel_feedrate() -> f64 { 6000.0 }
fn default_probe_timeout() -> f64 { 20.0 }
fn default_trigger_height() -> f64 { 0.7 }
fn default_probe_points() -> Vec<[f64; 2]> { vec![[15.0, 15.0], [185.0, 15.0], [100.0, 185.0]] }
fn default_tool_change_timeout() -> f64 { 300.0 }
fn default_heat_timeout() -> f64 { 600.0 }
fn default_tolerance() -> f64 { 1.0 }
fn default_hot_enough_to_extrude() -> f64 { 160.0 }
fn default_root() -> String { ".".to_string() }
fn default_gcode_dir() -> String { "gcodes".to_string() }
fn default_macro_dir() -> String { "sys".to_string() }
fn default_web_dir() -> String { "www".to_string() }
fn default_config_macro() -> String { "config.g".to_string() }
fn default_tick_interval() -> u64 { 1 }
fn default_baud() -> u32 { 250000 }

fn default_tools() -> Vec<ToolConfig> {
    vec![ToolConfig {
        number: 0,
        drives: vec![0],
        heaters: vec![1],
        active_temperatures: Vec::new(),
        standby_temperatures: Vec::new(),
        offsets: [0.0; AXES],
    }]
}

/// Load and validate configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let config: Config = match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                return Err(ConfigError::Toml(e));
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            return Err(ConfigError::Io(e));
        }
    };
    if let Err(e) = config.validate() {
        tracing::error!("Rejected config file '{}': {}", path, e);
        return Err(e);
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.machine.firmware_name, "krusty-gcodes");
        assert_eq!(config.axes.z.max, 180.0);
        assert_eq!(config.limits.mode, LimitMode::Clamp);
        assert_eq!(config.tools.len(), 1);
        assert_eq!(config.probe.points.len(), 3);
        assert_eq!(config.heaters.hot_enough_to_extrude, 160.0);
        assert!(!config.heaters.allow_cold_extrusion);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_success() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("printer.toml");
        let mut file = File::create(&file_path).unwrap();
        writeln!(
            file,
            "[limits]\nmode = 'reject'\n\n[axes.x]\nmax = 250.0\n\n[tool_change]\npark = [0.0, 190.0]\n\n[heaters]\nallow_cold_extrusion = true"
        )
        .unwrap();
        file.flush().unwrap();
        let config = load_config(file_path.to_str().unwrap()).unwrap();
        assert_eq!(config.limits.mode, LimitMode::Reject);
        assert_eq!(config.axes.x.max, 250.0);
        assert_eq!(config.tool_change.park, Some([0.0, 190.0]));
        assert!(config.heaters.allow_cold_extrusion);
        assert_eq!(config.heaters.hot_enough_to_extrude, 160.0);
        // Defaults for missing fields
        assert_eq!(config.axes.x.home_feedrate, 1800.0);
        assert_eq!(config.axes.z.max, 180.0);
    }

    #[test]
    fn test_load_config_missing_file() {
        let result = load_config("nonexistent_file.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("bad.toml");
        let mut file = File::create(&file_path).unwrap();
        writeln!(file, "not a valid toml").unwrap();
        file.flush().unwrap();
        let result = load_config(file_path.to_str().unwrap());
        assert!(matches!(result, Err(ConfigError::Toml(_))));
    }

    #[test]
    fn test_tools_are_validated() {
        let toml = r#"
        [machine]
        extruders = 2

        [[tools]]
        number = 0
        drives = [0]
        heaters = [1]

        [[tools]]
        number = 0
        drives = [1]
        heaters = [1]
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(msg)) if msg.contains("defined twice")));

        let config: Config = toml::from_str("[[tools]]\nnumber = 1\ndrives = [3]\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_resolve_paths() {
        let files = FilesConfig::default();
        assert_eq!(files.gcode("part.g"), "gcodes/part.g");
        assert_eq!(files.macro_file("sys/home.g"), "sys/home.g");
        assert_eq!(files.web("reprap.htm"), "www/reprap.htm");
    }
}
