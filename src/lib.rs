// src/lib.rs - krusty-gcodes: G-code command parsing and sequencing for a printer host
pub mod config;
pub mod files;
pub mod gcode;
pub mod host;
pub mod print_job;

pub use config::{Config, ConfigError, load_config};
pub use gcode::{Dispatcher, GCodeError, SourceId};
pub use print_job::{PrintJob, PrintStatus};
