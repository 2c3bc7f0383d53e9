// krusty_simulator: deterministic stand-ins for every service the G-code dispatcher talks to

pub mod heaters;
pub mod machine;
pub mod motion;
pub mod origins;
pub mod storage;

pub use heaters::SimHeaters;
pub use machine::{ManualClock, SimMachine};
pub use motion::SimMotion;
pub use origins::{ScriptedNetwork, ScriptedSerial};
pub use storage::MemoryFiles;
