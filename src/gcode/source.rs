// src/gcode/source.rs - command sources and the order they are served in
use std::fmt;

use super::buffer::CommandBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceId {
    Macro,
    Network,
    Serial,
    File,
}

/// Served in this order while no macro is open.
const EXTERNAL: [SourceId; 3] = [SourceId::Network, SourceId::Serial, SourceId::File];
/// An open macro runs to completion before anything else is read.
const MACRO_ONLY: [SourceId; 1] = [SourceId::Macro];

impl SourceId {
    pub const ALL: [SourceId; 4] = [SourceId::Macro, SourceId::Network, SourceId::Serial, SourceId::File];

    /// Interactive sources get a reply line for every command.
    pub fn is_interactive(self) -> bool {
        matches!(self, SourceId::Network | SourceId::Serial)
    }

    pub fn name(self) -> &'static str {
        match self {
            SourceId::Macro => "macro",
            SourceId::Network => "network",
            SourceId::Serial => "serial",
            SourceId::File => "file",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Sources eligible this tick, highest priority first.
pub fn arbitration_order(macro_open: bool) -> &'static [SourceId] {
    if macro_open { &MACRO_ONLY } else { &EXTERNAL }
}

/// One command buffer per source.
#[derive(Debug, Clone)]
pub struct SourceSet {
    buffers: [CommandBuffer; 4],
}

impl Default for SourceSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceSet {
    pub fn new() -> Self {
        SourceSet { buffers: SourceId::ALL.map(|id| CommandBuffer::new(id.name())) }
    }

    pub fn get(&self, id: SourceId) -> &CommandBuffer {
        &self.buffers[id.slot()]
    }

    pub fn get_mut(&mut self, id: SourceId) -> &mut CommandBuffer {
        &mut self.buffers[id.slot()]
    }

    /// First source in `order` holding a complete, unexecuted line.
    pub fn next_ready(&self, order: &[SourceId]) -> Option<SourceId> {
        order.iter().copied().find(|id| self.get(*id).is_ready())
    }
}
