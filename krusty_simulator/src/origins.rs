// Scripted command origins that record every reply.

use std::collections::VecDeque;

use krusty_shared::{NetworkSource, SerialLine};

#[derive(Debug, Default)]
pub struct ScriptedNetwork {
    incoming: VecDeque<Vec<u8>>,
    pub replies: Vec<String>,
}

impl ScriptedNetwork {
    pub fn push(&mut self, line: &str) {
        self.incoming.push_back(line.as_bytes().to_vec());
    }
}

impl NetworkSource for ScriptedNetwork {
    fn has_pending(&self) -> bool {
        !self.incoming.is_empty()
    }

    fn next_line(&mut self) -> Option<Vec<u8>> {
        self.incoming.pop_front()
    }

    fn reply(&mut self, line: &str) {
        self.replies.push(line.to_string());
    }
}

#[derive(Debug, Default)]
pub struct ScriptedSerial {
    incoming: VecDeque<u8>,
    pub replies: Vec<String>,
}

impl ScriptedSerial {
    /// Queues raw bytes; include the line terminator.
    pub fn send(&mut self, text: &str) {
        self.incoming.extend(text.bytes());
    }

    pub fn pending_bytes(&self) -> usize {
        self.incoming.len()
    }
}

impl SerialLine for ScriptedSerial {
    fn byte_available(&self) -> bool {
        !self.incoming.is_empty()
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.incoming.pop_front()
    }

    fn write_line(&mut self, line: &str) {
        self.replies.push(line.to_string());
    }
}
