// src/gcode/stack.rs - bounded save/restore of modal state for macros and M120/M121
use thiserror::Error;

use krusty_shared::FileHandle;

use super::source::SourceId;

pub const STACK_DEPTH: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StackError {
    #[error("push(): stack overflow, depth limit {} reached", STACK_DEPTH)]
    Full,
    #[error("pop(): stack underflow")]
    Empty,
    #[error("pop(): top of stack belongs to a running macro")]
    MacroFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameKind {
    /// Pushed by M120.
    #[default]
    Explicit,
    /// Pushed when a macro opened; `caller` waits for its end of file.
    Macro { caller: Option<SourceId> },
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ModalState {
    pub feedrate: f64,
    pub axes_relative: bool,
    pub drives_relative: bool,
    /// The macro file that was being read when this frame was pushed.
    pub file: Option<FileHandle>,
    pub kind: FrameKind,
}

#[derive(Debug, Default)]
pub struct ModalStateStack {
    frames: [ModalState; STACK_DEPTH],
    depth: usize,
}

impl ModalStateStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails without modifying the stack when it is full.
    pub fn push(&mut self, state: ModalState) -> Result<(), StackError> {
        if self.depth == STACK_DEPTH {
            return Err(StackError::Full);
        }
        self.frames[self.depth] = state;
        self.depth += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Result<ModalState, StackError> {
        if self.depth == 0 {
            return Err(StackError::Empty);
        }
        self.depth -= 1;
        Ok(self.frames[self.depth])
    }

    pub fn peek(&self) -> Option<&ModalState> {
        self.depth.checked_sub(1).map(|top| &self.frames[top])
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_full(&self) -> bool {
        self.depth == STACK_DEPTH
    }

    pub fn is_empty(&self) -> bool {
        self.depth == 0
    }

    pub fn macro_depth(&self) -> usize {
        self.iter().filter(|f| matches!(f.kind, FrameKind::Macro { .. })).count()
    }

    /// Bottom to top.
    pub fn iter(&self) -> impl Iterator<Item = &ModalState> {
        self.frames[..self.depth].iter()
    }

    pub fn clear(&mut self) {
        self.depth = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(feedrate: f64) -> ModalState {
        ModalState { feedrate, ..Default::default() }
    }

    #[test]
    fn push_beyond_depth_fails_unchanged() {
        let mut stack = ModalStateStack::new();
        for i in 0..STACK_DEPTH {
            stack.push(frame(i as f64)).unwrap();
        }
        assert!(stack.is_full());
        assert_eq!(stack.push(frame(99.0)), Err(StackError::Full));
        assert_eq!(stack.depth(), STACK_DEPTH);
        assert_eq!(stack.peek().map(|f| f.feedrate), Some((STACK_DEPTH - 1) as f64));
    }

    #[test]
    fn pop_on_empty_fails() {
        let mut stack = ModalStateStack::new();
        assert_eq!(stack.pop(), Err(StackError::Empty));
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn pops_in_reverse_order() {
        let mut stack = ModalStateStack::new();
        stack.push(frame(1.0)).unwrap();
        stack
            .push(ModalState { kind: FrameKind::Macro { caller: Some(SourceId::Serial) }, ..frame(2.0) })
            .unwrap();
        assert_eq!(stack.macro_depth(), 1);
        assert_eq!(stack.pop().map(|f| f.feedrate), Ok(2.0));
        assert_eq!(stack.pop().map(|f| f.feedrate), Ok(1.0));
        assert!(stack.is_empty());
    }
}
