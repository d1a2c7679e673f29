//! Label stack for structured control flow (spec §3 "Label stack", §4.2).

use crate::error::{Error, Result};

/// The WAT construct kind a label-stack frame was opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstructKind {
    Block,
    Loop,
    If,
}

/// One frame of the label stack: the construct it was opened for, the
/// label a `br` at this depth resolves to, and whether falling off the end
/// of the body needs a defined end label.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: ConstructKind,
    /// For `block`/`if`: the end-of-construct label. For `loop`: the
    /// start-of-construct label (the backward branch target).
    pub continuation: String,
    /// The label marking fall-through past the end of the construct body.
    /// Equal to `continuation` for `block`/`if`; distinct for `loop`,
    /// whose continuation is the *start* label.
    pub end_label: String,
    /// Operand-stack depth recorded when this frame was opened, for
    /// reconciling stack state across branches out of the construct.
    pub stack_depth: usize,
    pub has_result: bool,
}

/// Per-function stack of break-continuation targets, indexed by break
/// depth (spec §3's "Label stack", §4.2).
#[derive(Debug, Clone, Default)]
pub struct LabelStack {
    frames: Vec<Frame>,
    next_label_id: u32,
}

impl LabelStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-initialize for a new function. Per spec §5, label counters must
    /// not leak across functions.
    pub fn reset(&mut self) {
        self.frames.clear();
        self.next_label_id = 0;
    }

    /// Allocate a fresh label name, unique within the function.
    pub fn fresh_label(&mut self, prefix: &str) -> String {
        let id = self.next_label_id;
        self.next_label_id += 1;
        format!("{prefix}_{id}")
    }

    #[must_use]
    pub fn height(&self) -> usize {
        self.frames.len()
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    #[must_use]
    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    /// Resolve a `br`/`br_if`/`br_table` depth (0 = innermost) to the
    /// frame it targets. `depth == height()` means "branch out of the
    /// function" and is the caller's responsibility to detect (the
    /// function's implicit exit frame is not pushed onto this stack).
    pub fn resolve(&self, depth: u32) -> Result<&Frame> {
        let height = self.frames.len();
        let idx = height
            .checked_sub(1 + depth as usize)
            .ok_or(Error::InvalidBranchDepth { depth, height })?;
        Ok(&self.frames[idx])
    }

    /// Same as `resolve`, but treats `depth == height()` as valid and
    /// returns `None` to mean "the function's own exit". Any depth beyond
    /// that is still an error.
    pub fn resolve_or_function_exit(&self, depth: u32) -> Result<Option<&Frame>> {
        let height = self.frames.len();
        if depth as usize == height {
            return Ok(None);
        }
        self.resolve(depth).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(continuation: &str) -> Frame {
        Frame {
            kind: ConstructKind::Block,
            continuation: continuation.to_string(),
            end_label: continuation.to_string(),
            stack_depth: 0,
            has_result: false,
        }
    }

    #[test]
    fn resolve_indexes_from_the_top() {
        let mut stack = LabelStack::new();
        stack.push(frame("outer"));
        stack.push(frame("inner"));
        assert_eq!(stack.resolve(0).unwrap().continuation, "inner");
        assert_eq!(stack.resolve(1).unwrap().continuation, "outer");
    }

    #[test]
    fn depth_at_height_is_function_exit() {
        let mut stack = LabelStack::new();
        stack.push(frame("outer"));
        assert!(stack.resolve_or_function_exit(1).unwrap().is_none());
        assert!(stack.resolve_or_function_exit(2).is_err());
    }

    #[test]
    fn out_of_range_depth_is_invalid_branch_depth() {
        let stack = LabelStack::new();
        assert!(matches!(
            stack.resolve(0),
            Err(Error::InvalidBranchDepth { depth: 0, height: 0 })
        ));
    }

    #[test]
    fn fresh_labels_are_unique_and_reset_clears_counter() {
        let mut stack = LabelStack::new();
        let a = stack.fresh_label("Bend");
        let b = stack.fresh_label("Bend");
        assert_ne!(a, b);
        stack.reset();
        let c = stack.fresh_label("Bend");
        assert_eq!(a, c);
    }
}
