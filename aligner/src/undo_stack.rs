use std::sync::Arc;

use hashbrown::HashMap;
use tracing::{error, warn};

use crate::command::{Command, CommandKind};
use crate::error::CommandError;
use crate::slice::SliceId;

/// Stack state to return to when a unit fails part way through.
#[derive(Debug)]
pub struct Checkpoint {
    undo_len: usize,
    redo_stack: Vec<Arc<Command>>,
}

#[derive(Debug, Clone, Copy)]
struct OpenBatch {
    depth: usize,
    start: usize,
}

/// Undo and redo stacks of executed commands, plus the per-slice history
/// of commands currently in effect.
///
/// A batch is stored between two `BatchMarker` entries and is undone or
/// redone as one unit. Nested `begin_batch` calls join the outer batch.
#[derive(Debug, Default)]
pub struct CommandStack {
    undo_stack: Vec<Arc<Command>>,
    redo_stack: Vec<Arc<Command>>,
    slice_history: HashMap<SliceId, Vec<Arc<Command>>>,
    batch: Option<OpenBatch>,
    max_steps: Option<usize>,
}

impl CommandStack {
    pub fn new(max_steps: Option<usize>) -> Self {
        if let Some(max_steps) = max_steps {
            assert!(max_steps > 0, "undo stack must allow at least one step");
        }
        Self {
            max_steps,
            ..Self::default()
        }
    }

    pub fn push_executed(&mut self, command: Arc<Command>) {
        self.redo_stack.clear();
        self.record(&command);
        self.undo_stack.push(command);
        self.trim_to_limit();
    }

    pub fn begin_batch(&mut self) {
        match &mut self.batch {
            Some(batch) => batch.depth += 1,
            None => {
                self.batch = Some(OpenBatch {
                    depth: 1,
                    start: self.undo_stack.len(),
                });
                self.undo_stack.push(Arc::new(Command::BatchMarker));
            }
        }
    }

    pub fn end_batch(&mut self) {
        let Some(batch) = &mut self.batch else {
            warn!("end_batch called without an open batch");
            return;
        };
        batch.depth -= 1;
        if batch.depth > 0 {
            return;
        }
        let start = batch.start;
        self.batch = None;

        if self.undo_stack.len() == start + 1 {
            self.undo_stack.pop();
        } else {
            self.undo_stack.push(Arc::new(Command::BatchMarker));
            self.trim_to_limit();
        }
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            undo_len: self.undo_stack.len(),
            redo_stack: self.redo_stack.clone(),
        }
    }

    /// Drops every command pushed since `checkpoint` and brings back the redo
    /// stack seen then. The commands must already be reverted.
    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        let start = checkpoint.undo_len.min(self.undo_stack.len());
        let dropped: Vec<Arc<Command>> = self.undo_stack.drain(start..).collect();
        for command in dropped.iter() {
            self.forget(command);
        }
        self.redo_stack = checkpoint.redo_stack;
    }

    pub fn is_batch_open(&self) -> bool {
        self.batch.is_some()
    }

    /// Removes the next unit to undo, top first. Nothing is removed when the
    /// markers do not pair up.
    pub fn take_undo_run(&mut self) -> Result<Option<Vec<Arc<Command>>>, CommandError> {
        if self.batch.is_some() {
            error!("Undo requested while a batch is still open");
            return Err(CommandError::UnmatchedBatchMarker);
        }
        take_run(&mut self.undo_stack)
    }

    /// Removes the next unit to redo, in execution order.
    pub fn take_redo_run(&mut self) -> Result<Option<Vec<Arc<Command>>>, CommandError> {
        if self.batch.is_some() {
            error!("Redo requested while a batch is still open");
            return Err(CommandError::UnmatchedBatchMarker);
        }
        take_run(&mut self.redo_stack)
    }

    pub fn finish_undo(&mut self, run: Vec<Arc<Command>>) {
        for command in run.iter() {
            self.forget(command);
        }
        self.redo_stack.extend(run);
    }

    pub fn finish_redo(&mut self, run: Vec<Arc<Command>>) {
        for command in run.iter() {
            self.record(command);
        }
        self.undo_stack.extend(run);
    }

    /// Puts back a run taken by `take_undo_run` that could not be undone.
    pub fn restore_undo_run(&mut self, run: Vec<Arc<Command>>) {
        self.undo_stack.extend(run.into_iter().rev());
    }

    pub fn restore_redo_run(&mut self, run: Vec<Arc<Command>>) {
        self.redo_stack.extend(run.into_iter().rev());
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo_stack.len()
    }

    pub fn undo_message(&self) -> String {
        describe_top(&self.undo_stack)
    }

    pub fn redo_message(&self) -> String {
        describe_top(&self.redo_stack)
    }

    /// Commands currently in effect for `slice_id`, in execution order.
    pub fn slice_history(&self, slice_id: SliceId) -> Vec<Arc<Command>> {
        self.slice_history
            .get(&slice_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.slice_history.clear();
        self.batch = None;
    }

    fn record(&mut self, command: &Arc<Command>) {
        if let Some(slice) = command.slice() {
            self.slice_history
                .entry(slice.id())
                .or_default()
                .push(Arc::clone(command));
        }
    }

    fn forget(&mut self, command: &Arc<Command>) {
        let Some(slice) = command.slice() else {
            return;
        };
        if let Some(history) = self.slice_history.get_mut(&slice.id()) {
            if let Some(position) = history.iter().rposition(|c| Arc::ptr_eq(c, command)) {
                history.remove(position);
            }
        }
    }

    // Slice histories are kept, they still describe the live session.
    fn trim_to_limit(&mut self) {
        let Some(max_steps) = self.max_steps else {
            return;
        };
        if self.batch.is_some() {
            return;
        }
        while self.undo_stack.len() > max_steps {
            let oldest = if self.undo_stack[0].is_batch_marker() {
                self.undo_stack[1..]
                    .iter()
                    .position(|c| c.is_batch_marker())
                    .map_or(self.undo_stack.len(), |end| end + 2)
            } else {
                1
            };
            self.undo_stack.drain(..oldest);
        }
    }
}

fn take_run(stack: &mut Vec<Arc<Command>>) -> Result<Option<Vec<Arc<Command>>>, CommandError> {
    let Some(top) = stack.last() else {
        return Ok(None);
    };
    let run_len = if top.is_batch_marker() {
        let below = &stack[..stack.len() - 1];
        match below.iter().rposition(|c| c.is_batch_marker()) {
            Some(start) => stack.len() - start,
            None => {
                error!("Batch marker without its pair, stack left unchanged");
                return Err(CommandError::UnmatchedBatchMarker);
            }
        }
    } else {
        1
    };
    let start = stack.len() - run_len;
    Ok(Some(stack.drain(start..).rev().collect()))
}

fn describe_top(stack: &[Arc<Command>]) -> String {
    match stack {
        [] => "(None)".to_string(),
        [.., inner, top] if top.is_batch_marker() && !inner.is_batch_marker() => {
            format!("({} [batch])", inner.kind())
        }
        [.., top] if top.kind() == CommandKind::BatchMarker => "(Batch)".to_string(),
        [.., top] => format!("({})", top.kind()),
    }
}
