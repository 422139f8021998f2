//! Deferred task queue
//!
//! Work the loader must not do synchronously (style flushes, evaluation of
//! cached modules, cache persistence, re-reporting callback errors) is queued
//! here and run when the embedder drives the loader.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::module::loader::ModuleLoader;

pub(crate) type Task = Box<dyn FnOnce(&ModuleLoader)>;

struct ScheduledTask {
    not_before: Option<Instant>,
    task: Task,
}

/// FIFO of deferred tasks, some with a not-before deadline
#[derive(Default)]
pub struct TaskQueue {
    tasks: VecDeque<ScheduledTask>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a task to run on the next drive
    pub(crate) fn push(&mut self, task: Task) {
        self.tasks.push_back(ScheduledTask {
            not_before: None,
            task,
        });
    }

    /// Queue a task that may not run before `delay` has elapsed
    pub(crate) fn push_after(&mut self, delay: Duration, task: Task) {
        let not_before = if delay.is_zero() {
            None
        } else {
            Some(Instant::now() + delay)
        };
        self.tasks.push_back(ScheduledTask { not_before, task });
    }

    /// Remove the oldest task that is due at `now`
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<Task> {
        let index = self
            .tasks
            .iter()
            .position(|t| t.not_before.map_or(true, |due| due <= now))?;
        self.tasks.remove(index).map(|t| t.task)
    }

    /// Earliest instant at which a queued task becomes due
    pub fn next_due(&self) -> Option<Instant> {
        let now = Instant::now();
        self.tasks
            .iter()
            .map(|t| t.not_before.unwrap_or(now))
            .min()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
