//! Cooperative delayed-task scheduler
//!
//! Tasks are plain data drained by the owning context on its own tick, so a
//! callback never runs re-entrantly inside another operation. Cancelling a
//! scope (a weapon or an owner) removes its tasks synchronously; nothing
//! scheduled under that scope surfaces from `drain_due` afterwards.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use crate::util::time::TimeMs;

/// Handle to a scheduled task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

#[derive(Debug)]
struct Entry<S, T> {
    scope: S,
    task: T,
}

/// Scheduler of delayed tasks of type `T` grouped by cancellation scope `S`
#[derive(Debug)]
pub struct Scheduler<S, T> {
    /// Ordered by due time, ties by scheduling order
    queue: BTreeMap<(TimeMs, TaskId), Entry<S, T>>,
    due_times: HashMap<TaskId, TimeMs>,
    next_id: u64,
}

impl<S, T> Scheduler<S, T>
where
    S: Copy + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            queue: BTreeMap::new(),
            due_times: HashMap::new(),
            next_id: 0,
        }
    }

    /// Run `task` once `after_ms` has elapsed from `now`
    pub fn schedule(&mut self, now: TimeMs, after_ms: TimeMs, scope: S, task: T) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        let due = now.saturating_add(after_ms);
        self.queue.insert((due, id), Entry { scope, task });
        self.due_times.insert(id, due);
        id
    }

    /// Cancel one task; returns whether it was still pending
    pub fn cancel(&mut self, id: TaskId) -> bool {
        match self.due_times.remove(&id) {
            Some(due) => self.queue.remove(&(due, id)).is_some(),
            None => false,
        }
    }

    /// Cancel every task in `scope`; returns how many were dropped
    pub fn cancel_scope(&mut self, scope: S) -> usize {
        let doomed: Vec<(TimeMs, TaskId)> = self
            .queue
            .iter()
            .filter(|(_, entry)| entry.scope == scope)
            .map(|(key, _)| *key)
            .collect();
        for key in &doomed {
            self.queue.remove(key);
            self.due_times.remove(&key.1);
        }
        doomed.len()
    }

    pub fn is_pending(&self, id: TaskId) -> bool {
        self.due_times.contains_key(&id)
    }

    /// Remove and return every task due at or before `now`, earliest first
    pub fn drain_due(&mut self, now: TimeMs) -> Vec<(S, T)> {
        let mut due = Vec::new();
        while let Some(entry) = self.queue.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, id), entry) = entry.remove_entry();
            self.due_times.remove(&id);
            due.push((entry.scope, entry.task));
        }
        due
    }

    /// Due time of the earliest pending task
    pub fn next_due(&self) -> Option<TimeMs> {
        self.queue.keys().next().map(|(due, _)| *due)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<S, T> Default for Scheduler<S, T>
where
    S: Copy + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
