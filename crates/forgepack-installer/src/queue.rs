use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use tracing::debug;

use crate::task::{BuildStatus, Task};

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    key: (usize, u64),
    pkg_id: String,
}

/// Priority queue of build tasks keyed by `(priority, sequence)`, popped
/// minimum first.
///
/// The heap does not support arbitrary removal, so cancellation and
/// reprioritization use lazy deletion: the registry entry is replaced (or
/// dropped) and the stale heap entry evaporates when popped. The registry is
/// the source of truth; a heap entry is live only while its sequence matches
/// the registered task's.
#[derive(Debug, Default)]
pub struct TaskQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    tasks: HashMap<String, Task>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn contains(&self, pkg_id: &str) -> bool {
        self.tasks.contains_key(pkg_id)
    }

    pub fn get(&self, pkg_id: &str) -> Option<&Task> {
        self.tasks.get(pkg_id)
    }

    pub fn get_mut(&mut self, pkg_id: &str) -> Option<&mut Task> {
        self.tasks.get_mut(pkg_id)
    }

    /// Queue (or requeue) a task. Any previous task for the id becomes a
    /// stale heap entry.
    pub fn push(&mut self, task: Task) {
        let pkg_id = task.pkg_id().to_string();
        if let Some(old) = self.tasks.get_mut(&pkg_id) {
            old.status = BuildStatus::Removed;
        }
        self.heap.push(Reverse(Entry {
            key: task.key(),
            pkg_id: pkg_id.clone(),
        }));
        debug!(%pkg_id, key = ?task.key(), "queued task");
        self.tasks.insert(pkg_id, task);
    }

    /// Remove and return the lowest-keyed live task, discarding stale
    /// entries along the way.
    pub fn pop(&mut self) -> Option<Task> {
        while let Some(Reverse(entry)) = self.heap.pop() {
            let live = match self.tasks.get(&entry.pkg_id) {
                Some(task) => {
                    task.status() != BuildStatus::Removed && task.key() == entry.key
                }
                None => false,
            };
            if !live {
                continue;
            }
            let mut task = self
                .tasks
                .remove(&entry.pkg_id)
                .expect("registry entry checked above");
            task.status = BuildStatus::Dequeued;
            return Some(task);
        }
        None
    }

    /// Drop the task for an id, leaving its heap entry to evaporate.
    pub fn remove(&mut self, pkg_id: &str) -> Option<Task> {
        let mut task = self.tasks.remove(pkg_id)?;
        task.status = BuildStatus::Removed;
        debug!(%pkg_id, "removed task");
        Some(task)
    }

    /// Whether the next live task has no uninstalled dependencies. Discards
    /// stale heap entries encountered while peeking.
    pub fn next_is_priority_zero(&mut self) -> bool {
        while let Some(Reverse(entry)) = self.heap.peek() {
            let live = match self.tasks.get(&entry.pkg_id) {
                Some(task) => {
                    task.status() != BuildStatus::Removed && task.key() == entry.key
                }
                None => false,
            };
            if live {
                return entry.key.0 == 0;
            }
            self.heap.pop();
        }
        false
    }

    pub fn ids(&self) -> Vec<String> {
        self.tasks.keys().cloned().collect()
    }
}
