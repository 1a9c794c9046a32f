use std::sync::Arc;

use histplay_core::VirtualTime;

use crate::task::{Task, TaskState};

/// One scheduled occurrence of a task.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub execution_time: VirtualTime,
    /// `0` one-shot, `>0` fixed-rate, `<0` fixed-delay (magnitude is the interval).
    pub period: i64,
    pub task: Arc<Task>,
}

/// Binary min-heap of [`QueueEntry`] ordered by execution time.
///
/// Heap positions are 1-based: slot `k` has children `2k` and `2k + 1` and
/// lives at `entries[k - 1]`. Entries with equal times come out in an
/// unspecified order; callers needing a strict order must use distinct times.
#[derive(Debug, Default)]
pub struct TaskQueue {
    entries: Vec<QueueEntry>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(128),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add(&mut self, entry: QueueEntry) {
        self.entries.push(entry);
        self.fix_up(self.entries.len());
    }

    pub fn peek_min(&self) -> Option<&QueueEntry> {
        self.entries.first()
    }

    /// Remove the earliest entry: the last entry moves to the root and sifts down.
    pub fn remove_min(&mut self) -> Option<QueueEntry> {
        if self.entries.is_empty() {
            return None;
        }
        let min = self.entries.swap_remove(0);
        self.fix_down(1);
        Some(min)
    }

    /// Move the root to `new_time` in place. Only the root can have become
    /// too large, so a single sift-down restores the heap.
    pub fn reschedule_min(&mut self, new_time: VirtualTime) {
        debug_assert!(!self.entries.is_empty(), "reschedule_min on empty queue");
        if let Some(root) = self.entries.first_mut() {
            root.execution_time = new_time;
            self.fix_down(1);
        }
    }

    /// Drop every entry whose task is cancelled, then re-heapify once.
    pub fn purge_cancelled(&mut self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|entry| entry.task.state() != TaskState::Cancelled);
        let removed = before - self.entries.len();
        if removed != 0 {
            self.heapify();
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn time(&self, k: usize) -> VirtualTime {
        self.entries[k - 1].execution_time
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.entries.swap(a - 1, b - 1);
    }

    fn fix_up(&mut self, mut k: usize) {
        while k > 1 {
            let parent = k >> 1;
            if self.time(parent) <= self.time(k) {
                break;
            }
            self.swap(parent, k);
            k = parent;
        }
    }

    fn fix_down(&mut self, mut k: usize) {
        let size = self.entries.len();
        loop {
            let mut child = k << 1;
            if child > size {
                break;
            }
            if child < size && self.time(child) > self.time(child + 1) {
                child += 1; // smaller of the two children
            }
            if self.time(k) <= self.time(child) {
                break;
            }
            self.swap(k, child);
            k = child;
        }
    }

    fn heapify(&mut self) {
        for k in (1..=self.entries.len() / 2).rev() {
            self.fix_down(k);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_heap(&self) -> bool {
        (2..=self.entries.len()).all(|k| self.time(k >> 1) <= self.time(k))
    }
}
