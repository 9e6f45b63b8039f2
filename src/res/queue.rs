//! The loading queue: a deque of pending resources kept roughly sorted by
//! loading priority.
//!
//! Full sorts per frame are wasted work for a queue that drains anyway, so
//! ordering is amortized: each tick refreshes a bounded number of priority
//! values and runs a single reverse bubble pass. A queue of length `n` is
//! fully ordered after at most `n` ticks, and entries with equal priority
//! keep their insertion order.

use std::collections::VecDeque;
use std::sync::Arc;

use super::resource::Resource;

/// Priority values refreshed per tick.
const MAX_REFRESHES_PER_TICK: usize = 50;

pub(crate) struct QueueEntry {
    pub priority: f32,
    pub res: Arc<Resource>,
}

pub(crate) struct LoadingQueue {
    entries: VecDeque<QueueEntry>,
    refresh_cursor: usize,
}

impl LoadingQueue {
    pub fn new() -> Self {
        LoadingQueue {
            entries: VecDeque::new(),
            refresh_cursor: 0,
        }
    }

    pub fn push_back(&mut self, res: Arc<Resource>, now_us: u64) {
        let priority = res.loading_priority(now_us);
        self.entries.push_back(QueueEntry { priority, res });
    }

    /// Front insertion for blocking acquires; loads before everything else.
    pub fn push_front(&mut self, res: Arc<Resource>) {
        self.entries.push_front(QueueEntry {
            priority: 0.0,
            res,
        });
    }

    pub fn pop_front(&mut self) -> Option<QueueEntry> {
        self.entries.pop_front()
    }

    /// Removes the entry for `res`, if queued. Order of the remaining
    /// entries is preserved.
    pub fn remove(&mut self, res: &Arc<Resource>) -> bool {
        if let Some(idx) = self
            .entries
            .iter()
            .position(|e| Arc::ptr_eq(&e.res, res))
        {
            self.entries.remove(idx);
            true
        } else {
            false
        }
    }

    pub fn drain_all(&mut self) -> Vec<QueueEntry> {
        self.refresh_cursor = 0;
        self.entries.drain(..).collect()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// One amortized ordering step: refresh up to
    /// [`MAX_REFRESHES_PER_TICK`] priority values (round-robin over the
    /// queue), then one reverse bubble pass.
    pub fn tick(&mut self, now_us: u64) {
        let len = self.entries.len();
        if len == 0 {
            self.refresh_cursor = 0;
            return;
        }

        for _ in 0..len.min(MAX_REFRESHES_PER_TICK) {
            if self.refresh_cursor >= len {
                self.refresh_cursor = 0;
            }

            let entry = &mut self.entries[self.refresh_cursor];
            entry.priority = entry.res.loading_priority(now_us);
            self.refresh_cursor += 1;
        }

        // strict less-than keeps equal-priority entries stable
        for i in (1..len).rev() {
            if self.entries[i].priority < self.entries[i - 1].priority {
                self.entries.swap(i, i - 1);
            }
        }
    }
}
