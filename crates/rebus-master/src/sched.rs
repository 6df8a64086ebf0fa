// SPDX-License-Identifier: MIT OR Apache-2.0
//! Delayed re-injection scheduler.
//!
//! A monotonic min-heap of pending actions behind a single timer. The
//! master loop polls [`Scheduler::next_ready`] inside its `select!`; the
//! future is re-created every loop turn, so scheduling an earlier action
//! than the current head re-arms the timer naturally.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tokio::time::{Duration, Instant};

struct Entry<T> {
    at: Instant,
    seq: u64,
    action: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Deadline first; insertion order breaks ties.
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

/// Min-heap timer queue for delayed actions.
pub struct Scheduler<T> {
    heap: BinaryHeap<Reverse<Entry<T>>>,
    seq: u64,
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Scheduler {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }
}

impl<T> Scheduler<T> {
    /// Create an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `action` to fire after `delay`.
    pub fn schedule(&mut self, delay: Duration, action: T) {
        let entry = Entry {
            at: Instant::now() + delay,
            seq: self.seq,
            action,
        };
        self.seq += 1;
        self.heap.push(Reverse(entry));
    }

    /// Number of pending actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether no action is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Wait for and pop the earliest action.
    ///
    /// Pends forever while the queue is empty; cancellation-safe (the pop
    /// happens only after the deadline has fully elapsed).
    pub async fn next_ready(&mut self) -> T {
        let deadline = match self.heap.peek() {
            Some(Reverse(entry)) => entry.at,
            None => return std::future::pending().await,
        };
        tokio::time::sleep_until(deadline).await;
        let Reverse(entry) = self.heap.pop().expect("scheduler head vanished");
        entry.action
    }
}
