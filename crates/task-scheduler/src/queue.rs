//! Priority queue
//!
//! One FIFO lane per priority level. The most urgent non-empty lane is
//! served first, except when the head of a less urgent lane has waited past
//! the starvation threshold; the longest-waiting such head then goes first.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use common::error::{Error, Result};
use common::types::Priority;

/// Entry waiting in a lane
#[derive(Debug)]
struct Queued<T> {
    value: T,
    enqueued_at: Instant,
}

/// Bounded multi-lane priority queue
#[derive(Debug)]
pub struct PriorityQueue<T> {
    lanes: [VecDeque<Queued<T>>; 4],
    capacity: usize,
    starvation_threshold: Duration,
}

impl<T> PriorityQueue<T> {
    /// Creates an empty queue holding at most `capacity` entries
    pub fn new(capacity: usize, starvation_threshold: Duration) -> Self {
        Self {
            lanes: Default::default(),
            capacity,
            starvation_threshold,
        }
    }

    /// Appends `value` to the lane of `priority`
    pub fn push(&mut self, priority: Priority, value: T) -> Result<()> {
        let capacity = self.capacity;
        self.try_push(priority, value)
            .map_err(|_| Error::QueueFull(capacity))
    }

    /// Appends `value` to the lane of `priority`, handing it back when full
    pub fn try_push(&mut self, priority: Priority, value: T) -> std::result::Result<(), T> {
        if self.is_full() {
            return Err(value);
        }

        self.lanes[usize::from(priority.level())].push_back(Queued {
            value,
            enqueued_at: Instant::now(),
        });
        Ok(())
    }

    /// Takes the next entry to serve
    pub fn pop(&mut self) -> Option<(Priority, T)> {
        let now = Instant::now();
        let top = self.lanes.iter().position(|lane| !lane.is_empty())?;

        let mut lane = top;
        let mut longest_wait = Duration::ZERO;
        for (index, candidate) in self.lanes.iter().enumerate().skip(top + 1) {
            if let Some(head) = candidate.front() {
                let waited = now.saturating_duration_since(head.enqueued_at);
                if waited > self.starvation_threshold && waited > longest_wait {
                    lane = index;
                    longest_wait = waited;
                }
            }
        }

        let queued = self.lanes[lane].pop_front()?;
        Some((Priority::ALL[lane], queued.value))
    }

    /// Removes the first entry matching `predicate`
    pub fn remove_first(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Option<T> {
        for lane in self.lanes.iter_mut() {
            if let Some(index) = lane.iter().position(|queued| predicate(&queued.value)) {
                return lane.remove(index).map(|queued| queued.value);
            }
        }
        None
    }

    /// Removes every entry, most urgent lane first
    pub fn drain(&mut self) -> Vec<T> {
        self.lanes
            .iter_mut()
            .flat_map(|lane| lane.drain(..).map(|queued| queued.value))
            .collect()
    }

    /// Number of queued entries
    pub fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    /// Returns true if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }

    /// Returns true if no further entry fits
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Number of entries queued at `priority`
    pub fn lane_len(&self, priority: Priority) -> usize {
        self.lanes[usize::from(priority.level())].len()
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
