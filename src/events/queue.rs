//! Indexed binary min-heap of timed events
//!
//! Every schedulable object in the simulation (reaction instance,
//! compartment umbrella, wait list, delayed release, sampler) is keyed by
//! an [`EventKey`] and lives in exactly one [`EventQueue`] at a time. The
//! queue supports O(log n) insert, remove and reschedule-in-place, which
//! is what makes Next-Reaction-Method updates cheap.
//!
//! # Layout
//!
//! The heap is array-backed with a sentinel at slot 0 whose time is −∞,
//! so the parent walk `i/2` never needs an underflow check. A side table
//! maps each enqueued key to its current heap slot; it is maintained on
//! every swap, which is the indexed part of the structure.
//!
//! # New-minimum reporting
//!
//! Mutating operations report whether the entry at slot 1 changed. The
//! engine uses this to cascade: a wait list whose earliest release moved
//! re-enqueues itself in its compartment, a compartment or umbrella whose
//! earliest sub-event moved schedules itself for update.
//!
//! # Ordering
//!
//! Among events with identical times the order is unspecified but is a
//! pure function of the operation history, which is what trajectory-level
//! determinism requires.

use crate::sim::arena::{CompartmentId, InstanceId};
use std::collections::HashMap;

/// Identity of a schedulable event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKey {
    /// A reaction instance (plain, fire-once or umbrella shaped)
    Reaction(InstanceId),
    /// A compartment's own umbrella event in the main queue
    Compartment(CompartmentId),
    /// The wait list of a compartment, enqueued in that compartment
    WaitList(CompartmentId),
    /// A single delayed release inside a wait list's queue
    Release(u32),
    /// The periodic sampler on the parallel queue
    Sampler,
}

#[derive(Debug, Clone, Copy)]
struct HeapEntry {
    time: f64,
    key: EventKey,
}

/// Array-backed indexed binary min-heap with a base time.
///
/// The base time is the current time of the queue. Different queues run
/// at different relative speeds (see the umbrella instance), so each
/// carries its own clock.
#[derive(Debug, Clone)]
pub struct EventQueue {
    base_time: f64,
    /// heap[0] is the −∞ sentinel; its key is never read.
    heap: Vec<HeapEntry>,
    positions: HashMap<EventKey, usize>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::with_base_time(0.0)
    }

    pub fn with_base_time(base_time: f64) -> Self {
        Self {
            base_time,
            heap: vec![HeapEntry {
                time: f64::NEG_INFINITY,
                key: EventKey::Sampler,
            }],
            positions: HashMap::new(),
        }
    }

    pub fn base_time(&self) -> f64 {
        self.base_time
    }

    pub fn set_base_time(&mut self, t: f64) {
        self.base_time = t;
    }

    pub fn is_empty(&self) -> bool {
        self.heap.len() == 1
    }

    /// Number of enqueued events.
    pub fn len(&self) -> usize {
        self.heap.len() - 1
    }

    /// Earliest event time, or +∞ when empty.
    pub fn next_time(&self) -> f64 {
        if self.is_empty() {
            f64::INFINITY
        } else {
            self.heap[1].time
        }
    }

    /// Earliest event, if any.
    pub fn next_key(&self) -> Option<EventKey> {
        if self.is_empty() {
            None
        } else {
            Some(self.heap[1].key)
        }
    }

    pub fn contains(&self, key: EventKey) -> bool {
        self.positions.contains_key(&key)
    }

    /// Scheduled time of an enqueued event.
    pub fn time_of(&self, key: EventKey) -> Option<f64> {
        self.positions.get(&key).map(|&i| self.heap[i].time)
    }

    /// Insert `key` at `time`, or reposition it if already enqueued.
    ///
    /// Returns true when the earliest entry changed.
    pub fn enqueue(&mut self, key: EventKey, time: f64) -> bool {
        debug_assert!(!time.is_nan(), "event time is NaN");
        if let Some(&i) = self.positions.get(&key) {
            if time < self.heap[i].time {
                self.bubble_up(HeapEntry { time, key }, i)
            } else {
                self.bubble_down(HeapEntry { time, key }, i)
            }
        } else {
            let i = self.heap.len();
            self.heap.push(HeapEntry { time, key });
            self.positions.insert(key, i);
            self.bubble_up(HeapEntry { time, key }, i)
        }
    }

    /// Remove an event. Returns true when the earliest entry changed;
    /// removing an event that is not enqueued is a no-op.
    pub fn dequeue(&mut self, key: EventKey) -> bool {
        let Some(i) = self.positions.remove(&key) else {
            return false;
        };
        let last = self.heap.pop().expect("sentinel always present");
        if i == self.heap.len() {
            // Removed the trailing entry; nothing to re-place.
            return i == 1 || self.is_empty();
        }
        if self.is_empty() {
            return true;
        }
        // Re-place the old trailing entry at the hole, whichever way it
        // has to move.
        let up = last.time < self.heap[i >> 1].time;
        let min_changed = if up {
            self.bubble_up(last, i)
        } else {
            self.bubble_down(last, i)
        };
        min_changed || i == 1
    }

    fn bubble_up(&mut self, entry: HeapEntry, mut i: usize) -> bool {
        let t = entry.time;
        let mut parent = i >> 1;
        // heap[0] is −∞, so this loop cannot walk past the sentinel.
        while self.heap[parent].time > t {
            let moved = self.heap[parent];
            self.heap[i] = moved;
            self.positions.insert(moved.key, i);
            i = parent;
            parent = i >> 1;
        }
        self.heap[i] = entry;
        self.positions.insert(entry.key, i);
        i == 1
    }

    fn bubble_down(&mut self, entry: HeapEntry, mut i: usize) -> bool {
        let started_at_min = i == 1;
        let t = entry.time;
        let size = self.heap.len();
        loop {
            let lhs = i << 1;
            let rhs = lhs + 1;
            let next = if rhs < size {
                // Both subtrees exist
                if !(self.heap[lhs].time < t || self.heap[rhs].time < t) {
                    break;
                }
                if self.heap[lhs].time < self.heap[rhs].time {
                    lhs
                } else {
                    rhs
                }
            } else if lhs < size {
                // Left subtree only
                if !(self.heap[lhs].time < t) {
                    break;
                }
                lhs
            } else {
                break;
            };

            let moved = self.heap[next];
            self.heap[i] = moved;
            self.positions.insert(moved.key, i);
            i = next;
        }
        self.heap[i] = entry;
        self.positions.insert(entry.key, i);
        started_at_min
    }

    /// Verify the heap invariant and the index table. Test support.
    #[doc(hidden)]
    pub fn check_invariants(&self) -> bool {
        for i in 2..self.heap.len() {
            if self.heap[i].time < self.heap[i >> 1].time {
                return false;
            }
        }
        if self.positions.len() != self.heap.len() - 1 {
            return false;
        }
        self.positions
            .iter()
            .all(|(key, &i)| i >= 1 && i < self.heap.len() && self.heap[i].key == *key)
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
