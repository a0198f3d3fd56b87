//! Umbrella scheduling state
//!
//! An umbrella is both an event in its parent queue and a queue of
//! sub-events. Sub-events evolve in a local time `τ` that advances at
//! `a_umbrella` times the parent's rate; the parent sees the earliest
//! sub-event projected back into parent time:
//!
//! ```text
//! t_parent = last_base_t + (τ_min − local_base) / a_umbrella
//! ```
//!
//! Two things embed this state: umbrella-shaped reaction instances (their
//! propensity is `c · H`, re-evaluated on update) and compartments (unit
//! propensity: a compartment's queue runs at the main clock's rate, and the
//! umbrella machinery just keeps the hierarchy composable).
//!
//! The local advance is lazy: nothing moves until an update or a
//! sub-event lookup asks for the fresh local base, at which point the
//! elapsed parent span is integrated with the propensity that was in
//! force over that span.

use crate::events::EventQueue;

/// Queue + clock state shared by umbrella instances and compartments.
#[derive(Debug, Clone)]
pub struct UmbrellaCore {
    /// The local queue; its base time is the umbrella's local time
    pub queue: EventQueue,
    /// Propensity in force since the last sync
    pub a_old: f64,
    /// Parent time at the last sync
    pub last_base_t: f64,
}

impl UmbrellaCore {
    /// Fresh state synced to parent time `parent_base`.
    pub fn new(parent_base: f64, a_old: f64) -> Self {
        Self {
            queue: EventQueue::with_base_time(parent_base),
            a_old,
            last_base_t: parent_base,
        }
    }

    /// Integrate the elapsed parent span into local time.
    ///
    /// Invariant: local time is monotone, and never overtakes the
    /// earliest local sub-event.
    pub fn advance_to(&mut self, parent_base: f64) {
        debug_assert!(parent_base >= self.last_base_t, "parent time went backwards");
        if self.a_old > 0.0 {
            let local = self.queue.base_time() + (parent_base - self.last_base_t) * self.a_old;
            self.queue.set_base_time(local);
            debug_assert!(
                self.queue.next_time() >= self.queue.base_time(),
                "local time overtook a sub-event"
            );
        }
        self.last_base_t = parent_base;
    }

    /// Earliest sub-event projected into parent time; +∞ when the
    /// propensity is zero or no sub-event is pending.
    pub fn projected_next_time(&self) -> f64 {
        if self.a_old > 0.0 {
            let dt = self.queue.next_time() - self.queue.base_time();
            debug_assert!(dt >= 0.0);
            self.last_base_t + dt / self.a_old
        } else {
            f64::INFINITY
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKey;

    #[test]
    fn test_advance_scales_local_time() {
        let mut u = UmbrellaCore::new(10.0, 2.0);
        u.advance_to(15.0);
        // 5 parent seconds at a = 2 → 10 local seconds
        assert_eq!(u.queue.base_time(), 20.0);
        assert_eq!(u.last_base_t, 15.0);
    }

    #[test]
    fn test_zero_propensity_freezes_local_time() {
        let mut u = UmbrellaCore::new(0.0, 0.0);
        u.advance_to(100.0);
        assert_eq!(u.queue.base_time(), 0.0);
        assert_eq!(u.last_base_t, 100.0);
        assert_eq!(u.projected_next_time(), f64::INFINITY);
    }

    #[test]
    fn test_projection_divides_by_propensity() {
        let mut u = UmbrellaCore::new(0.0, 4.0);
        u.queue.enqueue(EventKey::Release(0), 8.0);
        // 8 local seconds ahead at a = 4 → 2 parent seconds
        assert_eq!(u.projected_next_time(), 2.0);
    }

    #[test]
    fn test_projection_infinite_when_empty() {
        let u = UmbrellaCore::new(0.0, 1.0);
        assert_eq!(u.projected_next_time(), f64::INFINITY);
    }
}
