//! Event scheduling primitives
//!
//! The queue here is the backbone of the simulator: the driver, every
//! compartment, every umbrella instance and every wait list owns one.

mod queue;

pub use queue::{EventKey, EventQueue};
