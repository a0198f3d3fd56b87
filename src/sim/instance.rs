//! Runtime reaction instances
//!
//! An instance is a template bound to a tuple of live compartments, plus
//! the Next-Reaction-Method scheduling state: the cached propensity, the
//! pending firing time and the update-pending flag that makes
//! `pop_update` idempotent. Umbrella-shaped instances additionally carry
//! an [`UmbrellaCore`] with their sub-queue.
//!
//! The behaviour (trigger, update, the Gibson–Bruck rescale) lives on
//! the engine, which owns the arenas and queues these fields refer to.

use crate::model::reaction::{TemplateRef, MAX_SLOTS};
use crate::sim::arena::CompartmentId;
use crate::sim::engine::QueueId;
use crate::sim::umbrella::UmbrellaCore;

/// Scheduling state of one live reaction.
#[derive(Debug)]
pub struct ReactionInstance {
    pub template: TemplateRef,
    /// Bound compartment tuple; slots beyond `n_comps` repeat slot 0
    pub comps: [CompartmentId; MAX_SLOTS],
    pub n_comps: u8,
    /// Queue this instance's event lives in
    pub home: QueueId,
    /// Propensity at the last (re)schedule
    pub a_old: f64,
    /// Scheduled firing time, +∞ while the propensity is zero
    pub t_next: f64,
    /// Already on the update list?
    pub upd_pending: bool,
    pub fires_once: bool,
    /// Sub-queue state for umbrella-shaped instances
    pub umb: Option<Box<UmbrellaCore>>,
}

impl ReactionInstance {
    pub fn new(template: TemplateRef, comps: &[CompartmentId], home: QueueId, fires_once: bool) -> Self {
        debug_assert!(!comps.is_empty() && comps.len() <= MAX_SLOTS);
        let mut tuple = [comps[0]; MAX_SLOTS];
        tuple[..comps.len()].copy_from_slice(comps);
        Self {
            template,
            comps: tuple,
            n_comps: comps.len() as u8,
            home,
            a_old: 0.0,
            t_next: f64::INFINITY,
            upd_pending: false,
            fires_once,
            umb: None,
        }
    }

    pub fn is_umbrella(&self) -> bool {
        self.umb.is_some()
    }

    /// The bound tuple as a slice.
    pub fn compartments(&self) -> &[CompartmentId] {
        &self.comps[..self.n_comps as usize]
    }
}
