//! Runtime compartments
//!
//! A compartment stores the populations of its type's chemicals and the
//! reaction dependency graph over them: a flat array of instance ids,
//! sliced per species by an exclusive end index stored next to each
//! population. It also embeds a wait list and the umbrella state that
//! makes the compartment an event (and a queue) of its own.
//!
//! # Dependency editing
//!
//! Instances come and go mid-simulation (bank instantiation, compartment
//! moves, destruction). Edits buffer into a pending-add list and a
//! tombstone count; [`Compartment::rebuild_dependencies`] compacts both
//! in one forward pass. The rebuild must run before populations are
//! mutated through the update-triggering setters; bank instantiation
//! does this as its last step. During propagation a nulled slot is
//! simply skipped, so tombstones are safe to observe.

use crate::model::TypeId;
use crate::sim::arena::{CompartmentId, InstanceId};
use crate::sim::umbrella::UmbrellaCore;
use crate::sim::waitlist::WaitList;
use crate::Population;

/// Population of one species plus the exclusive end of its slice in the
/// flat dependency array.
#[derive(Debug, Clone, Copy, Default)]
pub struct PopSlot {
    pub pop: Population,
    pub dep_end: u32,
}

/// A live compartment in the hierarchy.
#[derive(Debug)]
pub struct Compartment {
    pub ctype: TypeId,
    /// Unique per-simulation instantiation index (stable output identity)
    pub instantiation: u64,

    // Hierarchy links
    pub parent: Option<CompartmentId>,
    pub first_child: Option<CompartmentId>,
    pub next_sibling: Option<CompartmentId>,
    pub prev_sibling: Option<CompartmentId>,

    /// Populations and per-species dependency slice ends
    pub slots: Vec<PopSlot>,
    /// Flat dependency array; `None` is a tombstone
    pub deps: Vec<Option<InstanceId>>,
    /// Buffered additions: (species, instance)
    pub pending_deps: Vec<(u32, InstanceId)>,
    /// Tombstones awaiting compaction
    pub removed_deps: u32,

    /// One reaction instance per template of this type's bank
    pub bank: Vec<InstanceId>,
    /// Scheduled delayed releases
    pub wait: WaitList,
    /// The compartment's own queue and clock (unit propensity)
    pub umb: UmbrellaCore,
    /// Already on the update list?
    pub upd_pending: bool,
}

impl Compartment {
    /// Create a compartment synced to parent time `base_time`, with one
    /// population slot per chemical of the type.
    pub fn new(ctype: TypeId, instantiation: u64, chemical_count: usize, base_time: f64) -> Self {
        Self {
            ctype,
            instantiation,
            parent: None,
            first_child: None,
            next_sibling: None,
            prev_sibling: None,
            slots: vec![PopSlot::default(); chemical_count],
            deps: Vec::new(),
            pending_deps: Vec::new(),
            removed_deps: 0,
            bank: Vec::new(),
            wait: WaitList::new(),
            // Compartments run at the main clock's rate
            umb: UmbrellaCore::new(base_time, 1.0),
            upd_pending: false,
        }
    }

    pub fn chemical_count(&self) -> usize {
        self.slots.len()
    }

    pub fn population(&self, species: u32) -> Population {
        self.slots[species as usize].pop
    }

    /// Set a population without notifying dependent reactions. Used by
    /// mass reloads; the engine's updating setters wrap this.
    pub fn set_population_no_update(&mut self, species: u32, pop: Population) {
        self.slots[species as usize].pop = pop;
    }

    /// Modify a population without notifying dependent reactions.
    pub fn modify_population_no_update(&mut self, species: u32, delta: Population) {
        self.slots[species as usize].pop += delta;
    }

    /// Bounds of the species' slice in the flat dependency array.
    pub fn dep_range(&self, species: u32) -> (usize, usize) {
        let i = species as usize;
        let start = if i == 0 {
            0
        } else {
            self.slots[i - 1].dep_end as usize
        };
        (start, self.slots[i].dep_end as usize)
    }

    /// Buffer a dependency addition.
    ///
    /// NOTE: `rebuild_dependencies` must run before the next
    /// update-triggering population change.
    pub fn add_dependency(&mut self, species: u32, instance: InstanceId) {
        self.pending_deps.push((species, instance));
    }

    /// Tombstone a dependency.
    ///
    /// NOTE: `rebuild_dependencies` must run before the next
    /// update-triggering population change.
    pub fn remove_dependency(&mut self, species: u32, instance: InstanceId) {
        let (start, end) = self.dep_range(species);
        for slot in &mut self.deps[start..end] {
            if *slot == Some(instance) {
                *slot = None;
                self.removed_deps += 1;
                return;
            }
        }
    }

    /// Compact tombstones and merge pending additions, preserving
    /// per-species insertion order. Idempotent on a clean graph.
    pub fn rebuild_dependencies(&mut self) {
        if self.slots.is_empty() {
            return;
        }
        if self.pending_deps.is_empty() && self.removed_deps == 0 {
            return;
        }
        // Stable sort so same-species additions keep declaration order
        self.pending_deps.sort_by_key(|&(species, _)| species);

        let old_len = self.slots.last().map(|s| s.dep_end as usize).unwrap_or(0);
        let new_len = old_len + self.pending_deps.len() - self.removed_deps as usize;
        let mut new_deps = Vec::with_capacity(new_len);

        let mut orig = 0usize;
        let mut pending = 0usize;
        for i in 0..self.slots.len() {
            let end = self.slots[i].dep_end as usize;
            while orig < end {
                if let Some(dep) = self.deps[orig] {
                    new_deps.push(Some(dep));
                }
                orig += 1;
            }
            while pending < self.pending_deps.len() && self.pending_deps[pending].0 as usize == i {
                new_deps.push(Some(self.pending_deps[pending].1));
                pending += 1;
            }
            self.slots[i].dep_end = new_deps.len() as u32;
        }

        self.deps = new_deps;
        self.pending_deps.clear();
        self.removed_deps = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::arena::{Arena, InstanceId};

    fn ids(n: usize) -> Vec<InstanceId> {
        // Arena-made ids so the generational payload is realistic
        let mut arena: Arena<u8> = Arena::new();
        (0..n).map(|_| InstanceId(arena.insert(0))).collect()
    }

    fn deps_of(c: &Compartment, species: u32) -> Vec<InstanceId> {
        let (start, end) = c.dep_range(species);
        c.deps[start..end].iter().filter_map(|d| *d).collect()
    }

    #[test]
    fn test_rebuild_merges_in_species_order() {
        let mut c = Compartment::new(TypeId(0), 0, 3, 0.0);
        let i = ids(4);
        c.add_dependency(2, i[0]);
        c.add_dependency(0, i[1]);
        c.add_dependency(0, i[2]);
        c.add_dependency(1, i[3]);
        c.rebuild_dependencies();

        assert_eq!(deps_of(&c, 0), vec![i[1], i[2]], "insertion order preserved");
        assert_eq!(deps_of(&c, 1), vec![i[3]]);
        assert_eq!(deps_of(&c, 2), vec![i[0]]);
    }

    #[test]
    fn test_rebuild_compacts_tombstones() {
        let mut c = Compartment::new(TypeId(0), 0, 2, 0.0);
        let i = ids(3);
        c.add_dependency(0, i[0]);
        c.add_dependency(0, i[1]);
        c.add_dependency(1, i[2]);
        c.rebuild_dependencies();

        c.remove_dependency(0, i[0]);
        assert_eq!(c.removed_deps, 1);
        // Tombstone is observable (skipped) before the rebuild
        let (start, end) = c.dep_range(0);
        assert_eq!(c.deps[start..end], vec![None, Some(i[1])]);

        c.rebuild_dependencies();
        assert_eq!(deps_of(&c, 0), vec![i[1]]);
        assert_eq!(deps_of(&c, 1), vec![i[2]]);
        assert_eq!(c.removed_deps, 0);
    }

    #[test]
    fn test_rebuild_idempotent_on_clean_graph() {
        let mut c = Compartment::new(TypeId(0), 0, 2, 0.0);
        let i = ids(2);
        c.add_dependency(0, i[0]);
        c.add_dependency(1, i[1]);
        c.rebuild_dependencies();
        let before: Vec<_> = c.deps.clone();
        let ends: Vec<_> = c.slots.iter().map(|s| s.dep_end).collect();

        c.rebuild_dependencies();
        assert_eq!(c.deps, before);
        assert_eq!(c.slots.iter().map(|s| s.dep_end).collect::<Vec<_>>(), ends);
    }

    #[test]
    fn test_remove_unknown_dependency_is_noop() {
        let mut c = Compartment::new(TypeId(0), 0, 1, 0.0);
        let i = ids(2);
        c.add_dependency(0, i[0]);
        c.rebuild_dependencies();
        c.remove_dependency(0, i[1]);
        assert_eq!(c.removed_deps, 0);
        assert_eq!(deps_of(&c, 0), vec![i[0]]);
    }

    #[test]
    fn test_population_accessors() {
        let mut c = Compartment::new(TypeId(0), 0, 2, 0.0);
        c.set_population_no_update(0, 10);
        c.modify_population_no_update(0, -3);
        assert_eq!(c.population(0), 7);
        assert_eq!(c.population(1), 0);
    }
}
