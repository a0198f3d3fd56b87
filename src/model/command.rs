//! Init command types
//!
//! An init command is one step of the deterministic, replayable stream
//! executed against a working compartment set. The same command machinery
//! serves two masters:
//!
//! 1. The model's init stream, run once when a simulation is created.
//! 2. A reaction template's extra actions, run after stoichiometry each
//!    time the reaction fires (splits, compartment creation/destruction).
//!
//! Execution lives in the engine (`sim`); this module is the data.

use crate::model::distribution::RuntimeDistribution;
use crate::model::split::SplitFunction;
use crate::model::TypeId;
use serde::{Deserialize, Serialize};

/// One command of an init stream or extra-action list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InitCommand {
    /// Reset the working set to the environment compartment
    SelectEnv,
    /// Replace the working set by its members' children of the given type
    SelectCompartmentType { ctype: TypeId },
    /// Replace the working set by one compartment from the named table
    SelectCompartment { named: usize },
    /// Create one child of the working set's first compartment and record
    /// it in the named table at `named`
    InstantiateNamedCompartment { named: usize, ctype: TypeId },
    /// Create `count` anonymous children in every working-set compartment
    InstantiateCompartments { ctype: TypeId, count: u32 },
    /// Sample the distribution once per working-set compartment and set
    /// (or add to) the species' population
    SetPopulations {
        species: u32,
        distribution: RuntimeDistribution,
        add: bool,
    },
    /// Schedule a delayed release in every working-set compartment
    AddToWaitList {
        species: u32,
        amount: RuntimeDistribution,
        delay: RuntimeDistribution,
        /// When set, delays are relative to the current simulation time
        relative_to_now: bool,
    },
    /// Split the species' population in every working-set compartment;
    /// the sum of taken parts lands in split-buffer `slot`
    SplitPopulation {
        species: u32,
        slot: usize,
        split: SplitFunction,
    },
    /// Add split-buffer `slot` to the species in every working-set
    /// compartment
    AddPopulationFromSplitBuffer { species: u32, slot: usize },
    /// Schedule split-buffer `slot` as a delayed release in every
    /// working-set compartment
    AddToWaitListFromSplitBuffer {
        species: u32,
        slot: usize,
        delay: RuntimeDistribution,
    },
    /// Split the working set itself: selected compartments are orphaned
    /// into compartment-buffer `comp_slot` (or destroyed when `None`);
    /// the taken count lands in split-buffer `slot`
    SplitCompartments {
        slot: usize,
        comp_slot: Option<usize>,
        split: SplitFunction,
    },
    /// Move the compartments parked in compartment-buffer `slot` into the
    /// working set's first compartment
    InsertSplitCompartments { slot: usize },
    /// Destroy every compartment in the working set (and descendants)
    DeleteCompartments,
    /// Drain the update list
    UpdateSimulation,
}

impl InitCommand {
    /// Highest split-buffer slot this command touches, if any. The model
    /// sizes the per-simulation split buffer from this.
    pub(crate) fn max_split_slot(&self) -> Option<usize> {
        match self {
            InitCommand::SplitPopulation { slot, .. }
            | InitCommand::AddPopulationFromSplitBuffer { slot, .. }
            | InitCommand::AddToWaitListFromSplitBuffer { slot, .. }
            | InitCommand::InsertSplitCompartments { slot } => Some(*slot),
            InitCommand::SplitCompartments { slot, comp_slot, .. } => {
                Some((*slot).max(comp_slot.unwrap_or(0)))
            }
            _ => None,
        }
    }
}
