//! Reaction builder
//!
//! Compiles one user-level reaction (which may span several levels of
//! the compartment-type hierarchy, split populations or compartments,
//! and create or destroy compartments) into per-depth reaction
//! templates wired together by umbrella reactions, plus the extra-action
//! command list executed when the bottom template fires.
//!
//! # Compilation scheme
//!
//! - Each hierarchy depth touched by the reaction gets one template in
//!   that depth's bank. Every template above the deepest one is an
//!   umbrella: its propensity rescales the timeline of the queue holding
//!   the next deeper template's instances.
//! - The stochastic constant lands on the shallowest generated template;
//!   the rest contribute factor 1.
//! - Reactions with splits or compartment products move their
//!   stoichiometry into extra-action commands (the rate functions stay on
//!   the templates so propensities are unaffected); plain reactions keep
//!   consumption and release in the template itself.
//! - Compartment destruction compiles to a fire-once bottom template plus
//!   a delete command.
//!
//! Modelling invariants (lateral spans, splitting or destroying Env,
//! bad split references) are rejected here, at build time.

use crate::model::command::InitCommand;
use crate::model::distribution::RuntimeDistribution;
use crate::model::rate::RateFunction;
use crate::model::reaction::HEvaluator;
use crate::model::split::SplitFunction;
use crate::model::{ChemicalId, Model, ModelError, TypeId};
use crate::Population;

/// H-function override selection for [`ReactionBuilder::override_h`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HOverride {
    /// Fractional activation: k0, k1, k2, k3, k12, k23, k13, k123
    Fa2a1r { k: [f64; 8] },
    /// Steady-state heterodimer with constant k
    SshDimer { k: f64 },
    /// Registered script function
    Script { index: usize },
}

#[derive(Debug, Clone)]
struct TempPart {
    depth: u32,
    chemical: Option<ChemicalId>,
    species: u32,
    count: Population,
    /// Population splits: buffer slot. Split products: referenced slot.
    split_slot: Option<usize>,
    rate: RateFunction,
    tau: RuntimeDistribution,
    split: Option<SplitFunction>,
    create_type: Option<TypeId>,
    /// Reactant compartment splits: release ordinal once a product
    /// claims them
    comp_release: Option<u32>,
}

impl TempPart {
    fn is_split(&self) -> bool {
        self.split_slot.is_some() && self.chemical.is_some() && self.split.is_some()
            || self.chemical.is_none() && self.split.is_some()
    }
}

/// Builder for a single reaction. Obtained from [`Model::reaction`];
/// nothing is committed to the model until [`finish`](Self::finish).
#[derive(Debug)]
pub struct ReactionBuilder<'m> {
    model: &'m mut Model,
    name: Option<String>,
    selected: TypeId,
    /// Resolved type chain by depth; lateral conflicts error
    type_stack: Vec<Option<TypeId>>,
    /// Per-depth involvement: 1 = reactant, 2 = product, 4 = destroy
    type_used: Vec<u8>,
    /// Consolidated reactant-side chain (frozen at the first compartment
    /// product or at finish)
    reacts_in: Vec<TypeId>,
    reactants: Vec<TempPart>,
    products: Vec<TempPart>,
    /// Indices into `reactants` of split parts, in declaration order
    splits: Vec<usize>,
    destroys_depth: Option<u32>,
    produces_compartment: bool,
    comp_split_count: u32,
    h_override: Option<HOverride>,
}

impl<'m> ReactionBuilder<'m> {
    pub(crate) fn new(model: &'m mut Model) -> Self {
        let env = model.env();
        Self {
            model,
            name: None,
            selected: env,
            type_stack: Vec::new(),
            type_used: Vec::new(),
            reacts_in: Vec::new(),
            reactants: Vec::new(),
            products: Vec::new(),
            splits: Vec::new(),
            destroys_depth: None,
            produces_compartment: false,
            comp_split_count: 0,
            h_override: None,
        }
    }

    fn reaction_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| "<anonymous>".into())
    }

    /// Name the reaction. Anonymous reactions are fine; duplicate names
    /// warn but do not error.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the compartment type the following reactants/products live in.
    pub fn in_type(mut self, ty: TypeId) -> Self {
        self.selected = ty;
        self
    }

    /// Resolve `ty` and its ancestors into the reaction's type chain.
    /// Returns false on a lateral conflict.
    fn ensure_type_in_stack(&mut self, ty: TypeId) -> bool {
        let depth = self.model.compartment_type(ty).depth() as usize;
        if self.type_stack.len() <= depth {
            self.type_stack.resize(depth + 1, None);
            if !self.produces_compartment {
                self.type_used.resize(depth + 1, 0);
            }
        }
        let mut cur = ty;
        let mut d = depth;
        loop {
            match self.type_stack[d] {
                Some(existing) if existing != cur => return false,
                Some(_) => break,
                None => self.type_stack[d] = Some(cur),
            }
            if d == 0 {
                break;
            }
            cur = self
                .model
                .compartment_type(cur)
                .parent()
                .expect("non-root type has a parent");
            d -= 1;
        }
        true
    }

    fn mark_used(&mut self, depth: u32, bit: u8) {
        let d = depth as usize;
        if self.type_used.len() <= d {
            if self.produces_compartment {
                return;
            }
            self.type_used.resize(d + 1, 0);
        }
        self.type_used[d] |= bit;
    }

    /// Add a reactant consuming `n` molecules of `chemical` in the
    /// currently selected type. The default rate function is the
    /// combinatorial factor of order `n`; override with [`rate`](Self::rate).
    pub fn reactant(mut self, chemical: ChemicalId, n: Population) -> Result<Self, ModelError> {
        let ty = self.selected;
        if !self.ensure_type_in_stack(ty) {
            return Err(ModelError::LateralSpan(self.reaction_name()));
        }
        let depth = self.model.compartment_type(ty).depth();
        self.mark_used(depth, 1);
        let species = self.model.species_index(ty, chemical);
        self.reactants.push(TempPart {
            depth,
            chemical: Some(chemical),
            species,
            count: n,
            split_slot: None,
            rate: RateFunction::gil_h(n as i32),
            tau: RuntimeDistribution::delta(0.0),
            split: None,
            create_type: None,
            comp_release: None,
        });
        Ok(self)
    }

    /// Replace the most recent reactant's rate function.
    pub fn rate(mut self, rate: RateFunction) -> Result<Self, ModelError> {
        match self.reactants.last_mut() {
            Some(r) => {
                r.rate = rate;
                Ok(self)
            }
            None => Err(ModelError::NoReactant {
                reaction: self.reaction_name(),
            }),
        }
    }

    /// Add a population-split reactant: on firing, `chemical`'s
    /// population is split and the taken part parked in the split buffer.
    pub fn split_reactant(
        mut self,
        chemical: ChemicalId,
        split: SplitFunction,
    ) -> Result<Self, ModelError> {
        let ty = self.selected;
        if !self.ensure_type_in_stack(ty) {
            return Err(ModelError::LateralSpan(self.reaction_name()));
        }
        let depth = self.model.compartment_type(ty).depth();
        self.mark_used(depth, 1);
        let species = self.model.species_index(ty, chemical);
        let slot = self.splits.len();
        self.reactants.push(TempPart {
            depth,
            chemical: Some(chemical),
            species,
            count: 0,
            split_slot: Some(slot),
            rate: RateFunction::Unit,
            tau: RuntimeDistribution::delta(0.0),
            split: Some(split),
            create_type: None,
            comp_release: None,
        });
        self.splits.push(self.reactants.len() - 1);
        Ok(self)
    }

    /// Add a compartment-split reactant: on firing, the firing
    /// compartment's children of type `ty` are partitioned; taken ones
    /// are orphaned (awaiting re-insertion) or destroyed.
    pub fn split_compartment_reactant(
        mut self,
        ty: TypeId,
        split: SplitFunction,
    ) -> Result<Self, ModelError> {
        let Some(parent) = self.model.compartment_type(ty).parent() else {
            return Err(ModelError::CannotSplitEnv);
        };
        if !self.ensure_type_in_stack(parent) {
            return Err(ModelError::LateralSpan(self.reaction_name()));
        }
        let depth = self.model.compartment_type(ty).depth() - 1;
        self.mark_used(depth, 1);
        let slot = self.splits.len();
        self.reactants.push(TempPart {
            depth,
            chemical: None,
            species: u32::MAX,
            count: 0,
            split_slot: Some(slot),
            rate: RateFunction::Unit,
            tau: RuntimeDistribution::delta(0.0),
            split: Some(split),
            create_type: Some(ty),
            comp_release: None,
        });
        self.splits.push(self.reactants.len() - 1);
        Ok(self)
    }

    /// The reaction destroys the currently selected compartment (and all
    /// its descendants). Compiles to a fire-once bottom template.
    pub fn destroy_compartment(mut self) -> Result<Self, ModelError> {
        let ty = self.selected;
        let depth = self.model.compartment_type(ty).depth();
        if depth == 0 {
            return Err(ModelError::CannotDestroyEnv);
        }
        if self.destroys_depth.is_some() {
            return Err(ModelError::DoubleDestroy);
        }
        if !self.ensure_type_in_stack(ty) {
            return Err(ModelError::LateralSpan(self.reaction_name()));
        }
        self.mark_used(depth, 4);
        self.destroys_depth = Some(depth);
        Ok(self)
    }

    /// Add a product releasing `n` molecules of `chemical` in the
    /// currently selected type. Follow with [`delay`](Self::delay) for a
    /// delayed release.
    pub fn product(mut self, chemical: ChemicalId, n: Population) -> Result<Self, ModelError> {
        let ty = self.selected;
        if !self.ensure_type_in_stack(ty) {
            return Err(ModelError::LateralSpan(self.reaction_name()));
        }
        let depth = self.model.compartment_type(ty).depth();
        if !self.produces_compartment {
            self.mark_used(depth, 2);
        }
        let species = self.model.species_index(ty, chemical);
        self.products.push(TempPart {
            depth,
            chemical: Some(chemical),
            species,
            count: n,
            split_slot: None,
            rate: RateFunction::Unit,
            tau: RuntimeDistribution::delta(0.0),
            split: None,
            create_type: None,
            comp_release: None,
        });
        Ok(self)
    }

    /// Replace the most recent product's release delay.
    pub fn delay(mut self, tau: RuntimeDistribution) -> Result<Self, ModelError> {
        match self.products.last_mut() {
            Some(p) => {
                p.tau = tau;
                Ok(self)
            }
            None => Err(ModelError::NoProduct {
                reaction: self.reaction_name(),
            }),
        }
    }

    /// The reaction creates one compartment of type `ty` inside the
    /// firing compartment. Subsequent products default into the new
    /// compartment.
    pub fn produce_compartment(mut self, ty: TypeId) -> Result<Self, ModelError> {
        let depth = self.model.compartment_type(ty).depth();
        if depth == 0 {
            return Err(ModelError::CannotCreateEnv);
        }
        self.consolidate_reacts_in();
        self.produces_compartment = true;
        if !self.ensure_type_in_stack(ty) {
            return Err(ModelError::LateralSpan(self.reaction_name()));
        }
        // Types below the compartment just created no longer bind
        self.type_stack.truncate(depth as usize + 1);
        self.products.push(TempPart {
            depth: depth - 1,
            chemical: None,
            species: u32::MAX,
            count: 0,
            split_slot: None,
            rate: RateFunction::Unit,
            tau: RuntimeDistribution::delta(0.0),
            split: None,
            create_type: Some(ty),
            comp_release: None,
        });
        self.selected = ty;
        Ok(self)
    }

    /// Release a population split into the currently selected type.
    /// `source` indexes the reactant split list; `None` picks the first
    /// split of the same chemical.
    pub fn split_product(
        mut self,
        chemical: ChemicalId,
        source: Option<usize>,
    ) -> Result<Self, ModelError> {
        let ty = self.selected;
        if !self.ensure_type_in_stack(ty) {
            return Err(ModelError::LateralSpan(self.reaction_name()));
        }
        let depth = self.model.compartment_type(ty).depth();
        if !self.produces_compartment {
            self.mark_used(depth, 2);
        }
        let src = match source {
            Some(i) if i >= self.splits.len() => {
                return Err(ModelError::SplitIndexOutOfRange {
                    index: i,
                    count: self.splits.len(),
                })
            }
            Some(i) => i,
            None => self
                .splits
                .iter()
                .position(|&ri| self.reactants[ri].chemical == Some(chemical))
                .ok_or(ModelError::SplitNotFound)?,
        };
        let species = self.model.species_index(ty, chemical);
        self.products.push(TempPart {
            depth,
            chemical: Some(chemical),
            species,
            count: 0,
            split_slot: Some(src),
            rate: RateFunction::Unit,
            tau: RuntimeDistribution::delta(0.0),
            split: None,
            create_type: None,
            comp_release: None,
        });
        Ok(self)
    }

    /// Re-insert compartments taken by a compartment split into the
    /// currently selected compartment. `source` indexes the reactant
    /// split list; `None` picks the first unreleased compartment split of
    /// type `ty`.
    pub fn split_compartment_product(
        mut self,
        ty: TypeId,
        source: Option<usize>,
    ) -> Result<Self, ModelError> {
        let Some(parent) = self.model.compartment_type(ty).parent() else {
            return Err(ModelError::CannotSplitEnv);
        };
        if !self.ensure_type_in_stack(parent) {
            return Err(ModelError::LateralSpan(self.reaction_name()));
        }
        let depth = self.model.compartment_type(ty).depth();
        if !self.produces_compartment {
            self.mark_used(depth - 1, 2);
        }
        let src = match source {
            Some(i) if i >= self.splits.len() => {
                return Err(ModelError::SplitIndexOutOfRange {
                    index: i,
                    count: self.splits.len(),
                })
            }
            Some(i) => i,
            None => self
                .splits
                .iter()
                .position(|&ri| {
                    let r = &self.reactants[ri];
                    r.chemical.is_none() && r.create_type == Some(ty) && r.comp_release.is_none()
                })
                .ok_or(ModelError::CompartmentSplitNotFound)?,
        };
        let reactant_index = self.splits[src];
        {
            let r = &self.reactants[reactant_index];
            if r.chemical.is_some() {
                return Err(ModelError::CompartmentSplitRefersToPopulation);
            }
            if r.create_type != Some(ty) {
                return Err(ModelError::CompartmentSplitTypeMismatch);
            }
            if r.comp_release.is_some() {
                return Err(ModelError::CompartmentSplitAlreadyReleased);
            }
        }
        let release = self.comp_split_count;
        self.reactants[reactant_index].comp_release = Some(release);
        self.comp_split_count += 1;
        self.products.push(TempPart {
            depth: depth - 1,
            chemical: None,
            species: u32::MAX,
            count: 0,
            split_slot: Some(release as usize),
            rate: RateFunction::Unit,
            tau: RuntimeDistribution::delta(0.0),
            split: None,
            create_type: Some(ty),
            comp_release: None,
        });
        Ok(self)
    }

    /// Override the reaction's H-function. Applies to the template at the
    /// first reactant's depth.
    pub fn override_h(mut self, h: HOverride) -> Result<Self, ModelError> {
        match h {
            HOverride::Fa2a1r { .. } => {
                if !self.first_reactants_share_depth(3) {
                    return Err(ModelError::HOverrideShape {
                        function: "fa2a1r",
                        required: 3,
                    });
                }
            }
            HOverride::SshDimer { .. } => {
                if !self.first_reactants_share_depth(2) {
                    return Err(ModelError::HOverrideShape {
                        function: "sshdimer",
                        required: 2,
                    });
                }
            }
            HOverride::Script { index } => {
                if index >= self.model.script_count() {
                    return Err(ModelError::UnknownScript(index));
                }
            }
        }
        self.h_override = Some(h);
        Ok(self)
    }

    fn first_reactants_share_depth(&self, required: usize) -> bool {
        if self.reactants.len() < required {
            return false;
        }
        let depth = self.reactants[0].depth;
        self.reactants[..required].iter().all(|r| r.depth == depth)
    }

    fn consolidate_reacts_in(&mut self) {
        if !self.reacts_in.is_empty() {
            return;
        }
        self.reacts_in = self
            .type_stack
            .iter()
            .map(|t| t.expect("type chain resolved down to every used depth"))
            .collect();
        if let Some(d) = self.destroys_depth {
            self.type_stack.truncate(d as usize);
        }
    }

    /// Commit the reaction to the model's banks with stochastic constant
    /// `c` (applied to the shallowest generated template).
    pub fn finish(mut self, c: f64) -> Result<(), ModelError> {
        if self.model.is_sealed() {
            return Err(ModelError::Sealed);
        }
        if !(c > 0.0) || !c.is_finite() {
            return Err(ModelError::InvalidStochasticConstant(c));
        }
        if let Some(name) = self.name.clone() {
            self.model.note_reaction_name(&name);
        }
        self.consolidate_reacts_in();

        let reactants_in_extra = !self.splits.is_empty();
        let products_in_extra = self.produces_compartment || !self.splits.is_empty();

        let mut mask: u8 = 3;
        let mut max_depth = self.type_used.len();
        if products_in_extra {
            // Compartment-producing and splitting reactions handle their
            // products through the extra commands; no umbrellas are
            // synthesised for product-only depths.
            mask = 1;
            max_depth = self.reacts_in.len();
        }
        if let Some(d) = self.destroys_depth {
            if d as usize == max_depth.saturating_sub(1) {
                mask |= 4;
            }
        }

        let h_depth = self.reactants.first().map(|r| r.depth);
        let mut c_remaining = c;
        let mut umbrella: Option<(u32, u32)> = None;
        let mut bottom: Option<(TypeId, u32)> = None;

        for i in 0..max_depth {
            let used = self.type_used.get(i).copied().unwrap_or(0);
            if used & mask == 0 && i != max_depth - 1 {
                continue;
            }
            let ty = self.reacts_in[i];
            let is_umbrella = i + 1 < self.type_used.len();
            let fires_once = self
                .destroys_depth
                .map_or(false, |d| i as u32 >= d);

            let (parent_bank_depth, umbrella_index) = match umbrella {
                Some((bank, index)) => (bank, Some(index)),
                None => (0, None),
            };
            let index = self.model.compartment_type_mut(ty).bank.create_reaction(
                parent_bank_depth,
                umbrella_index,
                is_umbrella,
                fires_once,
            );
            {
                let tmpl = &mut self
                    .model
                    .compartment_type_mut(ty)
                    .bank
                    .entry_mut(index)
                    .template;
                tmpl.c = c_remaining;
                tmpl.name = self.name.clone();
                if let Some(h) = self.h_override {
                    if h_depth == Some(i as u32) {
                        tmpl.h_eval = match h {
                            HOverride::Fa2a1r { k } => HEvaluator::Fa2a1r {
                                k0: k[0],
                                k1: k[1],
                                k2: k[2],
                                k3: k[3],
                                k12: k[4],
                                k23: k[5],
                                k13: k[6],
                                k123: k[7],
                            },
                            HOverride::SshDimer { k } => HEvaluator::SshDimer { k },
                            HOverride::Script { index } => HEvaluator::Script { index },
                        };
                    }
                }
                // An H override reads reactant populations positionally,
                // so overridden reactions keep every reactant on the
                // template (and with it the dependency edges)
                let keep_all = self.h_override.is_some();
                for r in self.reactants.iter().filter(|r| r.depth as usize == i) {
                    if r.chemical.is_none() {
                        continue;
                    }
                    if reactants_in_extra {
                        // Consumption happens in the extra commands; only
                        // the rate function matters here
                        if !r.rate.is_unit() || keep_all {
                            tmpl.add_reactant(0, r.species, 0, r.rate);
                        }
                    } else if !r.rate.is_unit() || r.count != 0 || keep_all {
                        tmpl.add_reactant(0, r.species, r.count, r.rate);
                    }
                }
                if !products_in_extra {
                    for p in self.products.iter().filter(|p| p.depth as usize == i) {
                        tmpl.add_product(0, p.species, p.count, p.tau);
                    }
                }
            }
            c_remaining = 1.0;
            umbrella = Some((i as u32, index));
            bottom = Some((ty, index));
        }

        // ------------------------------------------------------------------
        // Extra-action command list
        // ------------------------------------------------------------------
        let mut extra: Vec<InitCommand> = Vec::new();
        let splits_total = self.splits.len();

        if reactants_in_extra {
            for r in &self.reactants {
                extra.push(InitCommand::SelectCompartment {
                    named: r.depth as usize,
                });
                if r.is_split() {
                    if r.chemical.is_some() {
                        extra.push(InitCommand::SplitPopulation {
                            species: r.species,
                            slot: r.split_slot.expect("split reactant has a slot"),
                            split: r.split.expect("split reactant has a function"),
                        });
                    } else {
                        extra.push(InitCommand::SelectCompartmentType {
                            ctype: r.create_type.expect("compartment split has a type"),
                        });
                        extra.push(InitCommand::SplitCompartments {
                            slot: r.split_slot.expect("split reactant has a slot"),
                            comp_slot: r
                                .comp_release
                                .map(|rel| splits_total + rel as usize),
                            split: r.split.expect("split reactant has a function"),
                        });
                    }
                } else if r.count != 0 {
                    extra.push(InitCommand::SetPopulations {
                        species: r.species,
                        distribution: RuntimeDistribution::delta(-(r.count as f64)),
                        add: true,
                    });
                }
            }
        }

        if let Some(d) = self.destroys_depth {
            extra.push(InitCommand::SelectCompartment { named: d as usize });
            extra.push(InitCommand::DeleteCompartments);
        }

        if products_in_extra {
            for p in &self.products {
                extra.push(InitCommand::SelectCompartment {
                    named: p.depth as usize,
                });
                if let Some(slot) = p.split_slot {
                    if p.chemical.is_some() {
                        if p.tau.is_zero() {
                            extra.push(InitCommand::AddPopulationFromSplitBuffer {
                                species: p.species,
                                slot,
                            });
                        } else {
                            extra.push(InitCommand::AddToWaitListFromSplitBuffer {
                                species: p.species,
                                slot,
                                delay: p.tau,
                            });
                        }
                    } else {
                        extra.push(InitCommand::InsertSplitCompartments {
                            slot: splits_total + slot,
                        });
                    }
                } else if p.chemical.is_some() {
                    if p.tau.is_zero() {
                        extra.push(InitCommand::SetPopulations {
                            species: p.species,
                            distribution: RuntimeDistribution::delta(p.count as f64),
                            add: true,
                        });
                    } else {
                        extra.push(InitCommand::AddToWaitList {
                            species: p.species,
                            amount: RuntimeDistribution::delta(p.count as f64),
                            delay: p.tau,
                            relative_to_now: true,
                        });
                    }
                } else {
                    extra.push(InitCommand::InstantiateNamedCompartment {
                        named: p.depth as usize + 1,
                        ctype: p.create_type.expect("compartment product has a type"),
                    });
                }
            }
        }

        if !extra.is_empty() {
            let (ty, index) = bottom.expect("at least one template was generated");
            self.model
                .compartment_type_mut(ty)
                .bank
                .entry_mut(index)
                .template
                .extra = extra;
        }

        // Population splits nothing releases silently drop molecules;
        // worth a warning, never an error.
        let mut unreferenced = Vec::new();
        for (slot, &ri) in self.splits.iter().enumerate() {
            let r = &self.reactants[ri];
            if r.chemical.is_some()
                && !self
                    .products
                    .iter()
                    .any(|p| p.chemical.is_some() && p.split_slot == Some(slot))
            {
                unreferenced.push(slot);
            }
        }
        let name = self.reaction_name();
        for slot in unreferenced {
            let message = format!(
                "reaction '{}': split index {} is not referenced by any product",
                name, slot
            );
            self.model.warn(message);
        }

        Ok(())
    }
}
