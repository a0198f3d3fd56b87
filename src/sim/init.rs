//! Init command execution
//!
//! Executes [`InitCommand`] streams against a mutable context of
//! (simulation, working compartment set, named compartment table,
//! environment root). Two callers share this machinery: the model's init
//! stream at simulation start, and reaction extra actions mid-step. The
//! contexts differ only in how the named table is seeded: the init
//! stream numbers compartments as it creates them, extra actions see the
//! firing compartment's ancestor chain indexed by depth.

use crate::model::InitCommand;
use crate::sim::arena::CompartmentId;
use crate::sim::engine::Simulation;
use crate::Population;

/// Mutable execution context for a command stream.
#[derive(Debug, Clone)]
pub struct InitContext {
    /// The working compartment set commands operate on
    pub working: Vec<CompartmentId>,
    /// Named compartment table
    pub named: Vec<CompartmentId>,
    /// The environment root
    pub env: CompartmentId,
}

impl InitContext {
    /// Context for the model's init stream: Env selected, named slot 0.
    pub fn for_setup(env: CompartmentId) -> Self {
        Self {
            working: vec![env],
            named: vec![env],
            env,
        }
    }

    /// Context for a firing reaction: the named table is the ancestor
    /// chain (env first), the working set starts empty; extra actions
    /// always begin with a select.
    pub fn for_reaction(chain: Vec<CompartmentId>, env: CompartmentId) -> Self {
        Self {
            working: Vec::new(),
            named: chain,
            env,
        }
    }
}

impl Simulation {
    pub(crate) fn execute_command(&mut self, cmd: &InitCommand, ctx: &mut InitContext) {
        match cmd {
            InitCommand::SelectEnv => {
                ctx.working.clear();
                ctx.working.push(ctx.env);
            }

            InitCommand::SelectCompartmentType { ctype } => {
                let mut next = Vec::new();
                for &comp in &ctx.working {
                    if !self.is_live(comp) {
                        continue;
                    }
                    for child in self.children(comp) {
                        if self.comp_ref(child).ctype == *ctype {
                            next.push(child);
                        }
                    }
                }
                ctx.working = next;
            }

            InitCommand::SelectCompartment { named } => {
                ctx.working.clear();
                if let Some(&c) = ctx.named.get(*named) {
                    // Destroyed named compartments silently drop out
                    if self.is_live(c) {
                        ctx.working.push(c);
                    }
                }
            }

            InitCommand::InstantiateNamedCompartment { named, ctype } => {
                let Some(&container) = ctx.working.first() else {
                    return;
                };
                let new_comp = self.create_compartment(*ctype, Some(container));
                if *named == ctx.named.len() {
                    ctx.named.push(new_comp);
                } else if *named < ctx.named.len() {
                    ctx.named[*named] = new_comp;
                } else {
                    ctx.named.resize(*named, ctx.env);
                    ctx.named.push(new_comp);
                }
            }

            InitCommand::InstantiateCompartments { ctype, count } => {
                let working = ctx.working.clone();
                for comp in working {
                    for _ in 0..*count {
                        self.create_compartment(*ctype, Some(comp));
                    }
                }
            }

            InitCommand::SetPopulations {
                species,
                distribution,
                add,
            } => {
                let working = ctx.working.clone();
                for comp in working {
                    let n = distribution.sample(self.rng_mut()).floor() as Population;
                    if *add {
                        self.modify_population(comp, *species, n);
                    } else {
                        self.set_population(comp, *species, n);
                    }
                }
            }

            InitCommand::AddToWaitList {
                species,
                amount,
                delay,
                relative_to_now,
            } => {
                let base = if *relative_to_now { self.time() } else { 0.0 };
                let working = ctx.working.clone();
                for comp in working {
                    let n = amount.sample(self.rng_mut()).floor() as Population;
                    let t = base + delay.sample(self.rng_mut());
                    self.release_at(comp, t, *species, n);
                }
            }

            InitCommand::SplitPopulation {
                species,
                slot,
                split,
            } => {
                let working = ctx.working.clone();
                let mut taken_total = 0;
                for comp in working {
                    let n = self.population(comp, *species);
                    let out = self.apply_split(split, n);
                    self.set_population(comp, *species, out.left);
                    taken_total += out.taken;
                }
                self.set_split_amount(*slot, taken_total);
            }

            InitCommand::AddPopulationFromSplitBuffer { species, slot } => {
                let n = self.split_amount(*slot);
                let working = ctx.working.clone();
                for comp in working {
                    self.modify_population(comp, *species, n);
                }
            }

            InitCommand::AddToWaitListFromSplitBuffer {
                species,
                slot,
                delay,
            } => {
                let n = self.split_amount(*slot);
                let base = self.time();
                let working = ctx.working.clone();
                for comp in working {
                    let t = base + delay.sample(self.rng_mut());
                    self.release_at(comp, t, *species, n);
                }
            }

            InitCommand::SplitCompartments {
                slot,
                comp_slot,
                split,
            } => {
                // Reaction banks are about to be torn apart; no update
                // may be left pending against them
                self.update();

                let n0 = ctx.working.len() as Population;
                let out = self.apply_split(split, n0);
                self.set_split_amount(*slot, out.taken);

                let mut orphans = Vec::new();
                if out.left < n0 {
                    let mut take = n0 - out.left;
                    let mut remaining = n0;
                    let working = ctx.working.clone();
                    for comp in working {
                        // Sequential sampling without replacement
                        if (self.rng_mut().next_u32() as Population % remaining) < take {
                            match comp_slot {
                                None => self.destroy_compartment(comp),
                                Some(_) => {
                                    self.orphan_compartment(comp);
                                    orphans.push(comp);
                                }
                            }
                            take -= 1;
                        }
                        remaining -= 1;
                    }
                    ctx.working.clear();
                }
                if let Some(cs) = comp_slot {
                    orphans.reverse();
                    self.set_split_comps(*cs, orphans);
                }
            }

            InitCommand::InsertSplitCompartments { slot } => {
                let Some(&container) = ctx.working.first() else {
                    return;
                };
                let orphans = self.take_split_comps(*slot);
                for comp in orphans {
                    if self.is_live(comp) {
                        // Orphans came out of a same-type container, so
                        // the move cannot fail
                        let _ = self.move_compartment_into(comp, container);
                    }
                }
            }

            InitCommand::DeleteCompartments => {
                self.update();
                let working = std::mem::take(&mut ctx.working);
                for comp in working {
                    self.destroy_compartment(comp);
                }
            }

            InitCommand::UpdateSimulation => {
                self.update();
            }
        }
    }
}
