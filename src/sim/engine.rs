//! Simulation engine
//!
//! Owns everything that moves: the compartment and instance arenas, the
//! main and parallel event queues, the update list and the RNG. The
//! driver selects the earliest event across both top-level queues,
//! triggers it, then drains the update list; triggering may cascade
//! through umbrella queues, wait lists and extra-action command streams,
//! all of which run to completion inside the step.
//!
//! # Step loop
//!
//! ```text
//! t_m ← main.peek, t_p ← parallel.peek
//! if t_p ≤ t_m and t_p ≤ t_stop: advance both clocks to t_p, fire parallel head
//! else if t_m ≤ t_stop:          advance main clock to t_m, fire main head, count a step
//! else:                          advance main clock to t_stop, halt
//! drain update list
//! ```
//!
//! # Determinism
//!
//! All randomness flows through the seeded [`RngManager`]; queue
//! tie-breaking is a pure function of operation history. Same seed +
//! same model ⇒ bit-identical trajectory, step counts included.
//!
//! # Update list
//!
//! A single FIFO of instances and compartments whose propensities may
//! have changed. `pop_update` is idempotent through the per-object
//! pending flag; the list is drained only between events. This replaces
//! observer-style callbacks.

use crate::events::{EventKey, EventQueue};
use crate::model::reaction::{HEvaluator, ReactionTemplate, TemplateRef};
use crate::model::{InitCommand, Model, ModelError, TypeId};
use crate::rng::{default_seed, RngManager};
use crate::sim::arena::{Arena, CompartmentId, InstanceId, SlotId};
use crate::sim::compartment::Compartment;
use crate::sim::init::InitContext;
use crate::sim::instance::ReactionInstance;
use crate::sim::sampler::{OutputFormat, SampleRecord, SamplerTarget};
use crate::sim::trace::{TraceEvent, TraceLog};
use crate::sim::umbrella::UmbrellaCore;
use crate::Population;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

// ============================================================================
// Configuration
// ============================================================================

/// Complete simulation configuration.
///
/// Batch fields describe the replication contract (`seed + k` per
/// replicate); orchestrating the replicate runs across threads belongs
/// to the caller.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SimulationConfig {
    /// RNG seed; `None` derives one from the clock, the process id and a
    /// per-process skew
    pub seed: Option<u64>,

    /// Simulation time at which the clock starts (negative warns)
    pub start_time: f64,

    /// Default stop time for [`Simulation::run`]
    pub stop_time: f64,

    /// Sampling interval; zero or negative means "sample every step",
    /// driven by the caller
    pub readout_interval: f64,

    /// Number of batch replicates
    pub batch_count: u32,

    /// Worker threads for batch mode (one simulation per worker)
    pub batch_threads: u32,

    /// Output file name template ('?' expands to the format extension)
    pub readout_file_template: String,

    /// Readout encoding
    pub readout_format: OutputFormat,

    /// Emit a header row in text formats
    pub readout_header: bool,

    /// Free-form named parameters (the `+name=value` surface)
    pub parameters: HashMap<String, String>,

    /// Record structural trace events
    pub trace: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: None,
            start_time: 0.0,
            stop_time: 0.0,
            readout_interval: 1.0,
            batch_count: 1,
            batch_threads: 1,
            readout_file_template: "output.?".to_string(),
            readout_format: OutputFormat::Csv,
            readout_header: true,
            parameters: HashMap::new(),
            trace: true,
        }
    }
}

impl SimulationConfig {
    /// Configuration for batch replicate `k`: same everything, seed
    /// offset by `k`. Resolves a missing seed first so all replicates
    /// share one base.
    pub fn replicate(&self, k: u32) -> Self {
        let base = self.seed.unwrap_or_else(default_seed);
        let mut config = self.clone();
        config.seed = Some(base.wrapping_add(k as u64));
        config
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by the simulation API. The stepping hot path itself
/// is infallible; these cover construction and explicit wiring calls.
#[derive(Debug)]
pub enum SimulationError {
    /// The model was not sealed before the simulation was created
    ModelNotSealed,

    /// A model-construction error bubbled through a simulation API
    Model(ModelError),

    /// Compartment instantiation under a parent of the wrong type
    InvalidParent { expected: String, actual: String },

    /// An id referred to a destroyed compartment
    DeadCompartment,

    /// A free-template index out of range
    UnknownTemplate(usize),

    /// Compartment tuple arity does not match the template
    TemplateArity { expected: u32, actual: usize },

    /// Configuration validation error
    InvalidConfig(String),
}

impl std::fmt::Display for SimulationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SimulationError::ModelNotSealed => {
                write!(f, "model must be sealed before simulation")
            }
            SimulationError::Model(e) => write!(f, "model error: {}", e),
            SimulationError::InvalidParent { expected, actual } => {
                write!(f, "invalid parent compartment: expected type {}, got {}", expected, actual)
            }
            SimulationError::DeadCompartment => write!(f, "compartment no longer exists"),
            SimulationError::UnknownTemplate(i) => write!(f, "unknown free template index {}", i),
            SimulationError::TemplateArity { expected, actual } => {
                write!(f, "template binds {} compartments, got {}", expected, actual)
            }
            SimulationError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for SimulationError {}

impl From<ModelError> for SimulationError {
    fn from(e: ModelError) -> Self {
        SimulationError::Model(e)
    }
}

// ============================================================================
// Engine internals
// ============================================================================

/// Which queue an event lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueId {
    /// The driver's main queue
    Main,
    /// The driver's parallel (sampling) queue
    Parallel,
    /// A compartment's local queue
    Local(CompartmentId),
    /// An umbrella instance's sub-queue
    Umbrella(InstanceId),
    /// A compartment's wait-list queue
    Wait(CompartmentId),
}

/// Entry on the update list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateEntry {
    Instance(InstanceId),
    Compartment(CompartmentId),
}

// ============================================================================
// Simulation
// ============================================================================

/// One live simulation: a sealed model plus all runtime state.
pub struct Simulation {
    model: Rc<Model>,
    config: SimulationConfig,
    seed: u64,
    rng: RngManager,

    compartments: Arena<Compartment>,
    instances: Arena<ReactionInstance>,

    main_queue: EventQueue,
    parallel_queue: EventQueue,
    update_list: VecDeque<UpdateEntry>,

    /// Population split results, shared across the commands of one
    /// reaction execution
    split_amounts: Vec<Population>,
    /// Orphaned compartments parked by compartment splits
    split_comps: Vec<Vec<CompartmentId>>,

    stop_time: f64,
    total_steps: u64,
    next_instantiation: u64,
    last_event: Option<EventKey>,

    env: CompartmentId,
    /// Named-compartment table built by the init stream
    named: Vec<CompartmentId>,

    sampler: Option<Box<dyn SamplerTarget>>,
    trace: TraceLog,
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation").finish_non_exhaustive()
    }
}

impl Simulation {
    /// Build a simulation from a sealed model: creates the environment
    /// compartment, runs the init command stream and drains the update
    /// list so the first step starts clean.
    pub fn new(model: Rc<Model>, config: SimulationConfig) -> Result<Self, SimulationError> {
        if !model.is_sealed() {
            return Err(SimulationError::ModelNotSealed);
        }
        let seed = config.seed.unwrap_or_else(default_seed);
        let start = config.start_time;
        let slots = model.max_split_slots();
        let dead = CompartmentId(SlotId {
            index: u32::MAX,
            gen: u32::MAX,
        });
        let mut sim = Self {
            model: Rc::clone(&model),
            seed,
            rng: RngManager::new(seed),
            compartments: Arena::new(),
            instances: Arena::new(),
            main_queue: EventQueue::with_base_time(start),
            parallel_queue: EventQueue::with_base_time(start),
            update_list: VecDeque::new(),
            split_amounts: vec![0; slots],
            split_comps: vec![Vec::new(); slots],
            stop_time: start,
            total_steps: 0,
            next_instantiation: 0,
            last_event: None,
            env: dead,
            named: Vec::new(),
            sampler: None,
            trace: TraceLog::new(config.trace),
            config,
        };
        if sim.config.start_time < 0.0 {
            sim.warn(format!(
                "negative start time {} requested",
                sim.config.start_time
            ));
        }
        let env = sim.create_compartment(model.env(), None);
        sim.env = env;

        let mut ctx = InitContext::for_setup(env);
        sim.run_commands(model.init_commands(), &mut ctx);
        sim.named = ctx.named.clone();
        sim.update();
        Ok(sim)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn model(&self) -> &Rc<Model> {
        &self.model
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// The seed actually in use (resolved if the config left it empty).
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Current simulation time (the main queue's clock).
    pub fn time(&self) -> f64 {
        self.main_queue.base_time()
    }

    /// Override the current simulation time. Only sensible before any
    /// stepping has happened.
    pub fn set_time(&mut self, t: f64) {
        self.main_queue.set_base_time(t);
        self.parallel_queue.set_base_time(t);
    }

    /// Main-queue events fired so far.
    pub fn step_count(&self) -> u64 {
        self.total_steps
    }

    /// The environment (root) compartment.
    pub fn env(&self) -> CompartmentId {
        self.env
    }

    /// The named-compartment table built by the init stream.
    pub fn named_compartments(&self) -> &[CompartmentId] {
        &self.named
    }

    /// The last top-level event that fired.
    pub fn last_event(&self) -> Option<EventKey> {
        self.last_event
    }

    pub fn trace(&self) -> &TraceLog {
        &self.trace
    }

    pub fn compartment(&self, cid: CompartmentId) -> Option<&Compartment> {
        self.compartments.get(cid.0)
    }

    pub fn instance(&self, iid: InstanceId) -> Option<&ReactionInstance> {
        self.instances.get(iid.0)
    }

    pub fn compartment_count(&self) -> usize {
        self.compartments.len()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Population of `species` in a live compartment.
    pub fn population(&self, cid: CompartmentId, species: u32) -> Population {
        self.comp(cid).population(species)
    }

    /// Direct children of a compartment, newest first.
    pub fn children(&self, cid: CompartmentId) -> Vec<CompartmentId> {
        let mut out = Vec::new();
        let mut child = self.comp(cid).first_child;
        while let Some(c) = child {
            out.push(c);
            child = self.comp(c).next_sibling;
        }
        out
    }

    /// Every live compartment of the given type, in hierarchy order.
    pub fn find_compartments(&self, ty: TypeId) -> Vec<CompartmentId> {
        let mut out = Vec::new();
        self.visit(self.env, &mut |sim, cid| {
            if sim.comp(cid).ctype == ty {
                out.push(cid);
            }
        });
        out
    }

    fn visit(&self, cid: CompartmentId, f: &mut impl FnMut(&Self, CompartmentId)) {
        f(self, cid);
        let mut child = self.comp(cid).first_child;
        while let Some(c) = child {
            self.visit(c, f);
            child = self.comp(c).next_sibling;
        }
    }

    fn comp(&self, cid: CompartmentId) -> &Compartment {
        &self.compartments[cid.0]
    }

    fn comp_mut(&mut self, cid: CompartmentId) -> &mut Compartment {
        &mut self.compartments[cid.0]
    }

    fn inst(&self, iid: InstanceId) -> &ReactionInstance {
        &self.instances[iid.0]
    }

    fn inst_mut(&mut self, iid: InstanceId) -> &mut ReactionInstance {
        &mut self.instances[iid.0]
    }

    fn warn(&mut self, message: String) {
        eprintln!("Warning: {}", message);
        let time = self.time();
        self.trace.push(TraceEvent::Warning { time, message });
    }

    // ------------------------------------------------------------------
    // Queue plumbing
    // ------------------------------------------------------------------

    fn queue(&self, q: QueueId) -> &EventQueue {
        match q {
            QueueId::Main => &self.main_queue,
            QueueId::Parallel => &self.parallel_queue,
            QueueId::Local(cid) => &self.comp(cid).umb.queue,
            QueueId::Umbrella(iid) => {
                &self.inst(iid).umb.as_ref().expect("umbrella home on a plain instance").queue
            }
            QueueId::Wait(cid) => &self.comp(cid).wait.queue,
        }
    }

    fn queue_mut(&mut self, q: QueueId) -> &mut EventQueue {
        match q {
            QueueId::Main => &mut self.main_queue,
            QueueId::Parallel => &mut self.parallel_queue,
            QueueId::Local(cid) => &mut self.comp_mut(cid).umb.queue,
            QueueId::Umbrella(iid) => {
                &mut self
                    .inst_mut(iid)
                    .umb
                    .as_mut()
                    .expect("umbrella home on a plain instance")
                    .queue
            }
            QueueId::Wait(cid) => &mut self.comp_mut(cid).wait.queue,
        }
    }

    fn enqueue_in(&mut self, q: QueueId, key: EventKey, t: f64) {
        let min_changed = self.queue_mut(q).enqueue(key, t);
        if min_changed {
            self.on_new_min(q);
        }
    }

    fn dequeue_from(&mut self, q: QueueId, key: EventKey) {
        let min_changed = self.queue_mut(q).dequeue(key);
        if min_changed {
            self.on_new_min(q);
        }
    }

    /// React to a queue's earliest entry changing. This is the cascade
    /// that keeps nested queues visible to the driver.
    fn on_new_min(&mut self, q: QueueId) {
        match q {
            QueueId::Main | QueueId::Parallel => {}
            QueueId::Local(cid) => self.pop_update_compartment(cid),
            QueueId::Umbrella(iid) => self.pop_update_instance(iid),
            QueueId::Wait(cid) => self.on_wait_min_changed(cid),
        }
    }

    /// Current time of a queue, advancing umbrella clocks up the chain
    /// first so the answer is fresh.
    fn base_time_updated(&mut self, q: QueueId) -> f64 {
        match q {
            QueueId::Main => self.main_queue.base_time(),
            QueueId::Parallel => self.parallel_queue.base_time(),
            QueueId::Local(cid) => {
                self.adjust_time_compartment(cid);
                self.comp(cid).umb.queue.base_time()
            }
            QueueId::Umbrella(iid) => {
                self.adjust_time_umbrella(iid);
                self.inst(iid)
                    .umb
                    .as_ref()
                    .expect("umbrella home on a plain instance")
                    .queue
                    .base_time()
            }
            QueueId::Wait(cid) => self.comp(cid).wait.queue.base_time(),
        }
    }

    fn adjust_time_compartment(&mut self, cid: CompartmentId) {
        // Compartment queues hang off the main queue directly
        let parent_base = self.main_queue.base_time();
        self.comp_mut(cid).umb.advance_to(parent_base);
    }

    fn adjust_time_umbrella(&mut self, iid: InstanceId) {
        let home = self.inst(iid).home;
        let parent_base = self.base_time_updated(home);
        self.inst_mut(iid)
            .umb
            .as_mut()
            .expect("umbrella home on a plain instance")
            .advance_to(parent_base);
    }

    // ------------------------------------------------------------------
    // Update list
    // ------------------------------------------------------------------

    fn pop_update_instance(&mut self, iid: InstanceId) {
        let inst = self.inst_mut(iid);
        if !inst.upd_pending {
            inst.upd_pending = true;
            self.update_list.push_back(UpdateEntry::Instance(iid));
        }
    }

    fn pop_update_compartment(&mut self, cid: CompartmentId) {
        let comp = self.comp_mut(cid);
        if !comp.upd_pending {
            comp.upd_pending = true;
            self.update_list.push_back(UpdateEntry::Compartment(cid));
        }
    }

    /// Drain the update list, recomputing propensities and rescheduling.
    /// Updates may enqueue further updates; the loop runs until empty.
    pub fn update(&mut self) {
        while let Some(entry) = self.update_list.pop_front() {
            match entry {
                UpdateEntry::Instance(iid) => {
                    // Entries can outlive their instance (destruction
                    // mid-step); dead ids are skipped
                    if !self.instances.contains(iid.0) {
                        continue;
                    }
                    self.inst_mut(iid).upd_pending = false;
                    if self.inst(iid).is_umbrella() {
                        self.umbrella_update(iid);
                    } else {
                        self.instance_update(iid);
                    }
                }
                UpdateEntry::Compartment(cid) => {
                    if !self.compartments.contains(cid.0) {
                        continue;
                    }
                    self.comp_mut(cid).upd_pending = false;
                    self.compartment_update(cid);
                }
            }
        }
    }

    /// Gibson–Bruck memoryless rescale, or a fresh draw when the old
    /// propensity was zero.
    fn instance_update(&mut self, iid: InstanceId) {
        let (tref, comps, n, home, a_old, t_old) = {
            let inst = self.inst(iid);
            (
                inst.template,
                inst.comps,
                inst.n_comps as usize,
                inst.home,
                inst.a_old,
                inst.t_next,
            )
        };
        let t_now = self.base_time_updated(home);
        let model = Rc::clone(&self.model);
        let a_new = self.propensity(model.template(tref), &comps[..n]);
        let t_next = if a_old > 0.0 {
            // The MIN_POSITIVE term keeps t_next strictly ahead of t_now
            // under rounding; dividing by a zero a_new lands on +∞
            t_now + (t_old - t_now + f64::MIN_POSITIVE) * a_old / a_new
        } else if a_new > 0.0 {
            t_now + self.rng.exponential(a_new)
        } else {
            f64::INFINITY
        };
        {
            let inst = self.inst_mut(iid);
            inst.a_old = a_new;
            inst.t_next = t_next;
        }
        debug_assert!(t_next >= t_now);
        self.enqueue_in(home, EventKey::Reaction(iid), t_next);
    }

    fn umbrella_update(&mut self, iid: InstanceId) {
        self.adjust_time_umbrella(iid);
        let (tref, comps, n, home) = {
            let inst = self.inst(iid);
            (inst.template, inst.comps, inst.n_comps as usize, inst.home)
        };
        let model = Rc::clone(&self.model);
        let a = self.propensity(model.template(tref), &comps[..n]);
        let t = {
            let inst = self.inst_mut(iid);
            inst.a_old = a;
            let u = inst.umb.as_mut().expect("umbrella instance has a core");
            u.a_old = a;
            u.projected_next_time()
        };
        self.enqueue_in(home, EventKey::Reaction(iid), t);
    }

    fn compartment_update(&mut self, cid: CompartmentId) {
        self.adjust_time_compartment(cid);
        let t = self.comp(cid).umb.projected_next_time();
        self.enqueue_in(QueueId::Main, EventKey::Compartment(cid), t);
    }

    // ------------------------------------------------------------------
    // Populations and dependencies
    // ------------------------------------------------------------------

    /// Set a population and notify dependent reactions.
    pub fn set_population(&mut self, cid: CompartmentId, species: u32, pop: Population) {
        self.comp_mut(cid).set_population_no_update(species, pop);
        self.trigger_pop_update(cid, species);
    }

    /// Modify a population and notify dependent reactions.
    pub fn modify_population(&mut self, cid: CompartmentId, species: u32, delta: Population) {
        self.comp_mut(cid).modify_population_no_update(species, delta);
        self.trigger_pop_update(cid, species);
    }

    /// Set a population without notification (mass reloads).
    pub fn set_population_no_update(&mut self, cid: CompartmentId, species: u32, pop: Population) {
        self.comp_mut(cid).set_population_no_update(species, pop);
    }

    fn trigger_pop_update(&mut self, cid: CompartmentId, species: u32) {
        let (start, end) = self.comp(cid).dep_range(species);
        for i in start..end {
            // Slots nulled during propagation are simply skipped
            let dep = self.comp(cid).deps[i];
            if let Some(iid) = dep {
                self.pop_update_instance(iid);
            }
        }
    }

    /// Schedule a delayed release on a compartment's wait list.
    pub fn release_at(&mut self, cid: CompartmentId, t: f64, species: u32, amount: Population) {
        let min_changed = self.comp_mut(cid).wait.push(t, species, amount);
        if self.trace.is_enabled() {
            let (time, steps, instantiation) =
                (self.time(), self.total_steps, self.comp(cid).instantiation);
            self.trace.push(TraceEvent::DelayedRelease {
                time,
                steps,
                compartment: instantiation,
                species,
                amount,
                release_at: t,
            });
        }
        if min_changed {
            self.on_wait_min_changed(cid);
        }
    }

    /// Keep the wait list's wrapping event at the earliest release time.
    fn on_wait_min_changed(&mut self, cid: CompartmentId) {
        let t = self.comp(cid).wait.next_time();
        self.enqueue_in(QueueId::Local(cid), EventKey::WaitList(cid), t);
    }

    // ------------------------------------------------------------------
    // Propensities
    // ------------------------------------------------------------------

    fn propensity(&self, tmpl: &ReactionTemplate, comps: &[CompartmentId]) -> f64 {
        tmpl.c * self.calc_h(tmpl, comps)
    }

    fn pop_of(&self, comps: &[CompartmentId], slot: u32, species: u32) -> Population {
        self.comp(comps[slot as usize]).population(species)
    }

    fn calc_h(&self, tmpl: &ReactionTemplate, comps: &[CompartmentId]) -> f64 {
        match tmpl.h_eval {
            HEvaluator::Default => {
                let mut h = 1.0;
                for r in &tmpl.reactants {
                    h *= r.rate.evaluate(self.pop_of(comps, r.slot, r.species));
                }
                h
            }
            HEvaluator::Fa2a1r {
                k0,
                k1,
                k2,
                k3,
                k12,
                k23,
                k13,
                k123,
            } => {
                let x1 = self.pop_of(comps, tmpl.reactants[0].slot, tmpl.reactants[0].species) as f64;
                let x2 = self.pop_of(comps, tmpl.reactants[1].slot, tmpl.reactants[1].species) as f64;
                let x3 = self.pop_of(comps, tmpl.reactants[2].slot, tmpl.reactants[2].species) as f64;
                let mut h = (k0 + k1 * x1 + k2 * x2 + k12 * x1 * x2)
                    / (1.0
                        + k1 * x1
                        + k2 * x2
                        + k12 * x1 * x2
                        + k3 * x3
                        + k13 * x1 * x3
                        + k23 * x2 * x3
                        + k123 * x1 * x2 * x3);
                for r in &tmpl.reactants[3..] {
                    h *= r.rate.evaluate(self.pop_of(comps, r.slot, r.species));
                }
                h
            }
            HEvaluator::SshDimer { k } => {
                let x1 = self.pop_of(comps, tmpl.reactants[0].slot, tmpl.reactants[0].species) as f64;
                let x2 = self.pop_of(comps, tmpl.reactants[1].slot, tmpl.reactants[1].species) as f64;
                let s = 1.0 + (x1 + x2) / k;
                let mut h = k * (1.0 + (x1 + x2) / k - (s * s - 4.0 * x1 * x2 / (k * k)).sqrt());
                for r in &tmpl.reactants[2..] {
                    h *= r.rate.evaluate(self.pop_of(comps, r.slot, r.species));
                }
                h
            }
            HEvaluator::Script { index } => {
                let pops: Vec<Population> = tmpl
                    .reactants
                    .iter()
                    .map(|r| self.pop_of(comps, r.slot, r.species))
                    .collect();
                // Script failures fall back to H = 1 so the simulation
                // cannot wedge
                match self.model.script(index) {
                    Some(f) => f(&pops).unwrap_or(1.0),
                    None => 1.0,
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Compartment lifecycle
    // ------------------------------------------------------------------

    /// Create a compartment of type `ty` inside `parent` and instantiate
    /// its reaction bank.
    pub fn instantiate(
        &mut self,
        ty: TypeId,
        parent: CompartmentId,
    ) -> Result<CompartmentId, SimulationError> {
        if !self.compartments.contains(parent.0) {
            return Err(SimulationError::DeadCompartment);
        }
        let expected = self.model.compartment_type(ty).parent();
        let actual = self.comp(parent).ctype;
        if expected != Some(actual) {
            return Err(SimulationError::InvalidParent {
                expected: expected
                    .map(|t| self.model.compartment_type(t).name().to_string())
                    .unwrap_or_else(|| "<none>".to_string()),
                actual: self.model.compartment_type(actual).name().to_string(),
            });
        }
        Ok(self.create_compartment(ty, Some(parent)))
    }

    pub(crate) fn create_compartment(
        &mut self,
        ty: TypeId,
        parent: Option<CompartmentId>,
    ) -> CompartmentId {
        let model = Rc::clone(&self.model);
        let ct = model.compartment_type(ty);
        let instantiation = self.next_instantiation;
        self.next_instantiation += 1;
        let base = self.main_queue.base_time();
        let comp = Compartment::new(ty, instantiation, ct.chemical_count(), base);
        let cid = CompartmentId(self.compartments.insert(comp));

        // The compartment is itself an event in the main queue; it
        // surfaces once its local queue holds something finite
        self.enqueue_in(QueueId::Main, EventKey::Compartment(cid), f64::INFINITY);

        if self.trace.is_enabled() {
            let parent_inst = parent.map(|p| self.comp(p).instantiation);
            let (time, steps) = (self.time(), self.total_steps);
            self.trace.push(TraceEvent::CompartmentCreated {
                time,
                steps,
                compartment: instantiation,
                ctype: ty,
                parent: parent_inst,
            });
        }

        match parent {
            Some(p) => {
                self.link_into(cid, p);
                self.instantiate_bank(cid);
            }
            None => {
                // Only the root type owns reactions without a container
                if ct.parent().is_none() {
                    self.instantiate_bank(cid);
                }
            }
        }
        cid
    }

    fn link_into(&mut self, cid: CompartmentId, parent: CompartmentId) {
        let old_first = self.comp(parent).first_child;
        {
            let comp = self.comp_mut(cid);
            comp.parent = Some(parent);
            comp.next_sibling = old_first;
            comp.prev_sibling = None;
        }
        if let Some(f) = old_first {
            self.comp_mut(f).prev_sibling = Some(cid);
        }
        self.comp_mut(parent).first_child = Some(cid);
    }

    fn unlink(&mut self, cid: CompartmentId) {
        let (parent, prev, next) = {
            let c = self.comp(cid);
            (c.parent, c.prev_sibling, c.next_sibling)
        };
        match prev {
            Some(p) => self.comp_mut(p).next_sibling = next,
            None => {
                if let Some(par) = parent {
                    self.comp_mut(par).first_child = next;
                }
            }
        }
        if let Some(n) = next {
            self.comp_mut(n).prev_sibling = prev;
        }
        let c = self.comp_mut(cid);
        c.parent = None;
        c.prev_sibling = None;
        c.next_sibling = None;
    }

    /// Instantiate the compartment's type bank: one instance per
    /// template, wired to ancestor umbrellas where declared, dependency
    /// rebuild last.
    fn instantiate_bank(&mut self, cid: CompartmentId) {
        let model = Rc::clone(&self.model);
        let ty = self.comp(cid).ctype;
        let depth = model.compartment_type(ty).depth() as usize;

        // Ancestor bank chain indexed by depth
        let mut banks_by_depth: Vec<Vec<InstanceId>> = vec![Vec::new(); depth + 1];
        let mut cur = self.comp(cid).parent;
        while let Some(a) = cur {
            let ac = self.comp(a);
            banks_by_depth[model.compartment_type(ac.ctype).depth() as usize] = ac.bank.clone();
            cur = ac.parent;
        }

        for (index, entry) in model.compartment_type(ty).bank().entries().iter().enumerate() {
            let home = match entry.umbrella_index {
                Some(ui) => QueueId::Umbrella(
                    banks_by_depth[entry.parent_bank_depth as usize][ui as usize],
                ),
                None => QueueId::Local(cid),
            };
            let tref = TemplateRef::Bank {
                ctype: ty,
                index: index as u32,
            };
            let iid = self.create_instance(
                tref,
                &[cid],
                home,
                entry.template.fires_once,
                entry.template.is_umbrella,
            );
            self.comp_mut(cid).bank.push(iid);
        }
        self.comp_mut(cid).rebuild_dependencies();
    }

    /// Bind a free (interface) template to an explicit compartment
    /// tuple. The instance is owned by the tuple's first compartment and
    /// dies with it; every other bound compartment must outlive the
    /// binding (destroy the owner first to retire it).
    pub fn bind_reaction(
        &mut self,
        template_index: usize,
        comps: &[CompartmentId],
    ) -> Result<InstanceId, SimulationError> {
        if template_index >= self.model.free_template_count() {
            return Err(SimulationError::UnknownTemplate(template_index));
        }
        let tref = TemplateRef::Free {
            index: template_index as u32,
        };
        let model = Rc::clone(&self.model);
        let tmpl = model.template(tref);
        if comps.len() != tmpl.n_slots as usize {
            return Err(SimulationError::TemplateArity {
                expected: tmpl.n_slots,
                actual: comps.len(),
            });
        }
        for &c in comps {
            if !self.compartments.contains(c.0) {
                return Err(SimulationError::DeadCompartment);
            }
        }
        let home = QueueId::Local(comps[0]);
        let iid = self.create_instance(tref, comps, home, tmpl.fires_once, tmpl.is_umbrella);
        self.comp_mut(comps[0]).bank.push(iid);
        for &c in comps {
            self.comp_mut(c).rebuild_dependencies();
        }
        Ok(iid)
    }

    fn create_instance(
        &mut self,
        tref: TemplateRef,
        comps: &[CompartmentId],
        home: QueueId,
        fires_once: bool,
        is_umbrella: bool,
    ) -> InstanceId {
        let mut inst = ReactionInstance::new(tref, comps, home, fires_once);
        if is_umbrella {
            inst.umb = Some(Box::new(UmbrellaCore::new(self.main_queue.base_time(), 0.0)));
        }
        let iid = InstanceId(self.instances.insert(inst));

        let model = Rc::clone(&self.model);
        let tmpl = model.template(tref);
        for r in &tmpl.reactants {
            let cid = comps[r.slot as usize];
            self.comp_mut(cid).add_dependency(r.species, iid);
        }
        self.begin_instance(iid);
        iid
    }

    /// Compute the initial propensity, draw the first firing time and
    /// enqueue. Umbrellas start parked at +∞ until a sub-event surfaces.
    fn begin_instance(&mut self, iid: InstanceId) {
        let (tref, comps, n, home, is_umb) = {
            let inst = self.inst(iid);
            (
                inst.template,
                inst.comps,
                inst.n_comps as usize,
                inst.home,
                inst.is_umbrella(),
            )
        };
        let t_now = self.base_time_updated(home);
        let model = Rc::clone(&self.model);
        let a = self.propensity(model.template(tref), &comps[..n]);
        if is_umb {
            {
                let inst = self.inst_mut(iid);
                inst.upd_pending = false;
                inst.a_old = a;
                let u = inst.umb.as_mut().expect("umbrella instance has a core");
                u.last_base_t = t_now;
                u.queue.set_base_time(t_now);
                u.a_old = a;
            }
            self.enqueue_in(home, EventKey::Reaction(iid), f64::INFINITY);
        } else {
            let t_next = if a > 0.0 {
                t_now + self.rng.exponential(a)
            } else {
                f64::INFINITY
            };
            {
                let inst = self.inst_mut(iid);
                inst.upd_pending = false;
                inst.a_old = a;
                inst.t_next = t_next;
            }
            debug_assert!(t_next >= t_now);
            self.enqueue_in(home, EventKey::Reaction(iid), t_next);
        }
    }

    fn destroy_instance(&mut self, iid: InstanceId) {
        let (tref, comps, n, home) = {
            let inst = self.inst(iid);
            (inst.template, inst.comps, inst.n_comps as usize, inst.home)
        };
        self.dequeue_from(home, EventKey::Reaction(iid));
        let model = Rc::clone(&self.model);
        let tmpl = model.template(tref);
        for r in &tmpl.reactants {
            let cid = comps[r.slot as usize];
            // Bound compartments may already be mid-teardown
            if self.compartments.contains(cid.0) {
                self.comp_mut(cid).remove_dependency(r.species, iid);
            }
        }
        self.instances.remove(iid.0);
    }

    /// Destroy a compartment and its whole subtree. The update list is
    /// drained before teardown begins and again afterwards, so no update
    /// ever runs against freed state.
    pub fn destroy_compartment(&mut self, cid: CompartmentId) {
        if !self.compartments.contains(cid.0) {
            return;
        }
        self.update();
        self.unlink(cid);
        self.destroy_subtree(cid);
        self.update();
    }

    fn destroy_subtree(&mut self, cid: CompartmentId) {
        // Children first: their instances may live in this compartment's
        // umbrella queues
        while let Some(child) = self.comp(cid).first_child {
            self.unlink(child);
            self.destroy_subtree(child);
        }
        let bank = std::mem::take(&mut self.comp_mut(cid).bank);
        for iid in bank {
            self.destroy_instance(iid);
        }
        // Pending wait-list releases die with the compartment, unfired
        self.main_queue.dequeue(EventKey::Compartment(cid));
        if self.trace.is_enabled() {
            let (time, steps, instantiation) =
                (self.time(), self.total_steps, self.comp(cid).instantiation);
            self.trace.push(TraceEvent::CompartmentDestroyed {
                time,
                steps,
                compartment: instantiation,
            });
        }
        self.compartments.remove(cid.0);
    }

    /// Detach a compartment from its container: the subtree keeps its
    /// populations and wait lists but loses all reaction banks until it
    /// is moved into a container again.
    pub fn orphan_compartment(&mut self, cid: CompartmentId) {
        if self.comp(cid).parent.is_none() {
            return;
        }
        self.unlink(cid);
        self.adjust_time_compartment(cid);
        self.orphan_banks(cid);
        if self.trace.is_enabled() {
            let (time, steps, instantiation) =
                (self.time(), self.total_steps, self.comp(cid).instantiation);
            self.trace.push(TraceEvent::CompartmentMoved {
                time,
                steps,
                compartment: instantiation,
                new_parent: None,
            });
        }
    }

    fn orphan_banks(&mut self, cid: CompartmentId) {
        let mut child = self.comp(cid).first_child;
        while let Some(c) = child {
            child = self.comp(c).next_sibling;
            self.orphan_banks(c);
        }
        let bank = std::mem::take(&mut self.comp_mut(cid).bank);
        for iid in bank {
            self.destroy_instance(iid);
        }
    }

    /// Move an orphaned (or contained) compartment under a new parent
    /// and re-instantiate its reaction bank there. The subtree's own
    /// banks stay gone until its members are moved individually.
    pub fn move_compartment_into(
        &mut self,
        cid: CompartmentId,
        new_parent: CompartmentId,
    ) -> Result<(), SimulationError> {
        if !self.compartments.contains(cid.0) || !self.compartments.contains(new_parent.0) {
            return Err(SimulationError::DeadCompartment);
        }
        let expected = self.model.compartment_type(self.comp(cid).ctype).parent();
        let actual = self.comp(new_parent).ctype;
        if expected != Some(actual) {
            return Err(SimulationError::InvalidParent {
                expected: expected
                    .map(|t| self.model.compartment_type(t).name().to_string())
                    .unwrap_or_else(|| "<none>".to_string()),
                actual: self.model.compartment_type(actual).name().to_string(),
            });
        }
        if self.comp(cid).parent.is_some() {
            self.orphan_compartment(cid);
        }
        self.link_into(cid, new_parent);
        self.instantiate_bank(cid);
        if self.trace.is_enabled() {
            let (time, steps) = (self.time(), self.total_steps);
            let instantiation = self.comp(cid).instantiation;
            let parent_inst = Some(self.comp(new_parent).instantiation);
            self.trace.push(TraceEvent::CompartmentMoved {
                time,
                steps,
                compartment: instantiation,
                new_parent: parent_inst,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event triggering
    // ------------------------------------------------------------------

    fn trigger(&mut self, key: EventKey, _q: QueueId) {
        match key {
            EventKey::Reaction(iid) => {
                if self.inst(iid).is_umbrella() {
                    self.trigger_umbrella(iid);
                } else {
                    self.trigger_reaction(iid);
                }
            }
            EventKey::Compartment(cid) => self.trigger_compartment(cid),
            EventKey::WaitList(cid) => self.trigger_waitlist(cid),
            EventKey::Sampler => self.trigger_sampler(),
            EventKey::Release(_) => {
                // Releases live inside wait-list queues and are consumed
                // by the wait list itself
                debug_assert!(false, "release event reached the driver");
            }
        }
    }

    /// Execute a reaction: stoichiometry, redraw, re-enqueue, extras.
    /// Fire-once instances skip the redraw; their extras are expected to
    /// destroy the owning compartment (and with it, this instance).
    fn trigger_reaction(&mut self, iid: InstanceId) {
        let (tref, comps, n, home, fires_once) = {
            let inst = self.inst_mut(iid);
            inst.upd_pending = true;
            (
                inst.template,
                inst.comps,
                inst.n_comps as usize,
                inst.home,
                inst.fires_once,
            )
        };
        let model = Rc::clone(&self.model);
        let tmpl = model.template(tref);

        self.execute_stoichiometry(tmpl, &comps[..n]);

        if !fires_once {
            let base = self.queue(home).base_time();
            let a = self.propensity(tmpl, &comps[..n]);
            let t_next = if a > 0.0 {
                base + self.rng.exponential(a)
            } else {
                f64::INFINITY
            };
            {
                let inst = self.inst_mut(iid);
                inst.a_old = a;
                inst.t_next = t_next;
            }
            debug_assert!(t_next >= base);
            self.enqueue_in(home, EventKey::Reaction(iid), t_next);
            self.inst_mut(iid).upd_pending = false;
        }

        self.execute_extra(tmpl, &comps[..n]);
    }

    /// An umbrella fires when its earliest sub-event's projected time
    /// arrives: advance the local clock to that sub-event, run the
    /// umbrella's own stoichiometry, then trigger the sub-event in local
    /// time. The sub-event's re-enqueue raises the new-min cascade that
    /// reschedules this umbrella in its parent.
    fn trigger_umbrella(&mut self, iid: InstanceId) {
        let (tref, comps, n, home) = {
            let inst = self.inst(iid);
            (inst.template, inst.comps, inst.n_comps as usize, inst.home)
        };
        let parent_base = self.queue(home).base_time();
        {
            let inst = self.inst_mut(iid);
            let u = inst.umb.as_mut().expect("umbrella instance has a core");
            u.last_base_t = parent_base;
            let sub_t = u.queue.next_time();
            if sub_t.is_finite() {
                u.queue.set_base_time(sub_t);
            }
        }
        let model = Rc::clone(&self.model);
        let tmpl = model.template(tref);
        self.execute_stoichiometry(tmpl, &comps[..n]);
        self.execute_extra(tmpl, &comps[..n]);

        // Extras may have destroyed this umbrella along with its
        // compartment
        if !self.instances.contains(iid.0) {
            return;
        }
        let (sub, sub_time) = {
            let q = &self
                .inst(iid)
                .umb
                .as_ref()
                .expect("umbrella instance has a core")
                .queue;
            (q.next_key(), q.next_time())
        };
        if let Some(sub) = sub {
            if sub_time.is_finite() {
                self.trigger(sub, QueueId::Umbrella(iid));
            }
        }
    }

    /// A compartment fires when its earliest local event's time arrives
    /// in main time. Unit propensity: the local clock tracks the main
    /// clock, so this only hops to the sub-event and fires it.
    fn trigger_compartment(&mut self, cid: CompartmentId) {
        let parent_base = self.main_queue.base_time();
        let sub = {
            let comp = self.comp_mut(cid);
            comp.umb.last_base_t = parent_base;
            let sub_t = comp.umb.queue.next_time();
            if sub_t.is_finite() {
                comp.umb.queue.set_base_time(sub_t);
                comp.umb.queue.next_key()
            } else {
                None
            }
        };
        if let Some(sub) = sub {
            self.trigger(sub, QueueId::Local(cid));
        }
    }

    /// Release the earliest delayed product into the compartment.
    fn trigger_waitlist(&mut self, cid: CompartmentId) {
        let Some(entry) = self.comp_mut(cid).wait.pop_earliest() else {
            return;
        };
        self.modify_population(cid, entry.species, entry.amount);
        // Keep the wrapping event at the (possibly infinite) next release
        self.on_wait_min_changed(cid);
    }

    fn execute_stoichiometry(&mut self, tmpl: &ReactionTemplate, comps: &[CompartmentId]) {
        for r in &tmpl.reactants {
            if r.consumes != 0 {
                self.modify_population(comps[r.slot as usize], r.species, -r.consumes);
            }
        }
        for p in &tmpl.products {
            if p.delay.is_zero() {
                self.modify_population(comps[p.slot as usize], p.species, p.produces);
            } else {
                let dt = p.delay.sample(&mut self.rng);
                let t = self.time() + dt;
                self.release_at(comps[p.slot as usize], t, p.species, p.produces);
            }
        }
    }

    fn execute_extra(&mut self, tmpl: &ReactionTemplate, comps: &[CompartmentId]) {
        if tmpl.extra.is_empty() {
            return;
        }
        let mut ctx = self.runtime_context(comps[0]);
        self.run_commands(&tmpl.extra, &mut ctx);
    }

    /// Context for extra actions: the named table is the firing
    /// compartment's ancestor chain, indexed by depth.
    fn runtime_context(&self, cid: CompartmentId) -> InitContext {
        let mut chain = Vec::new();
        let mut cur = Some(cid);
        while let Some(c) = cur {
            chain.push(c);
            cur = self.comp(c).parent;
        }
        chain.reverse();
        let env = chain[0];
        InitContext::for_reaction(chain, env)
    }

    // ------------------------------------------------------------------
    // Driver
    // ------------------------------------------------------------------

    /// Run until `t_stop`: fire every event at or before it, then park
    /// the clock exactly at `t_stop`.
    pub fn run_until(&mut self, t_stop: f64) {
        // Pick up any externally-made population changes first
        self.update();
        self.stop_time = t_stop;
        while self.internal_step() {}
    }

    /// Run for `dt` simulated seconds from now.
    pub fn run_for(&mut self, dt: f64) {
        let t = self.time() + dt;
        self.run_until(t);
    }

    /// Run the configured span (start already applied at construction).
    pub fn run(&mut self) {
        let stop = self.config.stop_time;
        self.run_until(stop);
    }

    /// Fire exactly one event; returns it, or `None` when the queues are
    /// exhausted.
    pub fn run_step(&mut self) -> Option<EventKey> {
        self.update();
        self.stop_time = f64::INFINITY;
        if self.internal_step() {
            self.last_event
        } else {
            None
        }
    }

    fn internal_step(&mut self) -> bool {
        let t_m = self.main_queue.next_time();
        let t_p = self.parallel_queue.next_time();
        debug_assert!(t_m >= self.main_queue.base_time());

        if t_p <= t_m {
            // Parallel queue first; ties go to the parallel queue so
            // sampling cannot perturb the trajectory
            if t_p <= self.stop_time && t_p.is_finite() {
                self.parallel_queue.set_base_time(t_p);
                self.main_queue.set_base_time(t_p);
                if let Some(key) = self.parallel_queue.next_key() {
                    self.last_event = Some(key);
                    self.trigger(key, QueueId::Parallel);
                }
                self.update();
                return true;
            }
        } else if t_m <= self.stop_time && t_m.is_finite() {
            self.total_steps += 1;
            self.main_queue.set_base_time(t_m);
            if let Some(key) = self.main_queue.next_key() {
                self.last_event = Some(key);
                self.trigger(key, QueueId::Main);
            }
            self.update();
            return true;
        }

        if self.stop_time.is_finite() {
            self.main_queue.set_base_time(self.stop_time);
        }
        false
    }

    // ------------------------------------------------------------------
    // Sampling
    // ------------------------------------------------------------------

    /// Attach a sampler target. With a positive configured readout
    /// interval the sampler self-schedules on the parallel queue,
    /// starting now; otherwise it stays passive and the caller drives it
    /// with [`sample_now`](Self::sample_now) around single steps.
    pub fn attach_sampler(&mut self, target: Box<dyn SamplerTarget>) {
        self.sampler = Some(target);
        if self.config.readout_interval > 0.0 {
            let t = self.time();
            self.enqueue_in(QueueId::Parallel, EventKey::Sampler, t);
        }
    }

    /// Remove the sampler target, returning it (to recover an in-memory
    /// target's records, say).
    pub fn detach_sampler(&mut self) -> Option<Box<dyn SamplerTarget>> {
        self.parallel_queue.dequeue(EventKey::Sampler);
        self.sampler.take()
    }

    /// Sample every output-visible compartment right now.
    pub fn sample_now(&mut self) {
        if self.sampler.is_none() {
            return;
        }
        let mut records = Vec::new();
        self.collect_samples(self.env, &mut records);
        let target = self.sampler.as_mut().expect("sampler checked above");
        for r in &records {
            target.write_sample(r);
        }
        target.end_sample();
        let (time, steps) = (self.main_queue.base_time(), self.total_steps);
        self.trace.push(TraceEvent::SampleTaken { time, steps });
    }

    fn collect_samples(&self, cid: CompartmentId, out: &mut Vec<SampleRecord>) {
        let comp = self.comp(cid);
        let ty = self.model.compartment_type(comp.ctype);
        if ty.is_output() {
            let populations = ty
                .chemicals()
                .iter()
                .enumerate()
                .filter(|(_, &chem)| self.model.chemical(chem).is_output())
                .map(|(i, _)| comp.population(i as u32))
                .collect();
            out.push(SampleRecord {
                time: self.time(),
                steps: self.total_steps,
                compartment: comp.instantiation,
                ctype: comp.ctype,
                wait_total: comp.wait.total_pending(),
                populations,
            });
        }
        let mut child = comp.first_child;
        while let Some(c) = child {
            self.collect_samples(c, out);
            child = self.comp(c).next_sibling;
        }
    }

    fn trigger_sampler(&mut self) {
        self.sample_now();
        let interval = self.config.readout_interval;
        if interval > 0.0 {
            let t = self.time() + interval;
            self.enqueue_in(QueueId::Parallel, EventKey::Sampler, t);
        }
    }

    // ------------------------------------------------------------------
    // Init-command plumbing shared with `sim::init`
    // ------------------------------------------------------------------

    pub(crate) fn run_commands(&mut self, commands: &[InitCommand], ctx: &mut InitContext) {
        for cmd in commands {
            self.execute_command(cmd, ctx);
        }
    }

    pub(crate) fn is_live(&self, cid: CompartmentId) -> bool {
        self.compartments.contains(cid.0)
    }

    pub(crate) fn comp_ref(&self, cid: CompartmentId) -> &Compartment {
        self.comp(cid)
    }

    pub(crate) fn split_amount(&self, slot: usize) -> Population {
        self.split_amounts[slot]
    }

    pub(crate) fn set_split_amount(&mut self, slot: usize, n: Population) {
        self.split_amounts[slot] = n;
    }

    pub(crate) fn take_split_comps(&mut self, slot: usize) -> Vec<CompartmentId> {
        std::mem::take(&mut self.split_comps[slot])
    }

    pub(crate) fn set_split_comps(&mut self, slot: usize, comps: Vec<CompartmentId>) {
        self.split_comps[slot] = comps;
    }

    pub(crate) fn rng_mut(&mut self) -> &mut RngManager {
        &mut self.rng
    }

    pub(crate) fn split_buffer(&self) -> &[Population] {
        &self.split_amounts
    }

    pub(crate) fn apply_split(
        &mut self,
        split: &crate::model::SplitFunction,
        n: Population,
    ) -> crate::model::SplitOutcome {
        split.split(n, &mut self.rng, &self.split_amounts)
    }
}
