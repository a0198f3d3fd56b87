//! Static model description
//!
//! Everything the simulator knows before time starts moving: chemicals,
//! the compartment-type tree, reaction templates grouped into per-type
//! banks, the init command stream and registered script hooks. A model is
//! built through [`Model`] and [`ReactionBuilder`], then sealed; sealed
//! models are immutable and can back any number of simulations.
//!
//! # Critical Invariants
//!
//! 1. Exactly one root compartment type ("Env") exists, at depth 0
//! 2. Banks are sealed before the first compartment is instantiated
//! 3. Everything that can fail is validated here, at build time; the
//!    stepping hot path is infallible

pub mod builder;
pub mod chemical;
pub mod command;
pub mod compartment_type;
pub mod distribution;
pub mod rate;
pub mod reaction;
pub mod split;

pub use builder::{HOverride, ReactionBuilder};
pub use chemical::{Chemical, ChemicalId};
pub use command::InitCommand;
pub use compartment_type::{BankEntry, CompartmentType, ReactionBank};
pub use distribution::RuntimeDistribution;
pub use rate::RateFunction;
pub use reaction::{HEvaluator, Product, Reactant, ReactionTemplate, TemplateRef, MAX_SLOTS};
pub use split::{SplitFunction, SplitKind, SplitOutcome};

use crate::Population;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Index of a compartment type in the model's type table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeId(pub u32);

/// Script hook callable as an H-function: reactant populations in,
/// H value out. `None` means the call failed; the engine substitutes 1.
pub type ScriptFn = Box<dyn Fn(&[Population]) -> Option<f64> + Send + Sync>;

/// Errors raised while building a model.
///
/// These cover spec'd model errors and modelling invariants; all are
/// detected at construction time so the simulation loop never sees them.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("model is sealed; no further construction is allowed")]
    Sealed,
    #[error("compartment type '{0}' already exists")]
    DuplicateTypeName(String),
    #[error("reaction '{0}' cannot span laterally across the compartment hierarchy")]
    LateralSpan(String),
    #[error("cannot split Env compartments")]
    CannotSplitEnv,
    #[error("cannot destroy Env")]
    CannotDestroyEnv,
    #[error("cannot create Env")]
    CannotCreateEnv,
    #[error(
        "cannot destroy two compartments - destruction removes everything below a level; destroy the parent compartment"
    )]
    DoubleDestroy,
    #[error("reaction '{reaction}' has no reactant to attach this to")]
    NoReactant { reaction: String },
    #[error("reaction '{reaction}' has no product to attach this to")]
    NoProduct { reaction: String },
    #[error("split index {index} is greater than the number of splits in the reactant list ({count})")]
    SplitIndexOutOfRange { index: usize, count: usize },
    #[error("chemical is not present as a split in the reactant list")]
    SplitNotFound,
    #[error("compartment type is not present as an unreleased split in the reactant list")]
    CompartmentSplitNotFound,
    #[error("a compartment split product cannot refer to a population split reactant")]
    CompartmentSplitRefersToPopulation,
    #[error("compartment split type must match the reactant split type")]
    CompartmentSplitTypeMismatch,
    #[error("this compartment split index has already been released")]
    CompartmentSplitAlreadyReleased,
    #[error("stochastic constant must be a positive real, got {0}")]
    InvalidStochasticConstant(f64),
    #[error("h-function '{function}' requires {required} reactants in the same compartment")]
    HOverrideShape {
        function: &'static str,
        required: usize,
    },
    #[error("script function index {0} is not registered")]
    UnknownScript(usize),
}

/// The complete static model.
pub struct Model {
    chemicals: Vec<Chemical>,
    types: Vec<CompartmentType>,
    free_templates: Vec<ReactionTemplate>,
    init_commands: Vec<InitCommand>,
    scripts: Vec<ScriptFn>,
    reaction_names: HashSet<String>,
    warnings: Vec<String>,
    named_count: usize,
    max_split_slots: usize,
    sealed: bool,
}

impl Model {
    /// Create an empty model holding only the root "Env" type.
    pub fn new() -> Self {
        Self {
            chemicals: Vec::new(),
            types: vec![CompartmentType::new("Env", 0, None, true)],
            free_templates: Vec::new(),
            init_commands: Vec::new(),
            scripts: Vec::new(),
            reaction_names: HashSet::new(),
            warnings: Vec::new(),
            named_count: 1, // slot 0 is Env
            max_split_slots: 0,
            sealed: false,
        }
    }

    /// The root compartment type.
    pub fn env(&self) -> TypeId {
        TypeId(0)
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    // ------------------------------------------------------------------
    // Chemicals
    // ------------------------------------------------------------------

    pub fn add_chemical(&mut self, name: impl Into<String>, output: bool) -> ChemicalId {
        let id = ChemicalId(self.chemicals.len() as u32);
        self.chemicals.push(Chemical::new(name, output));
        id
    }

    pub fn chemical(&self, id: ChemicalId) -> &Chemical {
        &self.chemicals[id.0 as usize]
    }

    pub fn chemical_by_name(&self, name: &str) -> Option<ChemicalId> {
        self.chemicals
            .iter()
            .position(|c| c.name() == name)
            .map(|i| ChemicalId(i as u32))
    }

    pub fn chemicals(&self) -> &[Chemical] {
        &self.chemicals
    }

    // ------------------------------------------------------------------
    // Compartment types
    // ------------------------------------------------------------------

    /// Declare a new compartment type under `parent`.
    pub fn add_compartment_type(
        &mut self,
        name: impl Into<String>,
        parent: TypeId,
        output: bool,
    ) -> Result<TypeId, ModelError> {
        if self.sealed {
            return Err(ModelError::Sealed);
        }
        let name = name.into();
        if self.type_by_name(&name).is_some() {
            return Err(ModelError::DuplicateTypeName(name));
        }
        let depth = self.types[parent.0 as usize].depth() + 1;
        let id = TypeId(self.types.len() as u32);
        self.types
            .push(CompartmentType::new(name, depth, Some(parent), output));
        Ok(id)
    }

    pub fn compartment_type(&self, id: TypeId) -> &CompartmentType {
        &self.types[id.0 as usize]
    }

    pub fn compartment_type_mut(&mut self, id: TypeId) -> &mut CompartmentType {
        assert!(!self.sealed, "cannot modify a sealed model");
        &mut self.types[id.0 as usize]
    }

    pub fn type_by_name(&self, name: &str) -> Option<TypeId> {
        self.types
            .iter()
            .position(|t| t.name() == name)
            .map(|i| TypeId(i as u32))
    }

    pub fn types(&self) -> &[CompartmentType] {
        &self.types
    }

    /// Is `ty` the same type as `ancestor`, or nested somewhere below it?
    pub fn is_subtype_of(&self, ty: TypeId, ancestor: TypeId) -> bool {
        let mut cur = ty;
        loop {
            if cur == ancestor {
                return true;
            }
            match self.compartment_type(cur).parent() {
                Some(p) => cur = p,
                None => return false,
            }
        }
    }

    /// Species index of `chemical` in `ty`, declaring it on first use.
    pub fn species_index(&mut self, ty: TypeId, chemical: ChemicalId) -> u32 {
        assert!(!self.sealed, "cannot declare species in a sealed model");
        self.types[ty.0 as usize].species_index_or_add(chemical)
    }

    // ------------------------------------------------------------------
    // Reactions
    // ------------------------------------------------------------------

    /// Begin building a reaction. The builder compiles into per-type
    /// banks when [`ReactionBuilder::finish`] is called.
    pub fn reaction(&mut self) -> ReactionBuilder<'_> {
        ReactionBuilder::new(self)
    }

    /// Register a template outside any bank; used for interface reactions
    /// bound to explicit compartment tuples at run time.
    pub fn add_free_template(&mut self, template: ReactionTemplate) -> usize {
        assert!(!self.sealed, "cannot add templates to a sealed model");
        self.free_templates.push(template);
        self.free_templates.len() - 1
    }

    /// Resolve a template reference.
    pub fn template(&self, r: TemplateRef) -> &ReactionTemplate {
        match r {
            TemplateRef::Bank { ctype, index } => {
                &self.types[ctype.0 as usize].bank().entry(index).template
            }
            TemplateRef::Free { index } => &self.free_templates[index as usize],
        }
    }

    pub fn free_template_count(&self) -> usize {
        self.free_templates.len()
    }

    pub(crate) fn note_reaction_name(&mut self, name: &str) {
        if !self.reaction_names.insert(name.to_string()) {
            self.warn(format!("reaction name '{}' is already in use", name));
        }
    }

    // ------------------------------------------------------------------
    // Scripts
    // ------------------------------------------------------------------

    /// Register a script hook; the returned index is what
    /// [`HOverride::Script`] refers to.
    pub fn add_script(&mut self, f: ScriptFn) -> usize {
        self.scripts.push(f);
        self.scripts.len() - 1
    }

    pub(crate) fn script(&self, index: usize) -> Option<&ScriptFn> {
        self.scripts.get(index)
    }

    pub fn script_count(&self) -> usize {
        self.scripts.len()
    }

    // ------------------------------------------------------------------
    // Init command stream
    // ------------------------------------------------------------------

    /// Append a raw command to the init stream.
    pub fn add_init_command(&mut self, command: InitCommand) {
        assert!(!self.sealed, "cannot extend the init stream of a sealed model");
        self.init_commands.push(command);
    }

    pub fn init_commands(&self) -> &[InitCommand] {
        &self.init_commands
    }

    /// Select the environment compartment.
    pub fn init_select_env(&mut self) {
        self.add_init_command(InitCommand::SelectEnv);
    }

    /// Descend from the working set to its children of `ty`.
    pub fn init_select_type(&mut self, ty: TypeId) {
        self.add_init_command(InitCommand::SelectCompartmentType { ctype: ty });
    }

    /// Select a compartment from the named table.
    pub fn init_select_named(&mut self, named: usize) {
        self.add_init_command(InitCommand::SelectCompartment { named });
    }

    /// Create one named compartment in the working set's first member;
    /// returns its index in the named table.
    pub fn init_instantiate_named(&mut self, ty: TypeId) -> usize {
        let named = self.named_count;
        self.named_count += 1;
        self.add_init_command(InitCommand::InstantiateNamedCompartment { named, ctype: ty });
        named
    }

    /// Create `count` anonymous compartments per working-set member.
    pub fn init_instantiate(&mut self, ty: TypeId, count: u32) {
        self.add_init_command(InitCommand::InstantiateCompartments { ctype: ty, count });
    }

    /// Set (or add to) a chemical's population across the working set.
    pub fn init_set_population(
        &mut self,
        ty: TypeId,
        chemical: ChemicalId,
        distribution: RuntimeDistribution,
        add: bool,
    ) {
        let species = self.species_index(ty, chemical);
        self.add_init_command(InitCommand::SetPopulations {
            species,
            distribution,
            add,
        });
    }

    /// Seed the wait lists of the working set.
    pub fn init_add_to_wait_list(
        &mut self,
        ty: TypeId,
        chemical: ChemicalId,
        amount: RuntimeDistribution,
        delay: RuntimeDistribution,
        relative_to_now: bool,
    ) {
        let species = self.species_index(ty, chemical);
        self.add_init_command(InitCommand::AddToWaitList {
            species,
            amount,
            delay,
            relative_to_now,
        });
    }

    // ------------------------------------------------------------------
    // Warnings and sealing
    // ------------------------------------------------------------------

    /// Record a non-fatal warning. Warnings also go to stderr, matching
    /// the load-time reporting contract.
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        eprintln!("Warning: {}", message);
        self.warnings.push(message);
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Size of the split buffer a simulation of this model needs.
    pub fn max_split_slots(&self) -> usize {
        self.max_split_slots
    }

    /// Freeze the model: seals every bank and computes the split-buffer
    /// size. Must be called before a simulation is created.
    pub fn seal(&mut self) {
        if self.sealed {
            return;
        }
        let mut slots = 0usize;
        for cmd in &self.init_commands {
            if let Some(s) = cmd.max_split_slot() {
                slots = slots.max(s + 1);
            }
        }
        for ty in &self.types {
            for entry in ty.bank().entries() {
                for cmd in &entry.template.extra {
                    if let Some(s) = cmd.max_split_slot() {
                        slots = slots.max(s + 1);
                    }
                }
            }
        }
        for tmpl in &self.free_templates {
            for cmd in &tmpl.extra {
                if let Some(s) = cmd.max_split_slot() {
                    slots = slots.max(s + 1);
                }
            }
        }
        self.max_split_slots = slots;
        for ty in &mut self.types {
            ty.bank.seal();
        }
        self.sealed = true;
    }
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("chemicals", &self.chemicals.len())
            .field("types", &self.types.len())
            .field("init_commands", &self.init_commands.len())
            .field("scripts", &self.scripts.len())
            .field("sealed", &self.sealed)
            .finish()
    }
}
