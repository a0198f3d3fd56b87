//! Reaction templates
//!
//! A template is the schema of a reaction, independent of any runtime
//! binding: reactants, products, the stochastic constant, the H-function
//! and the extra-action list. Binding a template to a tuple of live
//! compartments produces a reaction instance (see `sim`).

use crate::model::command::InitCommand;
use crate::model::distribution::RuntimeDistribution;
use crate::model::rate::RateFunction;
use crate::model::TypeId;
use crate::Population;

/// Maximum number of compartment slots a stoichiometry can bind.
pub const MAX_SLOTS: usize = 3;

/// Where a template lives: inside a type's bank, or in the model's free
/// list (interface reactions bound to explicit compartment tuples).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateRef {
    Bank { ctype: TypeId, index: u32 },
    Free { index: u32 },
}

/// A reactant: species slot, consumed count and rate function.
#[derive(Debug, Clone)]
pub struct Reactant {
    /// Compartment slot in the bound tuple
    pub slot: u32,
    /// Species index within that compartment's type
    pub species: u32,
    /// Molecules consumed per firing (≥ 0)
    pub consumes: Population,
    /// Contribution to the default H-function
    pub rate: RateFunction,
}

/// A product: species slot, produced count and release delay.
#[derive(Debug, Clone)]
pub struct Product {
    /// Compartment slot in the bound tuple
    pub slot: u32,
    /// Species index within that compartment's type
    pub species: u32,
    /// Molecules produced per firing
    pub produces: Population,
    /// Release delay; zero releases immediately, anything else goes
    /// through the compartment's wait list
    pub delay: RuntimeDistribution,
}

/// H-function selection. The closed set of spec'd evaluators; everything
/// else is expressed through rate functions on the reactants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HEvaluator {
    /// Product of every reactant's rate function
    Default,
    /// Fractional activation, two activators and one repressor. The three
    /// populations are those of the first three reactants; any further
    /// reactants multiply in through their rate functions.
    Fa2a1r {
        k0: f64,
        k1: f64,
        k2: f64,
        k3: f64,
        k12: f64,
        k23: f64,
        k13: f64,
        k123: f64,
    },
    /// Steady-state heterodimer closed form over the first two reactant
    /// populations
    SshDimer { k: f64 },
    /// Call a registered script function with all reactant populations;
    /// falls back to H = 1 when the call fails
    Script { index: usize },
}

/// Reaction schema. Frozen when its bank is sealed.
#[derive(Debug, Clone)]
pub struct ReactionTemplate {
    /// Stochastic rate constant
    pub c: f64,
    /// Ordered reactant list
    pub reactants: Vec<Reactant>,
    /// Ordered product list
    pub products: Vec<Product>,
    /// Commands executed after stoichiometry on every firing
    pub extra: Vec<InitCommand>,
    /// H-function of the reaction
    pub h_eval: HEvaluator,
    /// Umbrella reactions own a sub-queue whose timeline they rescale
    pub is_umbrella: bool,
    /// Fire-once reactions do not re-enqueue; their extra actions are
    /// expected to destroy the owning compartment
    pub fires_once: bool,
    /// Number of distinct compartment slots (1–3)
    pub n_slots: u32,
    /// Optional reaction name (anonymous reactions are allowed)
    pub name: Option<String>,
}

impl ReactionTemplate {
    pub fn new(is_umbrella: bool, fires_once: bool) -> Self {
        Self {
            c: 1.0,
            reactants: Vec::new(),
            products: Vec::new(),
            extra: Vec::new(),
            h_eval: HEvaluator::Default,
            is_umbrella,
            fires_once,
            n_slots: 1,
            name: None,
        }
    }

    /// Append a reactant. Widens the slot count as needed.
    pub fn add_reactant(
        &mut self,
        slot: u32,
        species: u32,
        consumes: Population,
        rate: RateFunction,
    ) -> &mut Self {
        self.n_slots = self.n_slots.max(slot + 1);
        self.reactants.push(Reactant {
            slot,
            species,
            consumes,
            rate,
        });
        self
    }

    /// Append a product. Widens the slot count as needed.
    pub fn add_product(
        &mut self,
        slot: u32,
        species: u32,
        produces: Population,
        delay: RuntimeDistribution,
    ) -> &mut Self {
        self.n_slots = self.n_slots.max(slot + 1);
        self.products.push(Product {
            slot,
            species,
            produces,
            delay,
        });
        self
    }

    pub fn set_c(&mut self, c: f64) -> &mut Self {
        self.c = c;
        self
    }

    pub fn add_extra(&mut self, command: InitCommand) -> &mut Self {
        self.extra.push(command);
        self
    }
}
