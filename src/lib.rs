//! Reaction Simulator Core - Rust Engine
//!
//! Discrete-event stochastic simulator of coupled chemical reaction
//! networks with delays, hierarchical compartments and time-varying
//! population splits, built around the Next Reaction Method.
//!
//! # Architecture
//!
//! - **model**: Static description (chemicals, compartment types,
//!   reaction templates, banks, the init command stream)
//! - **sim**: Runtime engine (compartment hierarchy, reaction instances,
//!   umbrella clocks, wait lists, the driver, sampling)
//! - **events**: The indexed binary min-heap every schedulable object
//!   lives in
//! - **rng**: Deterministic random number generation and the samplers
//!   built on it
//!
//! # Critical Invariants
//!
//! 1. All populations are i64 molecule counts
//! 2. All randomness is deterministic (seeded RNG); same seed + same
//!    model ⇒ bit-identical trajectory
//! 3. Everything that can fail is validated at model-build time; the
//!    stepping hot path is infallible

// Module declarations
pub mod events;
pub mod model;
pub mod rng;
pub mod sim;

/// Molecule (or compartment) count.
pub type Population = i64;

// Re-exports for convenience
pub use events::{EventKey, EventQueue};
pub use model::{
    Chemical, ChemicalId, HEvaluator, HOverride, InitCommand, Model, ModelError, RateFunction,
    ReactionBuilder, ReactionTemplate, RuntimeDistribution, SplitFunction, SplitKind, TypeId,
};
pub use rng::{default_seed, RngManager};
pub use sim::{
    BinaryTarget, CompartmentId, DelimitedTextTarget, InstanceId, MemoryTarget, OutputFormat,
    SampleColumns, SampleRecord, SamplerTarget, Simulation, SimulationConfig, SimulationError,
    TraceEvent, TraceLog,
};
