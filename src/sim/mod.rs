//! Runtime engine
//!
//! Everything that exists only while a simulation is running: the
//! compartment hierarchy, live reaction instances, umbrella clocks, wait
//! lists, the driver and its queues, init-command execution, sampling
//! and the structural trace.

pub mod arena;
pub mod compartment;
pub mod engine;
pub mod init;
pub mod instance;
pub mod sampler;
pub mod trace;
pub mod umbrella;
pub mod waitlist;

pub use arena::{CompartmentId, InstanceId};
pub use compartment::Compartment;
pub use engine::{QueueId, Simulation, SimulationConfig, SimulationError};
pub use init::InitContext;
pub use instance::ReactionInstance;
pub use sampler::{
    BinaryTarget, DelimitedTextTarget, MemoryTarget, OutputFormat, SampleColumns, SampleRecord,
    SamplerTarget,
};
pub use trace::{TraceEvent, TraceLog};
pub use umbrella::UmbrellaCore;
pub use waitlist::{WaitEntry, WaitList};
