// Evolution Engine module

mod apply;
mod engine;
mod types;
mod verify;

pub use apply::{apply_proposal, extract_proposal};
pub use engine::{EngineConfig, EvolutionEngine};
pub use types::{
    Decision, EvolutionTask, EvolveSpec, IterationContext, IterationRecord, StatusProjection,
    TaskStatus,
};
pub use verify::{run_verification, VerifyOutcome};
