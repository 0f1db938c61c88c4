//! Content invalidation job engine.
//!
//! - `engine`: request orchestration inside one store transaction
//! - `query`: allow-listed listing filters, ordering, pagination
//! - `revalidation`: fleet flag propagation after every mutation

pub mod engine;
pub mod query;
pub mod revalidation;

pub use engine::{
    EngineError, EngineSettings, JobEngine, JobMutation, ListOutcome, NewJobRequest,
    ReplaceJobRequest,
};
pub use query::{JobField, JobFilter, JobQuery, JobScope, SortOrder};
pub use revalidation::propagate;
