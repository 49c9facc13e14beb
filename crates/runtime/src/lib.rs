//! The reconciliation engine and the scheduler that drives it.
//!
//! One tick: pull the vault, merge local and remote changes, keep the
//! eligible paths, enrich each one concurrently, wait for all of them, then
//! commit and push.

mod builder;
mod classifier;
mod engine;
mod enrichment;
mod error;
mod normalizer;
mod publisher;
mod scheduler;
mod sync;

#[cfg(test)]
mod testing;

pub use builder::{ExternalServices, build_engine, build_services, open_repository};
pub use classifier::PathClassifier;
pub use engine::{EngineState, ReconciliationEngine, TickReport};
pub use enrichment::{Enricher, EnrichmentCoordinator, EnrichmentTask, TaskAction, TaskOutcome};
pub use error::{EngineError, EngineResult};
pub use normalizer::{FilenameNormalizer, normalize_name};
pub use publisher::{ChangeStats, CommitPublisher};
pub use scheduler::Scheduler;
pub use sync::{
    ChangeOrigin, ChangeRecord, ReconciliationBatch, RepositorySync, merge_changes,
};
