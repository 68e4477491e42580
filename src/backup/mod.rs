pub mod admission;
pub mod checkpoint;
pub mod pipeline;
pub mod rotation;
pub mod scheduler;

pub use checkpoint::CheckpointStore;
pub use pipeline::{BackupOutcome, BackupRunner, Pipeline, PipelineSettings};
pub use scheduler::{reconcile, Reconciled, RunReport, Scheduler};
