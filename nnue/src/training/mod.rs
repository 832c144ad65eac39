mod report;
mod trainer;

pub use report::{EpochReport, LogObserver, RunningLoss, TrainingObserver, WindowReport};
pub use trainer::{Trainer, TrainerConfig};

/// Batches between two progress reports.
pub const BATCHES_PER_REPORT: usize = 500;

pub const DEFAULT_BATCH_SIZE: usize = 32;
