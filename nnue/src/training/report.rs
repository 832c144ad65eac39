use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Progress within an epoch, emitted every `report_interval` batches.
#[derive(Debug, Clone)]
pub struct WindowReport {
    pub epoch: usize,
    /// Mean loss over the positions seen since the previous report.
    pub loss: f64,
    /// Positions processed so far in this epoch.
    pub positions: usize,
    pub total_positions: usize,
    pub positions_per_sec: f64,
}

#[derive(Debug, Clone)]
pub struct EpochReport {
    pub epoch: usize,
    pub loss: f64,
    pub positions: usize,
    pub elapsed: Duration,
    pub checkpoint: PathBuf,
}

/// Receives training progress. Only `on_window` and `on_epoch_end` are required.
pub trait TrainingObserver {
    fn on_epoch_start(&mut self, _epoch: usize, _num_batches: usize) {}

    fn on_batch(&mut self, _loss: f64) {}

    fn on_window(&mut self, report: &WindowReport);

    fn on_epoch_end(&mut self, report: &EpochReport);
}

/// Reports progress through the `log` facade.
#[derive(Debug, Default)]
pub struct LogObserver;

impl TrainingObserver for LogObserver {
    fn on_window(&mut self, report: &WindowReport) {
        log::info!(
            "Epoch {} - Loss: {:>7.6} [{:>5}/{:>5}] [{:.2} pos/s]",
            report.epoch,
            report.loss,
            report.positions,
            report.total_positions,
            report.positions_per_sec
        );
    }

    fn on_epoch_end(&mut self, report: &EpochReport) {
        log::info!(
            "Epoch {} - Loss: {} ({:.1?}, saved {:?})",
            report.epoch,
            report.loss,
            report.elapsed,
            report.checkpoint
        );
    }
}

/// Size-weighted loss over a window of batches.
///
/// Kept apart from the epoch totals: resetting the window never touches
/// the epoch's loss or position count.
#[derive(Debug)]
pub struct RunningLoss {
    loss_sum: f64,
    positions: usize,
    started: Instant,
}

impl RunningLoss {
    pub fn new(now: Instant) -> Self {
        Self {
            loss_sum: 0.0,
            positions: 0,
            started: now,
        }
    }

    /// Adds a batch whose mean loss was `loss`.
    pub fn add(&mut self, loss: f64, positions: usize) {
        self.loss_sum += loss * positions as f64;
        self.positions += positions;
    }

    pub fn mean(&self) -> f64 {
        self.loss_sum / self.positions.max(1) as f64
    }

    pub fn positions(&self) -> usize {
        self.positions
    }

    pub fn throughput(&self, now: Instant) -> f64 {
        let secs = now.duration_since(self.started).as_secs_f64();
        if secs > 0.0 {
            self.positions as f64 / secs
        } else {
            0.0
        }
    }

    pub fn reset(&mut self, now: Instant) {
        *self = Self::new(now);
    }
}
