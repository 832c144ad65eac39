use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use candle_core::{DType, Device};
use candle_nn::loss::mse;
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::checkpoint::{self, Checkpoint};
use crate::dataset::{Batch, PositionDataset};
use crate::error::{Error, Result};
use crate::network::model::{clamp_output_weights, load_parameters, parameters};
use crate::network::Nnue;
use crate::optimizer::{Adam, ParamsAdam};

use super::report::{EpochReport, RunningLoss, TrainingObserver, WindowReport};
use super::{BATCHES_PER_REPORT, DEFAULT_BATCH_SIZE};

#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub checkpoint_dir: PathBuf,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub report_interval: usize,
    /// Fixes the shuffling order. A fresh entropy seed is used when unset.
    pub seed: Option<u64>,
}

impl TrainerConfig {
    pub fn new(checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            learning_rate: ParamsAdam::default().lr,
            report_interval: BATCHES_PER_REPORT,
            seed: None,
        }
    }
}

pub struct Trainer {
    network: Nnue,
    varmap: VarMap,
    optimizer: Adam,
    device: Device,
    config: TrainerConfig,
    rng: StdRng,
    epoch: usize,
    loss: f64,
}

impl Trainer {
    pub fn new(config: TrainerConfig, device: Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let network = Nnue::new(&vs)?;
        let optimizer = Adam::new(
            &varmap,
            ParamsAdam {
                lr: config.learning_rate,
                ..Default::default()
            },
        )?;

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            network,
            varmap,
            optimizer,
            device,
            config,
            rng,
            epoch: 0,
            loss: 0.0,
        })
    }

    /// Restores parameters, optimizer state, epoch and loss from a checkpoint.
    ///
    /// On error the trainer keeps its previous state.
    pub fn resume(&mut self, path: &Path) -> Result<()> {
        let checkpoint = Checkpoint::load(path, &self.device)?;
        let corrupt = |e: candle_core::Error| Error::CorruptCheckpoint {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };

        // Each restore is all-or-nothing; put the parameters back if the
        // optimizer state is rejected after them.
        let previous = parameters(&self.varmap)?;
        load_parameters(&self.varmap, &checkpoint.parameters).map_err(corrupt)?;
        if let Err(e) = self.optimizer.restore(&checkpoint.optimizer) {
            load_parameters(&self.varmap, &previous)?;
            return Err(corrupt(e));
        }
        self.epoch = checkpoint.epoch;
        self.loss = checkpoint.loss;

        log::info!(
            "Resumed from {:?} after epoch {} (loss {})",
            path,
            self.epoch,
            self.loss
        );
        Ok(())
    }

    /// Number of completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Mean loss of the last completed epoch.
    pub fn loss(&self) -> f64 {
        self.loss
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn checkpoint(&self) -> Result<Checkpoint> {
        Ok(Checkpoint {
            parameters: parameters(&self.varmap)?,
            optimizer: self.optimizer.state()?,
            epoch: self.epoch,
            loss: self.loss,
        })
    }

    /// Trains epoch after epoch until `stop` is raised.
    pub fn train(
        &mut self,
        dataset: &PositionDataset,
        stop: &AtomicBool,
        observer: &mut dyn TrainingObserver,
    ) -> Result<()> {
        if dataset.is_empty() {
            return Err(Error::Format("dataset contains no positions".to_string()));
        }
        fs::create_dir_all(&self.config.checkpoint_dir)?;

        while !stop.load(Ordering::Relaxed) {
            if self.run_epoch(dataset, stop, observer)?.is_none() {
                break;
            }
        }

        log::info!("Training stopped after epoch {}", self.epoch);
        Ok(())
    }

    /// Runs one full epoch and saves its checkpoint.
    ///
    /// Returns `None` if `stop` was raised mid-epoch; the partial epoch is
    /// not counted and nothing is saved.
    pub fn run_epoch(
        &mut self,
        dataset: &PositionDataset,
        stop: &AtomicBool,
        observer: &mut dyn TrainingObserver,
    ) -> Result<Option<EpochReport>> {
        let epoch = self.epoch + 1;
        let started = Instant::now();
        let report_interval = self.config.report_interval.max(1);

        let device = self.device.clone();
        let batches = dataset.batches(&mut self.rng, self.config.batch_size, &device);
        observer.on_epoch_start(epoch, batches.num_batches());

        let mut epoch_loss = 0.0;
        let mut positions = 0;
        let mut window = RunningLoss::new(started);

        for (batch_idx, batch) in batches.enumerate() {
            if stop.load(Ordering::Relaxed) {
                log::info!("Interrupted during epoch {}", epoch);
                return Ok(None);
            }

            let batch = batch?;
            let loss = self.train_step(&batch)? as f64;

            epoch_loss += loss * batch.len as f64;
            positions += batch.len;
            window.add(loss, batch.len);
            observer.on_batch(loss);

            if batch_idx % report_interval == 0 {
                let now = Instant::now();
                observer.on_window(&WindowReport {
                    epoch,
                    loss: window.mean(),
                    positions,
                    total_positions: dataset.len(),
                    positions_per_sec: window.throughput(now),
                });
                window.reset(now);
            }
        }

        self.epoch = epoch;
        self.loss = epoch_loss / dataset.len().max(1) as f64;

        let path = checkpoint::path(&self.config.checkpoint_dir, epoch);
        self.checkpoint()?.save(&path)?;

        let report = EpochReport {
            epoch,
            loss: self.loss,
            positions,
            elapsed: started.elapsed(),
            checkpoint: path,
        };
        observer.on_epoch_end(&report);
        Ok(Some(report))
    }

    fn train_step(&mut self, batch: &Batch) -> Result<f32> {
        let preds = self.network.win_rate(&batch.stm, &batch.sntm)?;
        let loss = mse(&preds, &batch.targets)?;

        self.optimizer.backward_step(&loss)?;
        clamp_output_weights(&self.varmap)?;

        Ok(loss.to_vec0::<f32>()?)
    }
}
