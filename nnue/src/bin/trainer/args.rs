use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "NNUE Trainer")]
#[command(author = "Jørgen Hanssen <jorgen@hanssen.io>")]
#[command(version = "0.1.0")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Train until interrupted, saving a checkpoint after every epoch.
    Train(TrainArgs),

    /// Print the quantized export of a checkpoint.
    Dump {
        checkpoint: PathBuf,

        #[arg(long, default_value = "l1")]
        output_key: String,
    },

    /// Print the quantized export of a JSON parameter map read from stdin.
    DumpJson {
        /// Stored name of the output layer.
        #[arg(long, default_value = "out")]
        output_param: String,

        #[arg(long, default_value = "l1")]
        output_key: String,
    },

    /// Convert `fen,win_rate` CSV lines into training records.
    Convert {
        input: PathBuf,

        /// Defaults to `data/<timestamp>.bin`.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(ClapArgs, Debug)]
pub struct TrainArgs {
    /// Directory receiving `epoch-{n}.safetensors` files.
    pub checkpoint_dir: PathBuf,

    /// Training records, 129 bytes each.
    pub dataset: PathBuf,

    /// Checkpoint file inside the checkpoint directory to resume from.
    #[arg(long)]
    pub checkpoint: Option<String>,

    /// Number of positions per training batch.
    #[arg(long, default_value_t = nnue::training::DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Learning rate for the optimizer.
    #[arg(long, default_value_t = 0.001)]
    pub learning_rate: f64,

    /// Batches between two progress reports.
    #[arg(long, default_value_t = nnue::training::BATCHES_PER_REPORT)]
    pub report_interval: usize,

    /// Seed for the shuffling order.
    #[arg(long)]
    pub seed: Option<u64>,
}
