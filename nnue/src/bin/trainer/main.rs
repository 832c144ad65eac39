mod args;
mod convert;
mod progress;
mod utils;

use args::{Args, Command, TrainArgs};
use clap::Parser;
use log::LevelFilter;
use nnue::checkpoint::Checkpoint;
use nnue::dataset::PositionDataset;
use nnue::export::{self, ExportNames, ParameterSet};
use nnue::training::{Trainer, TrainerConfig};
use progress::TrainingProgressBar;
use simplelog::{Config, SimpleLogger};
use std::{
    error::Error,
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use utils::device::get_device;

fn main() -> Result<(), Box<dyn Error>> {
    let args = init()?;

    match args.command {
        Command::Train(train_args) => train(train_args),
        Command::Dump {
            checkpoint,
            output_key,
        } => {
            // Only the parameters are needed, the CPU is plenty.
            let checkpoint = Checkpoint::load(&checkpoint, &candle_core::Device::Cpu)?;
            let parameters = ParameterSet::from_tensors(&checkpoint.parameters)?;
            let names = ExportNames {
                output_key,
                ..Default::default()
            };
            println!("{}", export::dump(&parameters, &names)?);
            Ok(())
        }
        Command::DumpJson {
            output_param,
            output_key,
        } => {
            let parameters = ParameterSet::from_json(io::stdin().lock())?;
            let names = ExportNames {
                output: output_param,
                output_key,
                ..Default::default()
            };
            println!("{}", export::dump(&parameters, &names)?);
            Ok(())
        }
        Command::Convert { input, output } => {
            let output = output.unwrap_or_else(convert::default_output);
            convert::convert(&input, &output)?;
            Ok(())
        }
    }
}

fn train(args: TrainArgs) -> Result<(), Box<dyn Error>> {
    // Set up SIGINT handler
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_handler = Arc::clone(&stop_flag);

    ctrlc::set_handler(move || {
        log::info!("Received SIGINT, stopping training...");
        stop_flag_handler.store(true, Ordering::Relaxed);
    })?;

    let device = get_device()?;

    let dataset = PositionDataset::open(&args.dataset)?;

    let config = TrainerConfig {
        batch_size: args.batch_size,
        learning_rate: args.learning_rate,
        report_interval: args.report_interval,
        seed: args.seed,
        ..TrainerConfig::new(&args.checkpoint_dir)
    };
    let mut trainer = Trainer::new(config, device)?;

    if let Some(name) = &args.checkpoint {
        trainer.resume(&args.checkpoint_dir.join(name))?;
    }

    let mut progress = TrainingProgressBar::new()?;
    trainer.train(&dataset, &stop_flag, &mut progress)?;

    Ok(())
}

fn init() -> Result<Args, Box<dyn Error>> {
    let args = Args::parse();

    SimpleLogger::init(LevelFilter::Info, Config::default())?;

    Ok(args)
}
