use std::error::Error;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use cozy_chess::Board;
use nnue::encoding::{Record, RECORD_SIZE};
use rayon::prelude::*;

pub fn default_output() -> PathBuf {
    let timestamp = Local::now().format("%Y-%m-%d-%H:%M");
    PathBuf::from(format!("data/{}.bin", timestamp))
}

/// Encodes every `fen,win_rate` line of `input` into `output`.
pub fn convert(input: &Path, output: &Path) -> Result<usize, Box<dyn Error>> {
    let lines = BufReader::new(File::open(input)?)
        .lines()
        .collect::<Result<Vec<_>, _>>()?;

    log::info!("Encoding {} positions from {:?}", lines.len().saturating_sub(1), input);

    // First line is the header
    let records = lines
        .par_iter()
        .enumerate()
        .skip(1)
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| parse_line(line).map_err(|e| format!("line {}: {}", idx + 1, e)))
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut writer = BufWriter::new(File::create(output)?);
    for record in &records {
        writer.write_all(record)?;
    }
    writer.flush()?;

    log::info!("Wrote {} records to {:?}", records.len(), output);
    Ok(records.len())
}

fn parse_line(line: &str) -> Result<[u8; RECORD_SIZE], Box<dyn Error + Send + Sync>> {
    let (fen, win_rate) = line
        .rsplit_once(',')
        .ok_or("expected `fen,win_rate`")?;

    let board: Board = fen
        .trim()
        .parse()
        .map_err(|e| format!("invalid FEN {:?}: {:?}", fen, e))?;
    let win_rate: f32 = win_rate.trim().parse()?;
    if !(0.0..=1.0).contains(&win_rate) {
        return Err(format!("win rate {} outside [0, 1]", win_rate).into());
    }

    Ok(Record::from_board(&board, win_rate).encode()?)
}
