pub mod checkpoint;
pub mod dataset;
pub mod encoding;
pub mod error;
pub mod export;
pub mod network;
pub mod optimizer;
pub mod training;

pub use error::{Error, Result};
