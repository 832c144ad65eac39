pub mod model;
pub mod quantized;

pub use model::Nnue;
pub use quantized::{Accumulator, QuantizedNnue};

/// Size of the accumulator each perspective's features are embedded into.
pub const FT_OUT: usize = 32;

/// Number of network outputs.
pub const L1_OUT: usize = 1;

/// Quantized activations of the feature transformer span [0, ACTIVATION_RANGE].
pub const ACTIVATION_RANGE: i32 = 127;

/// Fixed-point scale of the output layer weights.
pub const WEIGHT_SCALE: i32 = 64;

/// Output layer weights must stay representable as i8 after scaling by WEIGHT_SCALE.
pub const LINEAR_MIN_WEIGHT: f32 = i8::MIN as f32 / WEIGHT_SCALE as f32;
pub const LINEAR_MAX_WEIGHT: f32 = i8::MAX as f32 / WEIGHT_SCALE as f32;

/// Converts the raw integer network output to centipawns in the engine.
pub const OUTPUT_SCALE: i32 = 115;
