use std::collections::HashMap;

use candle_core::{Result, Tensor};
use candle_nn::{linear, ops::sigmoid, Linear, Module, VarBuilder, VarMap};

use crate::encoding::NUM_FEATURES;

use super::{FT_OUT, L1_OUT, LINEAR_MAX_WEIGHT, LINEAR_MIN_WEIGHT};

/// Stored name of the output layer's weight tensor.
pub const OUTPUT_WEIGHT: &str = "l1.weight";

// Candle-compatible network definition (used for training)
pub struct Nnue {
    pub(crate) ft: Linear,
    pub(crate) l1: Linear,
}

impl Nnue {
    pub fn new(vs: &VarBuilder) -> Result<Self> {
        Ok(Self {
            ft: linear(NUM_FEATURES, FT_OUT, vs.pp("ft"))?,
            l1: linear(FT_OUT * 2, L1_OUT, vs.pp("l1"))?,
        })
    }

    /// Raw output logit for a batch of positions.
    ///
    /// The feature transformer is shared between both perspectives, and the
    /// accumulator goes through a hard clamp to [0, 1] which the integer
    /// runtime mirrors with a clipped ReLU.
    pub fn forward(&self, stm: &Tensor, sntm: &Tensor) -> Result<Tensor> {
        let stm = self.ft.forward(stm)?;
        let sntm = self.ft.forward(sntm)?;
        let accumulator = Tensor::cat(&[&stm, &sntm], 1)?;

        let l1_in = accumulator.clamp(0f32, 1f32)?;
        self.l1.forward(&l1_in)
    }

    /// Predicted win rate in [0, 1].
    pub fn win_rate(&self, stm: &Tensor, sntm: &Tensor) -> Result<Tensor> {
        sigmoid(&self.forward(stm, sntm)?)
    }
}

/// Clamps the output layer weights back into the range the i8 runtime can hold.
pub fn clamp_output_weights(varmap: &VarMap) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::msg("parameter map lock poisoned"))?;
    let weight = data
        .get(OUTPUT_WEIGHT)
        .ok_or_else(|| candle_core::Error::msg(format!("no parameter named {OUTPUT_WEIGHT}")))?;

    let clamped = weight
        .as_tensor()
        .clamp(LINEAR_MIN_WEIGHT, LINEAR_MAX_WEIGHT)?;
    weight.set(&clamped)
}

/// Copies of every parameter, keyed by their stored names (`ft.weight`, ...).
pub fn parameters(varmap: &VarMap) -> Result<HashMap<String, Tensor>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::msg("parameter map lock poisoned"))?;

    data.iter()
        .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?)))
        .collect()
}

/// Overwrites every parameter of `varmap` with the tensor stored under its name.
///
/// All tensors are checked before the first one is written, so on error
/// `varmap` is left untouched.
pub fn load_parameters(varmap: &VarMap, parameters: &HashMap<String, Tensor>) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::msg("parameter map lock poisoned"))?;

    let mut staged = Vec::with_capacity(data.len());
    for (name, var) in data.iter() {
        let value = parameters
            .get(name)
            .ok_or_else(|| candle_core::Error::msg(format!("missing parameter `{name}`")))?;
        if value.dims() != var.dims() {
            return Err(candle_core::Error::msg(format!(
                "parameter `{name}` has shape {:?}, expected {:?}",
                value.dims(),
                var.dims()
            )));
        }
        staged.push((var, value.to_dtype(var.dtype())?.to_device(var.device())?));
    }

    for (var, value) in staged {
        var.set(&value)?;
    }
    Ok(())
}
