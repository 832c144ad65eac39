use crate::encoding::NUM_FEATURES;
use crate::error::{Error, Result};
use crate::export::{
    quantize, ExportNames, LayerParameters, ParameterSet, FT_SCALE, LINEAR_BIAS_SCALE,
    LINEAR_WEIGHT_SCALE,
};

use super::{ACTIVATION_RANGE, FT_OUT, L1_OUT, OUTPUT_SCALE, WEIGHT_SCALE};

/// Integer mirror of the engine-side network, built from the same values
/// the exporter writes.
///
/// The feature transformer is stored transposed ([feature][output]) so a
/// feature change is a single row add/sub on the accumulator.
pub struct QuantizedNnue {
    ft_weights: Box<[[i16; FT_OUT]]>,
    ft_biases: [i16; FT_OUT],
    l1_weights: [i8; FT_OUT * 2],
    l1_bias: i32,
}

/// Feature transformer output for one perspective.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accumulator {
    values: [i16; FT_OUT],
}

impl QuantizedNnue {
    pub fn from_parameters(parameters: &ParameterSet, names: &ExportNames) -> Result<Self> {
        let ft = parameters.layer(&names.feature_transformer)?;
        let l1 = parameters.layer(&names.output)?;
        expect_dims(&names.feature_transformer, &ft, FT_OUT, NUM_FEATURES)?;
        expect_dims(&names.output, &l1, L1_OUT, FT_OUT * 2)?;

        let ft_name = format!("{}.weight", names.feature_transformer);
        let ft_flat = ft.weights.flatten();
        let mut ft_weights = vec![[0i16; FT_OUT]; NUM_FEATURES].into_boxed_slice();
        for (out_idx, row) in ft_flat.chunks_exact(NUM_FEATURES).enumerate() {
            for (feature_idx, &w) in row.iter().enumerate() {
                ft_weights[feature_idx][out_idx] = narrow(&ft_name, w, FT_SCALE, "i16")?;
            }
        }

        let mut ft_biases = [0i16; FT_OUT];
        let ft_bias_name = format!("{}.bias", names.feature_transformer);
        for (q, &b) in ft_biases.iter_mut().zip(&ft.biases.flatten()) {
            *q = narrow(&ft_bias_name, b, FT_SCALE, "i16")?;
        }

        let mut l1_weights = [0i8; FT_OUT * 2];
        let l1_name = format!("{}.weight", names.output);
        for (q, &w) in l1_weights.iter_mut().zip(&l1.weights.flatten()) {
            *q = narrow(&l1_name, w, LINEAR_WEIGHT_SCALE, "i8")?;
        }

        let l1_bias = narrow(
            &format!("{}.bias", names.output),
            l1.biases.flatten()[0],
            LINEAR_BIAS_SCALE,
            "i32",
        )?;

        Ok(Self {
            ft_weights,
            ft_biases,
            l1_weights,
            l1_bias,
        })
    }

    /// An accumulator holding only the biases.
    pub fn empty_accumulator(&self) -> Accumulator {
        Accumulator {
            values: self.ft_biases,
        }
    }

    pub fn accumulator(&self, features: impl IntoIterator<Item = usize>) -> Accumulator {
        let mut accumulator = self.empty_accumulator();
        for feature in features {
            self.add_feature(&mut accumulator, feature);
        }
        accumulator
    }

    /// Adds the row of `feature`, which must be below `NUM_FEATURES`.
    ///
    /// Entries wrap on overflow like the engine's accumulator does, so a
    /// later `sub_feature` of the same row restores the previous values.
    pub fn add_feature(&self, accumulator: &mut Accumulator, feature: usize) {
        for (v, &w) in accumulator.values.iter_mut().zip(&self.ft_weights[feature]) {
            *v = v.wrapping_add(w);
        }
    }

    /// Removes the row of `feature`, which must be below `NUM_FEATURES`.
    pub fn sub_feature(&self, accumulator: &mut Accumulator, feature: usize) {
        for (v, &w) in accumulator.values.iter_mut().zip(&self.ft_weights[feature]) {
            *v = v.wrapping_sub(w);
        }
    }

    /// Raw output at scale WEIGHT_SCALE * ACTIVATION_RANGE.
    pub fn evaluate(&self, stm: &Accumulator, sntm: &Accumulator) -> i32 {
        let inputs = stm.values.iter().chain(&sntm.values).map(|&v| clipped_relu(v));

        self.l1_bias
            + inputs
                .zip(&self.l1_weights)
                .map(|(i, &w)| i as i32 * w as i32)
                .sum::<i32>()
    }

    /// Engine score in centipawns, truncated toward zero.
    pub fn evaluate_centipawns(&self, stm: &Accumulator, sntm: &Accumulator) -> i32 {
        let raw = self.evaluate(stm, sntm) as i64;
        (raw * OUTPUT_SCALE as i64 / (WEIGHT_SCALE * ACTIVATION_RANGE) as i64) as i32
    }
}

/// The raw integer output back on the float model's logit scale.
pub fn raw_to_logit(raw: i32) -> f32 {
    raw as f32 / (WEIGHT_SCALE * ACTIVATION_RANGE) as f32
}

fn clipped_relu(value: i16) -> u8 {
    value.clamp(0, ACTIVATION_RANGE as i16) as u8
}

fn expect_dims(
    prefix: &str,
    layer: &LayerParameters,
    outputs: usize,
    inputs: usize,
) -> Result<()> {
    if layer.outputs != outputs || layer.inputs != inputs {
        return Err(Error::ShapeMismatch {
            name: format!("{prefix}.weight"),
            expected: format!("[{outputs}, {inputs}]"),
            found: format!("[{}, {}]", layer.outputs, layer.inputs),
        });
    }
    Ok(())
}

fn narrow<T: TryFrom<i64>>(name: &str, value: f64, scale: f64, target: &'static str) -> Result<T> {
    let quantized = quantize(value, scale);
    T::try_from(quantized).map_err(|_| Error::QuantizationOverflow {
        name: name.to_string(),
        value: quantized,
        target,
    })
}
