//! Fixed-point export of trained parameters.
//!
//! The engine embeds the network as a Rust struct literal, so the output is
//! a nested literal such as
//!
//! ```text
//! Nnue{ft:BitLinear{weights:[[..],..],biases:[..]},l1:Linear{weights:[[..]],biases:[..]}}
//! ```
//!
//! where every scalar is `round(value * scale)` with ties going to even.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::Read;

use candle_core::{DType, Tensor};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::network::{ACTIVATION_RANGE, WEIGHT_SCALE};

/// Scale of the feature transformer weights and biases.
pub const FT_SCALE: f64 = ACTIVATION_RANGE as f64;

/// Scale of the output layer weights.
pub const LINEAR_WEIGHT_SCALE: f64 = WEIGHT_SCALE as f64;

/// Output biases are added after the weight and activation scales have
/// multiplied together, so they carry both.
pub const LINEAR_BIAS_SCALE: f64 = (WEIGHT_SCALE * ACTIVATION_RANGE) as f64;

/// Scales and rounds a single parameter, ties to even.
pub fn quantize(value: f64, scale: f64) -> i64 {
    (value * scale).round_ties_even() as i64
}

/// A tensor of any rank as a tree of nested sequences.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorLiteral {
    Scalar(f64),
    Sequence(Vec<TensorLiteral>),
}

impl TensorLiteral {
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let data = tensor.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
        Ok(Self::from_flat(tensor.dims(), &data))
    }

    fn from_flat(dims: &[usize], data: &[f64]) -> Self {
        let Some((&len, rest)) = dims.split_first() else {
            return Self::Scalar(data[0]);
        };

        let stride = rest.iter().product::<usize>();
        if stride == 0 {
            return Self::Sequence((0..len).map(|_| Self::from_flat(rest, &[])).collect());
        }

        Self::Sequence(
            data.chunks(stride)
                .map(|chunk| Self::from_flat(rest, chunk))
                .collect(),
        )
    }

    /// Builds a literal from nested JSON number arrays.
    pub fn from_json(name: &str, value: &Value) -> Result<Self> {
        match value {
            Value::Number(number) => number.as_f64().map(Self::Scalar).ok_or_else(|| {
                Error::ShapeMismatch {
                    name: name.to_string(),
                    expected: "a finite number".to_string(),
                    found: number.to_string(),
                }
            }),
            Value::Array(items) => items
                .iter()
                .map(|item| Self::from_json(name, item))
                .collect::<Result<Vec<_>>>()
                .map(Self::Sequence),
            other => Err(Error::ShapeMismatch {
                name: name.to_string(),
                expected: "nested arrays of numbers".to_string(),
                found: other.to_string(),
            }),
        }
    }

    /// Dimensions of the tensor, or `None` if the nesting is ragged.
    pub fn shape(&self) -> Option<Vec<usize>> {
        match self {
            Self::Scalar(_) => Some(Vec::new()),
            Self::Sequence(items) => {
                let Some(first) = items.first() else {
                    return Some(vec![0]);
                };
                let inner = first.shape()?;
                for item in &items[1..] {
                    if item.shape()? != inner {
                        return None;
                    }
                }
                let mut shape = vec![items.len()];
                shape.extend(inner);
                Some(shape)
            }
        }
    }

    /// Swaps the two axes of a rectangular rank 2 literal.
    pub fn transpose(&self) -> Option<Self> {
        let shape = self.shape()?;
        let [rows, cols] = shape[..] else {
            return None;
        };

        let columns = (0..cols)
            .map(|col| {
                (0..rows)
                    .map(|row| self.at(&[row, col]).cloned())
                    .collect::<Option<Vec<_>>>()
                    .map(Self::Sequence)
            })
            .collect::<Option<Vec<_>>>()?;

        Some(Self::Sequence(columns))
    }

    fn at(&self, index: &[usize]) -> Option<&Self> {
        match (self, index.split_first()) {
            (_, None) => Some(self),
            (Self::Sequence(items), Some((&i, rest))) => items.get(i)?.at(rest),
            (Self::Scalar(_), Some(_)) => None,
        }
    }

    /// All scalars in row-major order.
    pub fn flatten(&self) -> Vec<f64> {
        let mut values = Vec::new();
        self.collect_into(&mut values);
        values
    }

    /// True when no scalar is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        match self {
            Self::Scalar(value) => value.is_finite(),
            Self::Sequence(items) => items.iter().all(Self::is_finite),
        }
    }

    fn collect_into(&self, values: &mut Vec<f64>) {
        match self {
            Self::Scalar(value) => values.push(*value),
            Self::Sequence(items) => items.iter().for_each(|item| item.collect_into(values)),
        }
    }

    fn render(&self, scale: f64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(value) => write!(f, "{}", quantize(*value, scale)),
            Self::Sequence(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    item.render(scale, f)?;
                }
                f.write_str("]")
            }
        }
    }
}

/// One node of the exported text.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Struct {
        type_name: &'static str,
        fields: Vec<(String, Literal)>,
    },
    Tensor {
        value: TensorLiteral,
        scale: f64,
    },
}

impl Literal {
    fn tensor(value: TensorLiteral, scale: f64) -> Self {
        Self::Tensor { value, scale }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Struct { type_name, fields } => {
                write!(f, "{type_name}{{")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{name}:{value}")?;
                }
                f.write_str("}")
            }
            Self::Tensor { value, scale } => value.render(*scale, f),
        }
    }
}

/// Maps the exported layer roles to the names the parameters are stored under.
///
/// Trainers disagree on what they call the output layer (`l1` vs `out`), while
/// the engine always reads it from the `output_key` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportNames {
    pub feature_transformer: String,
    pub output: String,
    pub output_key: String,
}

impl Default for ExportNames {
    fn default() -> Self {
        Self {
            feature_transformer: "ft".to_string(),
            output: "l1".to_string(),
            output_key: "l1".to_string(),
        }
    }
}

/// Weight and bias of one linear layer, with validated shapes.
#[derive(Debug)]
pub struct LayerParameters<'a> {
    pub weights: &'a TensorLiteral,
    pub biases: &'a TensorLiteral,
    pub outputs: usize,
    pub inputs: usize,
}

/// Named parameter tensors, keyed like `ft.weight` or `l1.bias`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    tensors: BTreeMap<String, TensorLiteral>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tensors(tensors: &HashMap<String, Tensor>) -> Result<Self> {
        let mut set = Self::new();
        for (name, tensor) in tensors {
            set.insert(name, TensorLiteral::from_tensor(tensor)?);
        }
        Ok(set)
    }

    /// Reads a JSON object mapping parameter names to nested number arrays.
    pub fn from_json<R: Read>(reader: R) -> Result<Self> {
        let object: serde_json::Map<String, Value> = serde_json::from_reader(reader)?;
        let mut set = Self::new();
        for (name, value) in &object {
            set.insert(name, TensorLiteral::from_json(name, value)?);
        }
        Ok(set)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: TensorLiteral) {
        self.tensors.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Result<&TensorLiteral> {
        self.tensors
            .get(name)
            .ok_or_else(|| Error::MissingParameter(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// Looks up `{prefix}.weight` and `{prefix}.bias` and checks they form a linear layer.
    pub fn layer(&self, prefix: &str) -> Result<LayerParameters<'_>> {
        let weight_name = format!("{prefix}.weight");
        let bias_name = format!("{prefix}.bias");
        let weights = self.get(&weight_name)?;
        let biases = self.get(&bias_name)?;

        let [outputs, inputs] = expect_rank::<2>(&weight_name, weights)?;
        let [bias_len] = expect_rank::<1>(&bias_name, biases)?;

        if bias_len != outputs {
            return Err(Error::ShapeMismatch {
                name: bias_name,
                expected: format!("[{outputs}]"),
                found: format!("[{bias_len}]"),
            });
        }

        for (name, value) in [(&weight_name, weights), (&bias_name, biases)] {
            if !value.is_finite() {
                return Err(Error::NonFinite(name.clone()));
            }
        }

        Ok(LayerParameters {
            weights,
            biases,
            outputs,
            inputs,
        })
    }
}

fn expect_rank<const N: usize>(name: &str, value: &TensorLiteral) -> Result<[usize; N]> {
    let mismatch = |found: String| Error::ShapeMismatch {
        name: name.to_string(),
        expected: format!("a rank {N} tensor"),
        found,
    };

    let shape = value.shape().ok_or_else(|| mismatch("a ragged tensor".to_string()))?;
    shape
        .as_slice()
        .try_into()
        .map_err(|_| mismatch(format!("{shape:?}")))
}

/// The feature transformer, transposed so each input feature owns one row.
/// The engine adds or removes a single row when a piece moves.
pub fn bit_linear(layer: &LayerParameters) -> Result<Literal> {
    let weights = layer.weights.transpose().ok_or_else(|| Error::ShapeMismatch {
        name: "feature transformer weights".to_string(),
        expected: "a rank 2 tensor".to_string(),
        found: format!("{:?}", layer.weights.shape()),
    })?;

    Ok(Literal::Struct {
        type_name: "BitLinear",
        fields: vec![
            ("weights".to_string(), Literal::tensor(weights, FT_SCALE)),
            (
                "biases".to_string(),
                Literal::tensor(layer.biases.clone(), FT_SCALE),
            ),
        ],
    })
}

pub fn linear(layer: &LayerParameters) -> Literal {
    Literal::Struct {
        type_name: "Linear",
        fields: vec![
            (
                "weights".to_string(),
                Literal::tensor(layer.weights.clone(), LINEAR_WEIGHT_SCALE),
            ),
            (
                "biases".to_string(),
                Literal::tensor(layer.biases.clone(), LINEAR_BIAS_SCALE),
            ),
        ],
    }
}

pub fn network(parameters: &ParameterSet, names: &ExportNames) -> Result<Literal> {
    let ft = parameters.layer(&names.feature_transformer)?;
    let output = parameters.layer(&names.output)?;

    // The output layer reads both perspectives' accumulators.
    if output.inputs != ft.outputs * 2 {
        return Err(Error::ShapeMismatch {
            name: format!("{}.weight", names.output),
            expected: format!("[{}, {}]", output.outputs, ft.outputs * 2),
            found: format!("[{}, {}]", output.outputs, output.inputs),
        });
    }

    Ok(Literal::Struct {
        type_name: "Nnue",
        fields: vec![
            ("ft".to_string(), bit_linear(&ft)?),
            (names.output_key.clone(), linear(&output)),
        ],
    })
}

/// Renders the whole network in the engine's literal format.
pub fn dump(parameters: &ParameterSet, names: &ExportNames) -> Result<String> {
    Ok(network(parameters, names)?.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn seq(values: &[f64]) -> TensorLiteral {
        TensorLiteral::Sequence(values.iter().copied().map(TensorLiteral::Scalar).collect())
    }

    fn matrix(rows: &[&[f64]]) -> TensorLiteral {
        TensorLiteral::Sequence(rows.iter().map(|row| seq(row)).collect())
    }

    fn small_network() -> ParameterSet {
        let mut set = ParameterSet::new();
        // 2 outputs, 3 inputs
        set.insert("ft.weight", matrix(&[&[1.0, 0.0, -1.0], &[0.5, 0.25, 0.0]]));
        set.insert("ft.bias", seq(&[0.0, 1.0]));
        set.insert("l1.weight", matrix(&[&[0.5, -0.5, 1.0, 0.0]]));
        set.insert("l1.bias", seq(&[0.25]));
        set
    }

    #[test]
    fn test_quantize_rounds_half_to_even() {
        assert_eq!(quantize(0.5, 1.0), 0);
        assert_eq!(quantize(1.5, 1.0), 2);
        assert_eq!(quantize(2.5, 1.0), 2);
        assert_eq!(quantize(-0.5, 1.0), 0);
        assert_eq!(quantize(-1.5, 1.0), -2);
        assert_eq!(quantize(0.3, 64.0), 19);
    }

    #[test]
    fn test_linear_literal() {
        let mut set = ParameterSet::new();
        set.insert("l1.weight", matrix(&[&[0.5, -0.5]]));
        set.insert("l1.bias", seq(&[0.25]));

        let layer = set.layer("l1").unwrap();
        assert_eq!(
            linear(&layer).to_string(),
            "Linear{weights:[[32,-32]],biases:[2032]}"
        );
    }

    #[test]
    fn test_bit_linear_transposes_weights() {
        let set = small_network();
        let layer = set.layer("ft").unwrap();
        assert_eq!(
            bit_linear(&layer).unwrap().to_string(),
            "BitLinear{weights:[[127,64],[0,32],[-127,0]],biases:[0,127]}"
        );
    }

    #[test]
    fn test_dump_network() {
        let text = dump(&small_network(), &ExportNames::default()).unwrap();
        assert_eq!(
            text,
            "Nnue{ft:BitLinear{weights:[[127,64],[0,32],[-127,0]],biases:[0,127]},\
             l1:Linear{weights:[[32,-32,64,0]],biases:[2032]}}"
        );
    }

    #[test]
    fn test_dump_uses_name_table() {
        let mut set = ParameterSet::new();
        for name in small_network().names() {
            let renamed = name.replace("l1.", "out.");
            set.insert(renamed, small_network().get(name).unwrap().clone());
        }

        let names = ExportNames {
            output: "out".to_string(),
            ..ExportNames::default()
        };
        let text = dump(&set, &names).unwrap();
        assert!(text.contains(",l1:Linear{weights:[[32,-32,64,0]]"));

        assert!(matches!(
            dump(&set, &ExportNames::default()),
            Err(Error::MissingParameter(name)) if name == "l1.weight"
        ));
    }

    #[test]
    fn test_missing_bias() {
        let mut set = small_network();
        set.tensors.remove("ft.bias");
        assert!(matches!(
            dump(&set, &ExportNames::default()),
            Err(Error::MissingParameter(name)) if name == "ft.bias"
        ));
    }

    #[test]
    fn test_shape_mismatch() {
        let mut set = small_network();
        set.insert("ft.bias", matrix(&[&[0.0, 1.0]]));
        assert!(matches!(
            dump(&set, &ExportNames::default()),
            Err(Error::ShapeMismatch { name, .. }) if name == "ft.bias"
        ));

        let mut set = small_network();
        set.insert("l1.weight", seq(&[0.5, -0.5, 1.0, 0.0]));
        assert!(matches!(
            dump(&set, &ExportNames::default()),
            Err(Error::ShapeMismatch { name, .. }) if name == "l1.weight"
        ));

        let mut set = small_network();
        set.insert("ft.weight", matrix(&[&[1.0, 0.0], &[0.5, 0.25, 0.0]]));
        assert!(matches!(
            dump(&set, &ExportNames::default()),
            Err(Error::ShapeMismatch { name, .. }) if name == "ft.weight"
        ));

        let mut set = small_network();
        set.insert("l1.weight", matrix(&[&[0.5, -0.5]]));
        assert!(matches!(
            dump(&set, &ExportNames::default()),
            Err(Error::ShapeMismatch { name, .. }) if name == "l1.weight"
        ));
    }

    #[test]
    fn test_non_finite_parameters() {
        let mut set = small_network();
        set.insert("ft.weight", matrix(&[&[1.0, f64::NAN, -1.0], &[0.5, 0.25, 0.0]]));
        set.insert("ft.bias", seq(&[f64::INFINITY, 1.0]));
        assert!(matches!(
            dump(&set, &ExportNames::default()),
            Err(Error::NonFinite(name)) if name == "ft.weight"
        ));

        let mut set = small_network();
        set.insert("l1.bias", seq(&[f64::NEG_INFINITY]));
        assert!(matches!(
            dump(&set, &ExportNames::default()),
            Err(Error::NonFinite(name)) if name == "l1.bias"
        ));
    }

    #[test]
    fn test_from_tensor() {
        let device = Device::Cpu;
        let tensor = Tensor::new(&[[1f32, 2.0, 3.0], [4.0, 5.0, 6.0]], &device).unwrap();
        let literal = TensorLiteral::from_tensor(&tensor).unwrap();
        assert_eq!(literal, matrix(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]]));
        assert_eq!(literal.shape(), Some(vec![2, 3]));

        let scalar = TensorLiteral::from_tensor(&Tensor::new(0.5f32, &device).unwrap()).unwrap();
        assert_eq!(scalar, TensorLiteral::Scalar(0.5));
    }

    #[test]
    fn test_from_json() {
        let json = r#"{"ft.weight": [[1, 0, -1], [0.5, 0.25, 0]], "ft.bias": [0, 1],
                       "out.weight": [[0.5, -0.5, 1, 0]], "out.bias": [0.25]}"#;
        let set = ParameterSet::from_json(json.as_bytes()).unwrap();
        let names = ExportNames {
            output: "out".to_string(),
            ..ExportNames::default()
        };
        assert_eq!(
            dump(&set, &names).unwrap(),
            dump(&small_network(), &ExportNames::default()).unwrap()
        );
    }

    #[test]
    fn test_from_json_rejects_strings() {
        let json = r#"{"ft.weight": [["a"]]}"#;
        assert!(matches!(
            ParameterSet::from_json(json.as_bytes()),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_ragged_shape() {
        let ragged = matrix(&[&[1.0], &[1.0, 2.0]]);
        assert_eq!(ragged.shape(), None);
        assert_eq!(ragged.transpose(), None);
        assert_eq!(TensorLiteral::Sequence(vec![]).shape(), Some(vec![0]));
    }
}
