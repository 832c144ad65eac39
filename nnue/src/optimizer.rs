use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::VarMap;

#[derive(Clone, Debug)]
pub struct ParamsAdam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Default for ParamsAdam {
    fn default() -> Self {
        Self {
            lr: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

struct VarAdam {
    name: String,
    var: Var,
    first_moment: Var,
    second_moment: Var,
}

/// Adam over the named variables of a `VarMap`.
///
/// Unlike candle's own optimizers the moment buffers and the step counter
/// can be exported and restored, which checkpoints need to resume training
/// where it left off.
pub struct Adam {
    vars: Vec<VarAdam>,
    step_t: usize,
    params: ParamsAdam,
}

const STEP_KEY: &str = "step";

impl Adam {
    pub fn new(varmap: &VarMap, params: ParamsAdam) -> Result<Self> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::msg("parameter map lock poisoned"))?;

        let mut named: Vec<(&String, &Var)> = data.iter().collect();
        named.sort_by(|a, b| a.0.cmp(b.0));

        let vars = named
            .into_iter()
            .filter(|(_, var)| var.dtype().is_float())
            .map(|(name, var)| {
                let shape = var.shape();
                Ok(VarAdam {
                    name: name.clone(),
                    var: var.clone(),
                    first_moment: Var::zeros(shape, var.dtype(), var.device())?,
                    second_moment: Var::zeros(shape, var.dtype(), var.device())?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            vars,
            step_t: 0,
            params,
        })
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_t += 1;
        let lr = self.params.lr;
        let beta1 = self.params.beta1;
        let beta2 = self.params.beta2;
        let scale_m = 1f64 / (1f64 - beta1.powi(self.step_t as i32));
        let scale_v = 1f64 / (1f64 - beta2.powi(self.step_t as i32));

        for var in &self.vars {
            let theta = &var.var;
            let m = &var.first_moment;
            let v = &var.second_moment;
            if let Some(g) = grads.get(theta) {
                let next_m = ((m.as_tensor() * beta1)? + (g * (1.0 - beta1))?)?;
                let next_v = ((v.as_tensor() * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;
                let m_hat = (&next_m * scale_m)?;
                let v_hat = (&next_v * scale_v)?;
                let adjusted_grad = (m_hat / (v_hat.sqrt()? + self.params.eps)?)?;
                let next_theta = (theta.as_tensor() - (adjusted_grad * lr)?)?;
                m.set(&next_m)?;
                v.set(&next_v)?;
                theta.set(&next_theta)?;
            }
        }

        Ok(())
    }

    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let grads = loss.backward()?;
        self.step(&grads)
    }

    /// Snapshot of the moment buffers (`{name}.m`, `{name}.v`) and step counter.
    pub fn state(&self) -> Result<HashMap<String, Tensor>> {
        let mut state = HashMap::with_capacity(self.vars.len() * 2 + 1);
        for var in &self.vars {
            state.insert(format!("{}.m", var.name), var.first_moment.as_tensor().copy()?);
            state.insert(format!("{}.v", var.name), var.second_moment.as_tensor().copy()?);
        }
        state.insert(
            STEP_KEY.to_string(),
            Tensor::new(self.step_t as i64, &Device::Cpu)?,
        );
        Ok(state)
    }

    /// Restores a snapshot taken by `state`. Every buffer must be present and
    /// match the shape of its variable; nothing changes unless all of them do.
    pub fn restore(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        let lookup = |key: String| {
            let tensor = state
                .get(&key)
                .ok_or_else(|| candle_core::Error::msg(format!("missing optimizer state `{key}`")))?;
            Ok::<_, candle_core::Error>((key, tensor))
        };

        let step = lookup(STEP_KEY.to_string())?.1.to_dtype(DType::I64)?.to_scalar::<i64>()?;
        let step = usize::try_from(step)
            .map_err(|_| candle_core::Error::msg(format!("invalid optimizer step {step}")))?;

        let mut staged = Vec::with_capacity(self.vars.len() * 2);
        for var in &self.vars {
            for (buffer, suffix) in [(&var.first_moment, "m"), (&var.second_moment, "v")] {
                let (key, tensor) = lookup(format!("{}.{}", var.name, suffix))?;
                if tensor.dims() != var.var.dims() {
                    return Err(candle_core::Error::msg(format!(
                        "optimizer state `{key}` has shape {:?}, expected {:?}",
                        tensor.dims(),
                        var.var.dims()
                    )));
                }
                let tensor = tensor.to_dtype(var.var.dtype())?.to_device(var.var.device())?;
                staged.push((buffer, tensor));
            }
        }

        for (buffer, tensor) in staged {
            buffer.set(&tensor)?;
        }
        self.step_t = step;
        Ok(())
    }
}
