/// Fully connected network over the functional forward interface.
///
/// Parameters are named `layers.{i}.weight` (`[out, in]`) and
/// `layers.{i}.bias` (`[out]`). Hidden layers apply the configured
/// activation; the last layer is linear.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{FinalLayer, MetaModule};
use crate::params::{ParamMap, ParamStore};
use crate::tape::{BufId, Tape};
use crate::tensor::{SimpleRng, Tensor};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    #[default]
    Relu,
    Sigmoid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MlpConfig {
    /// `[n_in, hidden..., n_out]`
    pub layer_sizes: Vec<usize>,
    #[serde(default)]
    pub activation: ActivationKind,
    #[serde(default)]
    pub seed: u64,
}

impl MlpConfig {
    /// Test configuration: tiny classifier for fast iteration.
    pub fn test_config() -> Self {
        MlpConfig { layer_sizes: vec![4, 8, 3], activation: ActivationKind::Relu, seed: 42 }
    }

    pub fn num_layers(&self) -> usize {
        self.layer_sizes.len().saturating_sub(1)
    }
}

pub fn weight_name(layer: usize) -> String {
    format!("layers.{layer}.weight")
}

pub fn bias_name(layer: usize) -> String {
    format!("layers.{layer}.bias")
}

#[derive(Clone, Debug)]
pub struct Mlp {
    config: MlpConfig,
    params: ParamStore,
}

impl Mlp {
    pub fn new(config: MlpConfig) -> Self {
        let mut rng = SimpleRng::new(config.seed);
        let mut params = ParamStore::new();
        for (l, pair) in config.layer_sizes.windows(2).enumerate() {
            let (n_in, n_out) = (pair[0], pair[1]);
            let scale = (1.0 / n_in.max(1) as f32).sqrt();
            let mut w = vec![0.0f32; n_out * n_in];
            rng.fill_uniform(&mut w, scale);
            let mut b = vec![0.0f32; n_out];
            rng.fill_uniform(&mut b, scale);
            params.insert(weight_name(l), Tensor::new(w, vec![n_out, n_in]));
            params.insert(bias_name(l), Tensor::new(b, vec![n_out]));
        }
        Mlp { config, params }
    }

    pub fn config(&self) -> &MlpConfig {
        &self.config
    }

    /// Flatten trailing dims: `[batch, ...]` → `[batch, features]`.
    fn input_buf(tape: &mut Tape, input: &Tensor) -> BufId {
        tape.constant(input.data.clone(), vec![input.rows(), input.row_len()])
    }

    /// x @ W^T + b
    fn linear(tape: &mut Tape, params: &ParamMap, layer: usize, x: BufId) -> Result<BufId> {
        let w = params.require(&weight_name(layer))?;
        let b = params.require(&bias_name(layer))?;
        let w_t = tape.transpose(w)?;
        let z = tape.matmul(x, w_t)?;
        tape.add_row_bias(z, b)
    }
}

impl MetaModule for Mlp {
    fn params(&self) -> &ParamStore {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }

    fn forward(&self, tape: &mut Tape, params: &ParamMap, input: &Tensor) -> Result<BufId> {
        let mut h = Self::input_buf(tape, input);
        let last = self.config.num_layers().saturating_sub(1);
        for l in 0..self.config.num_layers() {
            h = Self::linear(tape, params, l, h)?;
            if l < last {
                h = match self.config.activation {
                    ActivationKind::Relu => tape.relu(h),
                    ActivationKind::Sigmoid => tape.sigmoid(h),
                };
            }
        }
        Ok(h)
    }
}

impl FinalLayer for Mlp {
    fn final_weight_name(&self) -> String {
        weight_name(self.config.num_layers().saturating_sub(1))
    }

    fn final_bias_name(&self) -> String {
        bias_name(self.config.num_layers().saturating_sub(1))
    }

    /// The output layer is linear, so its drive is the forward output.
    fn forward_membrane(&self, tape: &mut Tape, params: &ParamMap, input: &Tensor) -> Result<BufId> {
        self.forward(tape, params, input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_names_and_shapes() {
        let m = Mlp::new(MlpConfig::test_config());
        let names: Vec<_> = m.params().names().cloned().collect();
        assert_eq!(names, vec!["layers.0.weight", "layers.0.bias", "layers.1.weight", "layers.1.bias"]);
        assert_eq!(m.params().value("layers.1.weight").unwrap().shape, vec![3, 8]);
        assert_eq!(m.final_weight_name(), "layers.1.weight");
    }

    #[test]
    fn test_forward_shape_and_determinism() {
        let m = Mlp::new(MlpConfig::test_config());
        let x = Tensor::new((0..8).map(|v| v as f32 * 0.1).collect(), vec![2, 4]);
        let mut tape = Tape::new();
        let out = m.forward_stored(&mut tape, &x).unwrap();
        assert_eq!(tape.shape(out), &[2, 3]);

        let m2 = Mlp::new(MlpConfig::test_config());
        let mut tape2 = Tape::new();
        let out2 = m2.forward_stored(&mut tape2, &x).unwrap();
        assert_eq!(tape.data(out), tape2.data(out2));
    }

    #[test]
    fn test_forward_uses_supplied_snapshot() {
        let m = Mlp::new(MlpConfig { layer_sizes: vec![2, 1], activation: ActivationKind::Relu, seed: 1 });
        let mut tape = Tape::new();
        let mut params = ParamMap::new();
        params.insert(weight_name(0), tape.param(&[1.0, 2.0], vec![1, 2]));
        params.insert(bias_name(0), tape.param(&[0.5], vec![1]));
        let x = Tensor::new(vec![1.0, 1.0], vec![1, 2]);
        let out = m.forward(&mut tape, &params, &x).unwrap();
        assert_eq!(tape.data(out), &[3.5]);
    }
}
