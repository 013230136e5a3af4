/// Leaky integrate-and-fire spiking network.
///
/// Discrete-time dynamics per layer, for t in 0..time_steps:
///   I_t = x_t @ W^T + b
///   u_t = beta * u_{t-1} * (1 - s_{t-1}) + I_t
///   s_t = fast_sigmoid(u_t - threshold)
/// Spikes of layer l are the input of layer l+1. Logits are the final layer's
/// spike counts summed over time; training flows through the fast-sigmoid
/// surrogate derivative. Class predictions read the counts by default, or the
/// earliest output spike with `SpikeDecoder::FirstSpike`.
///
/// Input rows are either `n_in` wide (constant current, repeated every step)
/// or `time_steps * n_in` wide (time-major, one `n_in` slice per step).
///
/// Parameters: `lif_layers.{i}.base_layer.weight` `[out, in]` and
/// `lif_layers.{i}.base_layer.bias` `[out]`.

use std::cmp::Reverse;

use serde::{Deserialize, Serialize};

use crate::error::{MetaError, Result};
use crate::loss::undo_onehot;
use crate::model::{FinalLayer, MetaModule, SpikeProbe, SpikeTrace};
use crate::params::{ParamMap, ParamStore};
use crate::tape::{BufId, Tape};
use crate::tensor::{SimpleRng, Tensor};

/// How a class is read from the output layer's spikes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpikeDecoder {
    /// Most spikes over the simulation.
    #[default]
    SpikeCount,
    /// Earliest first spike; ties go to the higher count, then the lower index.
    FirstSpike,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LifConfig {
    /// `[n_in, hidden..., n_out]`
    pub layer_sizes: Vec<usize>,
    pub time_steps: usize,
    /// Membrane leak factor in [0, 1].
    pub beta: f32,
    pub threshold: f32,
    /// Uniform init range, divided by sqrt(fan_in).
    pub weight_scale: f32,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub decoder: SpikeDecoder,
}

impl Default for LifConfig {
    fn default() -> Self {
        LifConfig {
            layer_sizes: vec![8, 16, 5],
            time_steps: 100,
            beta: 0.9,
            threshold: 1.0,
            weight_scale: 2.0,
            seed: 0,
            decoder: SpikeDecoder::SpikeCount,
        }
    }
}

impl LifConfig {
    /// Test configuration: tiny network, few time steps.
    pub fn test_config() -> Self {
        LifConfig {
            layer_sizes: vec![4, 6, 3],
            time_steps: 8,
            beta: 0.9,
            threshold: 0.5,
            weight_scale: 2.0,
            seed: 42,
            decoder: SpikeDecoder::SpikeCount,
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layer_sizes.len().saturating_sub(1)
    }
}

pub fn weight_name(layer: usize) -> String {
    format!("lif_layers.{layer}.base_layer.weight")
}

pub fn bias_name(layer: usize) -> String {
    format!("lif_layers.{layer}.base_layer.bias")
}

/// Class per row with the earliest output spike. `post` is
/// `[time_steps, batch, n_out]`; a silent unit counts as firing at `time_steps`.
pub fn first_spike_decode(post: &[f32], time_steps: usize, batch: usize, n_out: usize) -> Vec<usize> {
    (0..batch)
        .map(|b| {
            let fired = |t: usize, j: usize| post[(t * batch + b) * n_out + j] > 0.0;
            (0..n_out)
                .min_by_key(|&j| {
                    let first = (0..time_steps).find(|&t| fired(t, j)).unwrap_or(time_steps);
                    let count = (0..time_steps).filter(|&t| fired(t, j)).count();
                    (first, Reverse(count))
                })
                .unwrap_or(0)
        })
        .collect()
}

/// Outputs of one simulation.
struct LifOutputs {
    /// Final-layer spike counts `[batch, n_out]`.
    counts: BufId,
    /// Final-layer input current summed over time `[batch, n_out]`.
    drive: BufId,
}

/// Per-step recording of the final layer (single-sample probes).
#[derive(Default)]
struct Recorder {
    pre: Vec<f32>,
    post: Vec<f32>,
}

#[derive(Clone, Debug)]
pub struct LifNetwork {
    config: LifConfig,
    params: ParamStore,
}

impl LifNetwork {
    pub fn new(config: LifConfig) -> Self {
        let mut rng = SimpleRng::new(config.seed);
        let mut params = ParamStore::new();
        for (l, pair) in config.layer_sizes.windows(2).enumerate() {
            let (n_in, n_out) = (pair[0], pair[1]);
            let scale = config.weight_scale / (n_in.max(1) as f32).sqrt();
            let mut w = vec![0.0f32; n_out * n_in];
            rng.fill_uniform(&mut w, scale);
            let mut b = vec![0.0f32; n_out];
            rng.fill_uniform(&mut b, 0.1 * scale);
            params.insert(weight_name(l), Tensor::new(w, vec![n_out, n_in]));
            params.insert(bias_name(l), Tensor::new(b, vec![n_out]));
        }
        LifNetwork { config, params }
    }

    pub fn config(&self) -> &LifConfig {
        &self.config
    }

    fn n_in(&self) -> usize {
        self.config.layer_sizes.first().copied().unwrap_or(0)
    }

    /// Input buffer and whether it is time-major.
    fn input_buf(&self, tape: &mut Tape, input: &Tensor) -> Result<(BufId, bool)> {
        let (rows, width) = (input.rows(), input.row_len());
        let n_in = self.n_in();
        let time_major = if width == n_in {
            false
        } else if width == n_in * self.config.time_steps {
            true
        } else {
            return Err(MetaError::ShapeMismatch {
                op: "lif_input",
                left: input.shape.clone(),
                right: vec![rows, n_in],
            });
        };
        Ok((tape.constant(input.data.clone(), vec![rows, width]), time_major))
    }

    fn simulate(
        &self,
        tape: &mut Tape,
        params: &ParamMap,
        input: &Tensor,
        mut recorder: Option<&mut Recorder>,
    ) -> Result<LifOutputs> {
        let (x, time_major) = self.input_buf(tape, input)?;
        let batch = input.rows();
        let n_layers = self.config.num_layers();
        let n_in = self.n_in();

        let mut weights_t = Vec::with_capacity(n_layers);
        let mut biases = Vec::with_capacity(n_layers);
        for l in 0..n_layers {
            let w = params.require(&weight_name(l))?;
            weights_t.push(tape.transpose(w)?);
            biases.push(params.require(&bias_name(l))?);
        }

        let mut mem = Vec::with_capacity(n_layers);
        let mut spk = Vec::with_capacity(n_layers);
        for &size in &self.config.layer_sizes[1..] {
            mem.push(tape.constant(vec![0.0; batch * size], vec![batch, size]));
            spk.push(tape.constant(vec![0.0; batch * size], vec![batch, size]));
        }

        let mut counts: Option<BufId> = None;
        let mut drive: Option<BufId> = None;
        for t in 0..self.config.time_steps {
            let mut h = if time_major { tape.slice_cols(x, t * n_in, n_in)? } else { x };
            for l in 0..n_layers {
                if l + 1 == n_layers {
                    if let Some(rec) = recorder.as_deref_mut() {
                        rec.pre.extend_from_slice(tape.data(h));
                    }
                }
                let z = tape.matmul(h, weights_t[l])?;
                let current = tape.add_row_bias(z, biases[l])?;

                // reset where the neuron spiked on the previous step
                let not_spiked = tape.neg(spk[l]);
                let not_spiked = tape.add_const(not_spiked, 1.0);
                let kept = tape.mul(mem[l], not_spiked)?;
                let leaked = tape.scale(kept, self.config.beta);
                mem[l] = tape.add(leaked, current)?;

                let centered = tape.add_const(mem[l], -self.config.threshold);
                spk[l] = tape.fast_sigmoid(centered, &[0.0])?;
                h = spk[l];

                if l + 1 == n_layers {
                    counts = Some(match counts {
                        Some(c) => tape.add(c, spk[l])?,
                        None => spk[l],
                    });
                    drive = Some(match drive {
                        Some(d) => tape.add(d, current)?,
                        None => current,
                    });
                    if let Some(rec) = recorder.as_deref_mut() {
                        rec.post.extend_from_slice(tape.data(spk[l]));
                    }
                }
            }
        }

        match (counts, drive) {
            (Some(counts), Some(drive)) => Ok(LifOutputs { counts, drive }),
            _ => Err(MetaError::IncompatibleConfig("LIF network needs at least one layer and one time step")),
        }
    }
}

impl MetaModule for LifNetwork {
    fn params(&self) -> &ParamStore {
        &self.params
    }

    fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }

    fn forward(&self, tape: &mut Tape, params: &ParamMap, input: &Tensor) -> Result<BufId> {
        Ok(self.simulate(tape, params, input, None)?.counts)
    }

    fn predict(&self, tape: &mut Tape, params: &ParamMap, input: &Tensor, logits: BufId) -> Result<Vec<usize>> {
        match self.config.decoder {
            SpikeDecoder::SpikeCount => Ok(undo_onehot(&tape.to_tensor(logits))),
            SpikeDecoder::FirstSpike => {
                let mut rec = Recorder::default();
                tape.no_grad(|t| self.simulate(t, params, input, Some(&mut rec)))?;
                let n_out = self.config.layer_sizes.last().copied().unwrap_or(0);
                Ok(first_spike_decode(&rec.post, self.config.time_steps, input.rows(), n_out))
            }
        }
    }
}

impl FinalLayer for LifNetwork {
    fn final_weight_name(&self) -> String {
        weight_name(self.config.num_layers().saturating_sub(1))
    }

    fn final_bias_name(&self) -> String {
        bias_name(self.config.num_layers().saturating_sub(1))
    }

    fn forward_membrane(&self, tape: &mut Tape, params: &ParamMap, input: &Tensor) -> Result<BufId> {
        Ok(self.simulate(tape, params, input, None)?.drive)
    }
}

impl SpikeProbe for LifNetwork {
    fn probe(&self, tape: &mut Tape, params: &ParamMap, sample: &Tensor) -> Result<SpikeTrace> {
        if sample.rows() != 1 {
            return Err(MetaError::ShapeMismatch { op: "probe", left: sample.shape.clone(), right: vec![1] });
        }
        let mut rec = Recorder::default();
        tape.no_grad(|t| self.simulate(t, params, sample, Some(&mut rec)))?;
        let sizes = &self.config.layer_sizes;
        let n_layers = self.config.num_layers();
        Ok(SpikeTrace {
            time_steps: self.config.time_steps,
            n_pre: sizes[n_layers - 1],
            n_post: sizes[n_layers],
            pre: rec.pre,
            post: rec.post,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(batch: usize) -> Tensor {
        Tensor::new((0..batch * 4).map(|v| (v % 5) as f32 * 0.3).collect(), vec![batch, 4])
    }

    #[test]
    fn test_counts_bounded_by_time_steps() {
        let net = LifNetwork::new(LifConfig::test_config());
        let mut tape = Tape::new();
        let out = net.forward_stored(&mut tape, &input(3)).unwrap();
        assert_eq!(tape.shape(out), &[3, 3]);
        for &c in tape.data(out) {
            assert!((0.0..=8.0).contains(&c), "count {c}");
            assert_eq!(c.fract(), 0.0);
        }
    }

    #[test]
    fn test_time_major_input_accepted() {
        let net = LifNetwork::new(LifConfig::test_config());
        let x = Tensor::full(&[2, 4 * 8], 0.5);
        let mut tape = Tape::new();
        assert!(net.forward_stored(&mut tape, &x).is_ok());
        let bad = Tensor::full(&[2, 5], 0.5);
        assert!(matches!(net.forward_stored(&mut tape, &bad), Err(MetaError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_surrogate_gradient_reaches_first_layer() {
        let net = LifNetwork::new(LifConfig::test_config());
        let mut tape = Tape::new();
        let params = net.meta_named_parameters(&mut tape);
        let out = net.forward(&mut tape, &params, &input(2)).unwrap();
        let loss = tape.sum(out);
        let w0 = params.require(&weight_name(0)).unwrap();
        let g = tape.grad(loss, None, &[w0], false).unwrap();
        assert!(g[0].is_some());
    }

    #[test]
    fn test_first_spike_decode_prefers_earliest_then_count() {
        // T = 3, batch = 2, n_out = 3
        let post = [
            // t = 0
            0.0, 0.0, 0.0,   0.0, 0.0, 0.0,
            // t = 1
            0.0, 1.0, 1.0,   0.0, 0.0, 0.0,
            // t = 2
            1.0, 0.0, 1.0,   0.0, 0.0, 0.0,
        ];
        // row 0: units 1 and 2 both fire first at t = 1, unit 2 fires more
        // row 1: silent, lowest index
        assert_eq!(first_spike_decode(&post, 3, 2, 3), vec![2, 0]);
    }

    #[test]
    fn test_first_spike_predict_shape_and_default_decoder() {
        let x = input(3);
        let counts_net = LifNetwork::new(LifConfig::test_config());
        let first_net = LifNetwork::new(LifConfig { decoder: SpikeDecoder::FirstSpike, ..LifConfig::test_config() });

        let mut tape = Tape::new();
        let params = counts_net.meta_named_parameters(&mut tape);
        let logits = counts_net.forward(&mut tape, &params, &x).unwrap();
        let by_count = counts_net.predict(&mut tape, &params, &x, logits).unwrap();
        assert_eq!(by_count, undo_onehot(&tape.to_tensor(logits)));

        let before = tape.num_ops();
        let by_time = first_net.predict(&mut tape, &params, &x, logits).unwrap();
        assert_eq!(tape.num_ops(), before, "decoding must not record ops");
        assert_eq!(by_time.len(), 3);
        assert!(by_time.iter().all(|&c| c < 3));
    }

    #[test]
    fn test_probe_matches_forward_counts() {
        let net = LifNetwork::new(LifConfig::test_config());
        let sample = input(1);
        let mut tape = Tape::new();
        let params = net.meta_named_parameters(&mut tape);
        let before = tape.num_ops();
        let trace = net.probe(&mut tape, &params, &sample).unwrap();
        assert_eq!(tape.num_ops(), before, "probe must not record ops");
        assert_eq!(trace.pre.len(), 8 * 6);
        assert_eq!(trace.post.len(), 8 * 3);

        let counts = net.forward(&mut tape, &params, &sample).unwrap();
        for unit in 0..3 {
            assert_eq!(trace.post_count(unit, 0, 8), tape.data(counts)[unit]);
        }
    }
}
