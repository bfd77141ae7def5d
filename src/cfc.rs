use anyhow::{Result, ensure};
use candle_core::{DType, Device, Tensor};
use candle_nn::rnn::{GRU, GRUConfig, GRUState, RNN};
use candle_nn::{Init, Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

// =============================================================================
// Recurrent Core
// =============================================================================

/// A recurrent cell that maps `(B, F_in)` inputs to `(B, n_out)` outputs while
/// carrying a per-sequence state.
pub trait RecurrentCore {
    type State: Clone;

    fn output_size(&self) -> usize;

    fn zero_state(&self, batch: usize) -> Result<Self::State>;

    fn step(&self, input: &Tensor, state: &Self::State) -> Result<(Tensor, Self::State)>;

    /// Runs over a `(B, T, F_in)` sequence and returns `(B, T, n_out)` with the
    /// final state. `None` starts from the zero state.
    fn forward(&self, xs: &Tensor, state: Option<Self::State>) -> Result<(Tensor, Self::State)> {
        let (batch, seq_len, _) = xs.dims3()?;
        ensure!(seq_len > 0, "cannot run a recurrent core over an empty sequence");
        let mut state = match state {
            Some(state) => state,
            None => self.zero_state(batch)?,
        };
        let mut ys = Vec::with_capacity(seq_len);
        for t in 0..seq_len {
            let x = xs.narrow(1, t, 1)?.squeeze(1)?.contiguous()?;
            let (y, next) = self.step(&x, &state)?;
            ys.push(y);
            state = next;
        }
        Ok((Tensor::stack(&ys, 1)?, state))
    }
}

// =============================================================================
// CfC
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CfcMode {
    #[default]
    #[serde(alias = "default")]
    Gated,
    NoGate,
    Pure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CfcConfig {
    pub units: usize,
    pub backbone_units: usize,
    pub backbone_layers: usize,
    pub mode: CfcMode,
}

impl Default for CfcConfig {
    fn default() -> Self {
        Self {
            units: 64,
            backbone_units: 128,
            backbone_layers: 1,
            mode: CfcMode::Gated,
        }
    }
}

fn xavier_bound(fan_in: usize, fan_out: usize) -> f64 {
    (6.0 / (fan_in + fan_out) as f64).sqrt()
}

/// Linear layer with Xavier-uniform weights.
fn xavier_linear(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let bound = xavier_bound(in_dim, out_dim);
    let weight = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        Init::Uniform {
            lo: -bound,
            up: bound,
        },
    )?;
    let b = 1.0 / (in_dim as f64).sqrt();
    let bias = vb.get_with_hints(out_dim, "bias", Init::Uniform { lo: -b, up: b })?;
    Ok(Linear::new(weight, Some(bias)))
}

fn lecun_tanh(xs: &Tensor) -> Result<Tensor> {
    Ok(xs.affine(0.666, 0.0)?.tanh()?.affine(1.7159, 0.0)?)
}

enum CfcHead {
    Gated {
        ff1: Linear,
        ff2: Linear,
        time_a: Linear,
        time_b: Linear,
        no_gate: bool,
    },
    Pure {
        ff1: Linear,
        w_tau: Tensor,
        a: Tensor,
    },
}

/// Closed-form continuous-time cell with a fused output projection.
///
/// The carried state is the `(B, units)` hidden vector; `step` returns the
/// projected `(B, proj_size)` output alongside it. The time span is fixed
/// at 1.
pub struct Cfc {
    backbone: Vec<Linear>,
    head: CfcHead,
    fc: Linear,
    units: usize,
    proj_size: usize,
    device: Device,
    dtype: DType,
}

impl Cfc {
    pub fn new(
        input_size: usize,
        proj_size: usize,
        config: &CfcConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        ensure!(config.units > 0, "CfC needs at least one hidden unit");
        let units = config.units;
        let mut backbone = Vec::with_capacity(config.backbone_layers);
        let mut width = input_size + units;
        for i in 0..config.backbone_layers {
            backbone.push(xavier_linear(
                width,
                config.backbone_units,
                vb.pp(format!("backbone.{i}")),
            )?);
            width = config.backbone_units;
        }

        let ff1 = xavier_linear(width, units, vb.pp("ff1"))?;
        let head = match config.mode {
            CfcMode::Pure => {
                let bound = xavier_bound(units, 1);
                let init = Init::Uniform {
                    lo: -bound,
                    up: bound,
                };
                CfcHead::Pure {
                    ff1,
                    w_tau: vb.get_with_hints((1, units), "w_tau", init)?,
                    a: vb.get_with_hints((1, units), "A", init)?,
                }
            }
            mode => CfcHead::Gated {
                ff1,
                ff2: xavier_linear(width, units, vb.pp("ff2"))?,
                time_a: xavier_linear(width, units, vb.pp("time_a"))?,
                time_b: xavier_linear(width, units, vb.pp("time_b"))?,
                no_gate: mode == CfcMode::NoGate,
            },
        };
        let fc = xavier_linear(units, proj_size, vb.pp("fc"))?;

        Ok(Self {
            backbone,
            head,
            fc,
            units,
            proj_size,
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    fn next_hidden(&self, x: &Tensor) -> Result<Tensor> {
        let h = match &self.head {
            CfcHead::Gated {
                ff1,
                ff2,
                time_a,
                time_b,
                no_gate,
            } => {
                let ff1 = ff1.forward(x)?.tanh()?;
                let ff2 = ff2.forward(x)?.tanh()?;
                let t_a = time_a.forward(x)?;
                let t_b = time_b.forward(x)?;
                let t_interp = candle_nn::ops::sigmoid(&(t_a + t_b)?)?;
                if *no_gate {
                    (ff1 + t_interp.mul(&ff2)?)?
                } else {
                    let keep = t_interp.affine(-1.0, 1.0)?;
                    (ff1.mul(&keep)? + t_interp.mul(&ff2)?)?
                }
            }
            CfcHead::Pure { ff1, w_tau, a } => {
                let ff1 = ff1.forward(x)?;
                let decay = ff1.abs()?.broadcast_add(&w_tau.abs()?)?.neg()?.exp()?;
                a.broadcast_mul(&decay.mul(&ff1)?)?
                    .neg()?
                    .broadcast_add(a)?
            }
        };
        Ok(h)
    }
}

impl RecurrentCore for Cfc {
    type State = Tensor;

    fn output_size(&self) -> usize {
        self.proj_size
    }

    fn zero_state(&self, batch: usize) -> Result<Tensor> {
        Ok(Tensor::zeros((batch, self.units), self.dtype, &self.device)?)
    }

    fn step(&self, input: &Tensor, state: &Tensor) -> Result<(Tensor, Tensor)> {
        let mut x = Tensor::cat(&[input, state], 1)?;
        for layer in &self.backbone {
            x = lecun_tanh(&layer.forward(&x)?)?;
        }
        let h = self.next_hidden(&x)?;
        let out = self.fc.forward(&h)?;
        Ok((out, h))
    }
}

// =============================================================================
// GRU
// =============================================================================

/// Conventional GRU cell with the same output projection as [`Cfc`].
pub struct GruCore {
    gru: GRU,
    fc: Linear,
    proj_size: usize,
}

impl GruCore {
    pub fn new(input_size: usize, units: usize, proj_size: usize, vb: VarBuilder) -> Result<Self> {
        let gru = candle_nn::rnn::gru(input_size, units, GRUConfig::default(), vb.pp("gru"))?;
        let fc = xavier_linear(units, proj_size, vb.pp("fc"))?;
        Ok(Self { gru, fc, proj_size })
    }
}

impl RecurrentCore for GruCore {
    type State = GRUState;

    fn output_size(&self) -> usize {
        self.proj_size
    }

    fn zero_state(&self, batch: usize) -> Result<GRUState> {
        Ok(self.gru.zero_state(batch)?)
    }

    fn step(&self, input: &Tensor, state: &GRUState) -> Result<(Tensor, GRUState)> {
        let next = self.gru.step(input, state)?;
        let out = self.fc.forward(next.h())?;
        Ok((out, next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_nn::VarMap;

    fn build(mode: CfcMode) -> (VarMap, Cfc) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = CfcConfig {
            units: 8,
            backbone_units: 16,
            backbone_layers: 1,
            mode,
        };
        let cfc = Cfc::new(5, 3, &config, vb).unwrap();
        (varmap, cfc)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn forward_shapes_for_every_mode() {
        for mode in [CfcMode::Gated, CfcMode::NoGate, CfcMode::Pure] {
            let (_vm, cfc) = build(mode);
            let xs = Tensor::randn(0f32, 1.0, (2, 7, 5), &Device::Cpu).unwrap();
            let (ys, h) = cfc.forward(&xs, None).unwrap();
            assert_eq!(ys.dims(), &[2, 7, 3]);
            assert_eq!(h.dims(), &[2, 8]);
        }
    }

    #[test]
    fn state_shape_does_not_depend_on_sequence_length() {
        let (_vm, cfc) = build(CfcMode::Gated);
        let short = Tensor::randn(0f32, 1.0, (2, 1, 5), &Device::Cpu).unwrap();
        let long = Tensor::randn(0f32, 1.0, (2, 11, 5), &Device::Cpu).unwrap();
        let (_, h1) = cfc.forward(&short, None).unwrap();
        let (_, h2) = cfc.forward(&long, None).unwrap();
        assert_eq!(h1.dims(), h2.dims());
    }

    #[test]
    fn recurrence_is_step_composable() {
        let (_vm, cfc) = build(CfcMode::Gated);
        let xs = Tensor::randn(0f32, 1.0, (2, 6, 5), &Device::Cpu).unwrap();
        let (full, h_full) = cfc.forward(&xs, None).unwrap();

        let (first, h) = cfc.forward(&xs.narrow(1, 0, 4).unwrap(), None).unwrap();
        let (second, h_split) = cfc.forward(&xs.narrow(1, 4, 2).unwrap(), Some(h)).unwrap();
        let joined = Tensor::cat(&[&first, &second], 1).unwrap();

        assert_abs_diff_eq!(max_abs_diff(&full, &joined), 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(max_abs_diff(&h_full, &h_split), 0.0, epsilon = 1e-5);
    }

    #[test]
    fn none_state_equals_explicit_zero_state() {
        let (_vm, cfc) = build(CfcMode::Pure);
        let xs = Tensor::randn(0f32, 1.0, (3, 2, 5), &Device::Cpu).unwrap();
        let (a, _) = cfc.forward(&xs, None).unwrap();
        let (b, _) = cfc.forward(&xs, Some(cfc.zero_state(3).unwrap())).unwrap();
        assert_abs_diff_eq!(max_abs_diff(&a, &b), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn rejects_empty_sequence() {
        let (_vm, cfc) = build(CfcMode::Gated);
        let xs = Tensor::zeros((1, 0, 5), DType::F32, &Device::Cpu).unwrap();
        assert!(cfc.forward(&xs, None).is_err());
    }

    #[test]
    fn lecun_tanh_matches_formula() {
        let xs = Tensor::new(&[0.0f32, 1.0, -2.0], &Device::Cpu).unwrap();
        let ys = lecun_tanh(&xs).unwrap().to_vec1::<f32>().unwrap();
        for (x, y) in [0.0f32, 1.0, -2.0].iter().zip(ys) {
            assert_abs_diff_eq!(y, 1.7159 * (0.666 * x).tanh(), epsilon = 1e-5);
        }
    }

    #[test]
    fn gru_core_is_a_drop_in_substitute() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let gru = GruCore::new(5, 8, 3, vb).unwrap();
        let xs = Tensor::randn(0f32, 1.0, (2, 4, 5), &Device::Cpu).unwrap();
        let (ys, state) = gru.forward(&xs, None).unwrap();
        assert_eq!(ys.dims(), &[2, 4, 3]);
        assert_eq!(state.h().dims(), &[2, 8]);
        assert_eq!(gru.output_size(), 3);
    }

    #[test]
    fn mode_parses_from_json() {
        let cfg: CfcConfig = serde_json::from_str(r#"{"mode":"no_gate","units":4}"#).unwrap();
        assert_eq!(cfg.mode, CfcMode::NoGate);
        assert_eq!(cfg.backbone_units, 128);
        let legacy: CfcMode = serde_json::from_str("\"default\"").unwrap();
        assert_eq!(legacy, CfcMode::Gated);
    }
}
