use anyhow::{Result, ensure};
use candle_core::{D, Tensor};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, Module, ModuleT, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::cfc::{Cfc, CfcConfig, GruCore, RecurrentCore};

// =============================================================================
// Feature Extractor
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvConfig {
    /// Stacked frames per observation.
    pub in_channels: usize,
    pub channels: [usize; 4],
    pub kernel_size: usize,
}

impl Default for ConvConfig {
    fn default() -> Self {
        Self {
            in_channels: 4,
            channels: [64, 128, 128, 256],
            kernel_size: 5,
        }
    }
}

impl ConvConfig {
    pub fn feature_size(&self) -> usize {
        self.channels[3]
    }
}

/// Four strided convolutions with batch norm after the second and fourth,
/// followed by global average pooling: `(N, C, H, W)` -> `(N, F)`.
pub struct ConvBlock {
    conv1: Conv2d,
    conv2: Conv2d,
    bn2: BatchNorm,
    conv3: Conv2d,
    conv4: Conv2d,
    bn4: BatchNorm,
    in_channels: usize,
}

impl ConvBlock {
    pub fn new(config: &ConvConfig, vb: VarBuilder) -> Result<Self> {
        ensure!(config.kernel_size % 2 == 1, "kernel size must be odd");
        let conv_cfg = Conv2dConfig {
            padding: config.kernel_size / 2,
            stride: 2,
            ..Default::default()
        };
        let k = config.kernel_size;
        let [c1, c2, c3, c4] = config.channels;
        let conv1 = candle_nn::conv2d(config.in_channels, c1, k, conv_cfg, vb.pp("conv1"))?;
        let conv2 = candle_nn::conv2d(c1, c2, k, conv_cfg, vb.pp("conv2"))?;
        let bn2 = candle_nn::batch_norm(c2, 1e-5, vb.pp("bn2"))?;
        let conv3 = candle_nn::conv2d(c2, c3, k, conv_cfg, vb.pp("conv3"))?;
        let conv4 = candle_nn::conv2d(c3, c4, k, conv_cfg, vb.pp("conv4"))?;
        let bn4 = candle_nn::batch_norm(c4, 1e-5, vb.pp("bn4"))?;
        Ok(Self {
            conv1,
            conv2,
            bn2,
            conv3,
            conv4,
            bn4,
            in_channels: config.in_channels,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }
}

impl ModuleT for ConvBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let xs = self.conv1.forward(xs)?.relu()?;
        let xs = self.bn2.forward_t(&self.conv2.forward(&xs)?, train)?.relu()?;
        let xs = self.conv3.forward(&xs)?.relu()?;
        let xs = self.bn4.forward_t(&self.conv4.forward(&xs)?, train)?.relu()?;
        // global average pooling over H and W
        xs.mean(D::Minus1)?.mean(D::Minus1)
    }
}

// =============================================================================
// Policy
// =============================================================================

/// Recurrent core behind the conv features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    #[default]
    Cfc,
    Gru,
}

/// Conv feature extractor feeding a recurrent core, mapping
/// `(B, T, C, H, W)` frame sequences to `(B, T, n_actions)` logits.
pub struct ConvPolicy<R> {
    conv: ConvBlock,
    rnn: R,
}

impl ConvPolicy<Cfc> {
    pub fn cfc(
        conv: &ConvConfig,
        cfc: &CfcConfig,
        n_actions: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let block = ConvBlock::new(conv, vb.pp("conv_block"))?;
        let rnn = Cfc::new(conv.feature_size(), n_actions, cfc, vb.pp("rnn"))?;
        Ok(Self::new(block, rnn))
    }
}

impl ConvPolicy<GruCore> {
    pub fn gru(conv: &ConvConfig, units: usize, n_actions: usize, vb: VarBuilder) -> Result<Self> {
        let block = ConvBlock::new(conv, vb.pp("conv_block"))?;
        let rnn = GruCore::new(conv.feature_size(), units, n_actions, vb.pp("rnn"))?;
        Ok(Self::new(block, rnn))
    }
}

impl<R: RecurrentCore> ConvPolicy<R> {
    pub fn new(conv: ConvBlock, rnn: R) -> Self {
        Self { conv, rnn }
    }

    pub fn n_actions(&self) -> usize {
        self.rnn.output_size()
    }

    pub fn in_channels(&self) -> usize {
        self.conv.in_channels()
    }

    /// Batch and time are merged for the conv stack and split again before
    /// the recurrent core. `train` selects batch statistics in batch norm.
    pub fn forward_t(
        &self,
        xs: &Tensor,
        hx: Option<R::State>,
        train: bool,
    ) -> Result<(Tensor, R::State)> {
        let (b, t, c, h, w) = xs.dims5()?;
        ensure!(
            c == self.conv.in_channels(),
            "observation has {c} stacked frames but the model expects {}",
            self.conv.in_channels()
        );
        let merged = xs.reshape((b * t, c, h, w))?;
        let feats = self.conv.forward_t(&merged, train)?;
        let feats = feats.reshape((b, t, feats.dim(1)?))?;
        self.rnn.forward(&feats, hx)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    pub(crate) fn tiny_conv() -> ConvConfig {
        ConvConfig {
            in_channels: 4,
            channels: [4, 8, 8, 16],
            kernel_size: 5,
        }
    }

    pub(crate) fn tiny_cfc() -> CfcConfig {
        CfcConfig {
            units: 8,
            backbone_units: 16,
            ..Default::default()
        }
    }

    #[test]
    fn conv_block_pools_to_feature_vector() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let block = ConvBlock::new(&tiny_conv(), vb).unwrap();
        let xs = Tensor::randn(0f32, 1.0, (3, 4, 20, 20), &Device::Cpu).unwrap();
        let feats = block.forward_t(&xs, false).unwrap();
        assert_eq!(feats.dims(), &[3, 16]);
    }

    #[test]
    fn policy_maps_sequences_to_logits() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let policy = ConvPolicy::cfc(&tiny_conv(), &tiny_cfc(), 6, vb).unwrap();
        let xs = Tensor::randn(0f32, 1.0, (2, 3, 4, 16, 16), &Device::Cpu).unwrap();
        let (logits, h) = policy.forward_t(&xs, None, false).unwrap();
        assert_eq!(logits.dims(), &[2, 3, 6]);
        assert_eq!(h.dims(), &[2, 8]);
        assert_eq!(policy.n_actions(), 6);

        let one = Tensor::randn(0f32, 1.0, (2, 1, 4, 16, 16), &Device::Cpu).unwrap();
        let (_, h1) = policy.forward_t(&one, Some(h), false).unwrap();
        assert_eq!(h1.dims(), &[2, 8]);
    }

    #[test]
    fn policy_rejects_wrong_stack_depth() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let policy = ConvPolicy::cfc(&tiny_conv(), &tiny_cfc(), 4, vb).unwrap();
        let xs = Tensor::zeros((1, 1, 3, 16, 16), DType::F32, &Device::Cpu).unwrap();
        assert!(policy.forward_t(&xs, None, false).is_err());
    }

    #[test]
    fn gru_policy_shares_the_interface() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let policy = ConvPolicy::gru(&tiny_conv(), 8, 4, vb).unwrap();
        let xs = Tensor::randn(0f32, 1.0, (1, 2, 4, 16, 16), &Device::Cpu).unwrap();
        let (logits, _) = policy.forward_t(&xs, None, true).unwrap();
        assert_eq!(logits.dims(), &[1, 2, 4]);
    }
}
