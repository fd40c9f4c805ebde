// MIMO core network: M input adapter heads around one weight-shared
// encoder-bottleneck-decoder, split back into M two-branched output heads
// (mean + raw dispersion). The shared trunk is what lets one physical network
// emulate an M-member ensemble; the adapter arrays are explicit so the weight
// sharing is guaranteed by construction rather than by module-composition
// tricks.

use anyhow::{ensure, Result};
use candle_core::{Module, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, Dropout, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::losses::UncertaintyLoss;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MimoConfig {
    /// Number of virtual ensemble members M.
    pub num_subnetworks: usize,
    /// Input repetition probability p for the router.
    pub input_repetition: f64,
    pub in_channels: usize,
    /// Regression channels K.
    pub out_channels: usize,
    /// Width of the adapter heads; the shared trunk uses 2x this.
    pub hidden_channels: usize,
    pub encoder_dropout: f32,
    pub core_dropout: f32,
    pub decoder_dropout: f32,
    pub loss: UncertaintyLoss,
}

impl MimoConfig {
    /// Tiny CPU-fast tier for tests.
    pub fn test() -> Self {
        Self {
            num_subnetworks: 2,
            input_repetition: 0.2,
            in_channels: 3,
            out_channels: 1,
            hidden_channels: 8,
            encoder_dropout: 0.0,
            core_dropout: 0.1,
            decoder_dropout: 0.0,
            loss: UncertaintyLoss::LaplaceNll,
        }
    }

    /// Default training tier.
    pub fn default_config() -> Self {
        Self {
            num_subnetworks: 3,
            input_repetition: 0.2,
            in_channels: 3,
            out_channels: 1,
            hidden_channels: 32,
            encoder_dropout: 0.1,
            core_dropout: 0.2,
            decoder_dropout: 0.1,
            loss: UncertaintyLoss::LaplaceNll,
        }
    }

    /// Caller-input validation; aborts setup before any training step runs.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.num_subnetworks >= 1, "num_subnetworks must be >= 1");
        ensure!(
            (0.0..=1.0).contains(&self.input_repetition),
            "input_repetition must be in [0,1], got {}",
            self.input_repetition
        );
        ensure!(self.in_channels >= 1 && self.out_channels >= 1, "channel counts must be >= 1");
        ensure!(self.hidden_channels >= 1, "hidden_channels must be >= 1");
        for (name, rate) in [
            ("encoder_dropout", self.encoder_dropout),
            ("core_dropout", self.core_dropout),
            ("decoder_dropout", self.decoder_dropout),
        ] {
            ensure!(
                (0.0..=1.0).contains(&rate),
                "{name} must be in [0,1], got {rate}"
            );
        }
        Ok(())
    }

    /// Spatial divisor the input must satisfy: one pooling level, plus the
    /// block size when the covariance loss is selected.
    pub fn spatial_divisor(&self) -> usize {
        2 * self.loss.dispersion_stride()
    }
}

// ---------------------------------------------------------------------------
// Building blocks
// ---------------------------------------------------------------------------

struct ConvBlock {
    conv: Conv2d,
    dropout: Dropout,
}

impl ConvBlock {
    fn new(in_c: usize, out_c: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig { padding: 1, ..Default::default() };
        Ok(Self {
            conv: conv2d(in_c, out_c, 3, cfg, vb.pp("conv"))?,
            dropout: Dropout::new(dropout),
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.conv.forward(x)?.relu()?;
        self.dropout.forward(&h, train).map_err(Into::into)
    }
}

/// One forward pass result for a single subnetwork. The dispersion tensor is
/// raw (pre-positivity-transform); its interpretation belongs to the loss.
pub struct SubnetOutput {
    pub mean: Tensor,
    pub dispersion: Tensor,
}

// ---------------------------------------------------------------------------
// MimoNet
// ---------------------------------------------------------------------------

pub struct MimoNet {
    config: MimoConfig,
    input_heads: Vec<Conv2d>,
    encoder: ConvBlock,
    core: ConvBlock,
    decoder: ConvBlock,
    mean_heads: Vec<Conv2d>,
    dispersion_heads: Vec<Conv2d>,
}

impl MimoNet {
    pub fn new(config: MimoConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let m = config.num_subnetworks;
        let hid = config.hidden_channels;
        let pad1 = Conv2dConfig { padding: 1, ..Default::default() };

        let mut input_heads = Vec::with_capacity(m);
        for i in 0..m {
            input_heads.push(conv2d(
                config.in_channels,
                hid,
                3,
                pad1,
                vb.pp(format!("input_head_{i}")),
            )?);
        }

        let encoder = ConvBlock::new(hid * m, hid * 2, config.encoder_dropout, vb.pp("encoder"))?;
        let core = ConvBlock::new(hid * 2, hid * 2, config.core_dropout, vb.pp("core"))?;
        let decoder = ConvBlock::new(hid * 2, hid, config.decoder_dropout, vb.pp("decoder"))?;

        let disp_channels = config.loss.dispersion_channels(config.out_channels);
        let disp_stride = config.loss.dispersion_stride();
        let mut mean_heads = Vec::with_capacity(m);
        let mut dispersion_heads = Vec::with_capacity(m);
        for i in 0..m {
            mean_heads.push(conv2d(
                hid,
                config.out_channels,
                3,
                pad1,
                vb.pp(format!("mean_head_{i}")),
            )?);
            let disp_cfg = Conv2dConfig {
                padding: 0,
                stride: disp_stride,
                ..Default::default()
            };
            dispersion_heads.push(conv2d(
                hid,
                disp_channels,
                disp_stride,
                disp_cfg,
                vb.pp(format!("dispersion_head_{i}")),
            )?);
        }

        Ok(Self {
            config,
            input_heads,
            encoder,
            core,
            decoder,
            mean_heads,
            dispersion_heads,
        })
    }

    pub fn config(&self) -> &MimoConfig {
        &self.config
    }

    pub fn num_subnetworks(&self) -> usize {
        self.config.num_subnetworks
    }

    /// Map the routed `[B,M,C,H,W]` input to M (mean, dispersion) pairs.
    /// `train` enables dropout; the same flag drives MC-dropout inference.
    pub fn forward(&self, routed: &Tensor, train: bool) -> Result<Vec<SubnetOutput>> {
        let (_b, m, c, h, w) = routed.dims5()?;
        ensure!(
            m == self.config.num_subnetworks,
            "routed input has {m} member slots, model expects {}",
            self.config.num_subnetworks
        );
        ensure!(
            c == self.config.in_channels,
            "routed input has {c} channels, model expects {}",
            self.config.in_channels
        );
        let div = self.config.spatial_divisor();
        ensure!(
            h % div == 0 && w % div == 0,
            "spatial dims {h}x{w} must be divisible by {div}"
        );

        // M adapter heads, concatenated into the shared trunk.
        let mut features = Vec::with_capacity(m);
        for (i, head) in self.input_heads.iter().enumerate() {
            let slot = routed.narrow(1, i, 1)?.squeeze(1)?;
            features.push(head.forward(&slot)?.relu()?);
        }
        let x = Tensor::cat(&features, 1)?;

        let x = self.encoder.forward(&x, train)?;
        let x = x.max_pool2d(2)?;
        let x = self.core.forward(&x, train)?;
        let x = x.upsample_nearest2d(h, w)?;
        let shared = self.decoder.forward(&x, train)?;

        let mut outputs = Vec::with_capacity(m);
        for i in 0..m {
            outputs.push(SubnetOutput {
                mean: self.mean_heads[i].forward(&shared)?,
                dispersion: self.dispersion_heads[i].forward(&shared)?,
            });
        }
        Ok(outputs)
    }
}
