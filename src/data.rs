// Synthetic heteroscedastic dense-regression data.
//
// Real dataset loading (geospatial radar stacks, RGB-D) lives outside the
// core; this generator exists so the binary and the integration tests can
// exercise the training and inference paths with well-formed [B,C,H,W] /
// [B,K,H,W] batches. Inputs are blocky smooth random fields, the target is a
// nonlinear mix of the input channels, and the additive noise is Laplace with
// a spatially structured scale derived from channel 0 — so a calibrated model
// can actually learn the aleatoric component.

use anyhow::{ensure, Result};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub batch_size: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub height: usize,
    pub width: usize,
    /// Minimum Laplace noise scale.
    pub noise_floor: f32,
    /// Spatial modulation strength of the noise scale.
    pub noise_gain: f32,
}

impl SyntheticConfig {
    pub fn test() -> Self {
        Self {
            batch_size: 4,
            in_channels: 3,
            out_channels: 1,
            height: 8,
            width: 8,
            noise_floor: 0.05,
            noise_gain: 0.2,
        }
    }

    pub fn default_config() -> Self {
        Self {
            batch_size: 8,
            in_channels: 3,
            out_channels: 1,
            height: 32,
            width: 32,
            noise_floor: 0.05,
            noise_gain: 0.3,
        }
    }
}

pub struct SyntheticField {
    config: SyntheticConfig,
    rng: StdRng,
}

impl SyntheticField {
    pub fn new(config: SyntheticConfig, seed: u64) -> Result<Self> {
        ensure!(config.batch_size >= 1, "batch_size must be >= 1");
        ensure!(config.height >= 1 && config.width >= 1, "spatial dims must be >= 1");
        ensure!(config.noise_floor > 0.0, "noise_floor must be positive");
        ensure!(config.noise_gain >= 0.0, "noise_gain must be non-negative");
        Ok(Self { config, rng: StdRng::seed_from_u64(seed) })
    }

    /// Draw one (inputs `[B,C,H,W]`, targets `[B,K,H,W]`) pair. All values
    /// finite; reproducible under a fixed seed.
    pub fn next_batch(&mut self, device: &Device) -> Result<(Tensor, Tensor)> {
        let cfg = &self.config;
        let (b, c, h, w) = (cfg.batch_size, cfg.in_channels, cfg.height, cfg.width);
        let (hc, wc) = ((h / 4).max(1), (w / 4).max(1));

        // Blocky smooth fields: coarse uniform grid upsampled to full size.
        let coarse: Vec<f32> = (0..b * c * hc * wc)
            .map(|_| self.rng.gen::<f32>() * 2.0 - 1.0)
            .collect();
        let inputs = Tensor::from_vec(coarse, (b, c, hc, wc), device)?
            .upsample_nearest2d(h, w)?;

        // Target signal: per-channel-scaled tanh of the channel mean.
        let base = inputs.mean(1)?.unsqueeze(1)?.tanh()?; // [B,1,H,W]
        let mut channels = Vec::with_capacity(cfg.out_channels);
        for k in 0..cfg.out_channels {
            channels.push((&base * (1.0 + 0.5 * k as f64))?);
        }
        let signal = Tensor::cat(&channels, 1)?;

        // Heteroscedastic Laplace noise, scale tied to input channel 0.
        let scale = ((candle_nn::ops::sigmoid(&inputs.narrow(1, 0, 1)?)? * cfg.noise_gain as f64)?
            + cfg.noise_floor as f64)?;
        let unit_noise: Vec<f32> = (0..b * cfg.out_channels * h * w)
            .map(|_| {
                // Inverse-CDF Laplace sample with unit scale.
                let u: f32 = self.rng.gen::<f32>() - 0.5;
                let u = u.clamp(-0.499_99, 0.499_99);
                -u.signum() * (1.0 - 2.0 * u.abs()).ln()
            })
            .collect();
        let noise = Tensor::from_vec(unit_noise, (b, cfg.out_channels, h, w), device)?
            .broadcast_mul(&scale)?;

        let targets = (signal + noise)?;
        Ok((inputs, targets))
    }
}
