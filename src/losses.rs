// Probabilistic loss library: negative log-likelihoods that turn the network's
// raw (mean, dispersion) heads into a training signal and, at inference time,
// into per-pixel variances.
//
// The network always emits an unconstrained dispersion parameter (log-variance
// for Gaussian, log-scale for Laplace, log-diagonal Cholesky factors for the
// covariance variant). Positivity is enforced here via exp plus a value-level
// clamp floor, so no loss ever sees a non-positive variance — the guard
// against the two known unstable paths (dispersion <= 0 and dispersion -> 0).

use anyhow::{bail, ensure, Result};
use candle_core::{Tensor, D};
use serde::{Deserialize, Serialize};

/// Variance floor applied after the positivity transform.
pub const EPS_MIN: f32 = 1e-5;
/// Variance ceiling guarding against exploding dispersions.
pub const EPS_MAX: f32 = 1e3;

/// Laplace scale -> variance, `var = 2 * scale^2`.
pub fn laplace_scale_to_variance(scale: f32) -> f32 {
    2.0 * scale * scale
}

/// Inverse of [`laplace_scale_to_variance`].
pub fn laplace_variance_to_scale(variance: f32) -> f32 {
    (variance / 2.0).sqrt()
}

/// Clamp in value space while letting gradients flow as if unclamped. The
/// correction term is detached, so backprop sees the raw dispersion.
fn clamp_value_only(t: &Tensor, min: f32, max: f32) -> Result<Tensor> {
    let correction = (t.clamp(min, max)? - t)?.detach();
    (t + correction).map_err(Into::into)
}

/// Flat index of entry (i, j), j <= i, in a row-major lower-triangular layout.
fn tril_index(i: usize, j: usize) -> usize {
    i * (i + 1) / 2 + j
}

/// `[B,K,H,W]` -> `[B,Hb,Wb,d]` with `d = K*block^2`; the block vector is
/// ordered (channel, block row, block col).
fn blocks_from_pixels(t: &Tensor, block: usize) -> Result<Tensor> {
    let (b, k, h, w) = t.dims4()?;
    ensure!(
        h % block == 0 && w % block == 0,
        "spatial dims {h}x{w} not divisible by block size {block}"
    );
    let (hb, wb) = (h / block, w / block);
    t.reshape((b, k, hb, block, wb, block))?
        .permute([0, 2, 4, 1, 3, 5])?
        .contiguous()?
        .reshape((b, hb, wb, k * block * block))
        .map_err(Into::into)
}

/// Inverse of [`blocks_from_pixels`].
fn pixels_from_blocks(t: &Tensor, block: usize, channels: usize) -> Result<Tensor> {
    let (b, hb, wb, d) = t.dims4()?;
    ensure!(
        d == channels * block * block,
        "block vector length {d} inconsistent with {channels} channels and block {block}"
    );
    t.reshape((b, hb, wb, channels, block, block))?
        .permute([0, 3, 1, 4, 2, 5])?
        .contiguous()?
        .reshape((b, channels, hb * block, wb * block))
        .map_err(Into::into)
}

/// The family of NLL losses. Each variant is a pure map from
/// (mean, raw dispersion, target) to a scalar loss, and also defines how the
/// raw dispersion converts to a per-pixel variance for the decomposer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UncertaintyLoss {
    /// Independent per-pixel Gaussian; dispersion head is log-variance.
    GaussianNll,
    /// Independent per-pixel Laplace; dispersion head is log-scale. The
    /// default in the training configurations.
    LaplaceNll,
    /// Pixel-covariance-aware Gaussian over non-overlapping `block x block`
    /// neighborhoods; dispersion head is the lower-triangular Cholesky factor
    /// per block (diagonal entries in log space).
    CovGaussianNll { block: usize },
}

impl UncertaintyLoss {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "gaussian_nll" => Ok(Self::GaussianNll),
            "laplace_nll" => Ok(Self::LaplaceNll),
            "cov_gaussian_nll" => Ok(Self::CovGaussianNll { block: 2 }),
            _ => bail!("unknown loss function: {name}"),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::GaussianNll => "gaussian_nll",
            Self::LaplaceNll => "laplace_nll",
            Self::CovGaussianNll { .. } => "cov_gaussian_nll",
        }
    }

    /// Number of channels the dispersion head must emit for `out_channels`
    /// regression channels.
    pub fn dispersion_channels(&self, out_channels: usize) -> usize {
        match self {
            Self::GaussianNll | Self::LaplaceNll => out_channels,
            Self::CovGaussianNll { block } => {
                let d = out_channels * block * block;
                d * (d + 1) / 2
            }
        }
    }

    /// Spatial stride of the dispersion head (block resolution for the
    /// covariance variant, full resolution otherwise).
    pub fn dispersion_stride(&self) -> usize {
        match self {
            Self::GaussianNll | Self::LaplaceNll => 1,
            Self::CovGaussianNll { block } => *block,
        }
    }

    /// Negative log-likelihood of `target` under the predicted distribution,
    /// mean-reduced to a scalar. Shape or dtype mismatches between mean and
    /// target are caller-input errors, never broadcast away.
    pub fn nll(&self, mean: &Tensor, dispersion: &Tensor, target: &Tensor) -> Result<Tensor> {
        ensure!(
            mean.shape() == target.shape(),
            "prediction shape {:?} != target shape {:?}",
            mean.shape(),
            target.shape()
        );
        ensure!(
            mean.dtype() == target.dtype(),
            "prediction dtype {:?} != target dtype {:?}",
            mean.dtype(),
            target.dtype()
        );

        match self {
            Self::GaussianNll => {
                ensure!(dispersion.shape() == mean.shape(), "log-variance shape mismatch");
                let variance = clamp_value_only(&dispersion.exp()?, EPS_MIN, EPS_MAX)?;
                let diff = (mean - target)?;
                let loss = (variance.log()? + (diff.sqr()? / variance)?)?;
                loss.mean_all().map_err(Into::into)
            }
            Self::LaplaceNll => {
                ensure!(dispersion.shape() == mean.shape(), "log-scale shape mismatch");
                let scale = clamp_value_only(&dispersion.exp()?, EPS_MIN, EPS_MAX)?;
                let diff = (mean - target)?;
                let loss = (scale.log()? + (diff.abs()? / scale)?)?;
                loss.mean_all().map_err(Into::into)
            }
            Self::CovGaussianNll { block } => {
                self.cov_nll(mean, dispersion, target, *block)
            }
        }
    }

    /// Multivariate Gaussian NLL per pixel block, Sigma = L L^T with L built
    /// from the predicted factor channels. The Mahalanobis term is computed by
    /// forward substitution, the log-determinant from the diagonal of L.
    fn cov_nll(&self, mean: &Tensor, factors: &Tensor, target: &Tensor, block: usize) -> Result<Tensor> {
        let (b, k, h, w) = mean.dims4()?;
        let d = k * block * block;
        let n_tril = d * (d + 1) / 2;
        let (fb, fc, fh, fw) = factors.dims4()?;
        ensure!(
            fb == b && fc == n_tril && fh == h / block && fw == w / block,
            "covariance factors shape {:?} inconsistent with mean {:?} and block {block}",
            factors.shape(),
            mean.shape()
        );

        let diff = blocks_from_pixels(&(mean - target)?, block)?; // [B,Hb,Wb,d]
        let l = factors.permute([0, 2, 3, 1])?.contiguous()?; // [B,Hb,Wb,n_tril]

        // Solve L z = diff for z by forward substitution over the (small)
        // block dimension. Diagonal entries go through the positivity
        // transform; strictly-lower entries are used raw.
        let mut z: Vec<Tensor> = Vec::with_capacity(d);
        let mut log_det: Option<Tensor> = None;
        let mut mahalanobis: Option<Tensor> = None;
        for i in 0..d {
            let mut rhs = diff.narrow(D::Minus1, i, 1)?;
            for (j, z_j) in z.iter().enumerate() {
                let l_ij = l.narrow(D::Minus1, tril_index(i, j), 1)?;
                rhs = (rhs - (l_ij * z_j)?)?;
            }
            let raw_diag = l.narrow(D::Minus1, tril_index(i, i), 1)?;
            let l_ii = clamp_value_only(&raw_diag.exp()?, EPS_MIN, EPS_MAX)?;
            let z_i = (rhs / &l_ii)?;

            log_det = Some(match log_det {
                Some(acc) => (acc + l_ii.log()?)?,
                None => l_ii.log()?,
            });
            mahalanobis = Some(match mahalanobis {
                Some(acc) => (acc + z_i.sqr()?)?,
                None => z_i.sqr()?,
            });
            z.push(z_i);
        }
        // d >= 1, so both accumulators are set.
        let log_det = log_det.ok_or_else(|| anyhow::anyhow!("empty block dimension"))?;
        let mahalanobis = mahalanobis.ok_or_else(|| anyhow::anyhow!("empty block dimension"))?;

        let ln_2pi = (2.0 * std::f64::consts::PI).ln();
        let per_block = (((log_det * 2.0)? + mahalanobis)? + d as f64 * ln_2pi)?;
        (per_block * 0.5)?.mean_all().map_err(Into::into)
    }

    /// Per-pixel variance implied by a raw dispersion tensor, `[B,K,H,W]`.
    /// Gaussian: exp(log-variance). Laplace: 2*scale^2. Covariance: diagonal
    /// of L L^T scattered back from block to pixel layout.
    pub fn variance(&self, dispersion: &Tensor) -> Result<Tensor> {
        match self {
            Self::GaussianNll => {
                clamp_value_only(&dispersion.exp()?, EPS_MIN, EPS_MAX)
            }
            Self::LaplaceNll => {
                let scale = clamp_value_only(&dispersion.exp()?, EPS_MIN, EPS_MAX)?;
                (scale.sqr()? * 2.0).map_err(Into::into)
            }
            Self::CovGaussianNll { block } => {
                let (_b, n_tril, _hb, _wb) = dispersion.dims4()?;
                let d = tril_dim(n_tril)?;
                ensure!(
                    d % (block * block) == 0,
                    "block vector length {d} not divisible by block^2"
                );
                let channels = d / (block * block);

                let l = dispersion.permute([0, 2, 3, 1])?.contiguous()?;
                let mut diag: Vec<Tensor> = Vec::with_capacity(d);
                for i in 0..d {
                    let raw_diag = l.narrow(D::Minus1, tril_index(i, i), 1)?;
                    let l_ii = clamp_value_only(&raw_diag.exp()?, EPS_MIN, EPS_MAX)?;
                    let mut var_i = l_ii.sqr()?;
                    for j in 0..i {
                        let l_ij = l.narrow(D::Minus1, tril_index(i, j), 1)?;
                        var_i = (var_i + l_ij.sqr()?)?;
                    }
                    diag.push(var_i);
                }
                let diag = Tensor::cat(&diag, D::Minus1)?; // [B,Hb,Wb,d]
                pixels_from_blocks(&diag, *block, channels)
            }
        }
    }
}

/// Recover d from n_tril = d(d+1)/2.
fn tril_dim(n_tril: usize) -> Result<usize> {
    let mut d = 1;
    while d * (d + 1) / 2 < n_tril {
        d += 1;
    }
    ensure!(
        d * (d + 1) / 2 == n_tril,
        "{n_tril} is not a triangular number"
    );
    Ok(d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn dev() -> Device {
        Device::Cpu
    }

    fn full(value: f32, shape: (usize, usize, usize, usize)) -> Tensor {
        Tensor::full(value, shape, &dev()).unwrap()
    }

    #[test]
    fn test_from_name() -> Result<()> {
        assert_eq!(UncertaintyLoss::from_name("gaussian_nll")?, UncertaintyLoss::GaussianNll);
        assert_eq!(UncertaintyLoss::from_name("laplace_nll")?, UncertaintyLoss::LaplaceNll);
        assert_eq!(
            UncertaintyLoss::from_name("cov_gaussian_nll")?,
            UncertaintyLoss::CovGaussianNll { block: 2 }
        );
        assert!(UncertaintyLoss::from_name("huber").is_err());
        Ok(())
    }

    #[test]
    fn test_laplace_scale_variance_round_trip() {
        for scale in [1e-4f32, 0.3, 1.0, 7.5] {
            let var = laplace_scale_to_variance(scale);
            let back = laplace_variance_to_scale(var);
            assert!((back - scale).abs() < 1e-6 * scale.max(1.0));
        }
    }

    #[test]
    fn test_independent_nlls_finite_and_monotone() -> Result<()> {
        let shape = (2, 1, 4, 4);
        let target = full(0.0, shape);
        let dispersion = full(0.0, shape); // unit variance / unit scale
        for loss in [UncertaintyLoss::GaussianNll, UncertaintyLoss::LaplaceNll] {
            let mut prev = f32::NEG_INFINITY;
            for diff in [0.0f32, 0.5, 1.0, 2.0] {
                let mean = full(diff, shape);
                let v = loss.nll(&mean, &dispersion, &target)?.to_scalar::<f32>()?;
                assert!(v.is_finite(), "{} produced {v}", loss.name());
                assert!(
                    v >= prev,
                    "{}: loss must not decrease as |diff| grows",
                    loss.name()
                );
                prev = v;
            }
        }
        Ok(())
    }

    #[test]
    fn test_gaussian_variance_is_exp_log_variance() -> Result<()> {
        let log_var = full(0.7f32.ln(), (1, 1, 2, 2));
        let var = UncertaintyLoss::GaussianNll.variance(&log_var)?;
        for v in var.flatten_all()?.to_vec1::<f32>()? {
            assert!((v - 0.7).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_laplace_variance_closed_form() -> Result<()> {
        let log_scale = full(0.5f32.ln(), (1, 1, 2, 2));
        let var = UncertaintyLoss::LaplaceNll.variance(&log_scale)?;
        for v in var.flatten_all()?.to_vec1::<f32>()? {
            assert!((v - laplace_scale_to_variance(0.5)).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_variance_floor_applies() -> Result<()> {
        // A wildly negative log-variance must still yield variance >= EPS_MIN.
        let log_var = full(-50.0, (1, 1, 2, 2));
        let var = UncertaintyLoss::GaussianNll.variance(&log_var)?;
        for v in var.flatten_all()?.to_vec1::<f32>()? {
            assert!(v >= EPS_MIN);
        }
        Ok(())
    }

    #[test]
    fn test_shape_mismatch_is_error() {
        let mean = full(0.0, (1, 1, 4, 4));
        let target = full(0.0, (1, 1, 2, 2));
        let dispersion = full(0.0, (1, 1, 4, 4));
        assert!(UncertaintyLoss::GaussianNll.nll(&mean, &dispersion, &target).is_err());
    }

    // 2x2 block with K=1: d=4, n_tril=10.
    fn cov_factors(entries: &[(usize, usize, f32)]) -> Tensor {
        let mut data = vec![0.0f32; 10];
        for &(i, j, v) in entries {
            data[tril_index(i, j)] = v;
        }
        Tensor::from_vec(data, (1, 10, 1, 1), &dev()).unwrap()
    }

    #[test]
    fn test_cov_nll_perfect_prediction_identity_covariance() -> Result<()> {
        // diff = 0, L = I (raw diagonal log = 0): NLL = d/2 * ln(2*pi) per block.
        let mean = full(1.0, (1, 1, 2, 2));
        let target = full(1.0, (1, 1, 2, 2));
        let factors = cov_factors(&[]);
        let loss = UncertaintyLoss::CovGaussianNll { block: 2 };
        let v = loss.nll(&mean, &factors, &target)?.to_scalar::<f32>()?;
        let expected = 0.5 * 4.0 * (2.0 * std::f32::consts::PI).ln();
        assert!((v - expected).abs() < 1e-4, "got {v}, expected {expected}");
        Ok(())
    }

    #[test]
    fn test_cov_nll_monotone_in_residual() -> Result<()> {
        let target = full(0.0, (1, 1, 2, 2));
        let factors = cov_factors(&[(1, 0, 0.5), (2, 1, 0.5), (3, 2, 0.5)]);
        let loss = UncertaintyLoss::CovGaussianNll { block: 2 };
        let small = loss.nll(&full(0.1, (1, 1, 2, 2)), &factors, &target)?.to_scalar::<f32>()?;
        let large = loss.nll(&full(1.0, (1, 1, 2, 2)), &factors, &target)?.to_scalar::<f32>()?;
        assert!(small.is_finite() && large.is_finite());
        assert!(large > small);
        Ok(())
    }

    #[test]
    fn test_cov_variance_is_diag_of_llt() -> Result<()> {
        // L = I + 0.5 on the first sub-diagonal -> diag(LL^T) = [1, 1.25, 1.25, 1.25].
        let factors = cov_factors(&[(1, 0, 0.5), (2, 1, 0.5), (3, 2, 0.5)]);
        let loss = UncertaintyLoss::CovGaussianNll { block: 2 };
        let var = loss.variance(&factors)?;
        assert_eq!(var.dims4()?, (1, 1, 2, 2));
        let got = var.flatten_all()?.to_vec1::<f32>()?;
        let expected = [1.0f32, 1.25, 1.25, 1.25];
        for (g, e) in got.iter().zip(expected.iter()) {
            assert!((g - e).abs() < 1e-5, "got {got:?}, expected {expected:?}");
        }
        Ok(())
    }

    #[test]
    fn test_dispersion_head_layout() {
        assert_eq!(UncertaintyLoss::GaussianNll.dispersion_channels(2), 2);
        assert_eq!(UncertaintyLoss::LaplaceNll.dispersion_stride(), 1);
        let cov = UncertaintyLoss::CovGaussianNll { block: 2 };
        assert_eq!(cov.dispersion_channels(1), 10);
        assert_eq!(cov.dispersion_stride(), 2);
    }
}
