// Predictive-variance decomposition at the ensemble boundary.
//
// Members are treated uniformly whether they come from the M subnetwork heads
// of one pass or from extra MC-dropout passes: point estimate = mean of member
// means, aleatoric = mean of member variances, epistemic = population variance
// of member means. Total variance is additive by construction.

use anyhow::{ensure, Result};
use candle_core::Tensor;

use crate::losses::UncertaintyLoss;
use crate::model::SubnetOutput;

/// The predictive distribution for one batch, all tensors `[B,K,H,W]`.
pub struct Prediction {
    pub mean: Tensor,
    pub aleatoric: Tensor,
    pub epistemic: Tensor,
}

impl Prediction {
    /// Total predictive variance, aleatoric + epistemic.
    pub fn total(&self) -> Result<Tensor> {
        (&self.aleatoric + &self.epistemic).map_err(Into::into)
    }
}

/// Combine ensemble members into (point estimate, aleatoric, epistemic).
///
/// With a single member the deviation tensor is identically zero, so the
/// epistemic variance is exactly zero — the M=1 degenerate case reports no
/// cross-member disagreement.
pub fn decompose(members: &[SubnetOutput], loss: &UncertaintyLoss) -> Result<Prediction> {
    ensure!(!members.is_empty(), "cannot decompose an empty ensemble");

    let means: Vec<Tensor> = members.iter().map(|m| m.mean.clone()).collect();
    let stacked = Tensor::stack(&means, 0)?; // [E,B,K,H,W]
    let mean = stacked.mean(0)?;

    let mut variances = Vec::with_capacity(members.len());
    for member in members {
        variances.push(loss.variance(&member.dispersion)?);
    }
    let aleatoric = Tensor::stack(&variances, 0)?.mean(0)?;

    let deviations = stacked.broadcast_sub(&mean.unsqueeze(0)?)?;
    let epistemic = deviations.sqr()?.mean(0)?;

    Ok(Prediction { mean, aleatoric, epistemic })
}
