// Inference and evaluation: deterministic prediction, MC-dropout ensembling,
// batch evaluation summaries, and the safetensors result export consumed by
// the downstream calibration / precision-recall scripts.

use anyhow::{ensure, Result};
use candle_core::Tensor;
use std::collections::HashMap;

use crate::decompose::{decompose, Prediction};
use crate::model::MimoNet;
use crate::router::replicate_batch;

/// Deterministic inference pass: plain replication across member slots,
/// dropout disabled. Stateless and side-effect free.
pub fn predict(model: &MimoNet, inputs: &Tensor) -> Result<Prediction> {
    let routed = replicate_batch(inputs, model.num_subnetworks())?;
    let members = model.forward(&routed, false)?;
    decompose(&members, &model.config().loss)
}

/// MC-dropout inference: one deterministic pass plus `extra_passes` stochastic
/// passes with dropout enabled. All resulting members (M per pass) feed the
/// same decomposition as the subnetwork ensemble — dropout samples and
/// subnetwork members are interchangeable at that boundary.
pub fn predict_mc_dropout(
    model: &MimoNet,
    inputs: &Tensor,
    extra_passes: usize,
) -> Result<Prediction> {
    let routed = replicate_batch(inputs, model.num_subnetworks())?;
    let mut members = model.forward(&routed, false)?;
    for _ in 0..extra_passes {
        members.extend(model.forward(&routed, true)?);
    }
    decompose(&members, &model.config().loss)
}

/// Scalar summary over an evaluation set.
pub struct EvalSummary {
    pub rmse: f32,
    pub mean_nll: f32,
    pub mean_aleatoric: f32,
    pub mean_epistemic: f32,
    pub num_batches: usize,
}

/// Evaluate the model over a set of (input, target) batches. The NLL is the
/// average per-member NLL, matching the quantity optimized during training.
pub fn evaluate(model: &MimoNet, batches: &[(Tensor, Tensor)]) -> Result<EvalSummary> {
    ensure!(!batches.is_empty(), "evaluation set is empty");
    let loss = &model.config().loss;

    let mut sq_err_sum = 0.0f64;
    let mut nll_sum = 0.0f64;
    let mut alea_sum = 0.0f64;
    let mut epi_sum = 0.0f64;

    for (inputs, targets) in batches {
        let routed = replicate_batch(inputs, model.num_subnetworks())?;
        let members = model.forward(&routed, false)?;

        let mut batch_nll = 0.0f64;
        for member in &members {
            batch_nll +=
                loss.nll(&member.mean, &member.dispersion, targets)?.to_scalar::<f32>()? as f64;
        }
        nll_sum += batch_nll / members.len() as f64;

        let pred = decompose(&members, loss)?;
        let diff = (&pred.mean - targets)?;
        sq_err_sum += diff.sqr()?.mean_all()?.to_scalar::<f32>()? as f64;
        alea_sum += pred.aleatoric.mean_all()?.to_scalar::<f32>()? as f64;
        epi_sum += pred.epistemic.mean_all()?.to_scalar::<f32>()? as f64;
    }

    let n = batches.len() as f64;
    Ok(EvalSummary {
        rmse: (sq_err_sum / n).sqrt() as f32,
        mean_nll: (nll_sum / n) as f32,
        mean_aleatoric: (alea_sum / n) as f32,
        mean_epistemic: (epi_sum / n) as f32,
        num_batches: batches.len(),
    })
}

/// Write the result tensors for one evaluation pass to a safetensors file:
/// input and target passthrough plus point estimate, aleatoric variance and
/// epistemic variance — exactly what the downstream per-pixel table,
/// precision-recall and calibration scripts need.
pub fn export_results(
    path: &str,
    inputs: &Tensor,
    targets: &Tensor,
    prediction: &Prediction,
) -> Result<()> {
    let named: HashMap<String, Tensor> = [
        ("inputs".to_string(), inputs.clone()),
        ("targets".to_string(), targets.clone()),
        ("mean".to_string(), prediction.mean.clone()),
        ("aleatoric_variance".to_string(), prediction.aleatoric.clone()),
        ("epistemic_variance".to_string(), prediction.epistemic.clone()),
    ]
    .into_iter()
    .collect();
    candle_core::safetensors::save(&named, path)?;
    eprintln!("[EXPORT] Wrote {} result tensors to {path}", named.len());
    Ok(())
}
