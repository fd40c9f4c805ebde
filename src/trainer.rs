// Training loop plumbing: optimizer + cosine LR schedule, the single
// uninterruptible MIMO training step, checkpointing, and best-checkpoint /
// early-stop tracking for the external loop.

use anyhow::{bail, ensure, Context, Result};
use candle_core::{Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::buffer::LossBuffer;
use crate::model::MimoNet;
use crate::router::route_batch;

// ---------------------------------------------------------------------------
// Cosine LR Scheduler with Linear Warmup
// ---------------------------------------------------------------------------

pub struct CosineScheduler {
    base_lr: f64,
    min_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    current_step: usize,
}

impl CosineScheduler {
    pub fn new(base_lr: f64, min_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self { base_lr, min_lr, warmup_steps, total_steps, current_step: 0 }
    }

    pub fn step(&mut self) -> f64 {
        let lr = self.get_lr();
        self.current_step += 1;
        lr
    }

    pub fn get_lr(&self) -> f64 {
        if self.current_step < self.warmup_steps {
            self.base_lr * (self.current_step as f64 + 1.0) / self.warmup_steps as f64
        } else {
            let progress = (self.current_step - self.warmup_steps) as f64
                / (self.total_steps - self.warmup_steps).max(1) as f64;
            let progress = progress.min(1.0);
            self.min_lr
                + 0.5 * (self.base_lr - self.min_lr) * (1.0 + (std::f64::consts::PI * progress).cos())
        }
    }
}

// ---------------------------------------------------------------------------
// Trainer Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    pub lr: f64,
    pub min_lr: f64,
    pub weight_decay: f64,
    pub warmup_fraction: f64,
    pub total_steps: usize,
    /// Loss buffer capacity N.
    pub loss_buffer_size: usize,
    /// Loss buffer softmax temperature T.
    pub loss_buffer_temperature: f32,
}

impl TrainerConfig {
    pub fn test() -> Self {
        Self {
            lr: 1e-2,
            min_lr: 1e-4,
            weight_decay: 0.0,
            warmup_fraction: 0.1,
            total_steps: 100,
            loss_buffer_size: 10,
            loss_buffer_temperature: 0.3,
        }
    }

    pub fn default_config() -> Self {
        Self {
            lr: 3e-4,
            min_lr: 1e-5,
            weight_decay: 0.01,
            warmup_fraction: 0.1,
            total_steps: 2000,
            loss_buffer_size: 50,
            loss_buffer_temperature: 0.5,
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.lr > 0.0 && self.lr.is_finite(), "lr must be positive");
        ensure!(self.total_steps >= 1, "total_steps must be >= 1");
        ensure!(self.loss_buffer_size >= 1, "loss_buffer_size must be >= 1");
        ensure!(
            self.loss_buffer_temperature > 0.0,
            "loss_buffer_temperature must be > 0"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

pub struct Trainer {
    optimizer: AdamW,
    scheduler: CosineScheduler,
    step_count: usize,
}

impl Trainer {
    pub fn new(varmap: &VarMap, config: &TrainerConfig) -> Result<Self> {
        config.validate()?;
        let warmup_steps = (config.total_steps as f64 * config.warmup_fraction) as usize;
        let scheduler =
            CosineScheduler::new(config.lr, config.min_lr, warmup_steps, config.total_steps);
        let params = ParamsAdamW {
            lr: config.lr,
            weight_decay: config.weight_decay,
            ..Default::default()
        };
        let optimizer = AdamW::new(varmap.all_vars(), params)?;
        Ok(Self { optimizer, scheduler, step_count: 0 })
    }

    pub fn backward_step(&mut self, loss: &Tensor) -> Result<usize> {
        self.optimizer.backward_step(loss)?;
        self.step_count += 1;
        let lr = self.scheduler.step();
        self.optimizer.set_learning_rate(lr);
        Ok(self.step_count)
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn current_lr(&self) -> f64 {
        self.scheduler.get_lr()
    }
}

// ---------------------------------------------------------------------------
// MIMO training step
// ---------------------------------------------------------------------------

/// Per-step diagnostics returned to the external loop.
pub struct StepStats {
    pub step: usize,
    pub total_loss: f32,
    pub member_losses: Vec<f32>,
    pub weights: Vec<f32>,
    pub lr: f64,
}

/// One uninterruptible optimization step: route -> forward -> per-subnetwork
/// NLL -> buffer-weighted sum -> backward -> buffer update.
///
/// The buffer weights enter the aggregate loss as fixed scalars, so no
/// gradient flows through the reweighting. A non-finite member loss aborts the
/// step with an error; the caller decides whether to skip, reduce the learning
/// rate, or stop — the core never recovers silently.
pub fn train_step(
    model: &MimoNet,
    inputs: &Tensor,
    targets: &Tensor,
    buffer: &mut LossBuffer,
    trainer: &mut Trainer,
    rng: &mut StdRng,
) -> Result<StepStats> {
    let cfg = model.config();
    let (bi, _ci, hi, wi) = inputs.dims4()?;
    let (bt, kt, ht, wt) = targets.dims4()?;
    ensure!(
        bi == bt && hi == ht && wi == wt && kt == cfg.out_channels,
        "target shape {:?} does not match inputs {:?} with {} regression channels",
        targets.shape(),
        inputs.shape(),
        cfg.out_channels
    );
    ensure!(
        inputs.dtype() == targets.dtype(),
        "input dtype {:?} != target dtype {:?}",
        inputs.dtype(),
        targets.dtype()
    );
    ensure!(
        buffer.num_subnetworks() == cfg.num_subnetworks,
        "loss buffer tracks {} subnetworks, model has {}",
        buffer.num_subnetworks(),
        cfg.num_subnetworks
    );

    let routed = route_batch(inputs, cfg.num_subnetworks, cfg.input_repetition, rng)?;
    let outputs = model.forward(&routed, true)?;
    let weights = buffer.weights();

    let mut member_losses = Vec::with_capacity(outputs.len());
    let mut total: Option<Tensor> = None;
    for (m, out) in outputs.iter().enumerate() {
        let nll = cfg.loss.nll(&out.mean, &out.dispersion, targets)?;
        let value = nll.to_scalar::<f32>()?;
        if !value.is_finite() {
            bail!("non-finite loss {value} for subnetwork {m} at step {}", trainer.step_count());
        }
        member_losses.push(value);

        let weighted = (nll * weights[m] as f64)?;
        total = Some(match total {
            Some(acc) => (acc + weighted)?,
            None => weighted,
        });
    }
    let total = total.context("model produced no subnetwork outputs")?;
    let total_loss = total.to_scalar::<f32>()?;

    let step = trainer.backward_step(&total)?;
    buffer.record(&member_losses)?;

    Ok(StepStats {
        step,
        total_loss,
        member_losses,
        weights,
        lr: trainer.current_lr(),
    })
}

// ---------------------------------------------------------------------------
// Checkpointing (safetensors)
// ---------------------------------------------------------------------------

pub fn save_checkpoint(varmap: &VarMap, path: &str) -> Result<()> {
    let data = varmap.data().lock().unwrap();
    let named: std::collections::HashMap<String, Tensor> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&named, path)?;
    eprintln!("[CHECKPOINT] Saved {} params to {path}", named.len());
    Ok(())
}

pub fn load_checkpoint(varmap: &VarMap, path: &str, device: &Device) -> Result<()> {
    let tensors = candle_core::safetensors::load(path, device)?;
    let data = varmap.data().lock().unwrap();
    let mut loaded = 0usize;
    for (name, var) in data.iter() {
        if let Some(saved) = tensors.get(name) {
            var.set(saved)?;
            loaded += 1;
        }
    }
    eprintln!("[CHECKPOINT] Loaded {loaded}/{} params from {path}", data.len());
    Ok(())
}

// ---------------------------------------------------------------------------
// Early Stopping + Best Checkpoint Tracking
// ---------------------------------------------------------------------------

/// Tracks convergence for the external loop and saves the best checkpoint.
/// Stopping is the loop's decision; the core only reports.
pub struct EarlyStopping {
    patience: usize,
    stale_count: usize,
    best_loss: f32,
    best_step: usize,
    best_path: Option<String>,
}

#[derive(Debug, PartialEq)]
pub enum EarlyStopAction {
    Continue,
    NewBest,
    Stop,
}

impl EarlyStopping {
    /// Stops after `patience` consecutive checks without improvement.
    /// `best_path` is the file to save best weights to, if any.
    pub fn new(patience: usize, best_path: Option<String>) -> Self {
        Self {
            patience,
            stale_count: 0,
            best_loss: f32::MAX,
            best_step: 0,
            best_path,
        }
    }

    pub fn check(&mut self, avg_loss: f32, step: usize, varmap: &VarMap) -> EarlyStopAction {
        if avg_loss < self.best_loss {
            self.best_loss = avg_loss;
            self.best_step = step;
            self.stale_count = 0;
            if let Some(ref path) = self.best_path {
                if let Err(e) = save_checkpoint(varmap, path) {
                    eprintln!("[BEST] Warning: failed to save best checkpoint: {e}");
                } else {
                    eprintln!("[BEST] New best loss={avg_loss:.6} at step {step} -> {path}");
                }
            }
            return EarlyStopAction::NewBest;
        }

        self.stale_count += 1;
        if self.stale_count >= self.patience {
            eprintln!(
                "[EARLY STOP] No improvement for {} consecutive checks. \
                 Stopping at step {step} (best was {:.6} at step {}).",
                self.patience, self.best_loss, self.best_step
            );
            return EarlyStopAction::Stop;
        }
        EarlyStopAction::Continue
    }

    pub fn best_loss(&self) -> f32 {
        self.best_loss
    }

    pub fn best_step(&self) -> usize {
        self.best_step
    }
}
