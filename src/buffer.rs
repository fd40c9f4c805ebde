// Adaptive per-subnetwork loss reweighting.
//
// The buffer keeps a bounded FIFO of recent per-step loss scalars for each
// subnetwork and converts the history into a softmax weight vector: members
// with a higher recent average loss receive proportionally more weight in the
// aggregate training loss, which equalizes learning progress across the
// ensemble. Owned by the training loop and passed into the step function —
// never a global. Plain data so it can be checkpointed as JSON if a run needs
// to be resumable.

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossBuffer {
    capacity: usize,
    temperature: f32,
    histories: Vec<VecDeque<f32>>,
}

impl LossBuffer {
    /// Create an empty buffer. `capacity >= 1` and `temperature > 0` are
    /// caller-input contracts, rejected before any training step runs.
    pub fn new(num_subnetworks: usize, capacity: usize, temperature: f32) -> Result<Self> {
        ensure!(num_subnetworks >= 1, "need at least one subnetwork, got {num_subnetworks}");
        ensure!(capacity >= 1, "loss buffer capacity must be >= 1, got {capacity}");
        ensure!(
            temperature > 0.0 && temperature.is_finite(),
            "loss buffer temperature must be a positive real, got {temperature}"
        );
        Ok(Self {
            capacity,
            temperature,
            histories: vec![VecDeque::with_capacity(capacity); num_subnetworks],
        })
    }

    pub fn num_subnetworks(&self) -> usize {
        self.histories.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// History length for one subnetwork (== min(steps recorded, capacity)).
    pub fn history_len(&self, subnetwork: usize) -> usize {
        self.histories[subnetwork].len()
    }

    /// Oldest retained loss for one subnetwork, if any.
    pub fn oldest(&self, subnetwork: usize) -> Option<f32> {
        self.histories[subnetwork].front().copied()
    }

    /// Append one per-subnetwork loss scalar each, evicting the oldest entry
    /// once a FIFO is full. Called exactly once per optimization step.
    pub fn record(&mut self, losses: &[f32]) -> Result<()> {
        ensure!(
            losses.len() == self.histories.len(),
            "expected {} per-subnetwork losses, got {}",
            self.histories.len(),
            losses.len()
        );
        for (history, &loss) in self.histories.iter_mut().zip(losses) {
            if history.len() == self.capacity {
                history.pop_front();
            }
            history.push_back(loss);
        }
        Ok(())
    }

    /// Temperature-scaled softmax over per-subnetwork history means. Entries
    /// are strictly positive and sum to 1. Before the first `record` the
    /// vector is exactly uniform — the documented empty-state behavior, not an
    /// error path.
    pub fn weights(&self) -> Vec<f32> {
        let m = self.histories.len();
        if self.histories.iter().all(|h| h.is_empty()) {
            return vec![1.0 / m as f32; m];
        }

        let means: Vec<f32> = self
            .histories
            .iter()
            .map(|h| {
                if h.is_empty() {
                    0.0
                } else {
                    h.iter().sum::<f32>() / h.len() as f32
                }
            })
            .collect();

        let max = means.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = means
            .iter()
            .map(|&mu| ((mu - max) / self.temperature).exp())
            .collect();
        let sum: f32 = exps.iter().sum();
        exps.iter().map(|&e| e / sum).collect()
    }
}
