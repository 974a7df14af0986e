use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use tracing::{debug, info};

use crate::fissa::{Fissa, Interaction};
use crate::sampler::Sampler;
use crate::UserId;

// ---------------------------------------------------------------------------
// Training Config
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct TrainingConfig {
    pub lr: f64,
    pub weight_decay: f64,
    /// Emit an `info!` line every this many optimizer steps. 0 disables it.
    pub log_every: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            weight_decay: 0.0,
            log_every: 100,
        }
    }
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

pub struct Trainer {
    optimizer: AdamW,
    config: TrainingConfig,
    step_count: usize,
}

impl Trainer {
    pub fn new(varmap: &VarMap, config: TrainingConfig) -> Result<Self> {
        let params = ParamsAdamW {
            lr: config.lr,
            weight_decay: config.weight_decay,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        };
        let optimizer = AdamW::new(varmap.all_vars(), params)?;

        Ok(Self {
            optimizer,
            config,
            step_count: 0,
        })
    }

    pub fn backward_step(&mut self, loss: &Tensor) -> Result<usize> {
        self.optimizer.backward_step(loss)?;
        self.step_count += 1;
        Ok(self.step_count)
    }

    /// One optimizer step on `model.calculate_loss(batch)`. Returns the loss
    /// value seen before the update.
    pub fn train_step(&mut self, model: &Fissa, batch: &Interaction) -> Result<f32> {
        let loss = model.calculate_loss(batch)?;
        let value = loss.to_scalar::<f32>()?;
        let step = self.backward_step(&loss)?;

        debug!(step, loss = value, "optimizer step");
        if self.config.log_every > 0 && step % self.config.log_every == 0 {
            info!(step, loss = value, lr = self.optimizer.learning_rate(), "training");
        }
        Ok(value)
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.optimizer.set_learning_rate(lr);
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }
}

// ---------------------------------------------------------------------------
// Negative attachment
// ---------------------------------------------------------------------------

/// Draw one negative per example and store them as the batch's `neg_items`.
///
/// `user_ids[i]` owns row `i` of `batch`.
pub fn attach_negatives(
    sampler: &mut Sampler,
    phase: &str,
    user_ids: &[UserId],
    batch: Interaction,
) -> crate::Result<Interaction> {
    let expected = batch.batch_size()?;
    if user_ids.len() != expected {
        return Err(crate::Error::BatchSizeMismatch {
            field: "user_ids",
            expected,
            actual: user_ids.len(),
        });
    }
    let negatives = sampler.sample_by_user_ids(phase, user_ids, 1)?;
    batch.with_neg_items(&negatives)
}
