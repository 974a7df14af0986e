use std::str::FromStr;

use candle_core::Tensor;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossType {
    /// One sampled negative per example, BPR.
    Pairwise,
    /// Cross-entropy over the full item catalog.
    Listwise,
}

impl FromStr for LossType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bpr" | "pairwise" => Ok(Self::Pairwise),
            "ce" | "listwise" => Ok(Self::Listwise),
            _ => Err(Error::UnknownLossType(s.to_string())),
        }
    }
}

/// Bayesian personalised ranking: `-mean(log(gamma + sigmoid(pos - neg)))`.
#[derive(Debug, Clone, Copy)]
pub struct BprLoss {
    gamma: f64,
}

impl Default for BprLoss {
    fn default() -> Self {
        Self { gamma: 1e-10 }
    }
}

impl BprLoss {
    pub fn forward(&self, pos_score: &Tensor, neg_score: &Tensor) -> candle_core::Result<Tensor> {
        let diff = (pos_score - neg_score)?;
        let prob = (candle_nn::ops::sigmoid(&diff)? + self.gamma)?;
        prob.log()?.mean_all()?.neg()
    }
}

/// Categorical cross-entropy of `(B, C)` logits against `(B,)` class ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    pub fn forward(&self, logits: &Tensor, targets: &Tensor) -> candle_core::Result<Tensor> {
        candle_nn::loss::cross_entropy(logits, targets)
    }
}

/// Loss strategy fixed at model construction.
#[derive(Debug, Clone, Copy)]
pub enum Objective {
    Pairwise(BprLoss),
    Listwise(CrossEntropyLoss),
}

impl Objective {
    pub fn new(loss_type: LossType) -> Self {
        match loss_type {
            LossType::Pairwise => Self::Pairwise(BprLoss::default()),
            LossType::Listwise => Self::Listwise(CrossEntropyLoss),
        }
    }

    pub fn loss_type(&self) -> LossType {
        match self {
            Self::Pairwise(_) => LossType::Pairwise,
            Self::Listwise(_) => LossType::Listwise,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_loss_type_names() {
        assert_eq!("BPR".parse::<LossType>().unwrap(), LossType::Pairwise);
        assert_eq!("listwise".parse::<LossType>().unwrap(), LossType::Listwise);
        assert_eq!("CE".parse::<LossType>().unwrap(), LossType::Listwise);
        let err = "MSE".parse::<LossType>().unwrap_err();
        assert!(matches!(err, Error::UnknownLossType(ref s) if s == "MSE"));
    }

    #[test]
    fn test_bpr_prefers_positive_above_negative() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let bpr = BprLoss::default();
        let high = Tensor::new(&[3f32, 2.0], &device)?;
        let low = Tensor::new(&[-1f32, 0.0], &device)?;
        let good = bpr.forward(&high, &low)?.to_scalar::<f32>()?;
        let bad = bpr.forward(&low, &high)?.to_scalar::<f32>()?;
        assert!(good < bad, "ranking positive first should cost less: {good} vs {bad}");

        let even = bpr.forward(&high, &high)?.to_scalar::<f32>()?;
        assert!((even - std::f32::consts::LN_2).abs() < 1e-5, "tie should cost ln 2, got {even}");
        Ok(())
    }

    #[test]
    fn test_bpr_large_negative_margin_has_finite_gradient() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let pos = candle_core::Var::new(&[-50f32, 2.0], &device)?;
        let neg = candle_core::Var::new(&[50f32, 0.0], &device)?;
        let loss = BprLoss::default().forward(pos.as_tensor(), neg.as_tensor())?;
        let value = loss.to_scalar::<f32>()?;
        assert!(value.is_finite(), "loss should be finite, got {value}");

        let grads = loss.backward()?;
        for var in [&pos, &neg] {
            let g = grads.get(var.as_tensor()).unwrap().to_vec1::<f32>()?;
            assert!(g.iter().all(|v| v.is_finite()), "non-finite gradient: {g:?}");
        }
        // The unsaturated pair still pushes pos up and neg down.
        let g_pos = grads.get(pos.as_tensor()).unwrap().to_vec1::<f32>()?;
        assert!(g_pos[1] < 0.0);
        Ok(())
    }

    #[test]
    fn test_cross_entropy_large_logits_have_finite_gradient() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let logits = candle_core::Var::new(&[[1000f32, -1000.0, 0.0]], &device)?;
        let targets = Tensor::new(&[1u32], &device)?;
        let loss = CrossEntropyLoss.forward(logits.as_tensor(), &targets)?;
        assert!(loss.to_scalar::<f32>()?.is_finite());
        let g = loss.backward()?.get(logits.as_tensor()).unwrap().to_vec2::<f32>()?;
        assert!(g[0].iter().all(|v| v.is_finite()), "non-finite gradient: {g:?}");
        Ok(())
    }

    #[test]
    fn test_cross_entropy_uniform_logits() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::zeros((2, 4), candle_core::DType::F32, &device)?;
        let targets = Tensor::new(&[1u32, 3], &device)?;
        let loss = CrossEntropyLoss.forward(&logits, &targets)?.to_scalar::<f32>()?;
        assert!((loss - 4f32.ln()).abs() < 1e-5, "expected ln 4, got {loss}");
        Ok(())
    }

    #[test]
    fn test_objective_tags() {
        assert_eq!(Objective::new(LossType::Pairwise).loss_type(), LossType::Pairwise);
        assert_eq!(Objective::new(LossType::Listwise).loss_type(), LossType::Listwise);
    }
}
