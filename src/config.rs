use std::path::Path;
use std::str::FromStr;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Model Config
// ---------------------------------------------------------------------------

/// Hyperparameters consumed once by [`crate::fissa::Fissa::new`].
///
/// `loss_type` and `hidden_act` stay plain strings here and are parsed at
/// model construction, so a bad name surfaces as a construction error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FissaConfig {
    pub n_layers: usize,
    pub n_heads: usize,
    /// Embedding and hidden width `D`.
    pub hidden_size: usize,
    /// Feed-forward width.
    pub inner_size: usize,
    pub hidden_dropout_prob: f32,
    pub attn_dropout_prob: f32,
    pub hidden_act: String,
    pub layer_norm_eps: f64,
    /// Std-dev of `w1`, `w2` and `q_s`.
    pub initializer_range: f64,
    pub loss_type: String,
    pub max_seq_length: usize,
    pub device: String,
}

impl Default for FissaConfig {
    fn default() -> Self {
        Self {
            n_layers: 2,
            n_heads: 2,
            hidden_size: 64,
            inner_size: 256,
            hidden_dropout_prob: 0.5,
            attn_dropout_prob: 0.5,
            hidden_act: "gelu".into(),
            layer_norm_eps: 1e-12,
            initializer_range: 0.02,
            loss_type: "CE".into(),
            max_seq_length: 50,
            device: "cpu".into(),
        }
    }
}

impl FissaConfig {
    /// Small config for tests: d=16, 1 layer, 2 heads.
    pub fn tiny() -> Self {
        Self {
            n_layers: 1,
            n_heads: 2,
            hidden_size: 16,
            inner_size: 32,
            hidden_dropout_prob: 0.1,
            attn_dropout_prob: 0.1,
            max_seq_length: 8,
            ..Self::default()
        }
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn with_loss_type(mut self, loss_type: &str) -> Self {
        self.loss_type = loss_type.to_string();
        self
    }

    pub fn with_dropout(mut self, hidden: f32, attn: f32) -> Self {
        self.hidden_dropout_prob = hidden;
        self.attn_dropout_prob = attn;
        self
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.n_heads
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));
        if self.hidden_size == 0 || self.inner_size == 0 || self.n_layers == 0 {
            return invalid("hidden_size, inner_size and n_layers must be positive".into());
        }
        if self.n_heads == 0 || self.hidden_size % self.n_heads != 0 {
            return invalid(format!(
                "hidden_size {} is not a multiple of n_heads {}",
                self.hidden_size, self.n_heads
            ));
        }
        if self.max_seq_length == 0 {
            return invalid("max_seq_length must be positive".into());
        }
        for (name, p) in [
            ("hidden_dropout_prob", self.hidden_dropout_prob),
            ("attn_dropout_prob", self.attn_dropout_prob),
        ] {
            if !(0.0..1.0).contains(&p) {
                return invalid(format!("{name} {p} is outside [0, 1)"));
            }
        }
        if self.layer_norm_eps <= 0.0 {
            return invalid(format!("layer_norm_eps {} must be positive", self.layer_norm_eps));
        }
        if self.initializer_range < 0.0 {
            return invalid(format!(
                "initializer_range {} must be non-negative",
                self.initializer_range
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Activation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HiddenAct {
    Gelu,
    Relu,
    Swish,
    Tanh,
    Sigmoid,
}

impl FromStr for HiddenAct {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gelu" => Ok(Self::Gelu),
            "relu" => Ok(Self::Relu),
            "swish" | "silu" => Ok(Self::Swish),
            "tanh" => Ok(Self::Tanh),
            "sigmoid" => Ok(Self::Sigmoid),
            _ => Err(Error::UnknownActivation(s.to_string())),
        }
    }
}

impl HiddenAct {
    pub fn apply(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Gelu => x.gelu_erf(),
            Self::Relu => x.relu(),
            Self::Swish => x.silu(),
            Self::Tanh => x.tanh(),
            Self::Sigmoid => candle_nn::ops::sigmoid(x),
        }
    }
}

// ---------------------------------------------------------------------------
// Sampler Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub user_id_field: String,
    pub item_id_field: String,
    /// Seed for the one-time pool shuffle. `None` draws from the thread RNG.
    pub seed: Option<u64>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            user_id_field: "user_id".into(),
            item_id_field: "item_id".into(),
            seed: None,
        }
    }
}

impl SamplerConfig {
    pub fn seeded(seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Device Selection
// ---------------------------------------------------------------------------

/// Resolve the `device` option: `cpu`, `cuda` or `cuda:N`.
/// CUDA falls back to CPU when the crate was built without the `cuda` feature
/// or no device can be opened.
pub fn select_device(name: &str) -> Result<Device> {
    let name = name.trim().to_ascii_lowercase();
    if name == "cpu" {
        return Ok(Device::Cpu);
    }
    let ordinal = match name.strip_prefix("cuda") {
        Some("") => 0,
        Some(rest) => rest
            .strip_prefix(':')
            .and_then(|n| n.parse::<usize>().ok())
            .ok_or_else(|| Error::InvalidConfig(format!("unrecognised device [{name}]")))?,
        None => return Err(Error::InvalidConfig(format!("unrecognised device [{name}]"))),
    };

    #[cfg(feature = "cuda")]
    {
        if candle_core::utils::cuda_is_available() {
            match Device::new_cuda(ordinal) {
                Ok(dev) => {
                    tracing::info!(ordinal, "using CUDA device");
                    return Ok(dev);
                }
                Err(e) => {
                    tracing::warn!(ordinal, error = %e, "CUDA init failed, falling back to CPU");
                }
            }
        } else {
            tracing::warn!("CUDA not available, using CPU");
        }
    }

    #[cfg(not(feature = "cuda"))]
    {
        tracing::warn!(
            ordinal,
            "built without the cuda feature, using CPU (rebuild with --features cuda for GPU)"
        );
    }

    Ok(Device::Cpu)
}
