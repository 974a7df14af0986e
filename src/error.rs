//! Error types shared by the model and the sampler.

use thiserror::Error;

/// Errors raised by model construction, forward passes and negative sampling.
#[derive(Debug, Error)]
pub enum Error {
    /// `loss_type` is neither pairwise (`BPR`) nor listwise (`CE`).
    #[error("unknown loss_type [{0}]: expected one of BPR, CE")]
    UnknownLossType(String),

    /// Sampler distribution name is not `uniform` or `popularity`.
    #[error("distribution [{0}] should be one of [uniform, popularity]")]
    UnknownDistribution(String),

    /// Feed-forward activation name is not supported.
    #[error("unknown hidden_act [{0}]: expected one of gelu, relu, swish, tanh, sigmoid")]
    UnknownActivation(String),

    /// `phases` and `datasets` differ in length or are empty.
    #[error("phases {phases:?} and {datasets} datasets should have the same length")]
    PhaseDatasetMismatch { phases: Vec<String>, datasets: usize },

    /// A dataset does not carry a configured column.
    #[error("dataset has no field [{0}]")]
    MissingField(String),

    /// A configured value is out of its valid range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The sampler was not built with this phase.
    #[error("phase [{0}] does not exist")]
    PhaseNotFound(String),

    /// User id is not below `user_num`.
    #[error("user_id [{0}] does not exist")]
    UserIdOutOfRange(usize),

    /// Item id is not below `item_num`, or does not fit the tensor index type.
    #[error("item_id [{0}] does not exist")]
    ItemIdOutOfRange(usize),

    /// Every pool entry was tried once without finding an unseen item.
    #[error("no unseen item left for user_id [{user_id}] in phase [{phase}]")]
    SamplingExhausted { phase: String, user_id: usize },

    /// A true length or gather position falls outside the padded sequence.
    #[error("item_seq_len [{len}] at row {row} is outside [1, {max}]")]
    InvalidSequenceLength { row: usize, len: usize, max: usize },

    /// The padded sequence is wider than the position table.
    #[error("sequence length {len} exceeds max_seq_length {max}")]
    SequenceTooLong { len: usize, max: usize },

    /// A per-example field does not have one entry per example.
    #[error("batch size mismatch: {field} has {actual} rows, expected {expected}")]
    BatchSizeMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    /// The batch lacks a field the requested operation reads.
    #[error("interaction is missing [{0}]")]
    MissingInput(&'static str),

    /// Rejected by the tensor runtime.
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    /// Reading a config file failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A config file is not valid JSON for its type.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
