#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(unused_variables)]
//! FISSA sequential recommendation on candle.
//!
//! [`fissa::Fissa`] fuses a bidirectional self-attention encoder with an
//! item-similarity branch through a per-candidate sigmoid gate.
//! [`sampler::Sampler`] draws negative items that a user has not interacted
//! with in the current phase or any earlier one.

pub mod config;
pub mod dataset;
pub mod error;
pub mod fissa;
pub mod loss;
pub mod sampler;
pub mod training;
pub mod transformer;

pub use error::{Error, Result};

/// Alias for user indices.
pub type UserId = usize;
/// Alias for item indices.
pub type ItemId = usize;

/// Item id reserved for sequence padding.
pub const PADDING_ITEM_ID: ItemId = 0;
