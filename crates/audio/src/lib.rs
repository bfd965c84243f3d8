//! # audio
//!
//! Feature frontend for the encoder pipeline.
//!
//! This crate handles:
//! - STFT + log-mel feature extraction for padded batches
//! - Mel filterbanks and window functions
//! - Global and per-utterance mean/variance normalization

pub mod frontend;
pub mod mel;
pub mod normalize;

pub use frontend::FeatureFrontend;
pub use normalize::{GlobalMvn, MvnStats, Normalizer, UtteranceMvn};
