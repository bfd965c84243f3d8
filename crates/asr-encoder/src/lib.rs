//! # asr-encoder
//!
//! Инференс экспортированного энкодера речи:
//!
//! - [`PaddingMaskBuilder`] — маска паддинга по валидным длинам
//! - [`EncoderRunner`] — фронтенд → нормализация → маска → граф
//! - `OnnxGraph` — исполнение графа через ONNX Runtime (фича `onnx`)
//!
//! ## Пример
//! ```ignore
//! use asr_encoder::EncoderRunner;
//! use asr_core::EncoderConfig;
//!
//! let config = EncoderConfig::from_file("exported/config.json")?;
//! let mut runner = EncoderRunner::builder(config).load()?.build()?;
//! let out = runner.run(&speech, &[16000, 8000])?;
//! println!("{:?} {:?}", out.encoder_out.dims(), out.encoder_out_lens);
//! ```

pub mod mask;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod runner;

pub use mask::{MaskWidth, PaddingMask, PaddingMaskBuilder};
#[cfg(feature = "onnx")]
pub use onnx::OnnxGraph;
pub use runner::{EncoderOutput, EncoderRunner, EncoderRunnerBuilder, PreparedInputs};
