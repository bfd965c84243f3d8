//! # asr-core
//!
//! Базовые типы, трейты и определения ошибок для пайплайна ONNX-энкодера.
//!
//! Этот крейт предоставляет фундаментальные абстракции для всех остальных
//! крейтов в workspace:
//!
//! - Батч последовательностей переменной длины (`SequenceBatch`)
//! - Конфигурация энкодера, фронтенда и нормализации
//! - Контракт графа (`GraphContract`) и тип эмбеддинга (`EmbeddingKind`)
//! - Унифицированная обработка ошибок через `AsrError`
//! - Trait [`EncoderGraph`] — граница с движком исполнения

pub mod config;
pub mod contract;
pub mod debug;
pub mod embedding;
pub mod error;
pub mod traits;
pub mod types;

pub use config::{
    EncoderConfig, FrontendConfig, LogMelConfig, MaskConfig, NormalizeConfig, StftConfig,
};
pub use config::{MaskPolarity, MelScale, NormalizeKind, WindowKind};
pub use contract::{DeclaredTensor, GraphContract, NamedTensors, TensorDType, TensorSpec};
pub use embedding::{EmbeddingKind, SubsampleStride};
pub use error::{AsrError, AsrResult};
pub use traits::{EncoderGraph, SequenceStage};
pub use types::{SequenceBatch, lengths_from_tensor};
