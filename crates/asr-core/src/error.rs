//! Error types for the encoder pipeline.

use thiserror::Error;

/// Main error type for encoder inference.
#[derive(Error, Debug)]
pub enum AsrError {
    /// Нулевая или выходящая за допустимый диапазон длина последовательности.
    #[error("Invalid length: {0}")]
    InvalidLength(String),

    /// Входное аудио короче минимального окна фронтенда.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Некорректная или несогласованная конфигурация / статистика.
    #[error("Config error: {0}")]
    Config(String),

    /// Несоответствие имён, типов или форм тензоров контракту графа.
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// Model loading errors.
    #[error("Model error: {0}")]
    Model(String),

    /// Inference errors.
    #[error("Inference error: {0}")]
    Inference(String),

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle tensor errors.
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// JSON parsing errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for ASR operations.
pub type AsrResult<T> = Result<T, AsrError>;
