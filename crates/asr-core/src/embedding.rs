//! Тип входного эмбеддинга энкодера и его редукция по времени.
//!
//! Conv2d-субдискретизация уменьшает ось времени стопкой свёрток
//! `(kernel, stride)`. Маска после каждой свёртки — срез `[..T-(k-1)].step_by(s)`,
//! поэтому длина выхода и валидные длины детерминированы.

use serde::{Deserialize, Serialize};

use crate::AsrError;

/// Вид входного эмбеддинга модели.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EmbeddingKind {
    /// Линейный эмбеддинг, ось времени не меняется.
    Plain,
    /// Conv2d-субдискретизация с заданным шагом.
    Conv2dSubsample { stride: SubsampleStride },
}

/// Суммарный шаг Conv2d-субдискретизации.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub enum SubsampleStride {
    X2,
    X4,
    X6,
    X8,
}

impl SubsampleStride {
    /// Свёртки `(kernel, stride)` по оси времени.
    pub fn stages(self) -> &'static [(usize, usize)] {
        match self {
            Self::X2 => &[(3, 2), (3, 1)],
            Self::X4 => &[(3, 2), (3, 2)],
            Self::X6 => &[(3, 2), (5, 3)],
            Self::X8 => &[(3, 2), (3, 2), (3, 2)],
        }
    }

    pub fn factor(self) -> usize {
        self.stages().iter().map(|&(_, s)| s).product()
    }
}

impl TryFrom<usize> for SubsampleStride {
    type Error = AsrError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(Self::X2),
            4 => Ok(Self::X4),
            6 => Ok(Self::X6),
            8 => Ok(Self::X8),
            other => Err(AsrError::Config(format!(
                "неподдерживаемый шаг субдискретизации: {other} (ожидается 2, 4, 6 или 8)"
            ))),
        }
    }
}

impl From<SubsampleStride> for usize {
    fn from(value: SubsampleStride) -> Self {
        value.factor()
    }
}

impl EmbeddingKind {
    fn stages(&self) -> &'static [(usize, usize)] {
        match self {
            Self::Plain => &[],
            Self::Conv2dSubsample { stride } => stride.stages(),
        }
    }

    /// Номинальный коэффициент сокращения оси времени.
    pub fn factor(&self) -> usize {
        match self {
            Self::Plain => 1,
            Self::Conv2dSubsample { stride } => stride.factor(),
        }
    }

    /// Длина оси времени на выходе эмбеддинга при входной длине `time`.
    pub fn output_time(&self, time: usize) -> usize {
        self.stages()
            .iter()
            .fold(time, |t, &(kernel, stride)| reduce_time(t, kernel, stride))
    }

    /// Валидная длина сэмпла на выходе эмбеддинга.
    ///
    /// `length` — валидная длина на входе, `time` — ширина входной маски.
    pub fn output_length(&self, length: usize, time: usize) -> usize {
        let (length, _) = self
            .stages()
            .iter()
            .fold((length, time), |(l, t), &(kernel, stride)| {
                let t = reduce_time(t, kernel, stride);
                (l.div_ceil(stride).min(t), t)
            });
        length
    }

    /// [`Self::output_length`] для всего батча.
    pub fn output_lengths(&self, lengths: &[usize], time: usize) -> Vec<usize> {
        lengths
            .iter()
            .map(|&l| self.output_length(l, time))
            .collect()
    }
}

fn reduce_time(time: usize, kernel: usize, stride: usize) -> usize {
    if time >= kernel {
        (time - kernel) / stride + 1
    } else {
        0
    }
}
