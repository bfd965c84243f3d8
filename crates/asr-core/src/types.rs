//! Общие типы для пайплайна энкодера.

use candle_core::{DType, Device, Tensor};

use crate::{AsrError, AsrResult};

/// Батч последовательностей переменной длины: тензор + валидные длины.
///
/// `data` имеет форму `(batch, samples)` для сырого аудио или
/// `(batch, time, feat_dim)` для признаков. Ось времени — всегда ось 1.
#[derive(Debug, Clone)]
pub struct SequenceBatch {
    /// Дополненный тензор.
    pub data: Tensor,

    /// Валидная длина каждого элемента батча вдоль оси времени.
    pub lengths: Vec<usize>,
}

impl SequenceBatch {
    /// Создать батч, проверив согласованность размерности батча и длин.
    pub fn new(data: Tensor, lengths: Vec<usize>) -> AsrResult<Self> {
        let dims = data.dims();
        if dims.len() < 2 {
            return Err(AsrError::ContractViolation(format!(
                "ожидается тензор ранга >= 2 (batch, time, ...), получена форма {dims:?}"
            )));
        }
        if dims[0] != lengths.len() {
            return Err(AsrError::ContractViolation(format!(
                "размер батча {} не совпадает с количеством длин {}",
                dims[0],
                lengths.len()
            )));
        }
        if let Some(&too_long) = lengths.iter().find(|&&l| l > dims[1]) {
            return Err(AsrError::InvalidLength(format!(
                "длина {} больше оси времени {}",
                too_long, dims[1]
            )));
        }
        Ok(Self { data, lengths })
    }

    /// Собрать батч сырого аудио `(batch, max_len)` из отдельных записей,
    /// дополняя нулями.
    pub fn from_waveforms(waveforms: &[Vec<f32>], device: &Device) -> AsrResult<Self> {
        let max_len = waveforms.iter().map(Vec::len).max().unwrap_or(0);
        let mut flat = Vec::with_capacity(waveforms.len() * max_len);
        for wav in waveforms {
            flat.extend_from_slice(wav);
            flat.resize(flat.len() + max_len - wav.len(), 0.0);
        }
        let data = Tensor::from_vec(flat, (waveforms.len(), max_len), device)?;
        let lengths = waveforms.iter().map(Vec::len).collect();
        Self::new(data, lengths)
    }

    /// Размер батча.
    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    /// Длина оси времени (с учётом паддинга).
    pub fn time_dim(&self) -> usize {
        self.data.dims()[1]
    }

    /// Валидные длины в виде `i64`-тензора `(batch,)`.
    pub fn lengths_tensor(&self) -> AsrResult<Tensor> {
        let lengths: Vec<i64> = self.lengths.iter().map(|&l| l as i64).collect();
        Ok(Tensor::from_vec(lengths, self.batch_size(), self.data.device())?)
    }
}

/// Перевести `i64`-тензор длин `(batch,)` в вектор длин.
pub fn lengths_from_tensor(lengths: &Tensor) -> AsrResult<Vec<usize>> {
    let values = lengths.to_dtype(DType::I64)?.to_vec1::<i64>()?;
    values
        .into_iter()
        .map(|v| {
            usize::try_from(v)
                .map_err(|_| AsrError::InvalidLength(format!("отрицательная длина: {v}")))
        })
        .collect()
}
