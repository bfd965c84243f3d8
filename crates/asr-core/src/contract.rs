//! Контракт графа: имена, типы и ранги входов/выходов.
//!
//! Фиксируется при экспорте модели. Раннер проверяет контракт при
//! построении и на каждом вызове; тензоры никогда не приводятся к нужной
//! форме молча.

use std::collections::HashMap;

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::{AsrError, AsrResult};

/// Вход графа: признаки `(batch, time, feat_dim)`.
pub const FEATS: &str = "feats";
/// Вход графа: маска паддинга `(batch, 1, time)`.
pub const MASK: &str = "mask";
/// Выход графа: `(batch, out_time, hidden)`.
pub const ENCODER_OUT: &str = "encoder_out";
/// Выход графа: валидные длины выхода `(batch,)`.
pub const ENCODER_OUT_LENS: &str = "encoder_out_lens";

/// Именованные тензоры на границе с движком исполнения.
pub type NamedTensors = HashMap<String, Tensor>;

/// Тип элементов тензора на границе графа.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorDType {
    F32,
    F64,
    I64,
    /// Булев тензор; внутри candle хранится как `u8`.
    Bool,
}

impl TensorDType {
    /// Соответствующий тип candle.
    pub fn to_candle(self) -> DType {
        match self {
            Self::F32 => DType::F32,
            Self::F64 => DType::F64,
            Self::I64 => DType::I64,
            Self::Bool => DType::U8,
        }
    }
}

/// Описание одного тензора контракта.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    /// Имя входа/выхода в графе.
    pub name: String,

    /// Тип элементов.
    pub dtype: TensorDType,

    /// Размерности; `None` — динамическая ось.
    pub shape: Vec<Option<usize>>,
}

impl TensorSpec {
    pub fn new(name: impl Into<String>, dtype: TensorDType, shape: Vec<Option<usize>>) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Проверить тензор на соответствие описанию.
    pub fn check(&self, tensor: &Tensor) -> AsrResult<()> {
        if tensor.dtype() != self.dtype.to_candle() {
            return Err(AsrError::ContractViolation(format!(
                "'{}': ожидается dtype {:?}, получен {:?}",
                self.name,
                self.dtype,
                tensor.dtype()
            )));
        }

        let dims = tensor.dims();
        if dims.len() != self.rank() {
            return Err(AsrError::ContractViolation(format!(
                "'{}': ожидается ранг {}, получена форма {:?}",
                self.name,
                self.rank(),
                dims
            )));
        }

        for (axis, (&actual, expected)) in dims.iter().zip(&self.shape).enumerate() {
            if let Some(expected) = expected {
                if actual != *expected {
                    return Err(AsrError::ContractViolation(format!(
                        "'{}': ось {} равна {}, контракт требует {}",
                        self.name, axis, actual, expected
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Вход или выход, объявленный в метаданных загруженного графа.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredTensor {
    pub name: String,

    /// Тип элементов; `None` — тип, который пайплайн не поддерживает
    /// (f16, строки, последовательности).
    pub dtype: Option<TensorDType>,

    /// Размерности как в ONNX: `-1` — динамическая ось. Пустой вектор —
    /// форма в графе не объявлена, ранг не проверяется.
    pub shape: Vec<i64>,
}

impl DeclaredTensor {
    pub fn new(name: impl Into<String>, dtype: Option<TensorDType>, shape: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
        }
    }
}

impl TensorSpec {
    /// Сверить описание с тем, что объявляет сам граф.
    pub fn check_declared(&self, declared: &DeclaredTensor) -> AsrResult<()> {
        if declared.dtype != Some(self.dtype) {
            return Err(AsrError::ContractViolation(format!(
                "'{}': граф объявляет тип {:?}, контракт требует {:?}",
                self.name, declared.dtype, self.dtype
            )));
        }
        if declared.shape.is_empty() {
            return Ok(());
        }
        if declared.shape.len() != self.rank() {
            return Err(AsrError::ContractViolation(format!(
                "'{}': граф объявляет форму {:?}, контракт требует ранг {}",
                self.name,
                declared.shape,
                self.rank()
            )));
        }
        for (axis, (&actual, expected)) in declared.shape.iter().zip(&self.shape).enumerate() {
            if let (Ok(actual), Some(expected)) = (usize::try_from(actual), expected) {
                if actual != *expected {
                    return Err(AsrError::ContractViolation(format!(
                        "'{}': ось {} в графе равна {}, контракт требует {}",
                        self.name, axis, actual, expected
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Контракт графа энкодера.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphContract {
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

impl GraphContract {
    /// Стандартный контракт экспортированного энкодера.
    pub fn encoder(feat_dim: usize, mask_dtype: TensorDType) -> Self {
        Self {
            inputs: vec![
                TensorSpec::new(FEATS, TensorDType::F32, vec![None, None, Some(feat_dim)]),
                TensorSpec::new(MASK, mask_dtype, vec![None, Some(1), None]),
            ],
            outputs: vec![
                TensorSpec::new(ENCODER_OUT, TensorDType::F32, vec![None, None, None]),
                TensorSpec::new(ENCODER_OUT_LENS, TensorDType::I64, vec![None]),
            ],
        }
    }

    pub fn input(&self, name: &str) -> Option<&TensorSpec> {
        self.inputs.iter().find(|s| s.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&TensorSpec> {
        self.outputs.iter().find(|s| s.name == name)
    }

    /// Вход, обязательный для раннера.
    pub fn required_input(&self, name: &str) -> AsrResult<&TensorSpec> {
        self.input(name).ok_or_else(|| {
            AsrError::ContractViolation(format!("граф не объявляет вход '{name}'"))
        })
    }

    /// Выход, обязательный для раннера.
    pub fn required_output(&self, name: &str) -> AsrResult<&TensorSpec> {
        self.output(name).ok_or_else(|| {
            AsrError::ContractViolation(format!("граф не объявляет выход '{name}'"))
        })
    }

    /// Проверить набор входов: ровно объявленные имена, совпадающие типы и формы.
    pub fn check_inputs(&self, inputs: &NamedTensors) -> AsrResult<()> {
        for spec in &self.inputs {
            let tensor = inputs.get(&spec.name).ok_or_else(|| {
                AsrError::ContractViolation(format!("отсутствует вход '{}'", spec.name))
            })?;
            spec.check(tensor)?;
        }
        if let Some(extra) = inputs.keys().find(|name| self.input(name).is_none()) {
            return Err(AsrError::ContractViolation(format!(
                "вход '{extra}' не объявлен в контракте графа"
            )));
        }
        Ok(())
    }

    /// Сверить контракт с метаданными загруженного графа.
    ///
    /// Каждый вход и выход контракта должен быть объявлен в графе с тем же
    /// типом и совместимой формой. Вход графа, которого нет в контракте,
    /// тоже ошибка: подать его раннер не сможет. Лишние выходы допустимы.
    pub fn check_declared(
        &self,
        inputs: &[DeclaredTensor],
        outputs: &[DeclaredTensor],
    ) -> AsrResult<()> {
        let sides = [("вход", &self.inputs, inputs), ("выход", &self.outputs, outputs)];
        for (kind, specs, declared) in sides {
            for spec in specs {
                let found = declared.iter().find(|d| d.name == spec.name).ok_or_else(|| {
                    AsrError::ContractViolation(format!(
                        "граф не объявляет {kind} '{}', объявлены {:?}",
                        spec.name,
                        declared.iter().map(|d| d.name.as_str()).collect::<Vec<_>>()
                    ))
                })?;
                spec.check_declared(found)?;
            }
        }
        if let Some(extra) = inputs.iter().find(|d| self.input(&d.name).is_none()) {
            return Err(AsrError::ContractViolation(format!(
                "граф требует вход '{}', которого нет в контракте",
                extra.name
            )));
        }
        Ok(())
    }

    /// Проверить выходы движка: все объявленные выходы присутствуют и совпадают.
    pub fn check_outputs(&self, outputs: &NamedTensors) -> AsrResult<()> {
        for spec in &self.outputs {
            let tensor = outputs.get(&spec.name).ok_or_else(|| {
                AsrError::ContractViolation(format!("движок не вернул выход '{}'", spec.name))
            })?;
            spec.check(tensor)?;
        }
        Ok(())
    }
}
