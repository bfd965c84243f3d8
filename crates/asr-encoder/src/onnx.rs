//! Движок исполнения на ONNX Runtime.
//!
//! Включается фичей `onnx`. Контракт графа берётся из конфигурации и при
//! открытии сверяется с метаданными сессии: имена, типы и ранги входов и
//! выходов должны совпасть до первого вызова.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use ort::session::Session;
use ort::tensor::TensorElementType;
use ort::value::{DynValue, ValueType};
use tracing::{debug, info};

use asr_core::{
    AsrError, AsrResult, DeclaredTensor, EncoderGraph, GraphContract, NamedTensors, TensorDType,
    TensorSpec,
};

/// Граф энкодера, исполняемый через `ort::Session`.
pub struct OnnxGraph {
    session: Session,
    contract: GraphContract,
}

impl std::fmt::Debug for OnnxGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxGraph")
            .field("contract", &self.contract)
            .finish_non_exhaustive()
    }
}

impl OnnxGraph {
    /// Открыть граф из файла.
    ///
    /// # Ошибки
    /// - `AsrError::Model` — файла нет или сессию не удалось создать;
    /// - `AsrError::ContractViolation` — граф объявляет другие имена, типы
    ///   или ранги входов/выходов, чем `contract`.
    pub fn open(
        path: impl AsRef<Path>,
        contract: GraphContract,
        intra_threads: Option<usize>,
    ) -> AsrResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(AsrError::Model(format!(
                "граф не найден: {}",
                path.display()
            )));
        }

        let mut builder = Session::builder().map_err(|e| model_err(path, e))?;
        if let Some(threads) = intra_threads {
            builder = builder
                .with_intra_threads(threads)
                .map_err(|e| model_err(path, e))?;
        }
        let session = builder
            .commit_from_file(path)
            .map_err(|e| model_err(path, e))?;

        let inputs: Vec<DeclaredTensor> = session
            .inputs()
            .iter()
            .map(|i| declared(i.name(), i.dtype()))
            .collect();
        let outputs: Vec<DeclaredTensor> = session
            .outputs()
            .iter()
            .map(|o| declared(o.name(), o.dtype()))
            .collect();
        debug!("OnnxGraph: граф объявляет входы {inputs:?}, выходы {outputs:?}");
        contract.check_declared(&inputs, &outputs)?;

        info!(
            "OnnxGraph: {} загружен, входы={:?}, выходы={:?}",
            path.display(),
            contract.inputs.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            contract.outputs.iter().map(|s| s.name.as_str()).collect::<Vec<_>>()
        );

        Ok(Self { session, contract })
    }
}

impl EncoderGraph for OnnxGraph {
    fn contract(&self) -> &GraphContract {
        &self.contract
    }

    fn run(&mut self, inputs: NamedTensors) -> AsrResult<NamedTensors> {
        let mut values: Vec<(String, DynValue)> = Vec::with_capacity(inputs.len());
        let mut device = Device::Cpu;
        for spec in &self.contract.inputs {
            let tensor = inputs.get(&spec.name).ok_or_else(|| {
                AsrError::ContractViolation(format!("отсутствует вход '{}'", spec.name))
            })?;
            device = tensor.device().clone();
            values.push((spec.name.clone(), to_ort(spec, tensor)?));
        }

        let outputs = self
            .session
            .run(values)
            .map_err(|e| AsrError::Inference(e.to_string()))?;

        let mut result = NamedTensors::new();
        for spec in &self.contract.outputs {
            let value = outputs.get(spec.name.as_str()).ok_or_else(|| {
                AsrError::ContractViolation(format!("движок не вернул выход '{}'", spec.name))
            })?;
            result.insert(spec.name.clone(), from_ort(spec, value, &device)?);
        }
        Ok(result)
    }
}

fn model_err(path: &Path, e: impl std::fmt::Display) -> AsrError {
    AsrError::Model(format!("{}: {e}", path.display()))
}

/// Вход/выход сессии в терминах контракта.
fn declared(name: &str, value_type: &ValueType) -> DeclaredTensor {
    let dtype = value_type.tensor_type().and_then(|t| match t {
        TensorElementType::Float32 => Some(TensorDType::F32),
        TensorElementType::Float64 => Some(TensorDType::F64),
        TensorElementType::Int64 => Some(TensorDType::I64),
        TensorElementType::Bool => Some(TensorDType::Bool),
        _ => None,
    });
    let shape = value_type
        .tensor_shape()
        .map(|shape| shape.iter().copied().collect())
        .unwrap_or_default();
    DeclaredTensor::new(name, dtype, shape)
}

fn to_ort(spec: &TensorSpec, tensor: &Tensor) -> AsrResult<DynValue> {
    let shape: Vec<usize> = tensor.dims().to_vec();
    let flat = tensor.flatten_all()?;
    let value = match spec.dtype {
        TensorDType::F32 => {
            let data = flat.to_dtype(DType::F32)?.to_vec1::<f32>()?;
            ort::value::Tensor::from_array((shape, data.into_boxed_slice())).map(|t| t.into_dyn())
        }
        TensorDType::F64 => {
            let data = flat.to_dtype(DType::F64)?.to_vec1::<f64>()?;
            ort::value::Tensor::from_array((shape, data.into_boxed_slice())).map(|t| t.into_dyn())
        }
        TensorDType::I64 => {
            let data = flat.to_dtype(DType::I64)?.to_vec1::<i64>()?;
            ort::value::Tensor::from_array((shape, data.into_boxed_slice())).map(|t| t.into_dyn())
        }
        TensorDType::Bool => {
            let data: Vec<bool> = flat
                .to_dtype(DType::U8)?
                .to_vec1::<u8>()?
                .into_iter()
                .map(|v| v != 0)
                .collect();
            ort::value::Tensor::from_array((shape, data.into_boxed_slice())).map(|t| t.into_dyn())
        }
    };
    value.map_err(|e| AsrError::Inference(format!("'{}': {e}", spec.name)))
}

fn from_ort(spec: &TensorSpec, value: &DynValue, device: &Device) -> AsrResult<Tensor> {
    let extract_err = |e: ort::Error| {
        AsrError::ContractViolation(format!("'{}' ({:?}): {e}", spec.name, spec.dtype))
    };
    let tensor = match spec.dtype {
        TensorDType::F32 => {
            let (shape, data) = value.try_extract_tensor::<f32>().map_err(extract_err)?;
            Tensor::from_slice(data, dims(shape), device)?
        }
        TensorDType::F64 => {
            let (shape, data) = value.try_extract_tensor::<f64>().map_err(extract_err)?;
            Tensor::from_slice(data, dims(shape), device)?
        }
        TensorDType::I64 => {
            let (shape, data) = value.try_extract_tensor::<i64>().map_err(extract_err)?;
            Tensor::from_slice(data, dims(shape), device)?
        }
        TensorDType::Bool => {
            let (shape, data) = value.try_extract_tensor::<bool>().map_err(extract_err)?;
            let data: Vec<u8> = data.iter().map(|&b| u8::from(b)).collect();
            Tensor::from_vec(data, dims(shape), device)?
        }
    };
    Ok(tensor)
}

fn dims(shape: &[i64]) -> Vec<usize> {
    shape.iter().map(|&d| d.max(0) as usize).collect()
}
