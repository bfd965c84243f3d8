//! Точки расширения пайплайна: движок исполнения графа и
//! необязательные стадии до/после энкодера.

use crate::contract::{GraphContract, NamedTensors};
use crate::error::AsrResult;
use crate::types::SequenceBatch;

/// Движок исполнения экспортированного графа энкодера.
///
/// Для пайплайна это непрозрачный синхронный вызов: именованные входы
/// в обмен на именованные выходы. Движок может распараллеливать работу
/// внутри, но сам вызов блокирующий.
///
/// Потокобезопасность хэндла — предусловие реализации: раннер не берёт
/// блокировок и вызывает [`EncoderGraph::run`] только через `&mut self`.
///
/// # Пример
/// ```ignore
/// let mut graph = OnnxGraph::open("xformer_encoder.onnx", contract, None)?;
/// let outputs = graph.run(inputs)?;
/// let encoder_out = &outputs["encoder_out"];
/// ```
pub trait EncoderGraph: Send {
    /// Контракт графа, зафиксированный при экспорте.
    fn contract(&self) -> &GraphContract;

    /// Выполнить граф.
    ///
    /// # Ошибки
    /// `AsrError::Inference` при сбое движка.
    fn run(&mut self, inputs: NamedTensors) -> AsrResult<NamedTensors>;
}

/// Необязательная стадия пайплайна (pre-encoder или post-encoder).
///
/// Стадия обязана сохранять контракт `(тензор, длины)`: размер батча
/// не меняется, длины не превышают ось времени.
pub trait SequenceStage: Send {
    /// Имя стадии для логов.
    fn name(&self) -> &str;

    /// Преобразовать батч.
    ///
    /// Получает батч во владение и возвращает новый; раннер проверяет
    /// результат и отдаёт `AsrError::ContractViolation`, если размер батча
    /// изменился или длины вышли за ось времени.
    fn forward(&self, batch: SequenceBatch) -> AsrResult<SequenceBatch>;
}
