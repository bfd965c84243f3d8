//! Раннер энкодера.
//!
//! Один вызов [`EncoderRunner::run`]:
//! 1. Аудио `(batch, samples)` → log-mel признаки (`FeatureFrontend`)
//! 2. Нормализация (`Normalizer`, если задана)
//! 3. Pre-encoder стадия (если включена)
//! 4. Маска паддинга по длинам признаков
//! 5. Граф `feats`/`mask` → `encoder_out`/`encoder_out_lens`
//! 6. Post-encoder стадия (если включена)

use candle_core::Tensor;
use tracing::{debug, info, warn};

use asr_core::contract::{ENCODER_OUT, ENCODER_OUT_LENS, FEATS, MASK};
use asr_core::{
    AsrError, AsrResult, EncoderConfig, EncoderGraph, GraphContract,
    NamedTensors, SequenceBatch, SequenceStage, TensorDType, lengths_from_tensor,
};
use audio::{FeatureFrontend, MvnStats, Normalizer};

use crate::mask::{MaskWidth, PaddingMask, PaddingMaskBuilder};

/// Результат энкодера.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// Скрытые состояния `(batch, out_time, hidden)`.
    pub encoder_out: Tensor,

    /// Валидная длина каждого сэмпла на выходе, как её вернул граф.
    pub encoder_out_lens: Vec<usize>,
}

/// Входы графа, подготовленные из аудио.
#[derive(Debug, Clone)]
pub struct PreparedInputs {
    /// Признаки после нормализации и pre-encoder стадии.
    pub feats: SequenceBatch,

    /// Маска паддинга по длинам признаков.
    pub mask: PaddingMask,
}

/// Раннер энкодера: аудио → признаки → граф → выходы.
///
/// Все компоненты фиксируются при построении. `run` берёт `&mut self`,
/// поэтому вызовы одного раннера сериализованы; для параллельной работы
/// нужен отдельный раннер на поток.
pub struct EncoderRunner {
    config: EncoderConfig,
    frontend: FeatureFrontend,
    normalizer: Option<Normalizer>,
    mask_builder: PaddingMaskBuilder,
    graph: Box<dyn EncoderGraph>,
    pre_encoder: Option<Box<dyn SequenceStage>>,
    post_encoder: Option<Box<dyn SequenceStage>>,
}

impl std::fmt::Debug for EncoderRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoderRunner")
            .field("config", &self.config)
            .field("normalizer", &self.normalizer.as_ref().map(Normalizer::kind))
            .field("pre_encoder", &self.pre_encoder.as_ref().map(|s| s.name().to_string()))
            .field("post_encoder", &self.post_encoder.as_ref().map(|s| s.name().to_string()))
            .finish_non_exhaustive()
    }
}

/// Построитель [`EncoderRunner`].
pub struct EncoderRunnerBuilder {
    config: EncoderConfig,
    graph: Option<Box<dyn EncoderGraph>>,
    stats: Option<MvnStats>,
    pre_encoder: Option<Box<dyn SequenceStage>>,
    post_encoder: Option<Box<dyn SequenceStage>>,
}

impl EncoderRunnerBuilder {
    /// Движок исполнения графа.
    pub fn graph(mut self, graph: impl EncoderGraph + 'static) -> Self {
        self.graph = Some(Box::new(graph));
        self
    }

    /// Статистика глобальной нормализации (вместо `stats_file` из конфига).
    pub fn stats(mut self, stats: MvnStats) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Pre-encoder стадия. Требует `do_preencoder = true`.
    pub fn pre_encoder(mut self, stage: impl SequenceStage + 'static) -> Self {
        self.pre_encoder = Some(Box::new(stage));
        self
    }

    /// Post-encoder стадия. Требует `do_postencoder = true`.
    pub fn post_encoder(mut self, stage: impl SequenceStage + 'static) -> Self {
        self.post_encoder = Some(Box::new(stage));
        self
    }

    /// Открыть граф из `config.model_path` через ONNX Runtime.
    #[cfg(feature = "onnx")]
    pub fn load(self) -> AsrResult<Self> {
        let path = self.config.model_path.clone();
        self.load_from(path)
    }

    /// Открыть квантизированный граф из `config.quantized_model_path`.
    ///
    /// # Ошибки
    /// `AsrError::Config`, если путь к квантизированному графу не задан.
    #[cfg(feature = "onnx")]
    pub fn load_quantized(self) -> AsrResult<Self> {
        let path = self.config.quantized_model_path.clone().ok_or_else(|| {
            AsrError::Config("quantized_model_path не задан в конфигурации".into())
        })?;
        self.load_from(path)
    }

    #[cfg(feature = "onnx")]
    fn load_from(self, path: std::path::PathBuf) -> AsrResult<Self> {
        let graph = crate::onnx::OnnxGraph::open(
            &path,
            self.config.graph_contract(),
            self.config.intra_threads,
        )?;
        Ok(self.graph(graph))
    }

    /// Собрать раннер.
    ///
    /// # Ошибки
    /// - `AsrError::Config` — движок не задан, параметры фронтенда или
    ///   нормализации некорректны либо флаги стадий не совпадают с
    ///   переданными стадиями;
    /// - `AsrError::ContractViolation` — контракт графа несовместим с
    ///   конфигурацией (размерность признаков, тип маски, имена входов).
    pub fn build(self) -> AsrResult<EncoderRunner> {
        let Self {
            config,
            graph,
            stats,
            pre_encoder,
            post_encoder,
        } = self;

        let graph = graph
            .ok_or_else(|| AsrError::Config("движок исполнения графа не задан".into()))?;

        let frontend = FeatureFrontend::new(config.frontend.clone())?;
        let normalizer = match &config.normalize {
            Some(norm) => Some(Normalizer::from_config(norm, stats, frontend.feat_dim())?),
            None => {
                if stats.is_some() {
                    warn!("EncoderRunner: статистика передана, но нормализация отключена");
                }
                None
            }
        };
        let mask_builder = PaddingMaskBuilder::from_config(&config.mask)?;

        check_stage("pre_encoder", config.do_preencoder, pre_encoder.as_deref())?;
        check_stage("post_encoder", config.do_postencoder, post_encoder.as_deref())?;
        check_contract(graph.contract(), &config, frontend.feat_dim())?;

        info!(
            "EncoderRunner: n_mels={}, normalize={:?}, embedding={:?}, mask={:?}/{:?}",
            frontend.feat_dim(),
            normalizer.as_ref().map(Normalizer::kind),
            config.embedding,
            config.mask.polarity,
            config.mask.dtype,
        );

        Ok(EncoderRunner {
            config,
            frontend,
            normalizer,
            mask_builder,
            graph,
            pre_encoder,
            post_encoder,
        })
    }
}

impl EncoderRunner {
    /// Построитель раннера для указанной конфигурации.
    pub fn builder(config: EncoderConfig) -> EncoderRunnerBuilder {
        EncoderRunnerBuilder {
            config,
            graph: None,
            stats: None,
            pre_encoder: None,
            post_encoder: None,
        }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn frontend(&self) -> &FeatureFrontend {
        &self.frontend
    }

    /// Подготовить входы графа без его запуска.
    ///
    /// # Аргументы
    /// * `speech` — аудио `(batch, samples)`, дополненное нулями.
    /// * `speech_lengths` — валидная длина каждой записи в сэмплах.
    pub fn prepare(&self, speech: &Tensor, speech_lengths: &[usize]) -> AsrResult<PreparedInputs> {
        let debug = asr_core::debug::enabled();

        let mut feats = self.frontend.extract(speech, speech_lengths)?;
        if debug {
            eprintln!(
                "DEBUG EncoderRunner: feats={:?}, feat_lens={:?}",
                feats.data.dims(),
                feats.lengths
            );
        }

        if let Some(normalizer) = &self.normalizer {
            feats = normalizer.apply(feats)?;
        }

        if let Some(stage) = &self.pre_encoder {
            let batch = feats.batch_size();
            feats = stage.forward(feats)?;
            check_stage_output(stage.name(), batch, &feats)?;
            if debug {
                eprintln!(
                    "DEBUG EncoderRunner: {} → {:?}, lens={:?}",
                    stage.name(),
                    feats.data.dims(),
                    feats.lengths
                );
            }
        }

        let mask = self
            .mask_builder
            .build(&feats.lengths, MaskWidth::Explicit(feats.time_dim()))?;

        Ok(PreparedInputs { feats, mask })
    }

    /// Прогнать батч через энкодер.
    ///
    /// # Ошибки
    /// - `InvalidLength` / `InvalidInput` — некорректные длины или слишком
    ///   короткая запись;
    /// - `ContractViolation` — входы или выходы графа не соответствуют
    ///   контракту;
    /// - `Inference` — сбой движка.
    pub fn run(&mut self, speech: &Tensor, speech_lengths: &[usize]) -> AsrResult<EncoderOutput> {
        let debug = asr_core::debug::enabled();
        let prepared = self.prepare(speech, speech_lengths)?;
        let batch = prepared.feats.batch_size();
        let feats_time = prepared.feats.time_dim();

        let inputs = self.graph_inputs(&prepared)?;
        let contract = self.graph.contract();
        contract.check_inputs(&inputs)?;

        let mut outputs = self.graph.run(inputs)?;
        self.graph.contract().check_outputs(&outputs)?;

        let encoder_out = outputs.remove(ENCODER_OUT);
        let lens = outputs.remove(ENCODER_OUT_LENS);
        let (encoder_out, lens) = match (encoder_out, lens) {
            (Some(out), Some(lens)) => (out, lens),
            _ => {
                return Err(AsrError::ContractViolation(
                    "движок не вернул encoder_out/encoder_out_lens".into(),
                ));
            }
        };
        let encoder_out_lens = lengths_from_tensor(&lens).map_err(|e| match e {
            AsrError::InvalidLength(msg) => AsrError::ContractViolation(msg),
            other => other,
        })?;

        let out_time = encoder_out.dims()[1];
        if encoder_out.dims()[0] != batch || encoder_out_lens.len() != batch {
            return Err(AsrError::ContractViolation(format!(
                "размер батча на выходе {:?} / {} не совпадает со входом {}",
                encoder_out.dims(),
                encoder_out_lens.len(),
                batch
            )));
        }
        if let Some(&too_long) = encoder_out_lens.iter().find(|&&l| l > out_time) {
            return Err(AsrError::ContractViolation(format!(
                "длина выхода {too_long} больше оси времени {out_time}"
            )));
        }
        self.check_embedding(feats_time, out_time, &prepared.feats.lengths, &encoder_out_lens)?;

        if debug {
            eprintln!(
                "DEBUG EncoderRunner: feats_time={}, out={:?}, out_lens={:?}",
                feats_time,
                encoder_out.dims(),
                encoder_out_lens
            );
        }

        let mut output = EncoderOutput {
            encoder_out,
            encoder_out_lens,
        };
        if let Some(stage) = &self.post_encoder {
            let input = SequenceBatch::new(output.encoder_out, output.encoder_out_lens)?;
            let seq = stage.forward(input)?;
            check_stage_output(stage.name(), batch, &seq)?;
            output = EncoderOutput {
                encoder_out: seq.data,
                encoder_out_lens: seq.lengths,
            };
        }

        debug!(
            "EncoderRunner: batch={}, out={:?}, lens={:?}",
            batch,
            output.encoder_out.dims(),
            output.encoder_out_lens
        );
        Ok(output)
    }

    fn graph_inputs(&self, prepared: &PreparedInputs) -> AsrResult<NamedTensors> {
        let contract = self.graph.contract();
        let device = prepared.feats.data.device();
        let mask_spec = contract.required_input(MASK)?;
        let mask = if mask_spec.rank() == 2 {
            prepared
                .mask
                .to_tensor_2d(self.config.mask.polarity, mask_spec.dtype, device)?
        } else {
            prepared
                .mask
                .to_tensor(self.config.mask.polarity, mask_spec.dtype, device)?
        };

        let mut inputs = NamedTensors::new();
        inputs.insert(FEATS.to_string(), prepared.feats.data.clone());
        inputs.insert(MASK.to_string(), mask);
        Ok(inputs)
    }

    /// Сверить выход графа с ожидаемой редукцией эмбеддинга.
    ///
    /// Ширина выхода обязана совпадать; расхождение длин только логируется,
    /// длины графа остаются авторитетными.
    fn check_embedding(
        &self,
        feats_time: usize,
        out_time: usize,
        feat_lens: &[usize],
        out_lens: &[usize],
    ) -> AsrResult<()> {
        let Some(kind) = self.config.embedding.as_ref() else {
            return Ok(());
        };
        let expected_time = kind.output_time(feats_time);
        if expected_time != out_time {
            return Err(AsrError::ContractViolation(format!(
                "{kind:?}: ожидается ось времени {expected_time} на выходе (вход {feats_time}), получена {out_time}"
            )));
        }
        let expected = kind.output_lengths(feat_lens, feats_time);
        if expected != out_lens {
            warn!(
                "EncoderRunner: длины графа {:?} отличаются от ожидаемых для {:?}: {:?}",
                out_lens, kind, expected
            );
        }
        Ok(())
    }
}

fn check_stage(
    name: &str,
    enabled: bool,
    stage: Option<&dyn SequenceStage>,
) -> AsrResult<()> {
    match (enabled, stage.is_some()) {
        (true, false) => Err(AsrError::Config(format!(
            "{name} включён в конфигурации, но стадия не передана"
        ))),
        (false, true) => Err(AsrError::Config(format!(
            "{name} передан, но отключён в конфигурации"
        ))),
        _ => Ok(()),
    }
}

fn check_stage_output(name: &str, batch: usize, seq: &SequenceBatch) -> AsrResult<()> {
    if seq.data.rank() != 3 {
        return Err(AsrError::ContractViolation(format!(
            "стадия '{name}' вернула тензор формы {:?}, ожидается (batch, time, dim)",
            seq.data.dims()
        )));
    }
    if seq.batch_size() != batch || seq.data.dims()[0] != batch {
        return Err(AsrError::ContractViolation(format!(
            "стадия '{name}' изменила размер батча: {} → {}",
            batch,
            seq.batch_size()
        )));
    }
    if let Some(&too_long) = seq.lengths.iter().find(|&&l| l > seq.time_dim()) {
        return Err(AsrError::ContractViolation(format!(
            "стадия '{name}': длина {too_long} больше оси времени {}",
            seq.time_dim()
        )));
    }
    Ok(())
}

/// Проверить, что контракт графа совместим с конфигурацией раннера.
fn check_contract(
    contract: &GraphContract,
    config: &EncoderConfig,
    feat_dim: usize,
) -> AsrResult<()> {
    let incompatible =
        |msg: String| AsrError::ContractViolation(format!("контракт графа: {msg}"));

    let feats = contract.required_input(FEATS)?;
    if feats.dtype != TensorDType::F32 || feats.rank() != 3 {
        return Err(incompatible(format!(
            "'{FEATS}' должен быть f32 ранга 3, объявлен {:?} ранга {}",
            feats.dtype,
            feats.rank()
        )));
    }
    if let Some(dim) = feats.shape[2] {
        if dim != feat_dim {
            return Err(incompatible(format!(
                "'{FEATS}' ожидает {dim} признаков, фронтенд даёт {feat_dim}"
            )));
        }
    }

    let mask = contract.required_input(MASK)?;
    if mask.dtype != config.mask.dtype {
        return Err(incompatible(format!(
            "тип '{MASK}' {:?} не совпадает с конфигурацией {:?}",
            mask.dtype, config.mask.dtype
        )));
    }
    match mask.shape.as_slice() {
        [_, Some(1), _] | [_, None, _] | [_, _] => {}
        other => {
            return Err(incompatible(format!(
                "'{MASK}' должен иметь форму (batch, 1, time) или (batch, time), объявлена {other:?}"
            )));
        }
    }

    if let Some(extra) = contract
        .inputs
        .iter()
        .find(|spec| spec.name != FEATS && spec.name != MASK)
    {
        return Err(incompatible(format!("неизвестный вход '{}'", extra.name)));
    }

    let out = contract.required_output(ENCODER_OUT)?;
    if out.dtype != TensorDType::F32 || out.rank() != 3 {
        return Err(incompatible(format!(
            "'{ENCODER_OUT}' должен быть f32 ранга 3, объявлен {:?} ранга {}",
            out.dtype,
            out.rank()
        )));
    }
    let lens = contract.required_output(ENCODER_OUT_LENS)?;
    if lens.dtype != TensorDType::I64 || lens.rank() != 1 {
        return Err(incompatible(format!(
            "'{ENCODER_OUT_LENS}' должен быть i64 ранга 1, объявлен {:?} ранга {}",
            lens.dtype,
            lens.rank()
        )));
    }
    Ok(())
}
