//! Сквозные тесты раннера с подменённым движком исполнения.

use std::sync::{Arc, Mutex};

use asr_core::contract::{ENCODER_OUT, ENCODER_OUT_LENS, FEATS, MASK};
use asr_core::{
    AsrError, AsrResult, EmbeddingKind, EncoderConfig, EncoderGraph, FrontendConfig,
    GraphContract, NamedTensors, NormalizeConfig, SequenceBatch, SequenceStage, SubsampleStride,
    TensorDType,
};
use asr_encoder::EncoderRunner;
use audio::MvnStats;
use candle_core::{DType, Device, Tensor};

const HIDDEN: usize = 16;

/// Что подменённый граф возвращает в `encoder_out_lens`.
#[derive(Clone)]
enum Lens {
    /// Длины по маске через редукцию эмбеддинга.
    FromMask,
    /// Фиксированные значения.
    Fixed(Vec<i64>),
}

/// Граф-заглушка: нули `(batch, T', HIDDEN)` и длины по маске.
struct FakeGraph {
    contract: GraphContract,
    kind: EmbeddingKind,
    lens: Lens,
    out_time_delta: isize,
    seen: Arc<Mutex<Option<NamedTensors>>>,
}

impl FakeGraph {
    fn new(config: &EncoderConfig) -> Self {
        Self {
            contract: config.graph_contract(),
            kind: config.embedding.unwrap_or(EmbeddingKind::Plain),
            lens: Lens::FromMask,
            out_time_delta: 0,
            seen: Arc::new(Mutex::new(None)),
        }
    }
}

impl EncoderGraph for FakeGraph {
    fn contract(&self) -> &GraphContract {
        &self.contract
    }

    fn run(&mut self, inputs: NamedTensors) -> AsrResult<NamedTensors> {
        let feats = &inputs[FEATS];
        let (batch, time, _) = feats.dims3()?;

        let valid: Vec<usize> = inputs[MASK]
            .to_dtype(DType::F32)?
            .sum(2)?
            .squeeze(1)?
            .to_vec1::<f32>()?
            .into_iter()
            .map(|v| v as usize)
            .collect();
        let lens: Vec<i64> = match &self.lens {
            Lens::FromMask => self
                .kind
                .output_lengths(&valid, time)
                .into_iter()
                .map(|l| l as i64)
                .collect(),
            Lens::Fixed(values) => values.clone(),
        };

        let out_time = (self.kind.output_time(time) as isize + self.out_time_delta) as usize;
        let mut out = NamedTensors::new();
        out.insert(
            ENCODER_OUT.into(),
            Tensor::zeros((batch, out_time, HIDDEN), DType::F32, feats.device())?,
        );
        out.insert(
            ENCODER_OUT_LENS.into(),
            Tensor::from_vec(lens, batch, feats.device())?,
        );
        *self.seen.lock().expect("lock") = Some(inputs);
        Ok(out)
    }
}

/// Умножает признаки на константу.
struct Scale(f64);

impl SequenceStage for Scale {
    fn name(&self) -> &str {
        "scale"
    }

    fn forward(&self, batch: SequenceBatch) -> AsrResult<SequenceBatch> {
        SequenceBatch::new((batch.data * self.0)?, batch.lengths)
    }
}

/// Отбрасывает последний фрейм выхода.
struct DropLastFrame;

impl SequenceStage for DropLastFrame {
    fn name(&self) -> &str {
        "drop_last_frame"
    }

    fn forward(&self, batch: SequenceBatch) -> AsrResult<SequenceBatch> {
        let time = batch.time_dim() - 1;
        let lengths = batch.lengths.iter().map(|&l| l.min(time)).collect();
        SequenceBatch::new(batch.data.narrow(1, 0, time)?, lengths)
    }
}

/// Теряет последний элемент батча.
struct DropLastSample;

impl SequenceStage for DropLastSample {
    fn name(&self) -> &str {
        "drop_last_sample"
    }

    fn forward(&self, batch: SequenceBatch) -> AsrResult<SequenceBatch> {
        let n = batch.batch_size() - 1;
        SequenceBatch::new(batch.data.narrow(0, 0, n)?, batch.lengths[..n].to_vec())
    }
}

fn tone(len: usize, freq: f32) -> Vec<f32> {
    (0..len)
        .map(|i| 0.3 * (2.0 * std::f32::consts::PI * freq * i as f32 / 16000.0).sin())
        .collect()
}

fn speech_batch(lengths: &[usize]) -> SequenceBatch {
    let waves: Vec<Vec<f32>> = lengths.iter().map(|&l| tone(l, 440.0)).collect();
    SequenceBatch::from_waveforms(&waves, &Device::Cpu).expect("speech batch")
}

fn base_config() -> EncoderConfig {
    let mut config = EncoderConfig::new("xformer_encoder.onnx");
    config.frontend = FrontendConfig::fbank_25ms_10ms();
    config.normalize = Some(NormalizeConfig::utterance());
    config.embedding = Some(EmbeddingKind::Conv2dSubsample {
        stride: SubsampleStride::X4,
    });
    config
}

#[test]
fn test_two_utterances_end_to_end() {
    let config = base_config();
    let graph = FakeGraph::new(&config);
    let seen = graph.seen.clone();
    let mut runner = EncoderRunner::builder(config)
        .graph(graph)
        .build()
        .expect("runner");

    let speech = speech_batch(&[16000, 8000]);
    let out = runner.run(&speech.data, &speech.lengths).expect("run");

    eprintln!(
        "encoder_out={:?}, lens={:?}",
        out.encoder_out.dims(),
        out.encoder_out_lens
    );
    assert_eq!(out.encoder_out.dims(), &[2, 23, HIDDEN]);
    assert_eq!(out.encoder_out_lens, vec![23, 12]);

    let inputs = seen.lock().expect("lock").take().expect("graph was called");
    assert_eq!(inputs[FEATS].dims(), &[2, 98, 80]);

    // по умолчанию маска float64, как при экспорте
    assert_eq!(inputs[MASK].dtype(), DType::F64);
    let mask = inputs[MASK].to_vec3::<f64>().expect("mask");
    assert_eq!(inputs[MASK].dims(), &[2, 1, 98]);
    assert!(mask[0][0].iter().all(|&v| v == 1.0));
    assert!(mask[1][0][..48].iter().all(|&v| v == 1.0));
    assert!(mask[1][0][48..].iter().all(|&v| v == 0.0));

    // per-utterance нормализация обнуляет паддинг
    let feats = inputs[FEATS].to_vec3::<f32>().expect("feats");
    assert!(feats[1][48..].iter().flatten().all(|&v| v == 0.0));
}

#[test]
fn test_prepare_matches_run_inputs() {
    let config = base_config();
    let runner = EncoderRunner::builder(config.clone())
        .graph(FakeGraph::new(&config))
        .build()
        .expect("runner");

    let speech = speech_batch(&[16000, 8000]);
    let prepared = runner
        .prepare(&speech.data, &speech.lengths)
        .expect("prepare");
    assert_eq!(prepared.feats.lengths, vec![98, 48]);
    assert_eq!(prepared.mask.shape(), (2, 1, 98));
    assert_eq!(prepared.mask.valid_counts(), vec![98, 48]);
}

#[test]
fn test_engine_lengths_are_returned_unchanged() {
    let config = base_config();
    let mut graph = FakeGraph::new(&config);
    graph.lens = Lens::Fixed(vec![21, 9]);
    let mut runner = EncoderRunner::builder(config)
        .graph(graph)
        .build()
        .expect("runner");

    let speech = speech_batch(&[16000, 8000]);
    let out = runner.run(&speech.data, &speech.lengths).expect("run");
    assert_eq!(out.encoder_out_lens, vec![21, 9]);
}

#[test]
fn test_zero_length_fails() {
    let config = base_config();
    let mut runner = EncoderRunner::builder(config.clone())
        .graph(FakeGraph::new(&config))
        .build()
        .expect("runner");

    let speech = speech_batch(&[16000, 8000]);
    let err = runner.run(&speech.data, &[16000, 0]).unwrap_err();
    assert!(matches!(err, AsrError::InvalidLength(_)), "{err}");

    let err = runner.run(&speech.data, &[16000, 300]).unwrap_err();
    assert!(matches!(err, AsrError::InvalidInput(_)), "{err}");
}

#[test]
fn test_output_contract_violations() {
    let config = base_config();
    let speech = speech_batch(&[16000, 8000]);

    let mut wrong_time = FakeGraph::new(&config);
    wrong_time.out_time_delta = -1;
    let mut runner = EncoderRunner::builder(config.clone())
        .graph(wrong_time)
        .build()
        .expect("runner");
    let err = runner.run(&speech.data, &speech.lengths).unwrap_err();
    assert!(matches!(err, AsrError::ContractViolation(_)), "{err}");

    let mut negative = FakeGraph::new(&config);
    negative.lens = Lens::Fixed(vec![23, -1]);
    let mut runner = EncoderRunner::builder(config.clone())
        .graph(negative)
        .build()
        .expect("runner");
    let err = runner.run(&speech.data, &speech.lengths).unwrap_err();
    assert!(matches!(err, AsrError::ContractViolation(_)), "{err}");

    let mut too_long = FakeGraph::new(&config);
    too_long.lens = Lens::Fixed(vec![24, 12]);
    let mut runner = EncoderRunner::builder(config)
        .graph(too_long)
        .build()
        .expect("runner");
    let err = runner.run(&speech.data, &speech.lengths).unwrap_err();
    assert!(matches!(err, AsrError::ContractViolation(_)), "{err}");
}

#[test]
fn test_incompatible_contract_fails_at_build() {
    let config = base_config();

    let mut graph = FakeGraph::new(&config);
    graph.contract = GraphContract::encoder(40, TensorDType::F64);
    let err = EncoderRunner::builder(config.clone())
        .graph(graph)
        .build()
        .unwrap_err();
    assert!(matches!(err, AsrError::ContractViolation(_)), "{err}");

    // граф экспортирован с маской f32, конфигурация по умолчанию ждёт f64
    let mut graph = FakeGraph::new(&config);
    graph.contract = GraphContract::encoder(80, TensorDType::F32);
    let err = EncoderRunner::builder(config.clone())
        .graph(graph)
        .build()
        .unwrap_err();
    assert!(matches!(err, AsrError::ContractViolation(_)), "{err}");

    let mut graph = FakeGraph::new(&config);
    graph.contract.outputs.retain(|s| s.name != ENCODER_OUT_LENS);
    let err = EncoderRunner::builder(config)
        .graph(graph)
        .build()
        .unwrap_err();
    assert!(matches!(err, AsrError::ContractViolation(_)), "{err}");
}

#[test]
fn test_bool_mask_with_padded_polarity() {
    let mut config = base_config();
    config.mask.dtype = TensorDType::Bool;
    config.mask.polarity = asr_core::MaskPolarity::Padded;
    config.mask.max_seq_len = Some(512);

    let graph = FakeGraph::new(&config);
    let seen = graph.seen.clone();
    let mut runner = EncoderRunner::builder(config)
        .graph(graph)
        .build()
        .expect("runner");

    let speech = speech_batch(&[16000, 8000]);
    // FakeGraph считает единицы маски валидными, поэтому его длины здесь
    // неверны; раннер только предупреждает об этом.
    runner.run(&speech.data, &speech.lengths).expect("run");

    let inputs = seen.lock().expect("lock").take().expect("graph was called");
    assert_eq!(inputs[MASK].dtype(), DType::U8);
    let mask = inputs[MASK].to_vec3::<u8>().expect("mask");
    assert!(mask[0][0].iter().all(|&v| v == 0));
    assert!(mask[1][0][..48].iter().all(|&v| v == 0));
    assert!(mask[1][0][48..].iter().all(|&v| v == 1));
}

#[test]
fn test_pre_and_post_encoder_stages() {
    let mut config = base_config();
    config.do_preencoder = true;
    config.do_postencoder = true;

    let mut runner = EncoderRunner::builder(config.clone())
        .graph(FakeGraph::new(&config))
        .pre_encoder(Scale(2.0))
        .post_encoder(DropLastFrame)
        .build()
        .expect("runner");

    let speech = speech_batch(&[16000, 8000]);
    let out = runner.run(&speech.data, &speech.lengths).expect("run");
    assert_eq!(out.encoder_out.dims(), &[2, 22, HIDDEN]);
    assert_eq!(out.encoder_out_lens, vec![22, 12]);

    let mut bad = EncoderRunner::builder(config.clone())
        .graph(FakeGraph::new(&config))
        .pre_encoder(DropLastSample)
        .post_encoder(DropLastFrame)
        .build()
        .expect("runner");
    let err = bad.run(&speech.data, &speech.lengths).unwrap_err();
    assert!(matches!(err, AsrError::ContractViolation(_)), "{err}");
}

#[test]
fn test_stage_flags_must_match() {
    let config = base_config();
    let err = EncoderRunner::builder(config.clone())
        .graph(FakeGraph::new(&config))
        .pre_encoder(Scale(1.0))
        .build()
        .unwrap_err();
    assert!(matches!(err, AsrError::Config(_)), "{err}");

    let mut enabled = config.clone();
    enabled.do_postencoder = true;
    let err = EncoderRunner::builder(enabled)
        .graph(FakeGraph::new(&config))
        .build()
        .unwrap_err();
    assert!(matches!(err, AsrError::Config(_)), "{err}");
}

#[test]
fn test_global_stats_dimension_mismatch() {
    let mut config = base_config();
    config.normalize = Some(NormalizeConfig {
        stats_file: None,
        ..NormalizeConfig::global("feats_stats.json")
    });

    let stats = MvnStats::new(vec![0.0; 40], vec![1.0; 40]).expect("stats");
    let err = EncoderRunner::builder(config.clone())
        .graph(FakeGraph::new(&config))
        .stats(stats)
        .build()
        .unwrap_err();
    assert!(matches!(err, AsrError::Config(_)), "{err}");

    let stats = MvnStats::new(vec![0.0; 80], vec![1.0; 80]).expect("stats");
    let mut runner = EncoderRunner::builder(config.clone())
        .graph(FakeGraph::new(&config))
        .stats(stats)
        .build()
        .expect("runner");
    let speech = speech_batch(&[16000, 8000]);
    let out = runner.run(&speech.data, &speech.lengths).expect("run");
    assert_eq!(out.encoder_out_lens, vec![23, 12]);
}

#[test]
fn test_config_file_with_stats() {
    let dir = std::env::temp_dir().join(format!("asr-encoder-config-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("temp dir");

    let stats = serde_json::json!({
        "count": 10.0,
        "sum": vec![5.0; 80],
        "sum_square": vec![12.5; 80],
    });
    std::fs::write(dir.join("feats_stats.json"), stats.to_string()).expect("write stats");

    let config = serde_json::json!({
        "model_path": "xformer_encoder.onnx",
        "frontend": {
            "stft": {"n_fft": 400, "hop_length": 160, "center": false, "window": "hann"},
            "logmel": {"sr": 16000, "n_mels": 80}
        },
        "normalize": {"type": "gmvn", "stats_file": "feats_stats.json"},
        "embedding": {"type": "conv2d_subsample", "stride": 4},
        "mask": {"polarity": "valid", "dtype": "f32", "max_seq_len": 1024}
    });
    let config_path = dir.join("config.json");
    std::fs::write(&config_path, config.to_string()).expect("write config");

    let config = EncoderConfig::from_file(&config_path).expect("config");
    assert_eq!(config.model_path, dir.join("xformer_encoder.onnx"));

    let mut runner = EncoderRunner::builder(config.clone())
        .graph(FakeGraph::new(&config))
        .build()
        .expect("runner");
    let speech = speech_batch(&[16000, 8000]);
    let out = runner.run(&speech.data, &speech.lengths).expect("run");
    assert_eq!(out.encoder_out_lens, vec![23, 12]);

    std::fs::remove_dir_all(&dir).ok();
}
