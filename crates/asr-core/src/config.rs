//! Конфигурационные структуры энкодера.
//!
//! Формат совпадает с JSON-конфигом, который пишется при экспорте модели:
//! пути к графу, параметры фронтенда, тип нормализации и флаги
//! необязательных стадий.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::contract::{GraphContract, TensorDType};
use crate::embedding::EmbeddingKind;
use crate::{AsrError, AsrResult};

/// Конфигурация энкодера целиком.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Путь к экспортированному графу.
    pub model_path: PathBuf,

    /// Путь к квантизированному варианту графа (если экспортирован).
    #[serde(default)]
    pub quantized_model_path: Option<PathBuf>,

    /// Параметры фронтенда (STFT + log-mel).
    #[serde(default)]
    pub frontend: FrontendConfig,

    /// Нормализация признаков. `None` — стадия отключена.
    #[serde(default)]
    pub normalize: Option<NormalizeConfig>,

    /// Включена ли pre-encoder стадия.
    #[serde(default)]
    pub do_preencoder: bool,

    /// Включена ли post-encoder стадия.
    #[serde(default)]
    pub do_postencoder: bool,

    /// Представление маски паддинга на входе графа.
    #[serde(default)]
    pub mask: MaskConfig,

    /// Тип входного эмбеддинга модели (субдискретизация по времени).
    #[serde(default)]
    pub embedding: Option<EmbeddingKind>,

    /// Явный контракт графа. Если не задан, используется стандартный
    /// контракт `feats`/`mask` → `encoder_out`/`encoder_out_lens`.
    #[serde(default)]
    pub contract: Option<GraphContract>,

    /// Число потоков внутри движка исполнения (если он это поддерживает).
    #[serde(default)]
    pub intra_threads: Option<usize>,
}

impl EncoderConfig {
    /// Конфигурация с параметрами по умолчанию для графа по указанному пути.
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            quantized_model_path: None,
            frontend: FrontendConfig::default(),
            normalize: None,
            do_preencoder: false,
            do_postencoder: false,
            mask: MaskConfig::default(),
            embedding: None,
            contract: None,
            intra_threads: None,
        }
    }

    /// Загрузить конфигурацию из JSON-файла.
    ///
    /// Относительные пути (граф, квантизированный граф, файл статистики)
    /// разрешаются относительно директории конфига.
    pub fn from_file(path: impl AsRef<Path>) -> AsrResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let mut config: Self = serde_json::from_slice(&data)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        debug!("EncoderConfig загружен из {:?}", path);
        Ok(config)
    }

    /// Контракт графа: явный из конфига либо стандартный.
    pub fn graph_contract(&self) -> GraphContract {
        self.contract.clone().unwrap_or_else(|| {
            GraphContract::encoder(self.frontend.logmel.n_mels, self.mask.dtype)
        })
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.model_path);
        if let Some(p) = self.quantized_model_path.as_mut() {
            resolve(p);
        }
        if let Some(p) = self.normalize.as_mut().and_then(|n| n.stats_file.as_mut()) {
            resolve(p);
        }
    }
}

// ---------------------------------------------------------------------------
// Фронтенд
// ---------------------------------------------------------------------------

/// Конфигурация фронтенда признаков.
///
/// Неизвестные ключи отклоняются: пропущенная опция экспорта молча
/// изменила бы признаки.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrontendConfig {
    /// Параметры STFT.
    #[serde(default)]
    pub stft: StftConfig,

    /// Параметры mel-фильтров и логарифма.
    #[serde(default)]
    pub logmel: LogMelConfig,
}

impl FrontendConfig {
    /// Окно 25 мс / шаг 10 мс при 16 кГц без центрирования.
    ///
    /// Длина выхода: `(len - 400) / 160 + 1`.
    pub fn fbank_25ms_10ms() -> Self {
        Self {
            stft: StftConfig {
                n_fft: 400,
                win_length: Some(400),
                hop_length: 160,
                center: false,
                ..StftConfig::default()
            },
            logmel: LogMelConfig::default(),
        }
    }

    /// Проверить согласованность параметров.
    pub fn validate(&self) -> AsrResult<()> {
        let stft = &self.stft;
        if stft.n_fft == 0 || stft.hop_length == 0 {
            return Err(AsrError::Config(format!(
                "n_fft и hop_length должны быть > 0 (n_fft={}, hop_length={})",
                stft.n_fft, stft.hop_length
            )));
        }
        let win = stft.win_length();
        if win == 0 || win > stft.n_fft {
            return Err(AsrError::Config(format!(
                "win_length={} должен быть в диапазоне 1..={}",
                win, stft.n_fft
            )));
        }
        if !stft.onesided {
            return Err(AsrError::Config(
                "поддерживается только onesided STFT".into(),
            ));
        }

        let logmel = &self.logmel;
        if logmel.n_mels == 0 || logmel.fs == 0 {
            return Err(AsrError::Config(format!(
                "n_mels и fs должны быть > 0 (n_mels={}, fs={})",
                logmel.n_mels, logmel.fs
            )));
        }
        if let Some(n_fft) = logmel.n_fft {
            if n_fft != stft.n_fft {
                return Err(AsrError::Config(format!(
                    "logmel.n_fft={} не совпадает с stft.n_fft={}",
                    n_fft, stft.n_fft
                )));
            }
        }
        if let Some(base) = logmel.log_base {
            if !base.is_finite() || base <= 0.0 || base == 1.0 {
                return Err(AsrError::Config(format!(
                    "log_base должен быть конечным, > 0 и != 1, получен {base}"
                )));
            }
        }
        let nyquist = logmel.fs as f32 / 2.0;
        let (f_min, f_max) = (logmel.f_min(), logmel.f_max());
        if f_min < 0.0 || f_max > nyquist || f_min >= f_max {
            return Err(AsrError::Config(format!(
                "неверный диапазон частот fmin={f_min}, fmax={f_max} (nyquist={nyquist})"
            )));
        }
        Ok(())
    }
}

/// Параметры STFT.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StftConfig {
    /// Размер FFT.
    pub n_fft: usize,

    /// Длина окна. `None` — равна `n_fft`.
    pub win_length: Option<usize>,

    /// Шаг между фреймами.
    pub hop_length: usize,

    /// Оконная функция. `null` — без окна (прямоугольное).
    pub window: Option<WindowKind>,

    /// Центрирование фреймов (reflect-паддинг по `n_fft/2` с обеих сторон).
    pub center: bool,

    /// Нормировать спектр на `1/sqrt(n_fft)`.
    pub normalized: bool,

    /// Только положительные частоты.
    pub onesided: bool,
}

impl Default for StftConfig {
    fn default() -> Self {
        Self {
            n_fft: 512,
            win_length: None,
            hop_length: 128,
            window: Some(WindowKind::Hann),
            center: true,
            normalized: false,
            onesided: true,
        }
    }
}

impl StftConfig {
    /// Фактическая длина окна.
    pub fn win_length(&self) -> usize {
        self.win_length.unwrap_or(self.n_fft)
    }

    /// Фактическая оконная функция.
    pub fn window_kind(&self) -> WindowKind {
        self.window.unwrap_or(WindowKind::Rectangular)
    }

    /// Минимальная длина входа в сэмплах.
    ///
    /// При центрировании reflect-паддинг требует `len > n_fft / 2`.
    pub fn min_input_len(&self) -> usize {
        if self.center {
            self.n_fft / 2 + 1
        } else {
            self.n_fft
        }
    }

    /// Количество фреймов для входа длины `len`.
    ///
    /// Совпадает с `torch.stft`: при центрировании вход дополняется на
    /// `n_fft / 2` с каждой стороны, так что для нечётного `n_fft`
    /// получается `(len - 1) / hop + 1`. Для `len` меньше
    /// [`Self::min_input_len`] возвращает 0.
    pub fn num_frames(&self, len: usize) -> usize {
        if len < self.min_input_len() {
            return 0;
        }
        let padded = if self.center {
            len + 2 * (self.n_fft / 2)
        } else {
            len
        };
        (padded - self.n_fft) / self.hop_length + 1
    }
}

/// Оконная функция STFT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    /// Периодическое окно Ханна.
    Hann,
    /// Периодическое окно Хэмминга.
    Hamming,
    /// Прямоугольное окно.
    #[serde(alias = "boxcar")]
    Rectangular,
}

/// Параметры mel-фильтров, в формате `mel_options` librosa плюс `log_base`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogMelConfig {
    /// Частота дискретизации в Гц.
    #[serde(alias = "sr")]
    pub fs: usize,

    /// Размер FFT, под который построены фильтры. Если задан, обязан
    /// совпадать с `stft.n_fft`.
    pub n_fft: Option<usize>,

    /// Количество mel-бинов.
    pub n_mels: usize,

    /// Минимальная частота. `None` — 0 Гц.
    pub fmin: Option<f32>,

    /// Максимальная частота. `None` — fs/2.
    pub fmax: Option<f32>,

    /// HTK-шкала вместо Slaney.
    pub htk: bool,

    /// Основание логарифма. `None` — натуральный.
    pub log_base: Option<f32>,
}

impl Default for LogMelConfig {
    fn default() -> Self {
        Self {
            fs: 16000,
            n_fft: None,
            n_mels: 80,
            fmin: None,
            fmax: None,
            htk: false,
            log_base: None,
        }
    }
}

impl LogMelConfig {
    pub fn f_min(&self) -> f32 {
        self.fmin.unwrap_or(0.0)
    }

    pub fn f_max(&self) -> f32 {
        self.fmax.unwrap_or(self.fs as f32 / 2.0)
    }

    pub fn mel_scale(&self) -> MelScale {
        if self.htk {
            MelScale::Htk
        } else {
            MelScale::Slaney
        }
    }
}

/// Шкала mel-фильтров.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MelScale {
    /// Slaney: линейная ниже 1000 Гц, логарифмическая выше.
    Slaney,
    /// HTK: полностью логарифмическая шкала.
    Htk,
}

// ---------------------------------------------------------------------------
// Нормализация
// ---------------------------------------------------------------------------

/// Конфигурация MVN-нормализации.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizeConfig {
    /// Глобальная или per-utterance нормализация.
    #[serde(rename = "type")]
    pub kind: NormalizeKind,

    /// Вычитать среднее.
    #[serde(default = "default_true")]
    pub norm_means: bool,

    /// Делить на стандартное отклонение.
    #[serde(default = "default_true")]
    pub norm_vars: bool,

    /// Добавка к дисперсии под корнем.
    #[serde(default = "default_eps")]
    pub eps: f32,

    /// JSON-файл со статистикой (обязателен для глобальной нормализации,
    /// если статистика не передана программно).
    #[serde(default)]
    pub stats_file: Option<PathBuf>,
}

impl NormalizeConfig {
    /// Глобальная нормализация со статистикой из файла.
    pub fn global(stats_file: impl Into<PathBuf>) -> Self {
        Self {
            kind: NormalizeKind::Global,
            norm_means: true,
            norm_vars: true,
            eps: default_eps(),
            stats_file: Some(stats_file.into()),
        }
    }

    /// Per-utterance нормализация.
    pub fn utterance() -> Self {
        Self {
            kind: NormalizeKind::Utterance,
            norm_means: true,
            norm_vars: true,
            eps: default_eps(),
            stats_file: None,
        }
    }
}

/// Вариант нормализации.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormalizeKind {
    /// Статистика, посчитанная заранее по корпусу.
    #[serde(rename = "gmvn", alias = "global_mvn")]
    Global,
    /// Статистика по валидной части текущего сэмпла.
    #[serde(rename = "utterance_mvn")]
    Utterance,
}

fn default_true() -> bool {
    true
}

fn default_eps() -> f32 {
    1e-20
}

// ---------------------------------------------------------------------------
// Маска
// ---------------------------------------------------------------------------

/// Как маска паддинга подаётся на вход графа.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskConfig {
    /// Что означает единица в тензоре маски.
    pub polarity: MaskPolarity,

    /// Тип элементов тензора маски.
    pub dtype: TensorDType,

    /// Максимальная длина для предвычисленной таблицы масок.
    /// `None` — маска строится прямым сравнением.
    pub max_seq_len: Option<usize>,
}

impl Default for MaskConfig {
    fn default() -> Self {
        Self {
            polarity: MaskPolarity::Valid,
            dtype: TensorDType::F64,
            max_seq_len: None,
        }
    }
}

/// Полярность маски.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskPolarity {
    /// 1 — позиция дополнена (невалидна).
    Padded,
    /// 1 — позиция валидна (дополнение маски паддинга).
    Valid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_frontend() {
        let config = FrontendConfig::default();
        assert_eq!(config.stft.n_fft, 512);
        assert_eq!(config.stft.win_length(), 512);
        assert_eq!(config.logmel.n_mels, 80);
        assert_eq!(config.logmel.f_max(), 8000.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_num_frames() {
        let stft = FrontendConfig::fbank_25ms_10ms().stft;
        assert_eq!(stft.num_frames(16000), 98);
        assert_eq!(stft.num_frames(8000), 48);
        assert_eq!(stft.num_frames(400), 1);
        assert_eq!(stft.num_frames(399), 0);

        let centered = StftConfig::default();
        assert_eq!(centered.num_frames(16000), 126);
        assert_eq!(centered.min_input_len(), 257);
    }

    #[test]
    fn test_num_frames_centered_odd_n_fft() {
        let stft = StftConfig {
            n_fft: 401,
            win_length: Some(400),
            hop_length: 160,
            center: true,
            ..StftConfig::default()
        };
        // вход дополняется на 200 с каждой стороны: (16000 + 400 - 401) / 160 + 1
        assert_eq!(stft.num_frames(16000), 100);
        assert_eq!(stft.num_frames(16001), 101);
        assert_eq!(stft.num_frames(201), 2);
        assert_eq!(stft.num_frames(200), 0);
    }

    #[test]
    fn test_validate_rejects_bad_window() {
        let mut config = FrontendConfig::default();
        config.stft.win_length = Some(1024);
        assert!(matches!(config.validate(), Err(AsrError::Config(_))));

        let mut config = FrontendConfig::default();
        config.stft.onesided = false;
        assert!(matches!(config.validate(), Err(AsrError::Config(_))));

        let mut config = FrontendConfig::default();
        config.logmel.fmax = Some(9000.0);
        assert!(matches!(config.validate(), Err(AsrError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_log_base_and_n_fft() {
        for base in [0.0, 1.0, -2.0, f32::NAN, f32::INFINITY] {
            let mut config = FrontendConfig::default();
            config.logmel.log_base = Some(base);
            assert!(matches!(config.validate(), Err(AsrError::Config(_))), "{base}");
        }

        let mut config = FrontendConfig::default();
        config.logmel.log_base = Some(3.0);
        assert!(config.validate().is_ok());

        config.logmel.n_fft = Some(400);
        assert!(matches!(config.validate(), Err(AsrError::Config(_))));
        config.logmel.n_fft = Some(512);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_logmel_exporter_options() {
        let logmel: LogMelConfig =
            serde_json::from_str(r#"{"sr":16000,"n_mels":80,"htk":true,"log_base":10.0}"#).unwrap();
        assert_eq!(logmel.mel_scale(), MelScale::Htk);
        assert_eq!(logmel.log_base, Some(10.0));

        let json = r#"{
            "fs": 8000, "n_fft": 256, "n_mels": 40,
            "fmin": null, "fmax": null, "htk": false, "log_base": null
        }"#;
        let logmel: LogMelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(logmel.mel_scale(), MelScale::Slaney);
        assert_eq!(logmel.log_base, None);
        assert_eq!(logmel.n_fft, Some(256));
        assert_eq!(logmel.f_max(), 4000.0);
    }

    #[test]
    fn test_unknown_frontend_keys_are_rejected() {
        let err = serde_json::from_str::<LogMelConfig>(r#"{"sr":16000,"norm":"slaney"}"#);
        assert!(err.is_err());
        let err = serde_json::from_str::<StftConfig>(r#"{"n_fft":512,"pad_mode":"constant"}"#);
        assert!(err.is_err());
        let err = serde_json::from_str::<FrontendConfig>(r#"{"stft":{},"fbank":{}}"#);
        assert!(err.is_err());

        let stft: StftConfig = serde_json::from_str(r#"{"window":null}"#).unwrap();
        assert_eq!(stft.window_kind(), WindowKind::Rectangular);
    }

    #[test]
    fn test_parse_export_config() {
        let json = r#"{
            "model_path": "xformer_encoder.onnx",
            "quantized_model_path": "xformer_encoder_qt.onnx",
            "frontend": {
                "stft": {"n_fft": 512, "win_length": 400, "hop_length": 160, "window": "hann", "center": true},
                "logmel": {"sr": 16000, "n_mels": 80, "htk": true, "log_base": 10.0}
            },
            "normalize": {"type": "gmvn", "norm_means": true, "norm_vars": false, "stats_file": "feats_stats.json"},
            "embedding": {"type": "conv2d_subsample", "stride": 4}
        }"#;
        let mut config: EncoderConfig = serde_json::from_str(json).unwrap();
        config.resolve_paths(Path::new("/models/asr"));

        assert_eq!(config.model_path, PathBuf::from("/models/asr/xformer_encoder.onnx"));
        assert_eq!(config.frontend.stft.win_length(), 400);
        assert_eq!(config.frontend.logmel.mel_scale(), MelScale::Htk);
        assert_eq!(config.frontend.logmel.log_base, Some(10.0));

        let norm = config.normalize.unwrap();
        assert_eq!(norm.kind, NormalizeKind::Global);
        assert!(!norm.norm_vars);
        assert_eq!(
            norm.stats_file,
            Some(PathBuf::from("/models/asr/feats_stats.json"))
        );
        assert_eq!(
            config.embedding,
            Some(EmbeddingKind::Conv2dSubsample {
                stride: crate::SubsampleStride::X4
            })
        );
        assert_eq!(config.mask.polarity, MaskPolarity::Valid);
    }
}
