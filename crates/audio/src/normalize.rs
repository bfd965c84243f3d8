//! MVN-нормализация признаков.
//!
//! Два варианта, выбираемых при построении:
//! - **глобальная** — статистика посчитана заранее по корпусу и не зависит
//!   от батча, паддинг не учитывается;
//! - **per-utterance** — среднее и дисперсия по валидной части каждого
//!   сэмпла, паддинг на выходе обнуляется.
//!
//! Формула: `(x - mean) / sqrt(var + eps)`, флаги `norm_means` / `norm_vars`
//! отключают соответствующую часть.

use std::path::Path;

use candle_core::{DType, Tensor};
use serde::Deserialize;
use tracing::{info, warn};

use asr_core::{AsrError, AsrResult, NormalizeConfig, NormalizeKind, SequenceBatch};

/// Статистика по измерениям признаков.
#[derive(Debug, Clone, PartialEq)]
pub struct MvnStats {
    mean: Vec<f32>,
    var: Vec<f32>,
}

/// Формат JSON-файла статистики.
#[derive(Deserialize)]
#[serde(untagged)]
enum StatsFile {
    /// Накопленные суммы, как их пишет сбор статистики при обучении.
    Accumulated {
        count: f64,
        sum: Vec<f64>,
        sum_square: Vec<f64>,
    },
    /// Готовые среднее и дисперсия.
    Moments { mean: Vec<f32>, var: Vec<f32> },
}

impl MvnStats {
    /// Статистика из готовых среднего и дисперсии.
    pub fn new(mean: Vec<f32>, var: Vec<f32>) -> AsrResult<Self> {
        if mean.is_empty() || mean.len() != var.len() {
            return Err(AsrError::Config(format!(
                "размерности mean ({}) и var ({}) должны совпадать и быть > 0",
                mean.len(),
                var.len()
            )));
        }
        if let Some(bad) = var.iter().find(|v| !v.is_finite() || **v < 0.0) {
            return Err(AsrError::Config(format!("некорректная дисперсия: {bad}")));
        }
        if mean.iter().any(|m| !m.is_finite()) {
            return Err(AsrError::Config("среднее содержит не-конечные значения".into()));
        }
        Ok(Self { mean, var })
    }

    /// Статистика из накопленных `count`, `sum`, `sum_square`.
    ///
    /// `mean = sum / count`, `var = sum_square / count - mean²`
    /// (отрицательная из-за округления дисперсия зажимается в 0).
    pub fn from_accumulated(count: f64, sum: &[f64], sum_square: &[f64]) -> AsrResult<Self> {
        if count <= 0.0 {
            return Err(AsrError::Config(format!("count должен быть > 0, получен {count}")));
        }
        if sum.len() != sum_square.len() {
            return Err(AsrError::Config(format!(
                "размерности sum ({}) и sum_square ({}) не совпадают",
                sum.len(),
                sum_square.len()
            )));
        }
        let mean: Vec<f64> = sum.iter().map(|s| s / count).collect();
        let var: Vec<f32> = sum_square
            .iter()
            .zip(&mean)
            .map(|(sq, m)| (sq / count - m * m).max(0.0) as f32)
            .collect();
        Self::new(mean.into_iter().map(|m| m as f32).collect(), var)
    }

    /// Загрузить статистику из JSON-файла.
    ///
    /// Поддерживаются форматы `{count, sum, sum_square}` и `{mean, var}`.
    pub fn from_json_file(path: impl AsRef<Path>) -> AsrResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let stats = match serde_json::from_slice::<StatsFile>(&data)? {
            StatsFile::Accumulated {
                count,
                sum,
                sum_square,
            } => Self::from_accumulated(count, &sum, &sum_square)?,
            StatsFile::Moments { mean, var } => Self::new(mean, var)?,
        };
        info!("MVN: статистика dim={} загружена из {:?}", stats.dim(), path);
        Ok(stats)
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> &[f32] {
        &self.mean
    }

    pub fn var(&self) -> &[f32] {
        &self.var
    }
}

/// Глобальная нормализация по заранее посчитанной статистике.
#[derive(Debug, Clone)]
pub struct GlobalMvn {
    mean: Vec<f32>,
    /// `sqrt(var + eps)`.
    std: Vec<f32>,
    norm_means: bool,
    norm_vars: bool,
}

impl GlobalMvn {
    pub fn new(stats: MvnStats, norm_means: bool, norm_vars: bool, eps: f32) -> Self {
        let std = stats.var.iter().map(|v| (v + eps).sqrt()).collect();
        Self {
            mean: stats.mean,
            std,
            norm_means,
            norm_vars,
        }
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    fn apply(&self, batch: SequenceBatch) -> AsrResult<SequenceBatch> {
        let (_, _, dim) = feature_dims(&batch.data)?;
        check_dim(self.dim(), dim)?;

        let device = batch.data.device().clone();
        let mut x = batch.data.to_dtype(DType::F32)?;
        if self.norm_means {
            let mean = Tensor::from_slice(&self.mean, (1, 1, dim), &device)?;
            x = x.broadcast_sub(&mean)?;
        }
        if self.norm_vars {
            let std = Tensor::from_slice(&self.std, (1, 1, dim), &device)?;
            x = x.broadcast_div(&std)?;
        }
        SequenceBatch::new(x, batch.lengths)
    }
}

/// Per-utterance нормализация по валидной части каждого сэмпла.
#[derive(Debug, Clone)]
pub struct UtteranceMvn {
    norm_means: bool,
    norm_vars: bool,
    eps: f32,
}

impl UtteranceMvn {
    pub fn new(norm_means: bool, norm_vars: bool, eps: f32) -> Self {
        Self {
            norm_means,
            norm_vars,
            eps,
        }
    }

    fn apply(&self, batch: SequenceBatch) -> AsrResult<SequenceBatch> {
        let (n_batch, time, dim) = feature_dims(&batch.data)?;
        let values = batch.data.to_dtype(DType::F32)?.to_vec3::<f32>()?;

        let mut out = vec![0.0_f32; n_batch * time * dim];
        for (b, frames) in values.iter().enumerate() {
            let len = batch.lengths[b];
            if len == 0 {
                continue;
            }
            let valid = &frames[..len];
            let base = b * time * dim;

            for d in 0..dim {
                // Двухпроходный подсчёт по валидным фреймам (в f64).
                let mean = valid.iter().map(|f| f[d] as f64).sum::<f64>() / len as f64;
                let var = valid
                    .iter()
                    .map(|f| {
                        let diff = f[d] as f64 - mean;
                        diff * diff
                    })
                    .sum::<f64>()
                    / len as f64;
                let std = (var + self.eps as f64).sqrt();

                for (t, frame) in valid.iter().enumerate() {
                    let mut v = frame[d] as f64;
                    if self.norm_means {
                        v -= mean;
                    }
                    if self.norm_vars {
                        v /= std;
                    }
                    out[base + t * dim + d] = v as f32;
                }
            }
        }

        let data = Tensor::from_vec(out, (n_batch, time, dim), batch.data.device())?;
        SequenceBatch::new(data, batch.lengths)
    }
}

/// Нормализатор признаков, выбранный при построении.
#[derive(Debug, Clone)]
pub enum Normalizer {
    Global(GlobalMvn),
    Utterance(UtteranceMvn),
}

impl Normalizer {
    /// Построить нормализатор по конфигурации.
    ///
    /// Для глобального варианта статистика берётся из `stats`, а если её нет —
    /// из `config.stats_file`.
    ///
    /// # Ошибки
    /// `AsrError::Config`, если статистика отсутствует, повреждена или её
    /// размерность не совпадает с `feat_dim`.
    pub fn from_config(
        config: &NormalizeConfig,
        stats: Option<MvnStats>,
        feat_dim: usize,
    ) -> AsrResult<Self> {
        if !config.eps.is_finite() || config.eps < 0.0 {
            return Err(AsrError::Config(format!(
                "eps должен быть конечным и >= 0, получен {}",
                config.eps
            )));
        }

        match config.kind {
            NormalizeKind::Global => {
                let stats = match (stats, config.stats_file.as_ref()) {
                    (Some(stats), _) => stats,
                    (None, Some(path)) => MvnStats::from_json_file(path).map_err(|e| {
                        AsrError::Config(format!(
                            "не удалось загрузить статистику {}: {e}",
                            path.display()
                        ))
                    })?,
                    (None, None) => {
                        return Err(AsrError::Config(
                            "глобальная нормализация требует stats_file или статистику".into(),
                        ));
                    }
                };
                check_dim(stats.dim(), feat_dim)?;
                Ok(Self::Global(GlobalMvn::new(
                    stats,
                    config.norm_means,
                    config.norm_vars,
                    config.eps,
                )))
            }
            NormalizeKind::Utterance => {
                if stats.is_some() {
                    warn!("MVN: статистика передана, но per-utterance нормализация её не использует");
                }
                Ok(Self::Utterance(UtteranceMvn::new(
                    config.norm_means,
                    config.norm_vars,
                    config.eps,
                )))
            }
        }
    }

    pub fn kind(&self) -> NormalizeKind {
        match self {
            Self::Global(_) => NormalizeKind::Global,
            Self::Utterance(_) => NormalizeKind::Utterance,
        }
    }

    /// Нормализовать батч признаков `(batch, time, feat_dim)`.
    ///
    /// При выключенных `norm_means` и `norm_vars` батч возвращается как есть.
    pub fn apply(&self, batch: SequenceBatch) -> AsrResult<SequenceBatch> {
        let (norm_means, norm_vars) = match self {
            Self::Global(g) => (g.norm_means, g.norm_vars),
            Self::Utterance(u) => (u.norm_means, u.norm_vars),
        };
        if !norm_means && !norm_vars {
            return Ok(batch);
        }
        match self {
            Self::Global(g) => g.apply(batch),
            Self::Utterance(u) => u.apply(batch),
        }
    }
}

fn feature_dims(data: &Tensor) -> AsrResult<(usize, usize, usize)> {
    match *data.dims() {
        [b, t, d] => Ok((b, t, d)),
        ref dims => Err(AsrError::ContractViolation(format!(
            "ожидаются признаки (batch, time, feat_dim), получена форма {dims:?}"
        ))),
    }
}

fn check_dim(stats_dim: usize, feat_dim: usize) -> AsrResult<()> {
    if stats_dim != feat_dim {
        return Err(AsrError::Config(format!(
            "размерность статистики {stats_dim} не совпадает с размерностью признаков {feat_dim}"
        )));
    }
    Ok(())
}
