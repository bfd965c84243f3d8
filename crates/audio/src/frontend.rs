//! Фронтенд признаков: STFT → спектр мощности → mel-фильтры → логарифм.
//!
//! Работает с дополненным батчем `(batch, samples)`. Каждая строка
//! обрабатывается целиком (вместе с паддингом), фреймы за пределами
//! валидной длины обнуляются, так что результат совпадает с обучением.

use candle_core::{DType, Tensor};
use rustfft::{FftPlanner, num_complex::Complex};
use tracing::debug;

use asr_core::{AsrError, AsrResult, FrontendConfig, SequenceBatch};

use crate::mel::{mel_filterbank, padded_window};

/// Нижняя граница mel-энергии перед логарифмом.
const LOG_FLOOR: f32 = 1e-10;

/// Экстрактор log-mel признаков для батча.
#[derive(Debug)]
pub struct FeatureFrontend {
    config: FrontendConfig,
    /// Окно, дополненное нулями до `n_fft`.
    window: Vec<f32>,
    /// Mel-фильтры [n_mels][n_fft/2+1].
    mel_filters: Vec<Vec<f32>>,
}

impl FeatureFrontend {
    /// Создать фронтенд. Параметры фиксируются на всё время жизни.
    ///
    /// # Ошибки
    /// `AsrError::Config`, если параметры STFT или mel несогласованы.
    pub fn new(config: FrontendConfig) -> AsrResult<Self> {
        config.validate()?;

        let stft = &config.stft;
        let logmel = &config.logmel;
        let window = padded_window(stft.window_kind(), stft.win_length(), stft.n_fft);
        let mel_filters = mel_filterbank(
            logmel.mel_scale(),
            logmel.n_mels,
            stft.n_fft,
            logmel.fs as f32,
            logmel.f_min(),
            logmel.f_max(),
        );

        Ok(Self {
            config,
            window,
            mel_filters,
        })
    }

    pub fn config(&self) -> &FrontendConfig {
        &self.config
    }

    /// Размерность признаков (количество mel-бинов).
    pub fn feat_dim(&self) -> usize {
        self.config.logmel.n_mels
    }

    /// Количество фреймов на выходе для входа длины `len`.
    ///
    /// Монотонно не убывает по `len`; 0 для входа короче минимального окна.
    pub fn output_length(&self, len: usize) -> usize {
        self.config.stft.num_frames(len)
    }

    /// Извлечь признаки.
    ///
    /// # Аргументы
    /// * `speech` — аудио `(batch, samples)`, дополненное до общей длины.
    /// * `lengths` — валидная длина каждой записи в сэмплах.
    ///
    /// # Returns
    /// `SequenceBatch` с тензором `(batch, time, n_mels)` и длинами во фреймах.
    ///
    /// # Ошибки
    /// - `InvalidLength` — количество длин не равно размеру батча, длина
    ///   нулевая или больше ширины тензора;
    /// - `InvalidInput` — запись короче минимального окна.
    pub fn extract(&self, speech: &Tensor, lengths: &[usize]) -> AsrResult<SequenceBatch> {
        let dims = speech.dims();
        if dims.len() != 2 {
            return Err(AsrError::InvalidInput(format!(
                "ожидается аудио формы (batch, samples), получена {dims:?}"
            )));
        }
        let (batch, width) = (dims[0], dims[1]);
        if lengths.len() != batch {
            return Err(AsrError::InvalidLength(format!(
                "количество длин {} не совпадает с размером батча {}",
                lengths.len(),
                batch
            )));
        }

        let min_len = self.config.stft.min_input_len();
        for (i, &len) in lengths.iter().enumerate() {
            if len == 0 || len > width {
                return Err(AsrError::InvalidLength(format!(
                    "длина сэмпла {i} = {len} вне диапазона 1..={width}"
                )));
            }
            if len < min_len {
                return Err(AsrError::InvalidInput(format!(
                    "сэмпл {i}: {len} отсчётов меньше минимального окна {min_len}"
                )));
            }
        }

        let num_frames = self.output_length(width);
        let n_mels = self.feat_dim();
        let out_lengths: Vec<usize> = lengths.iter().map(|&l| self.output_length(l)).collect();

        let rows = speech.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(self.config.stft.n_fft);

        let mut feats = vec![0.0_f32; batch * num_frames * n_mels];
        for (b, row) in rows.iter().enumerate() {
            let base = b * num_frames * n_mels;
            for t in 0..out_lengths[b] {
                let power = self.power_frame(row, t, fft.as_ref());
                let out = &mut feats[base + t * n_mels..base + (t + 1) * n_mels];
                self.log_mel_into(&power, out);
            }
        }

        debug!(
            "FeatureFrontend: batch={}, samples={}, frames={}, lengths={:?}",
            batch, width, num_frames, out_lengths
        );

        let data = Tensor::from_vec(feats, (batch, num_frames, n_mels), speech.device())?;
        SequenceBatch::new(data, out_lengths)
    }

    /// Спектр мощности одного фрейма (только положительные частоты).
    fn power_frame(&self, row: &[f32], frame_idx: usize, fft: &dyn rustfft::Fft<f32>) -> Vec<f32> {
        let stft = &self.config.stft;
        let n_fft = stft.n_fft;
        let n = row.len() as isize;
        // center=True: окно центрируется на позиции frame_idx * hop
        let pad = if stft.center { (n_fft / 2) as isize } else { 0 };
        let start = (frame_idx * stft.hop_length) as isize - pad;

        let mut buffer: Vec<Complex<f32>> = (0..n_fft)
            .map(|i| {
                let mut idx = start + i as isize;
                // reflect-паддинг по краям строки
                if idx < 0 {
                    idx = -idx;
                }
                if idx >= n {
                    idx = 2 * n - idx - 2;
                }
                let sample = if (0..n).contains(&idx) {
                    row[idx as usize] * self.window[i]
                } else {
                    0.0
                };
                Complex::new(sample, 0.0)
            })
            .collect();

        fft.process(&mut buffer);

        let scale = if stft.normalized { 1.0 / n_fft as f32 } else { 1.0 };
        buffer
            .iter()
            .take(n_fft / 2 + 1)
            .map(|c| c.norm_sqr() * scale)
            .collect()
    }

    /// Mel-фильтры и логарифм одного фрейма.
    fn log_mel_into(&self, power: &[f32], out: &mut [f32]) {
        let log_base = self.config.logmel.log_base;
        let log_fn = |v: f32| match log_base {
            None => v.ln(),
            Some(b) if b == 2.0 => v.log2(),
            Some(b) if b == 10.0 => v.log10(),
            Some(b) => v.ln() / b.ln(),
        };

        for (dst, filter) in out.iter_mut().zip(&self.mel_filters) {
            let energy: f32 = power.iter().zip(filter).map(|(p, w)| p * w).sum();
            *dst = log_fn(energy.max(LOG_FLOOR));
        }
    }
}
