//! Mel-фильтры и оконные функции для фронтенда.
//!
//! Фильтры совпадают с librosa `mel(norm="slaney")`: треугольники с площадной
//! нормировкой `2 / (f_right - f_left)` на Slaney- или HTK-шкале.

use std::f32::consts::PI;

use asr_core::{MelScale, WindowKind};

/// Шаг линейного участка шкалы Slaney, Гц на mel.
const SLANEY_F_SP: f32 = 200.0 / 3.0;
/// Граница линейного и логарифмического участков Slaney.
const SLANEY_MIN_LOG_HZ: f32 = 1000.0;
const SLANEY_MIN_LOG_MEL: f32 = SLANEY_MIN_LOG_HZ / SLANEY_F_SP;

/// Оконная функция длины `win_length`, дополненная нулями до `n_fft`
/// симметрично (как в `torch.stft`).
pub fn padded_window(kind: WindowKind, win_length: usize, n_fft: usize) -> Vec<f32> {
    // периодические окна: знаменатель `win_length`, а не `win_length - 1`
    let cosine = |a0: f32, n: usize| {
        a0 - (1.0 - a0) * (2.0 * PI * n as f32 / win_length as f32).cos()
    };
    let left = (n_fft - win_length) / 2;

    let mut padded = vec![0.0_f32; n_fft];
    for (n, w) in padded[left..left + win_length].iter_mut().enumerate() {
        *w = match kind {
            WindowKind::Hann => cosine(0.5, n),
            WindowKind::Hamming => cosine(0.54, n),
            WindowKind::Rectangular => 1.0,
        };
    }
    padded
}

fn slaney_logstep() -> f32 {
    6.4_f32.ln() / 27.0
}

/// Hz → mel на выбранной шкале.
pub fn hz_to_mel(scale: MelScale, hz: f32) -> f32 {
    match scale {
        MelScale::Htk => 2595.0 * (1.0 + hz / 700.0).log10(),
        MelScale::Slaney if hz < SLANEY_MIN_LOG_HZ => hz / SLANEY_F_SP,
        MelScale::Slaney => SLANEY_MIN_LOG_MEL + (hz / SLANEY_MIN_LOG_HZ).ln() / slaney_logstep(),
    }
}

/// mel → Hz на выбранной шкале.
pub fn mel_to_hz(scale: MelScale, mel: f32) -> f32 {
    match scale {
        MelScale::Htk => 700.0 * (10.0_f32.powf(mel / 2595.0) - 1.0),
        MelScale::Slaney if mel < SLANEY_MIN_LOG_MEL => mel * SLANEY_F_SP,
        MelScale::Slaney => {
            SLANEY_MIN_LOG_HZ * (slaney_logstep() * (mel - SLANEY_MIN_LOG_MEL)).exp()
        }
    }
}

/// Mel filterbank `[n_mels][n_fft/2 + 1]` на выбранной шкале.
pub fn mel_filterbank(
    scale: MelScale,
    n_mels: usize,
    n_fft: usize,
    sample_rate: f32,
    f_min: f32,
    f_max: f32,
) -> Vec<Vec<f32>> {
    let n_freqs = n_fft / 2 + 1;
    let bin_hz = sample_rate / n_fft as f32;

    // n_mels + 2 опорные точки, равномерные по mel
    let (mel_lo, mel_hi) = (hz_to_mel(scale, f_min), hz_to_mel(scale, f_max));
    let step = (mel_hi - mel_lo) / (n_mels + 1) as f32;
    let edges: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hz(scale, mel_lo + step * i as f32))
        .collect();

    edges
        .windows(3)
        .map(|tri| {
            let (left, center, right) = (tri[0], tri[1], tri[2]);
            let enorm = 2.0 / (right - left);
            (0..n_freqs)
                .map(|k| {
                    let freq = k as f32 * bin_hz;
                    let rise = (freq - left) / (center - left);
                    let fall = (right - freq) / (right - center);
                    enorm * rise.min(fall).max(0.0)
                })
                .collect()
        })
        .collect()
}
