//! Log-mel spectrogram front end.
//!
//! Reproduces the audio features the lip-sync network is trained with:
//! 16 kHz input, pre-emphasis, a centered 800-point STFT with hop 200, an
//! 80-band Slaney mel filterbank over 55–7600 Hz, decibel conversion and a
//! symmetric normalization into `[-4, 4]`. One conditioning window is
//! [`MEL_STEP`] frames (200 ms).

use std::sync::Arc;

use ndarray::Array2;
use num_complex::Complex;
use rustfft::{Fft, FftPlanner};

pub const MODEL_SAMPLE_RATE: u32 = 16_000;
pub const N_FFT: usize = 800;
pub const HOP_LENGTH: usize = 200;
pub const N_MELS: usize = 80;
pub const MEL_STEP: usize = 16;

/// Audio span that produces exactly [`MEL_STEP`] centered frames.
pub const WINDOW_SAMPLES: usize = (MEL_STEP - 1) * HOP_LENGTH;

const FMIN: f64 = 55.0;
const FMAX: f64 = 7600.0;
const PREEMPHASIS: f32 = 0.97;
const REF_LEVEL_DB: f32 = 20.0;
const MIN_LEVEL_DB: f32 = -100.0;
const MAX_ABS_VALUE: f32 = 4.0;
const AMP_FLOOR: f32 = 1e-5;

/// Immutable STFT plan, window and filterbank. Safe to share across threads.
pub struct MelFrontend {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    filterbank: Array2<f32>,
}

impl std::fmt::Debug for MelFrontend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MelFrontend")
            .field("n_fft", &N_FFT)
            .field("hop_length", &HOP_LENGTH)
            .field("n_mels", &N_MELS)
            .finish()
    }
}

impl Default for MelFrontend {
    fn default() -> Self {
        Self::new()
    }
}

impl MelFrontend {
    pub fn new() -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(N_FFT);
        Self {
            fft,
            window: hann_window(N_FFT),
            filterbank: build_mel_filterbank(MODEL_SAMPLE_RATE, N_FFT, N_MELS, FMIN, FMAX),
        }
    }

    /// Normalized log-mel window of shape `[N_MELS, MEL_STEP]`.
    ///
    /// `samples` must be 16 kHz mono. Shorter input is centered in silence,
    /// longer input contributes only its trailing [`WINDOW_SAMPLES`].
    pub fn log_mel_window(&self, samples: &[f32]) -> Array2<f32> {
        let emphasized = preemphasis(samples);
        let fitted = fit_to_window(&emphasized);
        let spectra = self.magnitude_stft(&fitted);

        let mut mel = Array2::<f32>::zeros((N_MELS, spectra.len()));
        for (t, spectrum) in spectra.iter().enumerate() {
            for (m, filter) in self.filterbank.outer_iter().enumerate() {
                let energy: f32 = filter.iter().zip(spectrum.iter()).map(|(&w, &s)| w * s).sum();
                mel[[m, t]] = normalize(amp_to_db(energy) - REF_LEVEL_DB);
            }
        }
        mel
    }

    fn magnitude_stft(&self, samples: &[f32]) -> Vec<Vec<f32>> {
        let padded = reflect_pad(samples, N_FFT / 2);
        let n_bins = N_FFT / 2 + 1;
        let n_frames = 1 + (padded.len() - N_FFT) / HOP_LENGTH;

        let mut frames = Vec::with_capacity(n_frames);
        let mut buffer = vec![Complex::new(0.0f32, 0.0); N_FFT];
        for i in 0..n_frames {
            let start = i * HOP_LENGTH;
            for (n, slot) in buffer.iter_mut().enumerate() {
                *slot = Complex::new(padded[start + n] * self.window[n], 0.0);
            }
            self.fft.process(&mut buffer);
            frames.push(buffer[..n_bins].iter().map(|c| c.norm()).collect());
        }
        frames
    }
}

/// First-order high-pass `y[n] = x[n] - 0.97 x[n-1]`, zero initial state.
fn preemphasis(samples: &[f32]) -> Vec<f32> {
    let mut out = Vec::with_capacity(samples.len());
    let mut prev = 0.0f32;
    for &s in samples {
        out.push(s - PREEMPHASIS * prev);
        prev = s;
    }
    out
}

fn fit_to_window(samples: &[f32]) -> Vec<f32> {
    if samples.len() >= WINDOW_SAMPLES {
        return samples[samples.len() - WINDOW_SAMPLES..].to_vec();
    }
    let mut out = vec![0.0f32; WINDOW_SAMPLES];
    let offset = (WINDOW_SAMPLES - samples.len()) / 2;
    out[offset..offset + samples.len()].copy_from_slice(samples);
    out
}

/// Mirror padding without repeating the edge sample.
fn reflect_pad(samples: &[f32], pad: usize) -> Vec<f32> {
    debug_assert!(samples.len() > pad);
    let n = samples.len();
    let mut out = Vec::with_capacity(n + 2 * pad);
    out.extend((1..=pad).rev().map(|i| samples[i]));
    out.extend_from_slice(samples);
    out.extend((0..pad).map(|i| samples[n - 2 - i]));
    out
}

/// Periodic Hann window.
fn hann_window(len: usize) -> Vec<f32> {
    (0..len)
        .map(|n| 0.5 - 0.5 * (2.0 * std::f64::consts::PI * n as f64 / len as f64).cos() as f32)
        .collect()
}

fn amp_to_db(amplitude: f32) -> f32 {
    20.0 * amplitude.max(AMP_FLOOR).log10()
}

fn normalize(db: f32) -> f32 {
    let scaled = 2.0 * MAX_ABS_VALUE * ((db - MIN_LEVEL_DB) / -MIN_LEVEL_DB) - MAX_ABS_VALUE;
    scaled.clamp(-MAX_ABS_VALUE, MAX_ABS_VALUE)
}

// Slaney mel scale: linear below 1 kHz, logarithmic above.
const F_SP: f64 = 200.0 / 3.0;
const MIN_LOG_HZ: f64 = 1000.0;
const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;

fn log_step() -> f64 {
    6.4f64.ln() / 27.0
}

fn hz_to_mel(hz: f64) -> f64 {
    if hz >= MIN_LOG_HZ {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / log_step()
    } else {
        hz / F_SP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * (log_step() * (mel - MIN_LOG_MEL)).exp()
    } else {
        F_SP * mel
    }
}

/// Area-normalized triangular filters, shape `[n_mels, n_fft / 2 + 1]`.
fn build_mel_filterbank(sample_rate: u32, n_fft: usize, n_mels: usize, fmin: f64, fmax: f64) -> Array2<f32> {
    let n_bins = n_fft / 2 + 1;
    let nyquist = sample_rate as f64 / 2.0;
    let fft_freqs: Vec<f64> = (0..n_bins)
        .map(|k| nyquist * k as f64 / (n_bins - 1) as f64)
        .collect();

    let min_mel = hz_to_mel(fmin);
    let max_mel = hz_to_mel(fmax);
    let mel_freqs: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(min_mel + (max_mel - min_mel) * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut weights = Array2::<f32>::zeros((n_mels, n_bins));
    for m in 0..n_mels {
        let (left, center, right) = (mel_freqs[m], mel_freqs[m + 1], mel_freqs[m + 2]);
        let enorm = 2.0 / (right - left);
        for (k, &freq) in fft_freqs.iter().enumerate() {
            let lower = (freq - left) / (center - left);
            let upper = (right - freq) / (right - center);
            let w = lower.min(upper).max(0.0);
            weights[[m, k]] = (w * enorm) as f32;
        }
    }
    weights
}
