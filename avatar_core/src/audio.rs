//! Inbound audio chunks.

use std::io::Read;

use crate::error::{AvatarError, Result};

/// Only 16-bit little-endian PCM is accepted on the byte path.
pub const PCM16_SAMPLE_WIDTH: usize = 2;

/// Upper bound on a single chunk. One frame stands for a short slice of speech.
pub const MAX_CHUNK_SECONDS: f32 = 1.0;

/// Mono audio samples in `[-1.0, 1.0]` with their sample rate.
///
/// Constructors reject malformed input up front so the feature extractor
/// never sees garbage.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl AudioChunk {
    pub fn from_f32(samples: Vec<f32>, sample_rate: u32) -> Result<Self> {
        if let Some(pos) = samples.iter().position(|s| !s.is_finite()) {
            return Err(AvatarError::InvalidAudioChunk(format!(
                "non-finite sample at index {pos}"
            )));
        }
        Self::checked(samples, sample_rate)
    }

    pub fn from_i16(samples: &[i16], sample_rate: u32) -> Result<Self> {
        let samples = samples.iter().map(|&s| s as f32 / 32768.0).collect();
        Self::checked(samples, sample_rate)
    }

    /// Decode little-endian 16-bit PCM bytes.
    pub fn from_pcm16_le(bytes: &[u8], sample_rate: u32) -> Result<Self> {
        Self::from_pcm_bytes(bytes, PCM16_SAMPLE_WIDTH, sample_rate)
    }

    /// Decode raw PCM bytes with an explicit sample width in bytes.
    pub fn from_pcm_bytes(bytes: &[u8], sample_width: usize, sample_rate: u32) -> Result<Self> {
        if sample_width != PCM16_SAMPLE_WIDTH {
            return Err(AvatarError::InvalidAudioChunk(format!(
                "unsupported sample width {sample_width} bytes (expected {PCM16_SAMPLE_WIDTH})"
            )));
        }
        if bytes.len() % sample_width != 0 {
            return Err(AvatarError::InvalidAudioChunk(format!(
                "{} bytes is not a whole number of {sample_width}-byte samples",
                bytes.len()
            )));
        }
        let pcm: Vec<i16> = bytes
            .chunks_exact(sample_width)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        Self::from_i16(&pcm, sample_rate)
    }

    /// Read a mono WAV stream. Integer formats must be 16-bit.
    pub fn from_wav<R: Read>(reader: R) -> Result<Self> {
        let mut wav = hound::WavReader::new(reader)
            .map_err(|e| AvatarError::InvalidAudioChunk(format!("wav read error: {e}")))?;
        let spec = wav.spec();
        if spec.channels != 1 {
            return Err(AvatarError::InvalidAudioChunk(format!(
                "expected mono audio, got {} channels",
                spec.channels
            )));
        }
        match (spec.sample_format, spec.bits_per_sample) {
            (hound::SampleFormat::Int, 16) => {
                let pcm = wav
                    .samples::<i16>()
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| AvatarError::InvalidAudioChunk(format!("wav sample error: {e}")))?;
                Self::from_i16(&pcm, spec.sample_rate)
            }
            (hound::SampleFormat::Float, 32) => {
                let samples = wav
                    .samples::<f32>()
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| AvatarError::InvalidAudioChunk(format!("wav sample error: {e}")))?;
                Self::from_f32(samples, spec.sample_rate)
            }
            (format, bits) => Err(AvatarError::InvalidAudioChunk(format!(
                "unsupported wav encoding {format:?} with {bits} bits per sample"
            ))),
        }
    }

    fn checked(samples: Vec<f32>, sample_rate: u32) -> Result<Self> {
        if sample_rate == 0 {
            return Err(AvatarError::InvalidAudioChunk("sample rate is zero".into()));
        }
        if samples.is_empty() {
            return Err(AvatarError::InvalidAudioChunk("chunk is empty".into()));
        }
        let max_samples = (sample_rate as f32 * MAX_CHUNK_SECONDS) as usize;
        if samples.len() > max_samples {
            return Err(AvatarError::InvalidAudioChunk(format!(
                "chunk of {} samples exceeds {MAX_CHUNK_SECONDS}s at {sample_rate} Hz",
                samples.len()
            )));
        }
        Ok(Self { samples, sample_rate })
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_ms(&self) -> u64 {
        self.samples.len() as u64 * 1000 / self.sample_rate as u64
    }
}

/// Linear-interpolation resampler, endpoints clamped.
pub(crate) fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if input.is_empty() || from_rate == to_rate {
        return input.to_vec();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let out_len = ((input.len() as f64) * ratio).round().max(1.0) as usize;
    let last = input.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 / ratio;
            let i0 = (pos.floor() as usize).min(last);
            let i1 = (i0 + 1).min(last);
            let t = (pos - i0 as f64) as f32;
            input[i0] * (1.0 - t) + input[i1] * t
        })
        .collect()
}
