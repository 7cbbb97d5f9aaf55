//! Model input preparation: audio to conditioning feature, avatar to face crop.
//!
//! Both operations are pure functions of their inputs. The [`Preprocessor`]
//! only carries immutable setup (the STFT plan, the agreed input rate and the
//! face rectangle).

use image::imageops::FilterType;
use ndarray::{Array4, ArrayView4};

use crate::{
    audio::{resample_linear, AudioChunk},
    avatar::{AvatarImage, FaceRegion},
    error::{AvatarError, Result},
    mel::{MelFrontend, MEL_STEP, MODEL_SAMPLE_RATE, N_MELS},
};

/// Side length of the square face crop the network sees.
pub const FACE_SIZE: u32 = 96;

/// `[batch, channel, mel band, frame]`
pub const FEATURE_SHAPE: [usize; 4] = [1, 1, N_MELS, MEL_STEP];

/// `[batch, channel, height, width]`: masked BGR crop followed by reference BGR crop.
pub const FACE_CROP_SHAPE: [usize; 4] = [1, 6, FACE_SIZE as usize, FACE_SIZE as usize];

/// Mel window conditioning one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditioningFeature(Array4<f32>);

impl ConditioningFeature {
    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.0.view()
    }

    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }
}

/// Face crop tensor in model layout.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceCrop(Array4<f32>);

impl FaceCrop {
    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.0.view()
    }

    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }
}

#[derive(Debug)]
pub struct Preprocessor {
    mel: MelFrontend,
    input_sample_rate: u32,
    region: FaceRegion,
}

impl Preprocessor {
    pub fn new(input_sample_rate: u32, region: FaceRegion) -> Self {
        Self {
            mel: MelFrontend::new(),
            input_sample_rate,
            region,
        }
    }

    /// Turn one audio chunk into the `[1, 1, 80, 16]` mel feature.
    ///
    /// Chunks at a rate other than the agreed input rate are rejected.
    /// Input at a rate other than 16 kHz is resampled first.
    pub fn to_conditioning_feature(&self, chunk: &AudioChunk) -> Result<ConditioningFeature> {
        if chunk.sample_rate() != self.input_sample_rate {
            return Err(AvatarError::InvalidAudioChunk(format!(
                "sample rate {} Hz does not match the agreed {} Hz",
                chunk.sample_rate(),
                self.input_sample_rate
            )));
        }
        if chunk.is_empty() {
            return Err(AvatarError::InvalidAudioChunk("chunk is empty".into()));
        }

        let samples = resample_linear(chunk.samples(), chunk.sample_rate(), MODEL_SAMPLE_RATE);
        let mel = self.mel.log_mel_window(&samples);
        let (bands, frames) = mel.dim();
        mel.into_shape_with_order(FEATURE_SHAPE)
            .map(ConditioningFeature)
            .map_err(|_| AvatarError::shape_mismatch("conditioning feature", &FEATURE_SHAPE, &[bands, frames]))
    }

    /// Crop the face region, resize to 96×96 and lay it out as the network
    /// expects: BGR, values in `[0, 1]`, lower half masked in channels 0–2,
    /// untouched reference in channels 3–5.
    pub fn to_face_crop(&self, avatar: &AvatarImage) -> FaceCrop {
        let FaceRegion { x, y, width, height } = self.region;
        let region = image::imageops::crop_imm(avatar.image(), x, y, width, height).to_image();
        let face = image::imageops::resize(&region, FACE_SIZE, FACE_SIZE, FilterType::Triangle);

        let size = FACE_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros(FACE_CROP_SHAPE);
        for (px, py, pixel) in face.enumerate_pixels() {
            let (col, row) = (px as usize, py as usize);
            let [r, g, b] = pixel.0;
            for (c, value) in [b, g, r].into_iter().enumerate() {
                let v = value as f32 / 255.0;
                tensor[[0, 3 + c, row, col]] = v;
                if row < size / 2 {
                    tensor[[0, c, row, col]] = v;
                }
            }
        }
        FaceCrop(tensor)
    }
}
