//! Paste the predicted mouth region back onto the avatar.

use image::{imageops::FilterType, Rgb, RgbImage};

use crate::{
    avatar::{AvatarImage, FaceRegion},
    engine::{check_shape, PredictedRegion},
    error::Result,
    frame::SynthesizedFrame,
    model::PREDICTION_SHAPE,
};

#[derive(Debug, Clone)]
pub struct Postprocessor {
    region: FaceRegion,
}

impl Postprocessor {
    pub fn new(region: FaceRegion) -> Self {
        Self { region }
    }

    /// Compose a full frame from the prediction and a working copy of the
    /// avatar. The stored avatar is never written to.
    pub fn to_frame(&self, prediction: &PredictedRegion, avatar: &AvatarImage) -> Result<SynthesizedFrame> {
        check_shape("postprocess input", &PREDICTION_SHAPE, prediction.shape())?;

        let patch = prediction_to_rgb(prediction);
        let FaceRegion { x, y, width, height } = self.region;
        let patch = if (width, height) == patch.dimensions() {
            patch
        } else {
            image::imageops::resize(&patch, width, height, FilterType::Triangle)
        };

        let mut frame = avatar.working_copy();
        image::imageops::replace(&mut frame, &patch, x as i64, y as i64);
        Ok(SynthesizedFrame::new(frame))
    }
}

/// `[1, 3, H, W]` BGR floats to an RGB image. Values are clamped to `[0, 1]`
/// and truncated to 8 bits.
fn prediction_to_rgb(prediction: &PredictedRegion) -> RgbImage {
    let view = prediction.view();
    let (height, width) = (view.shape()[2], view.shape()[3]);
    let to_u8 = |v: f32| (v.clamp(0.0, 1.0) * 255.0) as u8;

    RgbImage::from_fn(width as u32, height as u32, |px, py| {
        let (row, col) = (py as usize, px as usize);
        let b = to_u8(view[[0, 0, row, col]]);
        let g = to_u8(view[[0, 1, row, col]]);
        let r = to_u8(view[[0, 2, row, col]]);
        Rgb([r, g, b])
    })
}
