use base64::Engine;
use image::{ImageEncoder, RgbImage};

/// One synthesized video frame: 256×256 RGB, 8 bits per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedFrame {
    image: RgbImage,
}

impl SynthesizedFrame {
    pub(crate) fn new(image: RgbImage) -> Self {
        Self { image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Row-major interleaved RGB bytes.
    pub fn as_raw(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }

    pub fn to_png_bytes(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut png_bytes = Vec::new();
        let encoder = image::codecs::png::PngEncoder::new(&mut png_bytes);
        encoder.write_image(
            self.image.as_raw(),
            self.image.width(),
            self.image.height(),
            image::ColorType::Rgb8,
        )?;
        Ok(png_bytes)
    }

    pub fn to_png_base64(&self) -> Result<String, image::ImageError> {
        let png_bytes = self.to_png_bytes()?;
        Ok(base64::engine::general_purpose::STANDARD.encode(png_bytes))
    }

    /// Mean absolute per-channel difference to another image of the same size.
    ///
    /// Returns `None` when the dimensions differ.
    pub fn mean_abs_diff(&self, other: &RgbImage) -> Option<f64> {
        if self.image.dimensions() != other.dimensions() {
            return None;
        }
        let total: u64 = self
            .image
            .as_raw()
            .iter()
            .zip(other.as_raw())
            .map(|(&a, &b)| a.abs_diff(b) as u64)
            .sum();
        Some(total as f64 / self.image.as_raw().len().max(1) as f64)
    }
}
