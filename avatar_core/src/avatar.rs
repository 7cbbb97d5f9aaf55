//! Avatar store: the single reference image every frame is synthesized from.

use std::{
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use image::{imageops::FilterType, ColorType, DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::InitError;

/// Every avatar and every output frame is exactly this size.
pub const CANONICAL_SIZE: u32 = 256;

/// Read-only avatar image at the canonical resolution.
///
/// Cloning shares the underlying pixels. Callers that need to draw must take
/// a [`working_copy`](Self::working_copy).
#[derive(Debug, Clone)]
pub struct AvatarImage {
    pixels: Arc<RgbImage>,
    source: Option<PathBuf>,
}

impl AvatarImage {
    /// Normalize an in-memory image to the canonical geometry.
    pub fn from_rgb(image: RgbImage) -> Self {
        Self {
            pixels: Arc::new(to_canonical(image)),
            source: None,
        }
    }

    pub fn image(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn working_copy(&self) -> RgbImage {
        self.pixels.as_ref().clone()
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }
}

/// Decode an avatar from disk and resize it to `CANONICAL_SIZE` square.
///
/// 8-bit grayscale and RGBA sources are converted to RGB. Alpha is dropped.
pub fn load_avatar(path: &Path) -> Result<AvatarImage, InitError> {
    info!("Loading avatar image from {}", path.display());
    if !path.is_file() {
        return Err(InitError::ImageNotFound(path.to_path_buf()));
    }

    let decoded = image::io::Reader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(|e| InitError::ImageDecode {
            path: path.to_path_buf(),
            source: image::ImageError::IoError(e),
        })?
        .decode()
        .map_err(|e| InitError::ImageDecode {
            path: path.to_path_buf(),
            source: e,
        })?;

    let rgb = to_rgb8(decoded, path)?;
    let (w, h) = rgb.dimensions();
    let avatar = AvatarImage {
        pixels: Arc::new(to_canonical(rgb)),
        source: Some(path.to_path_buf()),
    };
    info!("Avatar loaded ({w}x{h} -> {CANONICAL_SIZE}x{CANONICAL_SIZE})");
    Ok(avatar)
}

fn to_rgb8(image: DynamicImage, path: &Path) -> Result<RgbImage, InitError> {
    match image.color() {
        ColorType::Rgb8 => Ok(image.into_rgb8()),
        ColorType::L8 | ColorType::La8 | ColorType::Rgba8 => Ok(image.to_rgb8()),
        other => Err(InitError::UnsupportedColorFormat {
            path: path.to_path_buf(),
            format: format!("{other:?}"),
        }),
    }
}

fn to_canonical(image: RgbImage) -> RgbImage {
    if image.dimensions() == (CANONICAL_SIZE, CANONICAL_SIZE) {
        return image;
    }
    image::imageops::resize(&image, CANONICAL_SIZE, CANONICAL_SIZE, FilterType::Triangle)
}

/// Rectangle of the canonical avatar that holds the face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRegion {
    pub fn full_frame() -> Self {
        Self {
            x: 0,
            y: 0,
            width: CANONICAL_SIZE,
            height: CANONICAL_SIZE,
        }
    }

    pub fn validate(&self) -> Result<(), InitError> {
        if self.width == 0 || self.height == 0 {
            return Err(InitError::InvalidConfig(format!(
                "face region {self:?} has zero area"
            )));
        }
        let fits = self.x.checked_add(self.width).is_some_and(|r| r <= CANONICAL_SIZE)
            && self.y.checked_add(self.height).is_some_and(|b| b <= CANONICAL_SIZE);
        if !fits {
            return Err(InitError::InvalidConfig(format!(
                "face region {self:?} exceeds the {CANONICAL_SIZE}x{CANONICAL_SIZE} avatar"
            )));
        }
        Ok(())
    }
}

impl Default for FaceRegion {
    fn default() -> Self {
        Self::full_frame()
    }
}

impl FromStr for FaceRegion {
    type Err = InitError;

    /// Parses `x,y,width,height`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<u32> = s
            .split(',')
            .map(|p| p.trim().parse::<u32>())
            .collect::<Result<_, _>>()
            .map_err(|e| InitError::InvalidConfig(format!("invalid face region '{s}': {e}")))?;
        match parts.as_slice() {
            [x, y, width, height] => {
                let region = Self {
                    x: *x,
                    y: *y,
                    width: *width,
                    height: *height,
                };
                region.validate()?;
                Ok(region)
            }
            _ => Err(InitError::InvalidConfig(format!(
                "invalid face region '{s}': expected x,y,width,height"
            ))),
        }
    }
}
