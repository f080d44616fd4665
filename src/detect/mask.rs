use anyhow::{anyhow, Context, Result};
use image::{GrayImage, Luma};
use std::path::Path;

/// Single-channel exclusion map. A pixel value of 0 excludes detections whose
/// reference point lands on it.
#[derive(Clone, Debug)]
pub struct Mask {
    image: GrayImage,
}

impl Mask {
    /// Mask that excludes nothing.
    pub fn all_pass(width: u32, height: u32) -> Self {
        Self {
            image: GrayImage::from_pixel(width, height, Luma([255])),
        }
    }

    /// Load a mask image from disk, converting to grayscale.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow!("mask file {} does not exist", path.display()));
        }
        let image = image::open(path)
            .with_context(|| format!("failed to decode mask {}", path.display()))?
            .to_luma8();
        if image.width() == 0 || image.height() == 0 {
            return Err(anyhow!("mask {} is empty", path.display()));
        }
        Ok(Self { image })
    }

    pub fn from_image(image: GrayImage) -> Self {
        Self { image }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Value at `(x, y)`, with both coordinates clamped into the mask.
    pub fn value_at(&self, x: i64, y: i64) -> u8 {
        let x = x.clamp(0, i64::from(self.width()) - 1) as u32;
        let y = y.clamp(0, i64::from(self.height()) - 1) as u32;
        self.image.get_pixel(x, y).0[0]
    }

    pub fn is_excluded(&self, x: i64, y: i64) -> bool {
        self.value_at(x, y) == 0
    }
}
