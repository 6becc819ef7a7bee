use std::str::FromStr;

use image::{imageops::FilterType, DynamicImage, GenericImageView, RgbImage};
use rand::Rng;

use crate::error::Result;

pub const RESIZE_SHORTER_SIDE: u32 = 256;
pub const CROP_SIZE: u32 = 224;

// ImageNet statistics the backbone was trained with.
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Where the square crop is taken from the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CropMode {
    Center,
    Random,
}

impl FromStr for CropMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "center" => Ok(CropMode::Center),
            "random" => Ok(CropMode::Random),
            other => Err(format!("expected 'center' or 'random', got '{other}'")),
        }
    }
}

/// Normalized channel-first image, `shape` is `[channels, height, width]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    pub shape: [usize; 3],
    pub data: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct Preprocessor {
    crop_mode: CropMode,
}

impl Preprocessor {
    pub fn new(crop_mode: CropMode) -> Self {
        Self { crop_mode }
    }

    pub fn transform(&self, image_data: &[u8]) -> Result<ImageTensor> {
        self.transform_with_rng(image_data, &mut rand::thread_rng())
    }

    pub fn transform_with_rng<R: Rng>(
        &self,
        image_data: &[u8],
        rng: &mut R,
    ) -> Result<ImageTensor> {
        let img = image::load_from_memory(image_data)?;
        let (x, y, side) = self.crop_window(&img, rng);

        let cropped = img
            .crop_imm(x, y, side, side)
            .resize_exact(CROP_SIZE, CROP_SIZE, FilterType::Triangle)
            .to_rgb8();
        Ok(normalize(&cropped))
    }

    /// Square `(x, y, side)` in source pixels covering what a 224 crop of the
    /// image resized to a 256 shorter side would cover.
    ///
    /// Only the crop is ever resized, so the work stays bounded whatever the
    /// aspect ratio.
    fn crop_window<R: Rng>(&self, image: &DynamicImage, rng: &mut R) -> (u32, u32, u32) {
        let (width, height) = image.dimensions();
        let side = crop_side(width.min(height));
        let (max_x, max_y) = (width - side, height - side);
        let (x, y) = match self.crop_mode {
            CropMode::Center => (max_x / 2, max_y / 2),
            CropMode::Random => (rng.gen_range(0..=max_x), rng.gen_range(0..=max_y)),
        };
        (x, y, side)
    }
}

/// Side of the crop in source pixels, rounded and never larger than `shorter`.
fn crop_side(shorter: u32) -> u32 {
    let resize = RESIZE_SHORTER_SIDE as u64;
    let rounded = (shorter as u64 * CROP_SIZE as u64 + resize / 2) / resize;
    (rounded as u32).clamp(1, shorter.max(1))
}

fn normalize(image: &RgbImage) -> ImageTensor {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let plane = width * height;
    let mut data = vec![0.0f32; 3 * plane];

    for (x, y, pixel) in image.enumerate_pixels() {
        let offset = y as usize * width + x as usize;
        for c in 0..3 {
            data[c * plane + offset] = (pixel[c] as f32 / 255.0 - MEAN[c]) / STD[c];
        }
    }

    ImageTensor {
        shape: [3, height, width],
        data,
    }
}
