use crate::error::{CaptchaError, Result};
use crate::model::{IMG_HEIGHT, IMG_WIDTH, NUM_CLASSES, NUM_DIGITS};
use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    prelude::*,
};
use image::{DynamicImage, ImageReader};
use rand::{rng, seq::SliceRandom};
use std::path::Path;

/// Pixel normalization applied by the preprocessing step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Normalize {
    /// Values in [0, 1].
    Unit,
    /// Zero-centered: (x - 0.5) / 0.5, values in [-1, 1].
    #[default]
    Centered,
}

impl Normalize {
    fn apply(self, value: f32) -> f32 {
        match self {
            Normalize::Unit => value,
            Normalize::Centered => (value - 0.5) / 0.5,
        }
    }
}

/// Resizes to the configured geometry, converts to a single channel and
/// normalizes. Denoising, if any, happens before this call; only the output
/// shape and value range matter here.
pub fn preprocess(img: &DynamicImage, normalize: Normalize) -> Vec<f32> {
    let gray = img
        .resize_exact(
            IMG_WIDTH as u32,
            IMG_HEIGHT as u32,
            image::imageops::FilterType::Triangle,
        )
        .to_luma8();
    gray.pixels()
        .map(|pixel| normalize.apply(pixel.0[0] as f32 / 255.0))
        .collect()
}

/// Rejects labels that are not exactly `NUM_DIGITS` in-range classes. Bad
/// samples are dropped here so loss computation never sees them.
pub fn validate_label(label: &[i64]) -> Result<()> {
    if label.len() != NUM_DIGITS {
        return Err(CaptchaError::Label {
            label: label.to_vec(),
            reason: format!("expected {NUM_DIGITS} digits, got {}", label.len()),
        });
    }
    if let Some(&bad) = label.iter().find(|&&v| v < 0 || v >= NUM_CLASSES as i64) {
        return Err(CaptchaError::Label {
            label: label.to_vec(),
            reason: format!("class {bad} outside [0, {NUM_CLASSES})"),
        });
    }
    Ok(())
}

fn parse_label(stem: &str) -> Option<[i64; NUM_DIGITS]> {
    if stem.len() != NUM_DIGITS {
        return None;
    }
    let mut label = [0i64; NUM_DIGITS];
    for (i, c) in stem.chars().enumerate() {
        label[i] = c.to_digit(10)? as i64;
    }
    validate_label(&label).ok()?;
    Some(label)
}

/// Represents a single processed captcha item.
#[derive(Clone, Debug)]
pub struct CaptchaItem {
    /// Flattened pixel data, normalized.
    pub pixels: Vec<f32>,
    /// The 6-digit label.
    pub label: [i64; NUM_DIGITS],
}

/// A dataset of captcha images whose file stems are their labels.
#[derive(Clone)]
pub struct CaptchaDataset {
    items: Vec<CaptchaItem>,
}

impl CaptchaDataset {
    /// Loads `NNNNNN.png`/`.jpg` files from a directory. Files with
    /// unreadable images or invalid labels are skipped with a warning.
    pub fn from_dir<P: AsRef<Path>>(root: P, normalize: Normalize) -> Result<Self> {
        let mut items = Vec::new();
        let mut skipped = 0usize;
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            let path = entry.path();
            if !path.extension().is_some_and(|e| e == "png" || e == "jpg") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some(label) = parse_label(stem) else {
                skipped += 1;
                continue;
            };
            let Ok(img) = ImageReader::open(&path).and_then(|r| r.with_guessed_format()) else {
                skipped += 1;
                continue;
            };
            let Ok(img) = img.decode() else {
                skipped += 1;
                continue;
            };
            items.push(CaptchaItem {
                pixels: preprocess(&img, normalize),
                label,
            });
        }
        if skipped > 0 {
            log::warn!("skipped {skipped} files with bad labels or unreadable images");
        }
        log::info!("loaded {} labeled images", items.len());
        Ok(Self { items })
    }

    pub fn from_items(items: Vec<CaptchaItem>) -> Self {
        Self { items }
    }

    /// Splits the dataset into training and validation sets.
    pub fn split(mut self, ratio: f32) -> (Self, Self) {
        let mut rng = rng();
        self.items.shuffle(&mut rng);

        let split_idx = (self.items.len() as f32 * ratio) as usize;
        let valid_items = self.items.split_off(split_idx);

        (self, Self { items: valid_items })
    }

    /// Uploads the entire dataset as a single tensor pair.
    pub fn into_tensors<B: Backend>(self, device: &B::Device) -> (Tensor<B, 4>, Tensor<B, 2, Int>) {
        let batch_size = self.items.len();

        let mut all_pixels = Vec::with_capacity(batch_size * IMG_HEIGHT * IMG_WIDTH);
        let mut all_labels = Vec::with_capacity(batch_size * NUM_DIGITS);

        for item in self.items {
            all_pixels.extend_from_slice(&item.pixels);
            all_labels.extend_from_slice(&item.label);
        }

        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), device).reshape([
            batch_size,
            1,
            IMG_HEIGHT,
            IMG_WIDTH,
        ]);

        let targets = Tensor::<B, 1, Int>::from_ints(all_labels.as_slice(), device)
            .reshape([batch_size, NUM_DIGITS]);

        (images, targets)
    }
}

impl Dataset<CaptchaItem> for CaptchaDataset {
    fn get(&self, index: usize) -> Option<CaptchaItem> {
        self.items.get(index).cloned()
    }
    fn len(&self) -> usize {
        self.items.len()
    }
}

#[derive(Clone)]
pub struct CaptchaBatcher<B: Backend> {
    _phantom: std::marker::PhantomData<B>,
}

impl<B: Backend> CaptchaBatcher<B> {
    pub fn new(_device: B::Device) -> Self {
        Self {
            _phantom: std::marker::PhantomData,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CaptchaBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 2, Int>,
}

impl<B: Backend> Batcher<B, CaptchaItem, CaptchaBatch<B>> for CaptchaBatcher<B> {
    fn batch(&self, items: Vec<CaptchaItem>, device: &B::Device) -> CaptchaBatch<B> {
        let batch_size = items.len();
        let mut all_pixels = Vec::with_capacity(batch_size * IMG_HEIGHT * IMG_WIDTH);
        let mut all_labels = Vec::with_capacity(batch_size * NUM_DIGITS);

        for item in items {
            all_pixels.extend_from_slice(&item.pixels);
            all_labels.extend_from_slice(&item.label);
        }

        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), device).reshape([
            batch_size,
            1,
            IMG_HEIGHT,
            IMG_WIDTH,
        ]);

        let targets = Tensor::<B, 1, Int>::from_ints(all_labels.as_slice(), device)
            .reshape([batch_size, NUM_DIGITS]);

        CaptchaBatch { images, targets }
    }
}
