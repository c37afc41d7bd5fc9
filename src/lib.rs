//! Six-digit numeric CAPTCHA recognition.
//!
//! Two recognition strategies share one attention-augmented convolutional
//! backbone:
//!
//! - **Fixed-slot** ([`CaptchaSolver`]): position-aware pooling yields one
//!   feature vector per digit slot, each classified by an independent head.
//! - **Temporal** ([`SequenceSolver`]): the feature map's width axis becomes
//!   a time axis and per-timestep class probabilities are decoded greedily
//!   with repeat collapsing and blank removal.

pub mod attention;
pub mod ctc;
pub mod data;
pub mod error;
pub mod metrics;
pub mod model;
pub mod pool;

use burn::{
    module::Module,
    record::{BinFileRecorder, FullPrecisionSettings, Recorder},
    tensor::Tensor,
};
use burn_ndarray::NdArray;
use image::ImageReader;
use std::io::Cursor;
use std::path::Path;

use data::Normalize;

pub use ctc::{CtcGreedyDecoder, DigitVocab, SequencePrediction};
pub use error::{CaptchaError, Result};
pub use metrics::Prediction;
pub use model::{ModelConfig, MultiHeadModel, SequenceModel, IMG_HEIGHT, IMG_WIDTH};

/// CPU reference backend used for inference.
pub type InferenceBackend = NdArray;

type InferenceDevice = <InferenceBackend as burn::tensor::backend::Backend>::Device;

fn load_record<M: Module<InferenceBackend>>(
    model: M,
    path: &Path,
    device: &InferenceDevice,
) -> Result<M> {
    let record = BinFileRecorder::<FullPrecisionSettings>::default()
        .load(path.into(), device)
        .map_err(|e| CaptchaError::Record(e.to_string()))?;
    Ok(model.load_record(record))
}

fn decode_image_bytes(image_bytes: &[u8], normalize: Normalize) -> Result<Vec<f32>> {
    let img = ImageReader::new(Cursor::new(image_bytes))
        .with_guessed_format()?
        .decode()?;
    Ok(data::preprocess(&img, normalize))
}

/// Fixed-slot captcha solver.
pub struct CaptchaSolver {
    model: MultiHeadModel<InferenceBackend>,
    normalize: Normalize,
    device: InferenceDevice,
}

impl CaptchaSolver {
    /// Solver with fresh, untrained weights. Verifies the pooling backend
    /// against the reference path unless the reference path is forced.
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let device = InferenceDevice::default();
        let model = MultiHeadModel::new(config, &device);
        if !config.force_reference_pool {
            model.check_pooling_consistency(&device)?;
        }
        Ok(Self {
            model,
            normalize: Normalize::default(),
            device,
        })
    }

    /// Loads weights recorded by the training binary. `path` is the record
    /// path without the `.bin` extension.
    pub fn from_file(config: &ModelConfig, path: &Path) -> Result<Self> {
        let device = InferenceDevice::default();
        let model = load_record(MultiHeadModel::new(config, &device), path, &device)?;
        if !config.force_reference_pool {
            model.check_pooling_consistency(&device)?;
        }
        Ok(Self {
            model,
            normalize: Normalize::default(),
            device,
        })
    }

    pub fn with_normalize(mut self, normalize: Normalize) -> Self {
        self.normalize = normalize;
        self
    }

    /// Solves a captcha from image bytes (JPEG/PNG), returning the six
    /// decoded digits with per-slot confidence.
    pub fn solve(&self, image_bytes: &[u8]) -> Result<Prediction> {
        let pixels = decode_image_bytes(image_bytes, self.normalize)?;
        let input = Tensor::<InferenceBackend, 1>::from_floats(pixels.as_slice(), &self.device)
            .reshape([1, 1, IMG_HEIGHT, IMG_WIDTH]);

        let logits = self.model.forward_checked(input)?;
        let mut predictions = metrics::decode_with_confidence(&logits)?;
        let prediction = predictions.pop().expect("batch of one");
        log::debug!(
            "decoded {} (mean confidence {:.3})",
            prediction.text,
            prediction.mean_confidence()
        );
        Ok(prediction)
    }
}

/// Temporal captcha solver (CTC greedy decoding).
pub struct SequenceSolver {
    model: SequenceModel<InferenceBackend>,
    decoder: CtcGreedyDecoder,
    normalize: Normalize,
    device: InferenceDevice,
}

impl SequenceSolver {
    pub fn new(config: &ModelConfig) -> Self {
        let device = InferenceDevice::default();
        Self {
            model: SequenceModel::new(config, &device),
            decoder: CtcGreedyDecoder::new(DigitVocab::new(config.num_classes)),
            normalize: Normalize::default(),
            device,
        }
    }

    /// Loads weights recorded by the training binary. `path` is the record
    /// path without the `.bin` extension.
    pub fn from_file(config: &ModelConfig, path: &Path) -> Result<Self> {
        let device = InferenceDevice::default();
        let model = load_record(SequenceModel::new(config, &device), path, &device)?;
        Ok(Self {
            model,
            decoder: CtcGreedyDecoder::new(DigitVocab::new(config.num_classes)),
            normalize: Normalize::default(),
            device,
        })
    }

    pub fn with_normalize(mut self, normalize: Normalize) -> Self {
        self.normalize = normalize;
        self
    }

    /// Solves a captcha from image bytes. An empty decode is a legitimate
    /// low-confidence outcome, not an error.
    pub fn solve(&self, image_bytes: &[u8]) -> Result<SequencePrediction> {
        let pixels = decode_image_bytes(image_bytes, self.normalize)?;
        let input = Tensor::<InferenceBackend, 1>::from_floats(pixels.as_slice(), &self.device)
            .reshape([1, 1, IMG_HEIGHT, IMG_WIDTH]);

        let probs = self.model.forward_checked(input)?;
        let mut predictions = self.decoder.decode_batch(probs)?;
        let prediction = predictions.pop().expect("batch of one");
        if prediction.text.is_empty() {
            log::debug!("every timestep decoded to blank or unknown");
        }
        Ok(prediction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::DynamicImage;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::new_luma8(width, height);
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn fixed_slot_solver_emits_six_digits_with_confidences() {
        let solver = CaptchaSolver::new(&ModelConfig::new()).unwrap();
        let prediction = solver.solve(&png_bytes(160, 50)).unwrap();
        assert_eq!(prediction.text.len(), 6);
        assert!(prediction.text.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(prediction.confidences.len(), 6);
        assert!(prediction
            .confidences
            .iter()
            .all(|&c| (0.0..=1.0).contains(&c)));
    }

    #[test]
    fn solver_resizes_arbitrary_inputs_via_preprocessing() {
        // The preprocessing collaborator owns resizing; odd input sizes are fine.
        let solver = CaptchaSolver::new(&ModelConfig::new()).unwrap();
        let prediction = solver.solve(&png_bytes(97, 33)).unwrap();
        assert_eq!(prediction.text.len(), 6);
    }

    #[test]
    fn sequence_solver_returns_valid_possibly_empty_decode() {
        let solver = SequenceSolver::new(&ModelConfig::new());
        let prediction = solver.solve(&png_bytes(160, 50)).unwrap();
        // At most one character per timestep.
        assert!(prediction.text.len() <= 10);
        if prediction.text.is_empty() {
            assert_eq!(prediction.confidence, 0.0);
        } else {
            assert!(prediction.confidence > 0.0);
        }
    }

    #[test]
    fn garbage_bytes_surface_an_image_error() {
        let solver = CaptchaSolver::new(&ModelConfig::new()).unwrap();
        assert!(solver.solve(&[0u8, 1, 2, 3]).is_err());
    }
}
