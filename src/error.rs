use thiserror::Error;

/// Errors surfaced by the recognition core.
///
/// All failures are immediate and synchronous; nothing in this crate retries
/// or times out.
#[derive(Error, Debug)]
pub enum CaptchaError {
    /// Input dimensions do not match the configured geometry. Inputs are
    /// never silently reshaped or cropped.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    Shape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// A label is not exactly `num_digits` long, or contains a class outside
    /// the digit range. Raised by the data-loading side, before any loss
    /// computation sees the sample.
    #[error("invalid label {label:?}: {reason}")]
    Label { label: Vec<i64>, reason: String },

    /// A loss or logit tensor contains NaN or infinity. This signals a
    /// numerical-stability defect upstream and is never clamped away.
    #[error("non-finite value in {context}")]
    NonFinite { context: &'static str },

    /// The pooling backend disagrees with the reference execution path
    /// beyond tolerance. Set `force_reference_pool` to route pooling through
    /// the reference path instead.
    #[error("position pooling diverged from the reference path (max diff {max_diff})")]
    BackendConsistency { max_diff: f32 },

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Model weight file could not be loaded or written.
    #[error("model record error: {0}")]
    Record(String),
}

pub type Result<T> = std::result::Result<T, CaptchaError>;

/// Rejects NaN and infinity instead of letting them flow downstream.
pub fn ensure_finite(value: f32, context: &'static str) -> Result<f32> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(CaptchaError::NonFinite { context })
    }
}
