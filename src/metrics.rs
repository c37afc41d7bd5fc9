use std::cmp::Ordering;

use burn::{
    nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig},
    prelude::*,
    tensor::activation::softmax,
};

// `Config` derives expand to the two-parameter std `Result`, so the crate
// alias must stay out of this namespace.
use crate::error::CaptchaError;

#[derive(Config, Debug)]
pub struct MultiHeadLossConfig {
    /// Probability mass redistributed from the target class to all classes
    /// before cross-entropy. Zero reduces to plain cross-entropy.
    #[config(default = 0.1)]
    pub smoothing: f32,
}

impl MultiHeadLossConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> MultiHeadLoss<B> {
        let smoothing = (self.smoothing > 0.0).then_some(self.smoothing);
        MultiHeadLoss {
            loss: CrossEntropyLossConfig::new()
                .with_smoothing(smoothing)
                .init(device),
        }
    }
}

/// Sum of per-slot cross-entropy losses over the digit heads.
#[derive(Module, Debug)]
pub struct MultiHeadLoss<B: Backend> {
    loss: CrossEntropyLoss<B>,
}

#[derive(Debug)]
pub struct MultiHeadLossOutput<B: Backend> {
    /// Sum over all slots.
    pub total: Tensor<B, 1>,
    /// One loss per digit slot, for diagnostics.
    pub per_slot: Vec<Tensor<B, 1>>,
}

impl<B: Backend> MultiHeadLoss<B> {
    /// `logits` holds one (batch, num_classes) tensor per slot; `targets` is
    /// (batch, num_digits). Labels are validated at load time, before they
    /// can reach this point.
    pub fn forward(
        &self,
        logits: &[Tensor<B, 2>],
        targets: Tensor<B, 2, Int>,
    ) -> MultiHeadLossOutput<B> {
        debug_assert_eq!(logits.len(), targets.dims()[1]);
        let batch = targets.dims()[0];
        let per_slot: Vec<Tensor<B, 1>> = logits
            .iter()
            .enumerate()
            .map(|(slot, slot_logits)| {
                let slot_targets = targets.clone().narrow(1, slot, 1).reshape([batch]);
                self.loss.forward(slot_logits.clone(), slot_targets)
            })
            .collect();
        let total = per_slot
            .iter()
            .skip(1)
            .cloned()
            .fold(per_slot[0].clone(), |acc, loss| acc.add(loss));
        MultiHeadLossOutput { total, per_slot }
    }
}

/// Per-slot and sequence-level accuracy for one evaluation batch.
///
/// `full_sequence` counts a sample only when every slot matches its target
/// simultaneously; it is a strict AND, not an average of per-slot rates.
#[derive(Debug, Clone)]
pub struct AccuracyReport {
    pub per_slot: Vec<f32>,
    pub full_sequence: f32,
}

pub fn multi_head_accuracy<B: Backend>(
    logits: &[Tensor<B, 2>],
    targets: Tensor<B, 2, Int>,
) -> AccuracyReport {
    let [batch, num_digits] = targets.dims();
    debug_assert_eq!(logits.len(), num_digits);
    let target_vec: Vec<i64> = targets
        .into_data()
        .to_vec()
        .expect("Failed to read target data");

    let mut slot_correct = vec![0usize; num_digits];
    let mut row_correct = vec![true; batch];

    for (slot, slot_logits) in logits.iter().enumerate() {
        let predicted: Vec<i64> = slot_logits
            .clone()
            .argmax(1)
            .reshape([batch])
            .into_data()
            .to_vec()
            .expect("Failed to read prediction data");
        for i in 0..batch {
            if predicted[i] == target_vec[i * num_digits + slot] {
                slot_correct[slot] += 1;
            } else {
                row_correct[i] = false;
            }
        }
    }

    let per_slot = slot_correct
        .iter()
        .map(|&c| c as f32 / batch as f32)
        .collect();
    let full_sequence = row_correct.iter().filter(|&&ok| ok).count() as f32 / batch as f32;
    AccuracyReport {
        per_slot,
        full_sequence,
    }
}

/// Fixed-slot prediction with the softmax mass on each chosen class.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub text: String,
    pub confidences: Vec<f32>,
}

impl Prediction {
    pub fn mean_confidence(&self) -> f32 {
        if self.confidences.is_empty() {
            return 0.0;
        }
        self.confidences.iter().sum::<f32>() / self.confidences.len() as f32
    }
}

/// Argmax decode over per-slot logits with per-slot confidence.
///
/// Non-finite logits propagate as an error; they indicate a numerical defect
/// upstream and must not be clamped into a plausible-looking prediction.
pub fn decode_with_confidence<B: Backend>(
    logits: &[Tensor<B, 2>],
) -> crate::error::Result<Vec<Prediction>> {
    let batch = logits.first().map(|l| l.dims()[0]).unwrap_or(0);
    let mut texts = vec![String::new(); batch];
    let mut confidences = vec![Vec::with_capacity(logits.len()); batch];

    for slot_logits in logits {
        let classes = slot_logits.dims()[1];
        let probs: Vec<f32> = softmax(slot_logits.clone(), 1)
            .into_data()
            .to_vec()
            .expect("Failed to read probability data");
        for i in 0..batch {
            let row = &probs[i * classes..(i + 1) * classes];
            if row.iter().any(|p| !p.is_finite()) {
                return Err(CaptchaError::NonFinite {
                    context: "digit logits",
                });
            }
            let (best, &p) = row
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(Ordering::Equal))
                .expect("slot has at least one class");
            texts[i].push(char::from_digit(best as u32, 10).unwrap_or('?'));
            confidences[i].push(p);
        }
    }

    Ok(texts
        .into_iter()
        .zip(confidences)
        .map(|(text, confidences)| Prediction { text, confidences })
        .collect())
}
