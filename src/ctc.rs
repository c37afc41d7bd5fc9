use std::cmp::Ordering;

use burn::prelude::*;

use crate::error::{CaptchaError, Result};

/// Index reserved for the "unknown" token in the temporal vocabulary.
pub const UNKNOWN_INDEX: usize = 0;

/// Character-index mapping for the temporal (CTC) variant.
///
/// Index 0 is "unknown", 1..=`num_classes` are the digits '0'..'9', and the
/// final index is the blank marker used only by the temporal alignment
/// objective. The offset-by-one placement of the digits is a strict contract;
/// the fixed-slot variant uses the plain identity mapping instead.
#[derive(Debug, Clone)]
pub struct DigitVocab {
    num_classes: usize,
}

impl DigitVocab {
    pub fn new(num_classes: usize) -> Self {
        Self { num_classes }
    }

    pub fn blank_index(&self) -> usize {
        self.num_classes + 1
    }

    /// Table size including unknown and blank.
    pub fn table_size(&self) -> usize {
        self.num_classes + 2
    }

    /// '0'..'9' -> 1..=10; anything else maps to unknown.
    pub fn encode_char(&self, c: char) -> usize {
        match c.to_digit(10) {
            Some(d) if (d as usize) < self.num_classes => d as usize + 1,
            _ => UNKNOWN_INDEX,
        }
    }

    pub fn encode(&self, label: &str) -> Vec<usize> {
        label.chars().map(|c| self.encode_char(c)).collect()
    }

    /// 1..=10 -> '0'..'9'; unknown and blank carry no character.
    pub fn decode_index(&self, index: usize) -> Option<char> {
        if index == UNKNOWN_INDEX || index >= self.blank_index() {
            return None;
        }
        char::from_digit(index as u32 - 1, 10)
    }

    pub fn decode(&self, indices: &[usize]) -> String {
        indices.iter().filter_map(|&i| self.decode_index(i)).collect()
    }
}

impl Default for DigitVocab {
    fn default() -> Self {
        Self::new(crate::model::NUM_CLASSES)
    }
}

/// Decoded variable-length prediction.
///
/// An empty `text` is a legitimate outcome (every timestep decoded to blank
/// or unknown); it is reported with zero confidence, not as an error.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencePrediction {
    pub text: String,
    /// Mean confidence of the emitted characters; 0.0 when nothing was emitted.
    pub confidence: f32,
    pub char_confidences: Vec<f32>,
}

/// Greedy decoder for per-timestep class probabilities.
///
/// Per timestep: take the argmax class. Adjacent repeats collapse into their
/// first frame, then blank frames are discarded; unknown is dropped at
/// character emission. Collapsing before blank removal is the standard greedy
/// order: a blank between two identical digits keeps them separate, which is
/// exactly how the alignment objective encodes repeated digits. Re-decoding a
/// collapsed, blank-free index sequence is a no-op.
pub struct CtcGreedyDecoder {
    vocab: DigitVocab,
}

impl CtcGreedyDecoder {
    pub fn new(vocab: DigitVocab) -> Self {
        Self { vocab }
    }

    pub fn vocab(&self) -> &DigitVocab {
        &self.vocab
    }

    /// Decodes one (T, table_size) probability matrix.
    pub fn decode(&self, frames: &[Vec<f32>]) -> Result<SequencePrediction> {
        let blank = self.vocab.blank_index();

        let mut best: Vec<(usize, f32)> = Vec::with_capacity(frames.len());
        for row in frames {
            if row.len() != self.vocab.table_size() {
                return Err(CaptchaError::Shape {
                    expected: vec![self.vocab.table_size()],
                    actual: vec![row.len()],
                });
            }
            if row.iter().any(|p| !p.is_finite()) {
                return Err(CaptchaError::NonFinite {
                    context: "ctc probabilities",
                });
            }
            let (idx, &p) = row
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(Ordering::Equal))
                .expect("probability row is non-empty");
            best.push((idx, p));
        }

        // Adjacent repeats merge into their first frame, then blanks drop out.
        let mut collapsed: Vec<(usize, f32)> = Vec::new();
        for (idx, p) in best {
            if collapsed.last().map(|&(prev, _)| prev) != Some(idx) {
                collapsed.push((idx, p));
            }
        }

        let mut text = String::new();
        let mut char_confidences = Vec::new();
        for (idx, p) in collapsed.into_iter().filter(|&(idx, _)| idx != blank) {
            if let Some(c) = self.vocab.decode_index(idx) {
                text.push(c);
                char_confidences.push(p);
            }
        }

        let confidence = if char_confidences.is_empty() {
            0.0
        } else {
            char_confidences.iter().sum::<f32>() / char_confidences.len() as f32
        };
        Ok(SequencePrediction {
            text,
            confidence,
            char_confidences,
        })
    }

    /// Decodes a (batch, T, table_size) probability tensor, one prediction
    /// per sample.
    pub fn decode_batch<B: Backend>(&self, probs: Tensor<B, 3>) -> Result<Vec<SequencePrediction>> {
        let [batch, steps, classes] = probs.dims();
        if classes != self.vocab.table_size() {
            return Err(CaptchaError::Shape {
                expected: vec![self.vocab.table_size()],
                actual: vec![classes],
            });
        }
        let data: Vec<f32> = probs
            .into_data()
            .to_vec()
            .expect("Failed to read probability data");

        let mut out = Vec::with_capacity(batch);
        for i in 0..batch {
            let rows: Vec<Vec<f32>> = (0..steps)
                .map(|t| {
                    let offset = (i * steps + t) * classes;
                    data[offset..offset + classes].to_vec()
                })
                .collect();
            out.push(self.decode(&rows)?);
        }
        Ok(out)
    }
}

impl Default for CtcGreedyDecoder {
    fn default() -> Self {
        Self::new(DigitVocab::default())
    }
}
