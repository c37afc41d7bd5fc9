use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig,
        PaddingConfig2d, Relu,
    },
    prelude::*,
    tensor::activation::softmax,
};

use crate::attention::Cbam;
// `Config` derives expand to the two-parameter std `Result`, so the crate
// alias must stay out of this namespace.
use crate::error::CaptchaError;
use crate::pool::{PositionPool, PositionPoolConfig};

/// Input image height
pub const IMG_HEIGHT: usize = 50;
/// Input image width
pub const IMG_WIDTH: usize = 160;
/// Number of digit slots in a captcha
pub const NUM_DIGITS: usize = 6;
/// Digit classes '0'..'9'
pub const NUM_CLASSES: usize = 10;

/// Progressive regularization schedule, shallow to deep.
const BLOCK_DROPOUT: [f64; 4] = [0.1, 0.15, 0.2, 0.25];

#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = 6)]
    pub num_digits: usize,
    #[config(default = 10)]
    pub num_classes: usize,
    /// Hidden width of each digit head.
    #[config(default = 128)]
    pub head_hidden: usize,
    #[config(default = 0.3)]
    pub head_dropout: f64,
    /// Route position pooling through the reference execution path.
    #[config(default = false)]
    pub force_reference_pool: bool,
}

/// Fails on any batch whose per-image dims differ from the configured
/// geometry; inputs are never reshaped to fit.
pub fn validate_image_batch<B: Backend>(images: &Tensor<B, 4>) -> crate::error::Result<()> {
    let [_, c, h, w] = images.dims();
    if c != 1 || h != IMG_HEIGHT || w != IMG_WIDTH {
        return Err(CaptchaError::Shape {
            expected: vec![1, IMG_HEIGHT, IMG_WIDTH],
            actual: vec![c, h, w],
        });
    }
    Ok(())
}

/// Two conv+norm+relu stages, CBAM, 2x2 max pool, dropout.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    cbam: Cbam<B>,
    pool: MaxPool2d,
    dropout: Dropout,
    activation: Relu,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, dropout: f64, device: &B::Device) -> Self {
        let conv1 = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        let bn1 = BatchNormConfig::new(out_channels).init(device);

        let conv2 = Conv2dConfig::new([out_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        let bn2 = BatchNormConfig::new(out_channels).init(device);

        let cbam = Cbam::new(out_channels, 16, device);
        let pool = MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init();
        let dropout = DropoutConfig::new(dropout).init();

        Self {
            conv1,
            bn1,
            conv2,
            bn2,
            cbam,
            pool,
            dropout,
            activation: Relu::new(),
        }
    }

    /// Halves both spatial dims (floor for odd sizes).
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv1.forward(input);
        let x = self.bn1.forward(x);
        let x = self.activation.forward(x);

        let x = self.conv2.forward(x);
        let x = self.bn2.forward(x);
        let x = self.activation.forward(x);

        let x = self.cbam.forward(x);
        let x = self.pool.forward(x);
        self.dropout.forward(x)
    }
}

/// Four-stage attention-augmented feature extractor, widths 1->32->64->128->256.
///
/// For a (1, 50, 160) input the output map is (256, 3, 10). Shared verbatim
/// between the fixed-slot and temporal decoding variants.
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    block1: ConvBlock<B>,
    block2: ConvBlock<B>,
    block3: ConvBlock<B>,
    block4: ConvBlock<B>,
}

impl<B: Backend> Backbone<B> {
    pub fn new(device: &B::Device) -> Self {
        Self {
            block1: ConvBlock::new(1, 32, BLOCK_DROPOUT[0], device),
            block2: ConvBlock::new(32, 64, BLOCK_DROPOUT[1], device),
            block3: ConvBlock::new(64, 128, BLOCK_DROPOUT[2], device),
            block4: ConvBlock::new(128, 256, BLOCK_DROPOUT[3], device),
        }
    }

    pub const fn out_channels() -> usize {
        256
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.block1.forward(x);
        let x = self.block2.forward(x);
        let x = self.block3.forward(x);
        self.block4.forward(x)
    }
}

/// Independent classifier for one digit slot. No parameters are shared across
/// slots, so each position can learn its own feature-to-digit mapping.
#[derive(Module, Debug)]
pub struct DigitHead<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
    dropout: Dropout,
    activation: Relu,
}

impl<B: Backend> DigitHead<B> {
    pub fn new(
        in_features: usize,
        hidden: usize,
        num_classes: usize,
        dropout: f64,
        device: &B::Device,
    ) -> Self {
        Self {
            fc1: LinearConfig::new(in_features, hidden).init(device),
            fc2: LinearConfig::new(hidden, num_classes).init(device),
            dropout: DropoutConfig::new(dropout).init(),
            activation: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);
        let x = self.dropout.forward(x);
        self.fc2.forward(x)
    }
}

/// Fixed-slot recognizer: backbone, position pooling, one head per slot.
#[derive(Module, Debug)]
pub struct MultiHeadModel<B: Backend> {
    backbone: Backbone<B>,
    pool: PositionPool,
    heads: Vec<DigitHead<B>>,
    num_digits: usize,
}

impl<B: Backend> MultiHeadModel<B> {
    pub fn new(config: &ModelConfig, device: &B::Device) -> Self {
        let backbone = Backbone::new(device);
        let pool = PositionPoolConfig::new(config.num_digits)
            .with_force_reference(config.force_reference_pool)
            .init();
        let heads = (0..config.num_digits)
            .map(|_| {
                DigitHead::new(
                    Backbone::<B>::out_channels(),
                    config.head_hidden,
                    config.num_classes,
                    config.head_dropout,
                    device,
                )
            })
            .collect();
        Self {
            backbone,
            pool,
            heads,
            num_digits: config.num_digits,
        }
    }

    /// One logit vector per digit slot, left to right.
    pub fn forward(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 2>> {
        let batch = images.dims()[0];
        let features = self.backbone.forward(images);
        let channels = features.dims()[1];
        let pooled = self.pool.forward(features);
        let slots = pooled.reshape([batch, channels, self.num_digits]);
        self.heads
            .iter()
            .enumerate()
            .map(|(i, head)| {
                let slot = slots.clone().narrow(2, i, 1).reshape([batch, channels]);
                head.forward(slot)
            })
            .collect()
    }

    /// Validates the input geometry before running the forward pass.
    pub fn forward_checked(&self, images: Tensor<B, 4>) -> crate::error::Result<Vec<Tensor<B, 2>>> {
        validate_image_batch(&images)?;
        Ok(self.forward(images))
    }

    /// Verifies the pooling backend agrees with the reference path on this
    /// device, using a deterministic input of backbone-output geometry.
    pub fn check_pooling_consistency(&self, device: &B::Device) -> crate::error::Result<()> {
        let channels = Backbone::<B>::out_channels();
        let n = channels * 3 * 10;
        let sample = Tensor::<B, 1, Int>::arange(0..n as i64, device)
            .float()
            .div_scalar(n as f32)
            .reshape([1, channels, 3, 10]);
        self.pool.check_consistency(sample)
    }
}

/// Temporal recognizer (variant b): shared backbone, height collapsed, width
/// as the time axis, projected to per-timestep class probabilities.
///
/// The class axis follows the temporal vocabulary: index 0 is "unknown",
/// 1..=`num_classes` are the digits, the last index is blank.
#[derive(Module, Debug)]
pub struct SequenceModel<B: Backend> {
    backbone: Backbone<B>,
    proj: Linear<B>,
}

impl<B: Backend> SequenceModel<B> {
    pub fn new(config: &ModelConfig, device: &B::Device) -> Self {
        Self {
            backbone: Backbone::new(device),
            // unknown + digits + blank
            proj: LinearConfig::new(Backbone::<B>::out_channels(), config.num_classes + 2)
                .init(device),
        }
    }

    /// (batch, 1, H, W) -> (batch, T, num_classes + 2) probabilities, T = W/16.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 3> {
        let features = self.backbone.forward(images);
        let [batch, channels, _, width] = features.dims();
        let columns = features
            .mean_dim(2)
            .reshape([batch, channels, width])
            .swap_dims(1, 2);
        softmax(self.proj.forward(columns), 2)
    }

    pub fn forward_checked(&self, images: Tensor<B, 4>) -> crate::error::Result<Tensor<B, 3>> {
        validate_image_batch(&images)?;
        Ok(self.forward(images))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TB = NdArray<f32>;

    #[test]
    fn backbone_maps_configured_input_to_expected_feature_map() {
        let device = Default::default();
        let backbone = Backbone::<TB>::new(&device);
        let input = Tensor::zeros([1, 1, IMG_HEIGHT, IMG_WIDTH], &device);
        let out = backbone.forward(input);
        assert_eq!(out.dims(), [1, 256, 3, 10]);
    }

    #[test]
    fn regularization_follows_the_training_recipe() {
        assert_eq!(BLOCK_DROPOUT, [0.1, 0.15, 0.2, 0.25]);
        assert_eq!(ModelConfig::new().head_dropout, 0.3);
    }

    #[test]
    fn conv_block_halves_odd_sizes_with_floor() {
        let device = Default::default();
        let block = ConvBlock::<TB>::new(1, 32, 0.0, &device);
        let out = block.forward(Tensor::zeros([1, 1, 25, 13], &device));
        assert_eq!(out.dims(), [1, 32, 12, 6]);
    }

    #[test]
    fn multi_head_model_emits_one_logit_vector_per_slot() {
        let device = Default::default();
        let model = MultiHeadModel::<TB>::new(&ModelConfig::new(), &device);
        let input = Tensor::zeros([2, 1, IMG_HEIGHT, IMG_WIDTH], &device);
        let logits = model.forward(input);
        assert_eq!(logits.len(), NUM_DIGITS);
        for slot in logits {
            assert_eq!(slot.dims(), [2, NUM_CLASSES]);
        }
    }

    #[test]
    fn wrong_input_geometry_is_rejected_not_reshaped() {
        let device = Default::default();
        let model = MultiHeadModel::<TB>::new(&ModelConfig::new(), &device);
        let bad = Tensor::zeros([1, 3, IMG_HEIGHT, IMG_WIDTH], &device);
        assert!(matches!(
            model.forward_checked(bad),
            Err(crate::error::CaptchaError::Shape { .. })
        ));
        let bad = Tensor::zeros([1, 1, 60, IMG_WIDTH], &device);
        assert!(model.forward_checked(bad).is_err());
    }

    #[test]
    fn sequence_model_emits_probability_rows_per_timestep() {
        let device = Default::default();
        let model = SequenceModel::<TB>::new(&ModelConfig::new(), &device);
        let input = Tensor::zeros([2, 1, IMG_HEIGHT, IMG_WIDTH], &device);
        let probs = model.forward(input);
        assert_eq!(probs.dims(), [2, 10, NUM_CLASSES + 2]);

        // Softmax rows sum to one.
        let data: Vec<f32> = probs.into_data().to_vec().unwrap();
        for row in data.chunks(NUM_CLASSES + 2) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn pooling_consistency_holds_on_reference_backend() {
        let device = Default::default();
        let model = MultiHeadModel::<TB>::new(&ModelConfig::new(), &device);
        model.check_pooling_consistency(&device).unwrap();
    }

    #[test]
    fn batch_results_match_single_image_results() {
        let device = Default::default();
        let model = MultiHeadModel::<TB>::new(&ModelConfig::new(), &device);
        let a = Tensor::<TB, 4>::random(
            [1, 1, IMG_HEIGHT, IMG_WIDTH],
            burn::tensor::Distribution::Default,
            &device,
        );
        let b = Tensor::<TB, 4>::random(
            [1, 1, IMG_HEIGHT, IMG_WIDTH],
            burn::tensor::Distribution::Default,
            &device,
        );
        let batched = Tensor::cat(vec![a.clone(), b.clone()], 0);

        let batch_logits = model.forward(batched);
        let solo_a = model.forward(a);
        let solo_b = model.forward(b);

        for slot in 0..NUM_DIGITS {
            let joint: Vec<f32> = batch_logits[slot].clone().into_data().to_vec().unwrap();
            let la: Vec<f32> = solo_a[slot].clone().into_data().to_vec().unwrap();
            let lb: Vec<f32> = solo_b[slot].clone().into_data().to_vec().unwrap();
            for (x, y) in joint[..NUM_CLASSES].iter().zip(la.iter()) {
                assert!((x - y).abs() < 1e-4);
            }
            for (x, y) in joint[NUM_CLASSES..].iter().zip(lb.iter()) {
                assert!((x - y).abs() < 1e-4);
            }
        }
    }
}
