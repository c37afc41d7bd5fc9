use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Linear, LinearConfig, PaddingConfig2d, Relu, Sigmoid,
    },
    prelude::*,
};

/// Channel attention: rescales each feature channel by a learned gain in (0,1).
///
/// Global average and global max descriptors both pass through the same
/// two-layer bottleneck before being summed; averaging captures global
/// presence while max captures the most salient response.
#[derive(Module, Debug)]
pub struct ChannelAttention<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
    activation: Relu,
    sigmoid: Sigmoid,
}

impl<B: Backend> ChannelAttention<B> {
    /// `reduction` must divide into `channels` with a non-zero quotient.
    pub fn new(channels: usize, reduction: usize, device: &B::Device) -> Self {
        let reduced = channels / reduction;
        debug_assert!(reduced > 0);
        Self {
            fc1: LinearConfig::new(channels, reduced).with_bias(false).init(device),
            fc2: LinearConfig::new(reduced, channels).with_bias(false).init(device),
            activation: Relu::new(),
            sigmoid: Sigmoid::new(),
        }
    }

    // Shared bottleneck: one channel-importance function regardless of
    // descriptor source.
    fn bottleneck(&self, descriptor: Tensor<B, 2>) -> Tensor<B, 2> {
        let y = self.fc1.forward(descriptor);
        let y = self.activation.forward(y);
        self.fc2.forward(y)
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [b, c, _, _] = x.dims();
        let avg = x.clone().mean_dim(2).mean_dim(3).reshape([b, c]);
        let max = x.clone().max_dim(2).max_dim(3).reshape([b, c]);
        let gain = self
            .sigmoid
            .forward(self.bottleneck(avg).add(self.bottleneck(max)));
        x.mul(gain.reshape([b, c, 1, 1]))
    }
}

/// Spatial attention: rescales each spatial location by a learned gain in (0,1).
///
/// Channel-wise mean and max maps are stacked into a 2-channel descriptor and
/// collapsed to a single gain map by one same-padded convolution.
#[derive(Module, Debug)]
pub struct SpatialAttention<B: Backend> {
    conv: Conv2d<B>,
    sigmoid: Sigmoid,
}

impl<B: Backend> SpatialAttention<B> {
    /// `kernel_size` must be odd so "same" padding is exact.
    pub fn new(kernel_size: usize, device: &B::Device) -> Self {
        debug_assert!(kernel_size % 2 == 1);
        let pad = kernel_size / 2;
        let conv = Conv2dConfig::new([2, 1], [kernel_size, kernel_size])
            .with_padding(PaddingConfig2d::Explicit(pad, pad))
            .with_bias(false)
            .init(device);
        Self {
            conv,
            sigmoid: Sigmoid::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let avg = x.clone().mean_dim(1);
        let max = x.clone().max_dim(1);
        let descriptor = Tensor::cat(vec![avg, max], 1);
        let gain = self.sigmoid.forward(self.conv.forward(descriptor));
        x.mul(gain)
    }
}

/// Convolutional Block Attention Module.
///
/// Channel attention strictly before spatial attention; the ordering is a
/// fixed contract of the architecture.
#[derive(Module, Debug)]
pub struct Cbam<B: Backend> {
    channel: ChannelAttention<B>,
    spatial: SpatialAttention<B>,
}

impl<B: Backend> Cbam<B> {
    pub fn new(channels: usize, reduction: usize, device: &B::Device) -> Self {
        Self {
            channel: ChannelAttention::new(channels, reduction, device),
            spatial: SpatialAttention::new(7, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.channel.forward(x);
        self.spatial.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TB = NdArray<f32>;

    fn random_input(dims: [usize; 4]) -> Tensor<TB, 4> {
        Tensor::random(dims, Distribution::Uniform(-1.0, 1.0), &Default::default())
    }

    fn assert_attenuated(input: Tensor<TB, 4>, output: Tensor<TB, 4>) {
        let x: Vec<f32> = input.into_data().to_vec().unwrap();
        let y: Vec<f32> = output.into_data().to_vec().unwrap();
        assert_eq!(x.len(), y.len());
        for (a, b) in x.iter().zip(y.iter()) {
            // Sigmoid gains are strictly inside (0,1), so magnitude can only shrink.
            assert!(b.abs() <= a.abs() + 1e-6, "|{b}| > |{a}|");
            if a.abs() > 1e-4 {
                assert!(b.abs() < a.abs(), "gain did not attenuate {a} -> {b}");
            }
        }
    }

    #[test]
    fn channel_attention_preserves_shape_and_attenuates() {
        let device = Default::default();
        let attn = ChannelAttention::<TB>::new(16, 8, &device);
        let input = random_input([2, 16, 5, 9]);
        let output = attn.forward(input.clone());
        assert_eq!(output.dims(), [2, 16, 5, 9]);
        assert_attenuated(input, output);
    }

    #[test]
    fn spatial_attention_preserves_shape_and_attenuates() {
        let device = Default::default();
        let attn = SpatialAttention::<TB>::new(7, &device);
        let input = random_input([2, 8, 6, 10]);
        let output = attn.forward(input.clone());
        assert_eq!(output.dims(), [2, 8, 6, 10]);
        assert_attenuated(input, output);
    }

    #[test]
    fn cbam_composes_both_attentions() {
        let device = Default::default();
        let cbam = Cbam::<TB>::new(32, 8, &device);
        let input = random_input([1, 32, 3, 10]);
        let output = cbam.forward(input.clone());
        assert_eq!(output.dims(), [1, 32, 3, 10]);
        assert_attenuated(input, output);
    }

    #[test]
    fn attention_is_deterministic_across_calls() {
        let device = Default::default();
        let cbam = Cbam::<TB>::new(8, 8, &device);
        let input = random_input([1, 8, 4, 12]);
        let a: Vec<f32> = cbam.forward(input.clone()).into_data().to_vec().unwrap();
        let b: Vec<f32> = cbam.forward(input).into_data().to_vec().unwrap();
        assert_eq!(a, b);
    }
}
