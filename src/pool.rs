use burn::{
    nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
    prelude::*,
    tensor::ElementConversion,
};

// `Config` derives expand to the two-parameter std `Result`, so the crate
// alias must stay out of this namespace.
use crate::error::CaptchaError;

/// Maximum allowed disagreement between the native and reference paths.
const POOL_TOLERANCE: f32 = 1e-5;

#[derive(Config, Debug)]
pub struct PositionPoolConfig {
    /// Number of output columns, one per digit slot.
    pub slots: usize,
    /// Route pooling through the backend-independent reference path instead
    /// of the backend's adaptive-pool kernel.
    #[config(default = false)]
    pub force_reference: bool,
}

impl PositionPoolConfig {
    pub fn init(&self) -> PositionPool {
        PositionPool {
            pool: AdaptiveAvgPool2dConfig::new([1, self.slots]).init(),
            slots: self.slots,
            force_reference: self.force_reference,
        }
    }
}

/// Collapses a feature map to exactly one column per digit slot.
///
/// The width axis is reduced to `slots` averaged windows and the height axis
/// to one, preserving left-to-right order so that output column `i` always
/// corresponds to digit slot `i`. This is the single pooling definition in
/// the crate; every consumer goes through it.
///
/// Two execution paths exist. The native path uses the backend's
/// adaptive-average-pool kernel; the reference path composes the same
/// windows from primitive slice and mean ops, which evaluate identically on
/// every backend. `check_consistency` verifies the two agree on a given
/// device, and `force_reference` makes the reference path an explicit
/// configuration choice rather than a silent fallback.
#[derive(Module, Clone, Debug)]
pub struct PositionPool {
    pool: AdaptiveAvgPool2d,
    slots: usize,
    force_reference: bool,
}

impl PositionPool {
    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn forces_reference(&self) -> bool {
        self.force_reference
    }

    /// Input (batch, C, h, w) with w >= `slots`; output (batch, C, 1, `slots`).
    pub fn forward<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        if self.force_reference {
            self.forward_reference(x)
        } else {
            self.pool.forward(x)
        }
    }

    /// Backend-independent pooling. Window `i` covers columns
    /// `[floor(i*w/slots), ceil((i+1)*w/slots))`, matching the adaptive
    /// kernel, so a healthy native backend produces the same values.
    pub fn forward_reference<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let w = x.dims()[3];
        debug_assert!(w >= self.slots, "feature width {w} below slot count");
        let mut columns = Vec::with_capacity(self.slots);
        for slot in 0..self.slots {
            let start = slot * w / self.slots;
            let end = ((slot + 1) * w).div_ceil(self.slots);
            let window = x.clone().narrow(3, start, end - start);
            // (b, c, h, win) -> (b, c, 1, 1); uniform weights make the mean
            // of row means equal the window mean.
            columns.push(window.mean_dim(3).mean_dim(2));
        }
        Tensor::cat(columns, 3)
    }

    /// Runs both execution paths on the same input and verifies agreement
    /// within tolerance.
    pub fn check_consistency<B: Backend>(&self, x: Tensor<B, 4>) -> crate::error::Result<()> {
        let native = self.pool.forward(x.clone());
        let reference = self.forward_reference(x);
        let max_diff: f32 = native.sub(reference).abs().max().into_scalar().elem();
        if max_diff > POOL_TOLERANCE {
            return Err(CaptchaError::BackendConsistency { max_diff });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TB = NdArray<f32>;

    fn pool(slots: usize) -> PositionPool {
        PositionPoolConfig::new(slots).init()
    }

    #[test]
    fn output_width_equals_slot_count_for_any_input_width() {
        let device = Default::default();
        for width in [8, 10, 40] {
            let input =
                Tensor::<TB, 4>::random([2, 3, 4, width], Distribution::Default, &device);
            let out = pool(6).forward(input.clone());
            assert_eq!(out.dims(), [2, 3, 1, 6], "native, width {width}");
            let out = pool(6).forward_reference(input);
            assert_eq!(out.dims(), [2, 3, 1, 6], "reference, width {width}");
        }
    }

    #[test]
    fn native_and_reference_paths_agree() {
        let device = Default::default();
        for width in [8, 10, 40] {
            let input =
                Tensor::<TB, 4>::random([1, 5, 3, width], Distribution::Default, &device);
            pool(6).check_consistency(input).unwrap();
        }
    }

    #[test]
    fn constant_input_pools_to_the_constant() {
        let device = Default::default();
        let input = Tensor::<TB, 4>::full([1, 2, 3, 10], 0.75, &device);
        let out: Vec<f32> = pool(6)
            .forward_reference(input)
            .into_data()
            .to_vec()
            .unwrap();
        for v in out {
            assert!((v - 0.75).abs() < 1e-6);
        }
    }

    #[test]
    fn column_to_slot_mapping_is_monotonic() {
        let device = Default::default();
        // Column j holds the value j; averaged windows must be non-decreasing
        // left to right if the mapping preserves order.
        let ramp: Vec<f32> = (0..40).map(|j| j as f32).collect();
        let input = Tensor::<TB, 1>::from_floats(ramp.as_slice(), &device).reshape([1, 1, 1, 40]);
        let out: Vec<f32> = pool(6).forward_reference(input).into_data().to_vec().unwrap();
        assert_eq!(out.len(), 6);
        for pair in out.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn pooling_is_deterministic() {
        let device = Default::default();
        let input = Tensor::<TB, 4>::random([2, 4, 3, 10], Distribution::Default, &device);
        let p = pool(6);
        let a: Vec<f32> = p.forward(input.clone()).into_data().to_vec().unwrap();
        let b: Vec<f32> = p.forward(input).into_data().to_vec().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn forced_reference_is_an_explicit_choice() {
        let p = PositionPoolConfig::new(6).with_force_reference(true).init();
        assert!(p.forces_reference());
        let device = Default::default();
        let input = Tensor::<TB, 4>::random([1, 2, 3, 10], Distribution::Default, &device);
        let forced: Vec<f32> = p.forward(input.clone()).into_data().to_vec().unwrap();
        let reference: Vec<f32> = p.forward_reference(input).into_data().to_vec().unwrap();
        assert_eq!(forced, reference);
    }
}
