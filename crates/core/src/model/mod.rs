//! The learned part of the interpolator.
//!
//! The network maps a stacked frame pair to two re-aligned input crops and,
//! for each crop, a pair of per-pixel 1-D kernels. It is consumed only through
//! [`InterpolationModel`]; the convolution itself runs in [`crate::sepconv`].

pub mod backend;
pub mod onnx;

use anyhow::{ensure, Result};

use crate::tensor::Tensor;
use crate::tier::ConvolutionGeometry;

pub use backend::{build_session, InferenceBackend, SessionConfig};
pub use onnx::OnnxSepConvModel;

/// Per-pixel vertical and horizontal filters, each `[1, 1, L, S, S]`.
#[derive(Debug, Clone)]
pub struct KernelPair {
    pub vertical: Tensor,
    pub horizontal: Tensor,
}

/// Everything the convolution stage needs for one frame pair.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// First frame crop, `[1, 1, D, S + L - 1, S + L - 1]`.
    pub crop_a: Tensor,
    pub kernels_a: KernelPair,
    /// Second frame crop, same shape as `crop_a`.
    pub crop_b: Tensor,
    pub kernels_b: KernelPair,
}

impl ModelOutput {
    /// Checks every tensor against the shapes the geometry prescribes.
    pub fn validate(&self, geometry: &ConvolutionGeometry) -> Result<()> {
        let crop = geometry.input_shape();
        let kernel = geometry.kernel_shape();
        let checks = [
            ("crop_a", self.crop_a.shape(), crop),
            ("crop_b", self.crop_b.shape(), crop),
            ("kernels_a.vertical", self.kernels_a.vertical.shape(), kernel),
            ("kernels_a.horizontal", self.kernels_a.horizontal.shape(), kernel),
            ("kernels_b.vertical", self.kernels_b.vertical.shape(), kernel),
            ("kernels_b.horizontal", self.kernels_b.horizontal.shape(), kernel),
        ];
        for (name, actual, expected) in checks {
            ensure!(
                actual == expected,
                "model output {name} has shape {actual:?}, expected {expected:?}"
            );
        }
        Ok(())
    }
}

/// A network with a fixed square input side.
pub trait InterpolationModel: Send {
    /// Square input side `S` the network was exported for.
    fn input_side(&self) -> usize;

    /// Channels per frame. The stacked input carries twice as many.
    fn image_depth(&self) -> usize;

    /// Runs the network on a `[1, 1, 2D, S, S]` stacked pair.
    fn forward(&mut self, stacked: &Tensor) -> Result<ModelOutput>;
}
