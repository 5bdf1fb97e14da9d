//! Per-pixel adaptive separable convolution.
//!
//! For every output pixel `(y, x)` the network predicts a vertical and a
//! horizontal 1-D filter of length `L`. The engine evaluates
//!
//! ```text
//! out[c, y, x] = sum_i sum_j v[i, y, x] * h[j, y, x] * in[c, y + i, x + j]
//! ```
//!
//! over an input crop that is `L - 1` pixels larger than the output on each
//! spatial axis.

pub mod cpu;
pub mod gpu;
pub mod shaders;

use std::fmt;

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tensor::{Shape5, Tensor};
use crate::tier::ConvolutionGeometry;

pub use cpu::CpuSeparableConvolution;
pub use gpu::{list_adapters, AdapterSummary, GpuSeparableConvolution};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no compatible GPU device: {0}")]
    EngineUnavailable(String),

    #[error("failed to allocate {label} buffer ({bytes} bytes): {reason}")]
    AllocationFailed {
        label: &'static str,
        bytes: u64,
        reason: String,
    },

    #[error("convolution engine used before prepare()")]
    NotConfigured,

    #[error("convolution dispatch failed: {0}")]
    ExecutionFailed(String),

    #[error("{operand} has shape {actual:?}, expected {expected}")]
    ShapeMismatch {
        operand: &'static str,
        expected: String,
        actual: Shape5,
    },
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Engine that applies one pair of per-pixel kernels to an input crop.
///
/// Calls are synchronous. One instance serves one pipeline and never runs two
/// dispatches at once.
pub trait SeparableConvolution: Send {
    fn name(&self) -> &str;

    fn geometry(&self) -> ConvolutionGeometry;

    /// Acquires device resources sized for [`Self::geometry`]. Idempotent.
    fn prepare(&mut self) -> EngineResult<()>;

    fn is_prepared(&self) -> bool;

    /// Runs the convolution. `input` is `[1, 1, D, H + L - 1, W + L - 1]` and
    /// both kernels are `[1, 1, L, H, W]`; the result is `[1, 1, D, H, W]`.
    fn apply(
        &mut self,
        input: &Tensor,
        vertical: &Tensor,
        horizontal: &Tensor,
    ) -> EngineResult<Tensor>;
}

/// Which engine implementation a run uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Gpu,
    /// Reference implementation on the host, for machines without a GPU.
    Cpu,
}

impl EngineKind {
    pub fn from_str_lossy(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gpu" => Some(Self::Gpu),
            "cpu" => Some(Self::Cpu),
            _ => None,
        }
    }

    pub fn build(self, geometry: ConvolutionGeometry) -> Box<dyn SeparableConvolution> {
        match self {
            Self::Gpu => Box::new(GpuSeparableConvolution::new(geometry)),
            Self::Cpu => Box::new(CpuSeparableConvolution::new(geometry)),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gpu => write!(f, "gpu"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

/// Output extent of one call after operand validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallExtent {
    pub depth: usize,
    pub height: usize,
    pub width: usize,
    pub filter_length: usize,
}

impl CallExtent {
    pub fn output_shape(&self) -> Shape5 {
        [1, 1, self.depth, self.height, self.width]
    }

    pub fn output_len(&self) -> usize {
        self.depth * self.height * self.width
    }
}

/// Checks operand shapes against each other and against the capacity the
/// engine was sized for. Operands smaller than the tier are accepted.
pub fn validate_operands(
    geometry: &ConvolutionGeometry,
    input: &Tensor,
    vertical: &Tensor,
    horizontal: &Tensor,
) -> EngineResult<CallExtent> {
    let l = geometry.filter_length;
    let [vn, vt, vl, h, w] = vertical.shape();
    let side = geometry.network_side;
    if vn != 1 || vt != 1 || vl != l || h == 0 || w == 0 || h > side || w > side {
        return Err(EngineError::ShapeMismatch {
            operand: "vertical kernel",
            expected: format!("[1, 1, {l}, <={side}, <={side}]"),
            actual: vertical.shape(),
        });
    }
    if horizontal.shape() != vertical.shape() {
        return Err(EngineError::ShapeMismatch {
            operand: "horizontal kernel",
            expected: format!("{:?}", vertical.shape()),
            actual: horizontal.shape(),
        });
    }

    let expected_input = [1, 1, geometry.depth, h + l - 1, w + l - 1];
    if input.shape() != expected_input {
        return Err(EngineError::ShapeMismatch {
            operand: "input",
            expected: format!("{expected_input:?}"),
            actual: input.shape(),
        });
    }

    Ok(CallExtent {
        depth: geometry.depth,
        height: h,
        width: w,
        filter_length: l,
    })
}

/// Uniform block describing one call. Sizes and strides cover the
/// `(time, channel, height, width)` axes, strides in elements.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ShaderInfo {
    pub input_size: [i32; 4],
    pub input_stride: [i32; 4],
    pub vertical_size: [i32; 4],
    pub vertical_stride: [i32; 4],
    pub horizontal_size: [i32; 4],
    pub horizontal_stride: [i32; 4],
    pub output_size: [i32; 4],
    pub output_stride: [i32; 4],
    pub filter_size: i32,
    pub _pad: [i32; 3],
}

impl ShaderInfo {
    pub fn for_call(
        input: &Tensor,
        vertical: &Tensor,
        horizontal: &Tensor,
        extent: &CallExtent,
    ) -> Self {
        let output = extent.output_shape();
        Self {
            input_size: int4_shape(&input.shape()),
            input_stride: int4_stride(&input.shape()),
            vertical_size: int4_shape(&vertical.shape()),
            vertical_stride: int4_stride(&vertical.shape()),
            horizontal_size: int4_shape(&horizontal.shape()),
            horizontal_stride: int4_stride(&horizontal.shape()),
            output_size: int4_shape(&output),
            output_stride: int4_stride(&output),
            filter_size: extent.filter_length as i32,
            _pad: [0; 3],
        }
    }
}

fn int4_shape(shape: &Shape5) -> [i32; 4] {
    [shape[1] as i32, shape[2] as i32, shape[3] as i32, shape[4] as i32]
}

fn int4_stride(shape: &Shape5) -> [i32; 4] {
    let w = shape[4];
    let hw = shape[3] * w;
    let chw = shape[2] * hw;
    [chw as i32, hw as i32, w as i32, 1]
}
