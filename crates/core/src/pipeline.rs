//! Synthesizes the frame halfway between two frames.
//!
//! Per pair: downscale to the tier's usable side, convert to tensors,
//! replicate-pad to the network side, stack, run the network, apply the
//! separable convolution to both predicted crops, sum, trim and convert back.

use std::fmt;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};

use crate::model::InterpolationModel;
use crate::resize::resize_to_max_side;
use crate::sepconv::{EngineError, SeparableConvolution};
use crate::tensor::{self, Padding};
use crate::tier::{ConvolutionGeometry, ResolutionTier};
use crate::types::{Frame, PixelLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Configured,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineState::Completed | PipelineState::Cancelled | PipelineState::Failed
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Configured => "configured",
            PipelineState::Running => "running",
            PipelineState::Completed => "completed",
            PipelineState::Cancelled => "cancelled",
            PipelineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("frame conversion failed: {0}")]
    Conversion(String),

    #[error("model inference failed: {0}")]
    Model(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("cannot {operation} while pipeline is {state}")]
    InvalidState {
        state: PipelineState,
        operation: &'static str,
    },
}

impl PipelineError {
    /// Errors confined to one frame pair. Everything else leaves the pipeline
    /// unusable.
    pub fn is_pair_local(&self) -> bool {
        matches!(self, PipelineError::Conversion(_) | PipelineError::Model(_))
    }
}

fn conversion(err: anyhow::Error) -> PipelineError {
    PipelineError::Conversion(format!("{err:#}"))
}

/// Both preprocessed originals with the synthesized frame between them. All
/// three are RGBA and share the same dimensions.
#[derive(Debug, Clone)]
pub struct InterpolatedTriple {
    pub left: Frame,
    pub middle: Frame,
    pub right: Frame,
}

impl InterpolatedTriple {
    pub fn into_frames(self) -> [Frame; 3] {
        [self.left, self.middle, self.right]
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct StageTimings {
    preprocess: Duration,
    model: Duration,
    convolution: Duration,
    postprocess: Duration,
}

fn avg_ms(total: Duration, count: u64) -> String {
    if count == 0 {
        return "0.0".to_string();
    }
    format!("{:.1}", total.as_secs_f64() * 1000.0 / count as f64)
}

pub struct FramePipeline {
    tier: ResolutionTier,
    geometry: ConvolutionGeometry,
    model: Box<dyn InterpolationModel>,
    engine: Box<dyn SeparableConvolution>,
    state: PipelineState,
    pairs: u64,
    timings: StageTimings,
}

impl FramePipeline {
    pub fn new(
        tier: ResolutionTier,
        model: Box<dyn InterpolationModel>,
        engine: Box<dyn SeparableConvolution>,
    ) -> Result<Self, PipelineError> {
        let geometry = ConvolutionGeometry::for_tier(tier)
            .map_err(|e| PipelineError::Configuration(format!("{e:#}")))?;
        Self::with_geometry(tier, geometry, model, engine)
    }

    /// Builds a pipeline for an explicit geometry, e.g. a reduced filter
    /// length with a stand-in model.
    pub fn with_geometry(
        tier: ResolutionTier,
        geometry: ConvolutionGeometry,
        model: Box<dyn InterpolationModel>,
        engine: Box<dyn SeparableConvolution>,
    ) -> Result<Self, PipelineError> {
        if model.input_side() != geometry.network_side {
            return Err(PipelineError::Configuration(format!(
                "model expects {0}x{0} input but the pipeline is sized for {1}x{1}",
                model.input_side(),
                geometry.network_side
            )));
        }
        if model.image_depth() != geometry.depth {
            return Err(PipelineError::Configuration(format!(
                "model works on {} channels per frame, expected {}",
                model.image_depth(),
                geometry.depth
            )));
        }
        if engine.geometry() != geometry {
            return Err(PipelineError::Configuration(format!(
                "{} engine is sized for {:?}, pipeline needs {geometry:?}",
                engine.name(),
                engine.geometry()
            )));
        }

        Ok(Self {
            tier,
            geometry,
            model,
            engine,
            state: PipelineState::Idle,
            pairs: 0,
            timings: StageTimings::default(),
        })
    }

    pub fn tier(&self) -> ResolutionTier {
        self.tier
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn pairs_interpolated(&self) -> u64 {
        self.pairs
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    /// Largest side a frame may have before it is downscaled.
    pub fn max_image_side(&self) -> usize {
        self.geometry.max_image_side()
    }

    /// Acquires the engine's device resources.
    pub fn prepare(&mut self) -> Result<(), PipelineError> {
        match self.state {
            PipelineState::Idle | PipelineState::Configured => {}
            state => {
                return Err(PipelineError::InvalidState {
                    state,
                    operation: "prepare",
                })
            }
        }
        self.engine.prepare()?;
        self.state = PipelineState::Configured;
        debug!(
            tier = %self.tier,
            engine = self.engine.name(),
            "frame pipeline configured"
        );
        Ok(())
    }

    /// Downscales and normalizes a decoded frame to what the network accepts.
    pub fn preprocess(&self, frame: Frame) -> Result<Frame, PipelineError> {
        let max_side = self.max_image_side() as u32;
        let resized = resize_to_max_side(frame, max_side).map_err(conversion)?;
        Ok(resized.into_layout(PixelLayout::Rgba))
    }

    pub fn interpolate(
        &mut self,
        a: Frame,
        b: Frame,
    ) -> Result<InterpolatedTriple, PipelineError> {
        match self.state {
            PipelineState::Configured | PipelineState::Running => {}
            state => {
                return Err(PipelineError::InvalidState {
                    state,
                    operation: "interpolate",
                })
            }
        }
        if !self.engine.is_prepared() {
            return Err(EngineError::NotConfigured.into());
        }
        self.state = PipelineState::Running;

        let t_pre = Instant::now();
        let left = self.preprocess(a)?;
        let right = self.preprocess(b)?;
        if (left.width, left.height) != (right.width, right.height) {
            return Err(PipelineError::Conversion(format!(
                "frame sizes differ after preprocessing: {}x{} vs {}x{}",
                left.width, left.height, right.width, right.height
            )));
        }
        let tensor_a = tensor::frame_to_tensor(&left).map_err(conversion)?;
        let tensor_b = tensor::frame_to_tensor(&right).map_err(conversion)?;

        let side = self.geometry.network_side;
        let padding = Padding::to_reach(tensor_a.height(), tensor_a.width(), side);
        let stacked = if padding.is_zero() {
            tensor::stack(&tensor_a, &tensor_b)
        } else {
            tensor::stack(
                &tensor::replicate_pad(&tensor_a, padding),
                &tensor::replicate_pad(&tensor_b, padding),
            )
        };
        let pre_elapsed = t_pre.elapsed();

        let t_model = Instant::now();
        let predicted = self
            .model
            .forward(&stacked)
            .map_err(|e| PipelineError::Model(format!("{e:#}")))?;
        predicted
            .validate(&self.geometry)
            .map_err(|e| PipelineError::Model(format!("{e:#}")))?;
        let model_elapsed = t_model.elapsed();

        let t_conv = Instant::now();
        let from_a = self.engine.apply(
            &predicted.crop_a,
            &predicted.kernels_a.vertical,
            &predicted.kernels_a.horizontal,
        )?;
        let from_b = self.engine.apply(
            &predicted.crop_b,
            &predicted.kernels_b.vertical,
            &predicted.kernels_b.horizontal,
        )?;
        let conv_elapsed = t_conv.elapsed();

        let t_post = Instant::now();
        let summed = tensor::add(&from_a, &from_b);
        let output = if padding.is_zero() {
            summed
        } else {
            tensor::trim(&summed, padding)
        };
        let middle = tensor::tensor_to_frame(&output).map_err(conversion)?;
        let post_elapsed = t_post.elapsed();

        self.pairs += 1;
        self.timings.preprocess += pre_elapsed;
        self.timings.model += model_elapsed;
        self.timings.convolution += conv_elapsed;
        self.timings.postprocess += post_elapsed;

        debug!(
            pair = self.pairs,
            width = middle.width,
            height = middle.height,
            preprocess_ms = format!("{:.1}", pre_elapsed.as_secs_f64() * 1000.0),
            model_ms = format!("{:.1}", model_elapsed.as_secs_f64() * 1000.0),
            sepconv_ms = format!("{:.1}", conv_elapsed.as_secs_f64() * 1000.0),
            postprocess_ms = format!("{:.1}", post_elapsed.as_secs_f64() * 1000.0),
            "pair interpolated"
        );

        Ok(InterpolatedTriple {
            left,
            middle,
            right,
        })
    }

    pub fn mark_completed(&mut self) {
        self.finish(PipelineState::Completed);
    }

    pub fn mark_cancelled(&mut self) {
        self.finish(PipelineState::Cancelled);
    }

    pub fn mark_failed(&mut self) {
        self.finish(PipelineState::Failed);
    }

    fn finish(&mut self, state: PipelineState) {
        if self.state.is_terminal() {
            return;
        }
        self.state = state;
        let n = self.pairs;
        info!(
            state = %state,
            pairs = n,
            avg_preprocess_ms = avg_ms(self.timings.preprocess, n),
            avg_model_ms = avg_ms(self.timings.model, n),
            avg_sepconv_ms = avg_ms(self.timings.convolution, n),
            avg_postprocess_ms = avg_ms(self.timings.postprocess, n),
            "Frame pipeline summary"
        );
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use anyhow::Result;
    use ndarray::{s, Array5};

    use crate::model::{InterpolationModel, KernelPair, ModelOutput};
    use crate::tensor::{self, Padding, Tensor};
    use crate::tier::ConvolutionGeometry;

    /// Stand-in network that predicts a fixed blend: every output pixel takes
    /// half of the co-located pixel of each frame.
    pub struct AveragingModel {
        pub geometry: ConvolutionGeometry,
        pub calls: usize,
        pub fail_on_call: Option<usize>,
    }

    impl AveragingModel {
        pub fn new(geometry: ConvolutionGeometry) -> Self {
            Self {
                geometry,
                calls: 0,
                fail_on_call: None,
            }
        }

        fn centre_tap_kernels(&self, weight: f32) -> KernelPair {
            let g = &self.geometry;
            let centre = g.filter_length / 2;
            let mut v = Array5::<f32>::zeros(g.kernel_shape());
            v.slice_mut(s![0, 0, centre, .., ..]).fill(weight);
            let mut h = Array5::<f32>::zeros(g.kernel_shape());
            h.slice_mut(s![0, 0, centre, .., ..]).fill(1.0);
            KernelPair {
                vertical: Tensor::from_array(v),
                horizontal: Tensor::from_array(h),
            }
        }
    }

    impl InterpolationModel for AveragingModel {
        fn input_side(&self) -> usize {
            self.geometry.network_side
        }

        fn image_depth(&self) -> usize {
            self.geometry.depth
        }

        fn forward(&mut self, stacked: &Tensor) -> Result<ModelOutput> {
            self.calls += 1;
            if self.fail_on_call == Some(self.calls) {
                anyhow::bail!("synthetic model failure on call {}", self.calls);
            }
            let d = self.geometry.depth;
            let half = self.geometry.filter_length / 2;
            let pad = Padding::new(half, half, half, half);
            let frames = stacked.array();
            let frame_a = Tensor::from_array(frames.slice(s![.., .., ..d, .., ..]).to_owned());
            let frame_b = Tensor::from_array(frames.slice(s![.., .., d.., .., ..]).to_owned());
            Ok(ModelOutput {
                crop_a: tensor::replicate_pad(&frame_a, pad),
                kernels_a: self.centre_tap_kernels(0.5),
                crop_b: tensor::replicate_pad(&frame_b, pad),
                kernels_b: self.centre_tap_kernels(0.5),
            })
        }
    }
}
