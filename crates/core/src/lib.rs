//! Frame-rate doubling with adaptive separable convolution.
//!
//! A kernel-prediction network looks at two consecutive frames and predicts,
//! for every output pixel, a pair of 1-D filters per input frame. Applying
//! those filters to both frames and summing the results synthesizes the frame
//! in between. [`run::InterpolationRun`] drives that over a whole video.

pub mod config;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod queue;
pub mod resize;
pub mod run;
pub mod runtime;
pub mod sepconv;
pub mod tensor;
pub mod tier;
pub mod types;
pub mod video;
