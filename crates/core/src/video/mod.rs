//! Video input and output through ffmpeg/ffprobe subprocesses.

pub mod encoder;
pub mod probe;
pub mod sink;
pub mod source;

pub use encoder::{EncoderConfig, FrameEncoder, VideoEncoder};
pub use probe::{probe_video, VideoProbe};
pub use sink::QueuedSink;
pub use source::{FfmpegFrameSource, FrameSource, RawFrameSource};
