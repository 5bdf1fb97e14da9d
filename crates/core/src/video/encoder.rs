//! ffmpeg encode subprocess fed with raw frames on stdin.
//!
//! The process starts on the first frame, so the output size always matches
//! whatever the pipeline produced after downscaling.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Stdio};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, info, warn};

use crate::types::{Frame, PixelLayout};

/// Ordered frame persistence.
pub trait FrameEncoder: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Flushes and closes the artifact. Returns the number of frames written.
    fn finish(&mut self) -> Result<u64>;

    /// Abandons the artifact, removing anything partially written.
    fn discard(&mut self);
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncoderConfig {
    pub output_path: PathBuf,
    /// Output frame rate, twice the source rate for a doubling run.
    pub fps: f64,
    /// Video codec (e.g. "libx264").
    pub codec: String,
    /// Constant Rate Factor.
    pub crf: u32,
    /// Output pixel format (e.g. "yuv420p").
    pub pixel_format: String,
}

impl EncoderConfig {
    pub fn new(output_path: impl Into<PathBuf>, fps: f64) -> Self {
        Self {
            output_path: output_path.into(),
            fps,
            codec: "libx264".to_string(),
            crf: 18,
            pixel_format: "yuv420p".to_string(),
        }
    }

    pub fn build_ffmpeg_args(&self, width: u32, height: u32, layout: PixelLayout) -> Vec<String> {
        // yuv420p needs even dimensions; pad by one pixel instead of failing.
        let vf_filter = "pad=ceil(iw/2)*2:ceil(ih/2)*2".to_string();

        vec![
            "-nostdin".into(),
            "-y".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            layout.ffmpeg_pix_fmt().into(),
            "-s".into(),
            format!("{width}x{height}"),
            "-r".into(),
            format_rate(self.fps),
            "-i".into(),
            "pipe:0".into(),
            "-an".into(),
            "-c:v".into(),
            self.codec.clone(),
            "-crf".into(),
            self.crf.to_string(),
            "-vf".into(),
            vf_filter,
            "-pix_fmt".into(),
            self.pixel_format.clone(),
            self.output_path.to_string_lossy().into_owned(),
        ]
    }
}

fn format_rate(fps: f64) -> String {
    if fps.fract() == 0.0 {
        format!("{}", fps as u64)
    } else {
        let s = format!("{fps:.6}");
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

struct EncoderProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_thread: Option<JoinHandle<()>>,
    width: u32,
    height: u32,
    layout: PixelLayout,
}

impl EncoderProcess {
    fn spawn(config: &EncoderConfig, width: u32, height: u32, layout: PixelLayout) -> Result<Self> {
        let args = config.build_ffmpeg_args(width, height, layout);
        debug!(
            cmd = %format!("ffmpeg {}", args.join(" ")),
            "launching FFmpeg encoder"
        );

        let mut child = crate::runtime::command_for("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg, is it installed?")?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to open ffmpeg stdin"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("failed to open ffmpeg stderr"))?;
        let stderr_thread = thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                match line {
                    Ok(line) if !line.is_empty() => {
                        debug!(target: "ffmpeg_encode_stderr", "{}", line);
                    }
                    Err(e) => {
                        debug!(target: "ffmpeg_encode_stderr", "read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        info!(
            width,
            height,
            fps = %format_rate(config.fps),
            codec = %config.codec,
            crf = config.crf,
            output = %config.output_path.display(),
            "FFmpeg encoder started"
        );

        Ok(Self {
            child,
            stdin: Some(stdin),
            stderr_thread: Some(stderr_thread),
            width,
            height,
            layout,
        })
    }

    fn join_stderr(&mut self) {
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }

    fn kill(&mut self) {
        drop(self.stdin.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.join_stderr();
    }
}

/// Lazily started ffmpeg encoder. Kills ffmpeg on [`Drop`] if neither
/// `finish` nor `discard` ran.
pub struct VideoEncoder {
    config: EncoderConfig,
    process: Option<EncoderProcess>,
    frames_written: u64,
    closed: bool,
}

impl VideoEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self {
            config,
            process: None,
            frames_written: 0,
            closed: false,
        }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl FrameEncoder for VideoEncoder {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if self.closed {
            bail!("encoder already closed");
        }
        if self.process.is_none() {
            self.process = Some(EncoderProcess::spawn(
                &self.config,
                frame.width,
                frame.height,
                frame.layout,
            )?);
        }
        let process = self
            .process
            .as_mut()
            .ok_or_else(|| anyhow!("encoder process not running"))?;

        if (frame.width, frame.height, frame.layout)
            != (process.width, process.height, process.layout)
        {
            bail!(
                "frame {}x{} {} does not match the stream {}x{} {}",
                frame.width,
                frame.height,
                frame.layout,
                process.width,
                process.height,
                process.layout
            );
        }

        let stdin = process
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("encoder stdin already closed"))?;
        stdin
            .write_all(&frame.data)
            .context("failed to write frame to ffmpeg stdin")?;
        self.frames_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<u64> {
        self.closed = true;
        let Some(mut process) = self.process.take() else {
            warn!(
                output = %self.config.output_path.display(),
                "no frames were written, output file not created"
            );
            return Ok(0);
        };

        drop(process.stdin.take());
        let status = process.child.wait().context("failed to wait for ffmpeg")?;
        process.join_stderr();
        if !status.success() {
            bail!("ffmpeg encoder exited with status {}", status);
        }

        debug!(frames = self.frames_written, "FFmpeg encoder finished successfully");
        Ok(self.frames_written)
    }

    fn discard(&mut self) {
        self.closed = true;
        if let Some(mut process) = self.process.take() {
            process.kill();
            let path = &self.config.output_path;
            if path.exists() {
                match std::fs::remove_file(path) {
                    Ok(()) => debug!(path = %path.display(), "removed partial output"),
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial output"),
                }
            }
        }
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn config() -> EncoderConfig {
        EncoderConfig::new("/tmp/out.mp4", 59.94)
    }

    #[test]
    fn test_ffmpeg_args_basic_structure() {
        let args = config().build_ffmpeg_args(205, 115, PixelLayout::Rgba);
        assert_eq!(args[0], "-nostdin");
        assert_eq!(args[1], "-y");
        assert!(args.windows(2).any(|w| w[0] == "-f" && w[1] == "rawvideo"));
        assert!(args.windows(2).any(|w| w[0] == "-s" && w[1] == "205x115"));
        assert!(args.windows(2).any(|w| w[0] == "-r" && w[1] == "59.94"));
        assert!(args.windows(2).any(|w| w[0] == "-c:v" && w[1] == "libx264"));
        assert!(args.windows(2).any(|w| w[0] == "-crf" && w[1] == "18"));
        assert_eq!(args.last().unwrap(), "/tmp/out.mp4");
    }

    #[test]
    fn test_ffmpeg_args_input_and_output_pix_fmt() {
        let args = config().build_ffmpeg_args(8, 8, PixelLayout::Bgra);
        let formats: Vec<&str> = args
            .windows(2)
            .filter(|w| w[0] == "-pix_fmt")
            .map(|w| w[1].as_str())
            .collect();
        assert_eq!(formats, ["bgra", "yuv420p"]);
    }

    #[test]
    fn test_ffmpeg_args_custom_codec() {
        let mut config = config();
        config.codec = "libx265".to_string();
        config.crf = 24;
        let args = config.build_ffmpeg_args(8, 8, PixelLayout::Rgba);
        assert!(args.windows(2).any(|w| w[0] == "-c:v" && w[1] == "libx265"));
        assert!(args.windows(2).any(|w| w[0] == "-crf" && w[1] == "24"));
    }

    #[test]
    fn test_format_rate() {
        assert_eq!(format_rate(60.0), "60");
        assert_eq!(format_rate(59.94), "59.94");
        assert_eq!(format_rate(2.0 * 24000.0 / 1001.0), "47.952048");
    }

    #[test]
    fn test_finish_without_frames_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.mp4");
        let mut encoder = VideoEncoder::new(EncoderConfig::new(&path, 30.0));
        assert_eq!(encoder.finish().unwrap(), 0);
        assert!(!path.exists());
    }

    #[test]
    fn test_write_after_finish_is_rejected() {
        let mut encoder = VideoEncoder::new(EncoderConfig::new(Path::new("/tmp/x.mp4"), 30.0));
        encoder.finish().unwrap();
        let frame = Frame::solid(2, 2, PixelLayout::Rgba, [0, 0, 0]);
        assert!(encoder.write_frame(&frame).is_err());
    }

    #[test]
    #[ignore = "requires ffmpeg on PATH"]
    fn test_encode_and_discard() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.mp4");
        let mut encoder = VideoEncoder::new(EncoderConfig::new(&path, 30.0));
        let frame = Frame::solid(16, 16, PixelLayout::Rgba, [200, 10, 10]);
        for _ in 0..5 {
            encoder.write_frame(&frame).unwrap();
        }
        encoder.discard();
        assert!(!path.exists());
    }
}
