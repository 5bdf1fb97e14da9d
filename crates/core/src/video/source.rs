use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, ChildStdout, Stdio};
use std::thread;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};

use super::probe::VideoProbe;
use crate::types::{Frame, PixelLayout};

/// Sequential frame provider with increasing presentation time.
pub trait FrameSource: Send {
    /// True once no further pair can be produced.
    fn is_done(&self) -> bool;

    /// Returns `(previous, next)` where `previous` is the frame returned as
    /// `next` by the prior call. The first call reads two frames.
    fn next_frame_pair(&mut self) -> Result<Option<(Frame, Frame)>>;

    /// Nominal source frame rate.
    fn frame_rate(&self) -> f64;

    fn frame_count(&self) -> Option<u64>;
}

/// Pairs fixed-size packed frames read from any byte stream.
pub struct RawFrameSource<R> {
    reader: R,
    width: u32,
    height: u32,
    layout: PixelLayout,
    fps: f64,
    frame_count: Option<u64>,
    frame_size: usize,
    buf: Vec<u8>,
    latest: Option<Frame>,
    exhausted: bool,
    frames_read: u64,
}

impl<R: Read> RawFrameSource<R> {
    pub fn new(
        reader: R,
        width: u32,
        height: u32,
        layout: PixelLayout,
        fps: f64,
        frame_count: Option<u64>,
    ) -> Self {
        let frame_size = Frame::byte_len(width, height);
        Self {
            reader,
            width,
            height,
            layout,
            fps,
            frame_count,
            frame_size,
            buf: vec![0u8; frame_size],
            latest: None,
            exhausted: false,
            frames_read: 0,
        }
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        let mut total_read = 0;
        while total_read < self.frame_size {
            match self.reader.read(&mut self.buf[total_read..self.frame_size]) {
                Ok(0) => {
                    if total_read > 0 {
                        warn!(
                            "partial frame at EOF ({total_read}/{} bytes), discarding",
                            self.frame_size
                        );
                    }
                    return Ok(None);
                }
                Ok(n) => total_read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("failed to read decoded frame"),
            }
        }

        self.frames_read += 1;
        let frame = Frame::new(
            self.buf[..self.frame_size].to_vec(),
            self.width,
            self.height,
            self.layout,
        )?;
        Ok(Some(frame))
    }

    fn next_or_exhaust(&mut self) -> Result<Option<Frame>> {
        match self.read_frame() {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => {
                self.exhausted = true;
                Ok(None)
            }
            Err(e) => {
                self.exhausted = true;
                Err(e)
            }
        }
    }
}

impl<R: Read + Send> FrameSource for RawFrameSource<R> {
    fn is_done(&self) -> bool {
        self.exhausted
    }

    fn next_frame_pair(&mut self) -> Result<Option<(Frame, Frame)>> {
        if self.exhausted {
            return Ok(None);
        }
        let previous = match self.latest.take() {
            Some(frame) => frame,
            None => match self.next_or_exhaust()? {
                Some(frame) => frame,
                None => return Ok(None),
            },
        };
        match self.next_or_exhaust()? {
            Some(next) => {
                self.latest = Some(next.clone());
                Ok(Some((previous, next)))
            }
            None => Ok(None),
        }
    }

    fn frame_rate(&self) -> f64 {
        self.fps
    }

    fn frame_count(&self) -> Option<u64> {
        self.frame_count
    }
}

pub fn build_decoder_args(path: &Path, layout: PixelLayout, stream_index: usize) -> Vec<String> {
    vec![
        "-nostdin".to_string(),
        // Frames come out display-oriented, matching `VideoProbe` dimensions.
        "-autorotate".to_string(),
        "-i".to_string(),
        path.to_string_lossy().into_owned(),
        "-map".to_string(),
        format!("0:{stream_index}"),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        layout.ffmpeg_pix_fmt().to_string(),
        "-vsync".to_string(),
        "cfr".to_string(),
        "-v".to_string(),
        "error".to_string(),
        "pipe:1".to_string(),
    ]
}

/// Decodes a video file through an ffmpeg subprocess. Drains stderr on a
/// background thread and kills ffmpeg on [`Drop`].
pub struct FfmpegFrameSource {
    child: Child,
    frames: RawFrameSource<ChildStdout>,
    stderr_thread: Option<thread::JoinHandle<()>>,
}

impl FfmpegFrameSource {
    pub fn open(path: &Path, probe: &VideoProbe) -> Result<Self> {
        let layout = PixelLayout::Rgba;
        let args = build_decoder_args(path, layout, probe.stream_index);
        debug!(
            cmd = %format!("ffmpeg {}", args.join(" ")),
            "launching FFmpeg decoder"
        );

        let mut child = crate::runtime::command_for("ffmpeg")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg, is it installed?")?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stdout not available"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stderr not available"))?;
        let stderr_thread = thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                match line {
                    Ok(line) if !line.is_empty() => {
                        debug!(target: "ffmpeg_decode_stderr", "{}", line);
                    }
                    Err(e) => {
                        debug!(target: "ffmpeg_decode_stderr", "read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        Ok(Self {
            child,
            frames: RawFrameSource::new(
                stdout,
                probe.width,
                probe.height,
                layout,
                probe.fps,
                probe.frame_count,
            ),
            stderr_thread: Some(stderr_thread),
        })
    }
}

impl FrameSource for FfmpegFrameSource {
    fn is_done(&self) -> bool {
        self.frames.is_done()
    }

    fn next_frame_pair(&mut self) -> Result<Option<(Frame, Frame)>> {
        let pair = self.frames.next_frame_pair()?;
        if pair.is_none() {
            let status = self.child.wait().context("failed to wait for ffmpeg")?;
            if !status.success() {
                anyhow::bail!(
                    "ffmpeg decoder exited with status {status} after {} frames",
                    self.frames.frames_read()
                );
            }
        }
        Ok(pair)
    }

    fn frame_rate(&self) -> f64 {
        self.frames.frame_rate()
    }

    fn frame_count(&self) -> Option<u64> {
        self.frames.frame_count()
    }
}

impl Drop for FfmpegFrameSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn stream_of(values: &[u8], width: u32, height: u32) -> RawFrameSource<Cursor<Vec<u8>>> {
        let frame_len = Frame::byte_len(width, height);
        let bytes: Vec<u8> = values
            .iter()
            .flat_map(|&v| std::iter::repeat(v).take(frame_len))
            .collect();
        RawFrameSource::new(
            Cursor::new(bytes),
            width,
            height,
            PixelLayout::Rgba,
            24.0,
            Some(values.len() as u64),
        )
    }

    #[test]
    fn test_pairs_share_the_middle_frame() {
        let mut source = stream_of(&[1, 2, 3], 2, 2);
        let (a, b) = source.next_frame_pair().unwrap().unwrap();
        assert_eq!((a.data[0], b.data[0]), (1, 2));
        assert!(!source.is_done());
        let (a, b) = source.next_frame_pair().unwrap().unwrap();
        assert_eq!((a.data[0], b.data[0]), (2, 3));
        assert!(source.next_frame_pair().unwrap().is_none());
        assert!(source.is_done());
        assert!(source.next_frame_pair().unwrap().is_none());
        assert_eq!(source.frames_read(), 3);
    }

    #[test]
    fn test_single_frame_yields_no_pair() {
        let mut source = stream_of(&[9], 3, 1);
        assert!(source.next_frame_pair().unwrap().is_none());
        assert!(source.is_done());
    }

    #[test]
    fn test_partial_trailing_frame_is_dropped() {
        let mut bytes = vec![5u8; 16];
        bytes.extend([6u8; 16]);
        bytes.extend([7u8; 5]);
        let mut source = RawFrameSource::new(
            Cursor::new(bytes),
            2,
            2,
            PixelLayout::Rgba,
            30.0,
            None,
        );
        assert!(source.next_frame_pair().unwrap().is_some());
        assert!(source.next_frame_pair().unwrap().is_none());
        assert_eq!(source.frames_read(), 2);
    }

    #[test]
    fn test_reports_rate_and_count() {
        let source = stream_of(&[1, 2], 1, 1);
        assert_eq!(source.frame_rate(), 24.0);
        assert_eq!(source.frame_count(), Some(2));
    }

    #[test]
    fn test_decoder_args() {
        let args = build_decoder_args(Path::new("/tmp/in.mov"), PixelLayout::Rgba, 2);
        assert_eq!(args[0], "-nostdin");
        let autorotate = args.iter().position(|a| a == "-autorotate").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(autorotate < input, "autorotate must be an input option");
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "/tmp/in.mov"));
        assert!(args.windows(2).any(|w| w[0] == "-map" && w[1] == "0:2"));
        assert!(args.windows(2).any(|w| w[0] == "-pix_fmt" && w[1] == "rgba"));
        assert_eq!(args.last().unwrap(), "pipe:1");
    }

    #[test]
    #[ignore = "requires ffmpeg and a sample video at data/sample.mp4"]
    fn test_ffmpeg_source_reads_pairs() {
        let path = Path::new("data/sample.mp4");
        let probe = crate::video::probe_video(path).unwrap();
        let mut source = FfmpegFrameSource::open(path, &probe).unwrap();
        let (a, b) = source.next_frame_pair().unwrap().unwrap();
        assert_eq!((a.width, a.height), (probe.width, probe.height));
        assert_eq!(b.layout, PixelLayout::Rgba);
    }
}
