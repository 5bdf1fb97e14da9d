use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, warn};

const FALLBACK_FPS: f64 = 30.0;

#[derive(serde::Deserialize, Debug)]
pub struct FfprobeOutput {
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: Option<FfprobeFormat>,
}

#[derive(serde::Deserialize, Debug)]
struct FfprobeStream {
    index: usize,
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    /// Container-reported frame count, absent for many formats.
    nb_frames: Option<String>,
    duration: Option<String>,
    #[serde(default)]
    disposition: HashMap<String, serde_json::Value>,
    #[serde(default)]
    tags: HashMap<String, String>,
    #[serde(default)]
    side_data_list: Vec<FfprobeSideData>,
}

#[derive(serde::Deserialize, Debug)]
struct FfprobeSideData {
    rotation: Option<f64>,
}

#[derive(serde::Deserialize, Debug)]
struct FfprobeFormat {
    duration: Option<String>,
}

/// Parses `"num/den"` or a plain decimal rate.
pub fn parse_frame_rate(s: &str) -> Option<f64> {
    let parts: Vec<&str> = s.split('/').collect();
    if parts.len() == 2 {
        let num: f64 = parts[0].parse().ok()?;
        let den: f64 = parts[1].parse().ok()?;
        if den > 0.0 {
            return Some(num / den);
        }
        return None;
    }
    s.parse().ok()
}

fn disposition_flag(stream: &FfprobeStream, key: &str) -> bool {
    stream
        .disposition
        .get(key)
        .and_then(|value| {
            value
                .as_bool()
                .or_else(|| value.as_i64().map(|n| n != 0))
                .or_else(|| value.as_str().map(|s| s != "0"))
        })
        .unwrap_or(false)
}

/// Display rotation in degrees, normalized to 0, 90, 180 or 270. Read from
/// the display matrix side data, or the legacy `rotate` tag.
fn stream_rotation(stream: &FfprobeStream) -> u32 {
    let degrees = stream
        .side_data_list
        .iter()
        .find_map(|side_data| side_data.rotation)
        .or_else(|| stream.tags.get("rotate").and_then(|r| r.trim().parse().ok()))
        .unwrap_or(0.0);
    let quarter_turns = (degrees / 90.0).round() as i64;
    (quarter_turns.rem_euclid(4) * 90) as u32
}

/// Real video track preferred over cover art, default track over others.
fn select_primary_video_stream(streams: &[FfprobeStream]) -> Option<&FfprobeStream> {
    streams
        .iter()
        .filter(|stream| stream.codec_type.as_deref() == Some("video"))
        .min_by_key(|stream| {
            let is_attached_picture = disposition_flag(stream, "attached_pic");
            let is_default = disposition_flag(stream, "default");
            (is_attached_picture, !is_default, stream.index)
        })
}

pub fn run_ffprobe(path: &Path) -> Result<FfprobeOutput> {
    let output = crate::runtime::command_for("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("failed to execute ffprobe, is FFmpeg installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        );
    }

    parse_ffprobe_json(&output.stdout)
}

pub fn parse_ffprobe_json(json: &[u8]) -> Result<FfprobeOutput> {
    serde_json::from_slice(json).context("failed to parse ffprobe JSON output")
}

/// What the run needs to know about the input video.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoProbe {
    pub stream_index: usize,
    /// Display width. ffmpeg applies the stream rotation while decoding, so
    /// this is the decoded frame width, not the coded one.
    pub width: u32,
    pub height: u32,
    pub rotation: u32,
    /// Nominal frames per second.
    pub fps: f64,
    pub duration_secs: Option<f64>,
    pub frame_count: Option<u64>,
}

impl VideoProbe {
    pub fn from_ffprobe(probe: &FfprobeOutput) -> Result<Self> {
        let stream = select_primary_video_stream(&probe.streams)
            .ok_or_else(|| anyhow!("no video stream found"))?;

        let coded_width = stream
            .width
            .ok_or_else(|| anyhow!("video stream missing width"))?;
        let coded_height = stream
            .height
            .ok_or_else(|| anyhow!("video stream missing height"))?;
        let rotation = stream_rotation(stream);
        let (width, height) = if rotation % 180 == 90 {
            (coded_height, coded_width)
        } else {
            (coded_width, coded_height)
        };

        let fps_str = stream
            .r_frame_rate
            .as_deref()
            .or(stream.avg_frame_rate.as_deref())
            .unwrap_or("0/0");
        let fps = match parse_frame_rate(fps_str) {
            Some(fps) if fps > 0.0 => fps,
            _ => {
                warn!("could not determine frame rate (got {fps_str}), defaulting to {FALLBACK_FPS}");
                FALLBACK_FPS
            }
        };

        let duration_secs = stream
            .duration
            .as_deref()
            .or_else(|| probe.format.as_ref().and_then(|f| f.duration.as_deref()))
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|d| *d > 0.0);

        let frame_count = stream
            .nb_frames
            .as_deref()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|n| *n > 0)
            .or_else(|| duration_secs.map(|d| (d * fps).round() as u64));

        Ok(Self {
            stream_index: stream.index,
            width,
            height,
            rotation,
            fps,
            duration_secs,
            frame_count,
        })
    }
}

/// Probes `path` with ffprobe.
pub fn probe_video(path: &Path) -> Result<VideoProbe> {
    if !path.exists() {
        bail!("input file does not exist: {}", path.display());
    }
    debug!(path = %path.display(), "running ffprobe");
    let output = run_ffprobe(path)?;
    let probe = VideoProbe::from_ffprobe(&output)
        .with_context(|| format!("unusable video: {}", path.display()))?;
    debug!(
        stream_index = probe.stream_index,
        width = probe.width,
        height = probe.height,
        rotation = probe.rotation,
        fps = probe.fps,
        frame_count = ?probe.frame_count,
        "video input probed"
    );
    Ok(probe)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_FFPROBE_JSON: &str = r#"{
        "streams": [
            {
                "index": 0,
                "codec_name": "h264",
                "codec_type": "video",
                "width": 1280,
                "height": 720,
                "r_frame_rate": "30000/1001",
                "avg_frame_rate": "30000/1001",
                "nb_frames": "300",
                "duration": "10.010000",
                "disposition": {"default": 1, "attached_pic": 0}
            },
            {
                "index": 1,
                "codec_name": "aac",
                "codec_type": "audio",
                "disposition": {"default": 1}
            }
        ],
        "format": {"duration": "10.030000"}
    }"#;

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate("30/1"), Some(30.0));
        assert!((parse_frame_rate("24000/1001").unwrap() - 23.976).abs() < 0.001);
        assert_eq!(parse_frame_rate("25"), Some(25.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("abc"), None);
    }

    #[test]
    fn test_probe_from_sample_json() {
        let output = parse_ffprobe_json(SAMPLE_FFPROBE_JSON.as_bytes()).unwrap();
        let probe = VideoProbe::from_ffprobe(&output).unwrap();
        assert_eq!(probe.stream_index, 0);
        assert_eq!((probe.width, probe.height), (1280, 720));
        assert_eq!(probe.rotation, 0);
        assert!((probe.fps - 29.97).abs() < 0.01);
        assert_eq!(probe.frame_count, Some(300));
        assert_eq!(probe.duration_secs, Some(10.01));
    }

    #[test]
    fn test_frame_count_estimated_from_duration() {
        let json = r#"{
            "streams": [{
                "index": 0, "codec_type": "video", "width": 64, "height": 48,
                "r_frame_rate": "25/1"
            }],
            "format": {"duration": "2.0"}
        }"#;
        let output = parse_ffprobe_json(json.as_bytes()).unwrap();
        let probe = VideoProbe::from_ffprobe(&output).unwrap();
        assert_eq!(probe.duration_secs, Some(2.0));
        assert_eq!(probe.frame_count, Some(50));
    }

    #[test]
    fn test_missing_frame_rate_uses_fallback() {
        let json = r#"{
            "streams": [{"index": 0, "codec_type": "video", "width": 8, "height": 8}]
        }"#;
        let output = parse_ffprobe_json(json.as_bytes()).unwrap();
        let probe = VideoProbe::from_ffprobe(&output).unwrap();
        assert_eq!(probe.fps, FALLBACK_FPS);
        assert_eq!(probe.frame_count, None);
    }

    #[test]
    fn test_prefers_real_video_over_attached_picture() {
        let json = r#"{
            "streams": [
                {"index": 0, "codec_type": "video", "width": 600, "height": 600,
                 "disposition": {"attached_pic": 1, "default": 1}},
                {"index": 1, "codec_type": "video", "width": 320, "height": 240,
                 "r_frame_rate": "24/1", "disposition": {"attached_pic": 0, "default": 0}}
            ]
        }"#;
        let output = parse_ffprobe_json(json.as_bytes()).unwrap();
        let probe = VideoProbe::from_ffprobe(&output).unwrap();
        assert_eq!(probe.stream_index, 1);
        assert_eq!(probe.width, 320);
    }

    #[test]
    fn test_display_matrix_rotation_swaps_dimensions() {
        let json = r#"{
            "streams": [{
                "index": 0, "codec_type": "video", "width": 1920, "height": 1080,
                "r_frame_rate": "30/1",
                "side_data_list": [
                    {"side_data_type": "Display Matrix", "displaymatrix": "...", "rotation": -90}
                ]
            }]
        }"#;
        let output = parse_ffprobe_json(json.as_bytes()).unwrap();
        let probe = VideoProbe::from_ffprobe(&output).unwrap();
        assert_eq!(probe.rotation, 270);
        assert_eq!((probe.width, probe.height), (1080, 1920));
    }

    #[test]
    fn test_rotate_tag_and_half_turn() {
        let json = r#"{
            "streams": [
                {"index": 0, "codec_type": "video", "width": 640, "height": 480,
                 "tags": {"rotate": "90"}}
            ]
        }"#;
        let probe = VideoProbe::from_ffprobe(&parse_ffprobe_json(json.as_bytes()).unwrap()).unwrap();
        assert_eq!(probe.rotation, 90);
        assert_eq!((probe.width, probe.height), (480, 640));

        let json = r#"{
            "streams": [
                {"index": 0, "codec_type": "video", "width": 640, "height": 480,
                 "side_data_list": [{"rotation": 180}]}
            ]
        }"#;
        let probe = VideoProbe::from_ffprobe(&parse_ffprobe_json(json.as_bytes()).unwrap()).unwrap();
        assert_eq!(probe.rotation, 180);
        assert_eq!((probe.width, probe.height), (640, 480));
    }

    #[test]
    fn test_no_video_stream_error() {
        let json = r#"{"streams": [{"index": 0, "codec_type": "audio"}]}"#;
        let output = parse_ffprobe_json(json.as_bytes()).unwrap();
        let err = VideoProbe::from_ffprobe(&output).unwrap_err();
        assert!(err.to_string().contains("no video stream"));
    }

    #[test]
    fn test_probe_video_missing_file() {
        let err = probe_video(Path::new("/nonexistent/input.mp4")).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
