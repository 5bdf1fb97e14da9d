//! Execution provider selection for the kernel-prediction network.
//!
//! [`build_session`] creates an `ort::Session` for the requested backend. The
//! TensorRT path registers CUDA as a fallback and caches built engines under
//! a per-model directory, because an engine build can take minutes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const TRT_PROGRESS_TICK: Duration = Duration::from_secs(15);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    /// ONNX Runtime's default CPU provider.
    Cpu,
    #[default]
    Cuda,
    /// TensorRT with CUDA fallback. Needs the TensorRT runtime libraries.
    Tensorrt,
}

impl InferenceBackend {
    /// Case-insensitive parse; unknown values map to `Cuda`.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Self::Cpu,
            "tensorrt" | "trt" => Self::Tensorrt,
            _ => Self::Cuda,
        }
    }
}

impl fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
}

/// Engine cache directory for one model file, so engines built for different
/// tiers never overwrite each other.
pub fn trt_cache_dir_for(base_dir: &Path, model_path: &Path) -> PathBuf {
    let stem = model_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".to_string());
    base_dir.join(stem)
}

fn count_cache_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| e.path().is_file())
                .count()
        })
        .unwrap_or(0)
}

pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let model_path = config.model_path;
    let load_context = || format!("failed to load ONNX model: {}", model_path.display());

    match config.backend {
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "building session with the default CPU provider");
            builder.commit_from_file(model_path).with_context(load_context)
        }
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available, inference will fall back to CPU");
            }
            debug!(backend = "cuda", "building session with CUDA EP");
            builder
                .with_execution_providers([cuda.build()])?
                .commit_from_file(model_path)
                .with_context(load_context)
        }
        InferenceBackend::Tensorrt => {
            let base = config
                .trt_cache_dir
                .unwrap_or_else(|| Path::new("trt_cache"));
            let cache_dir = trt_cache_dir_for(base, model_path);
            if let Err(e) = std::fs::create_dir_all(&cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "failed to create TensorRT cache directory"
                );
            }
            let cached_before = count_cache_files(&cache_dir);
            info!(
                cache_dir = %cache_dir.display(),
                cached_engines = cached_before,
                "initializing TensorRT session (an uncached engine build may take several minutes)"
            );

            let started = Instant::now();
            let (stop_tx, stop_rx) = channel::<()>();
            let ticker = thread::spawn(move || {
                let mut waited = TRT_PROGRESS_TICK;
                while let Err(RecvTimeoutError::Timeout) =
                    stop_rx.recv_timeout(TRT_PROGRESS_TICK)
                {
                    info!(
                        elapsed_secs = waited.as_secs(),
                        "TensorRT engine build still in progress"
                    );
                    waited += TRT_PROGRESS_TICK;
                }
            });

            let cache_path = cache_dir.to_string_lossy().to_string();
            let result = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(model_path)
                .with_context(load_context);

            let _ = stop_tx.send(());
            let _ = ticker.join();

            let session = result?;
            let cached_after = count_cache_files(&cache_dir);
            info!(
                elapsed_secs = format!("{:.1}", started.elapsed().as_secs_f64()),
                engine_cache_updated = cached_after > cached_before,
                "TensorRT session ready"
            );
            Ok(session)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_from_str_lossy() {
        assert_eq!(InferenceBackend::from_str_lossy("CPU"), InferenceBackend::Cpu);
        assert_eq!(InferenceBackend::from_str_lossy("cuda"), InferenceBackend::Cuda);
        assert_eq!(
            InferenceBackend::from_str_lossy(" TensorRT "),
            InferenceBackend::Tensorrt
        );
        assert_eq!(InferenceBackend::from_str_lossy("trt"), InferenceBackend::Tensorrt);
        assert_eq!(InferenceBackend::from_str_lossy("metal"), InferenceBackend::Cuda);
    }

    #[test]
    fn test_backend_display_round_trips() {
        for backend in [
            InferenceBackend::Cpu,
            InferenceBackend::Cuda,
            InferenceBackend::Tensorrt,
        ] {
            assert_eq!(InferenceBackend::from_str_lossy(&backend.to_string()), backend);
        }
    }

    #[test]
    fn test_trt_cache_dir_is_per_model() {
        let base = Path::new("trt_cache");
        assert_eq!(
            trt_cache_dir_for(base, Path::new("models/SepConvPartialNetwork512.onnx")),
            PathBuf::from("trt_cache/SepConvPartialNetwork512")
        );
    }
}
