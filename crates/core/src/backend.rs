//! Execution provider selection for the inpainting session: CPU, CUDA EP or TensorRT EP.
//!
//! [`build_session`] creates an `ort::Session` with the requested providers and, for
//! TensorRT, an on-disk engine cache.

use std::path::Path;
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{
        builder::{GraphOptimizationLevel, SessionBuilder},
        Session,
    },
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Inference backend selection.
///
/// `Tensorrt` needs the TensorRT runtime (`libnvinfer.so.10` or `nvinfer.dll`); without it
/// the session falls back to CUDA EP, and without CUDA to CPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    Cpu,
    #[default]
    Cuda,
    Tensorrt,
}

impl InferenceBackend {
    /// Parse from string (case-insensitive). Returns `Cuda` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Self::Cpu,
            "tensorrt" | "trt" => Self::Tensorrt,
            _ => Self::Cuda,
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
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

#[derive(Clone, Copy, Debug, Default)]
struct CacheStats {
    file_count: u64,
    total_bytes: u64,
}

fn cache_stats(root: &Path) -> CacheStats {
    let mut stats = CacheStats::default();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(meta) = entry.metadata() {
                stats.file_count += 1;
                stats.total_bytes += meta.len();
            }
        }
    }

    stats
}

/// Logs a heartbeat every [`Self::INTERVAL`] until dropped.
struct InitTicker {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl InitTicker {
    const INTERVAL: Duration = Duration::from_secs(15);

    fn start(label: &'static str) -> Self {
        let (stop, ticks) = channel::<()>();
        let handle = thread::spawn(move || {
            let mut waited = Duration::ZERO;
            while let Err(RecvTimeoutError::Timeout) = ticks.recv_timeout(Self::INTERVAL) {
                waited += Self::INTERVAL;
                info!(elapsed_secs = waited.as_secs(), "{label} still initializing");
            }
        });
        Self {
            stop: Some(stop),
            handle: Some(handle),
        }
    }
}

impl Drop for InitTicker {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Build an `ort::Session` for `config.backend`.
///
/// TensorRT registers the TRT EP with engine caching and CUDA EP behind it.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    match config.backend {
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session with CPU EP");
            commit(builder, config.model_path)
        }
        InferenceBackend::Cuda => {
            if !CUDAExecutionProvider::default().is_available().unwrap_or(false) {
                warn!("CUDA EP is not available, inference will fall back to CPU");
            }
            debug!(backend = "cuda", "Building session with CUDA EP");
            let builder =
                builder.with_execution_providers([CUDAExecutionProvider::default().build()])?;
            commit(builder, config.model_path)
        }
        InferenceBackend::Tensorrt => build_tensorrt_session(builder, config),
    }
}

fn commit(mut builder: SessionBuilder, model_path: &Path) -> Result<Session> {
    builder
        .commit_from_file(model_path)
        .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))
}

/// Engine builds for a video model can take minutes on first run, so progress is
/// logged while the session commits.
fn build_tensorrt_session(builder: SessionBuilder, config: &SessionConfig<'_>) -> Result<Session> {
    let cache_dir = config.trt_cache_dir.unwrap_or_else(|| Path::new("trt_cache"));
    if let Err(e) = std::fs::create_dir_all(cache_dir) {
        warn!(dir = %cache_dir.display(), error = %e, "Failed to create TRT cache directory");
    }

    let before = cache_stats(cache_dir);
    info!(
        cache_dir = %cache_dir.display(),
        cache_files = before.file_count,
        cache_bytes = before.total_bytes,
        "Initializing TensorRT session (first run may take several minutes)"
    );

    let started = Instant::now();
    let result = {
        let _ticker = InitTicker::start("TensorRT session");
        let trt = TensorRTExecutionProvider::default()
            .with_engine_cache(true)
            .with_engine_cache_path(cache_dir.to_string_lossy())
            .with_fp16(true)
            .with_device_id(0)
            .build();
        builder
            .with_execution_providers([trt, CUDAExecutionProvider::default().build()])
            .map_err(anyhow::Error::from)
            .and_then(|builder| commit(builder, config.model_path))
    };
    let elapsed_secs = started.elapsed().as_secs_f64();

    match result {
        Ok(session) => {
            let after = cache_stats(cache_dir);
            info!(
                elapsed_secs,
                engine_built = after.total_bytes != before.total_bytes,
                cache_files = after.file_count,
                "TensorRT session ready"
            );
            Ok(session)
        }
        Err(e) => {
            error!(
                elapsed_secs,
                cache_dir = %cache_dir.display(),
                error = %e,
                "TensorRT session initialization failed"
            );
            Err(e)
        }
    }
}
