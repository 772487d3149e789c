//! End-to-end inpainting job: load frames and masks, run every window, then encode.
//!
//! The output sink is only opened once all windows have been predicted and finalized,
//! so a failed run never leaves a partial video behind.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::backend::InferenceBackend;
use crate::error::InpaintError;
use crate::media::images::{load_frames, FrameSource};
use crate::media::masks::{load_masks, MaskOptions};
use crate::media::video_output::{verify_output, EncoderConfig, VideoEncoder};
use crate::model::{verify_checkpoint, InpaintModel, ModelSpec, ModelVariant};
use crate::schedule::{ScheduleParams, WindowProgress, WindowScheduler};
use crate::types::{FrameStore, RgbFrame};

/// Consumer of finalized frames, written in index order.
pub trait FrameSink {
    fn write_frame(&mut self, frame: &RgbFrame) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

impl<S: FrameSink + ?Sized> FrameSink for &mut S {
    fn write_frame(&mut self, frame: &RgbFrame) -> Result<()> {
        (**self).write_frame(frame)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

/// Everything needed to inpaint one video.
#[derive(Debug, Clone)]
pub struct InpaintJob {
    /// Video file or directory of frame images.
    pub input: PathBuf,
    pub checkpoint: PathBuf,
    pub checkpoint_sha256: Option<String>,
    pub mask_dir: PathBuf,
    pub output: PathBuf,
    pub variant: ModelVariant,
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<PathBuf>,
    pub schedule: ScheduleParams,
    pub mask: MaskOptions,
    /// Explicit working size `(width, height)`; ignored by variants with a fixed size.
    pub size: Option<(u32, u32)>,
    pub fps: f64,
    pub codec: String,
    pub crf: u32,
    pub pixel_format: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobSummary {
    pub frames: usize,
    pub windows: usize,
    pub width: u32,
    pub height: u32,
    pub elapsed_secs: f64,
}

/// The variant's fixed working size, else the explicit size, else `None` (keep the source
/// size).
pub fn working_size(spec: &ModelSpec, explicit: Option<(u32, u32)>) -> Option<(u32, u32)> {
    match (spec.default_size, explicit) {
        (Some(fixed), Some(requested)) => {
            if fixed != requested {
                warn!(
                    model = spec.name,
                    requested = ?requested,
                    used = ?fixed,
                    "Model requires a fixed working size, ignoring --width/--height"
                );
            }
            Some(fixed)
        }
        (fixed, requested) => fixed.or(requested),
    }
}

/// Uses `checkpoint` as given when it exists, otherwise looks it up under `models_dir`.
pub fn resolve_checkpoint(models_dir: &Path, checkpoint: &Path) -> PathBuf {
    if checkpoint.is_file() || checkpoint.is_absolute() {
        return checkpoint.to_path_buf();
    }
    let candidate = models_dir.join(checkpoint);
    if candidate.is_file() {
        candidate
    } else {
        checkpoint.to_path_buf()
    }
}

/// Runs every window over `store` and returns the finalized frames.
pub fn inpaint_store<M, F>(
    store: &FrameStore,
    model: &mut M,
    params: ScheduleParams,
    spec: ModelSpec,
    on_window: F,
) -> Result<Vec<RgbFrame>, InpaintError>
where
    M: InpaintModel + ?Sized,
    F: FnMut(WindowProgress),
{
    WindowScheduler::new(store, params, spec)?.run(model, on_window)
}

/// Writes `frames` in order and closes the sink. Returns the number written.
pub fn write_frames<S: FrameSink + ?Sized>(sink: &mut S, frames: &[RgbFrame]) -> Result<usize> {
    for (index, frame) in frames.iter().enumerate() {
        sink.write_frame(frame)
            .with_context(|| format!("failed to write frame {index}"))?;
    }
    sink.finish()?;
    Ok(frames.len())
}

/// Inpaints `store` and hands the result to a sink created by `open_sink`.
///
/// `open_sink` is not called unless every window succeeded.
pub fn inpaint_into<M, S, O, F>(
    store: &FrameStore,
    model: &mut M,
    params: ScheduleParams,
    spec: ModelSpec,
    open_sink: O,
    on_window: F,
) -> Result<usize>
where
    M: InpaintModel + ?Sized,
    S: FrameSink,
    O: FnOnce() -> Result<S>,
    F: FnMut(WindowProgress),
{
    let frames = inpaint_store(store, model, params, spec, on_window)?;
    let mut sink = open_sink()?;
    write_frames(&mut sink, &frames)
}

fn validate_job(job: &InpaintJob) -> Result<()> {
    job.schedule.validate()?;
    if !(job.fps.is_finite() && job.fps > 0.0) {
        return Err(
            InpaintError::InvalidConfig(format!("fps must be positive, got {}", job.fps)).into(),
        );
    }
    if let Some((width, height)) = job.size {
        if width == 0 || height == 0 {
            return Err(
                InpaintError::InvalidConfig(format!("invalid size {width}x{height}")).into(),
            );
        }
    }
    if !job.mask_dir.is_dir() {
        return Err(InpaintError::InvalidInput(format!(
            "mask directory does not exist: {}",
            job.mask_dir.display()
        ))
        .into());
    }
    if !job.checkpoint.is_file() {
        return Err(InpaintError::InvalidInput(format!(
            "checkpoint not found: {}",
            job.checkpoint.display()
        ))
        .into());
    }
    Ok(())
}

/// Load, inpaint and encode according to `job`.
pub fn run_job<F>(job: &InpaintJob, mut on_window: F) -> Result<JobSummary>
where
    F: FnMut(WindowProgress),
{
    let started = Instant::now();
    validate_job(job)?;

    let spec = job.variant.spec();
    let source = FrameSource::detect(&job.input)?;
    let size = working_size(&spec, job.size);
    info!(
        input = %source.path().display(),
        model = %job.variant,
        size = ?size,
        "Loading frames"
    );

    let loaded = load_frames(&source, size)?;
    let Some(first) = loaded.frames.first() else {
        bail!(InpaintError::InvalidInput(format!(
            "no frames in {}",
            source.path().display()
        )));
    };
    let (width, height) = first.dimensions();
    if let Some(source_fps) = loaded.fps {
        if (source_fps - job.fps).abs() > 0.01 {
            debug!(source_fps, output_fps = job.fps, "Output frame rate differs from source");
        }
    }

    let masks = load_masks(&job.mask_dir, (width, height), job.mask)?;
    let store = FrameStore::new(loaded.frames, masks)?;
    info!(frames = store.len(), width, height, "Frames and masks loaded");

    if let Some(expected) = job.checkpoint_sha256.as_deref() {
        verify_checkpoint(&job.checkpoint, expected)?;
    }
    let mut model = job
        .variant
        .load(&job.checkpoint, job.backend, job.trt_cache_dir.as_deref())?;

    let encoder_config = EncoderConfig {
        output_path: job.output.clone(),
        codec: job.codec.clone(),
        crf: job.crf,
        pixel_format: job.pixel_format.clone(),
        width,
        height,
        fps: job.fps,
    };

    let mut windows = 0;
    let written = inpaint_into(
        &store,
        &mut model,
        job.schedule,
        spec,
        || VideoEncoder::new(&encoder_config),
        |progress| {
            windows = progress.total;
            on_window(progress);
        },
    )?;

    if let Err(e) = verify_output(&job.output, width, height) {
        warn!(error = %e, "Output verification failed");
    }

    let summary = JobSummary {
        frames: written,
        windows,
        width,
        height,
        elapsed_secs: started.elapsed().as_secs_f64(),
    };
    info!(
        frames = summary.frames,
        windows = summary.windows,
        elapsed_secs = format!("{:.1}", summary.elapsed_secs),
        output = %job.output.display(),
        "Inpainting finished"
    );
    Ok(summary)
}
