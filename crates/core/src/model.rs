//! Inpainting model variants and the ONNX Runtime implementation of [`InpaintModel`].
//!
//! Every supported model family (E2FGVI, E2FGVI-HQ) consumes a `[1, K, 3, H, W]` batch of
//! masked frames normalized to `[-1, 1]` and returns `[K, 3, H, W]` predictions in the same
//! range. Only the first `neighbor_count` predictions are used.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{arr1, Array4, ArrayD, ArrayView5, Axis, Ix4};
use ort::{session::Session, value::Tensor};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::backend::{build_session, InferenceBackend, SessionConfig};

/// Opaque neural predictor driven by the window scheduler.
pub trait InpaintModel {
    /// `batch` is `[1, K, 3, H, W]` with `H`/`W` already padded; the first
    /// `neighbor_count` of the `K` frames are neighbors. Returns `[K', 3, H, W]` with
    /// `K' >= neighbor_count`.
    fn predict(&mut self, batch: ArrayView5<'_, f32>, neighbor_count: usize)
        -> Result<Array4<f32>>;

    /// Called once after every window. Implementations holding accelerator memory between
    /// calls release it here to bound peak usage on long videos.
    fn release_cache(&mut self) {}
}

impl<M: InpaintModel + ?Sized> InpaintModel for Box<M> {
    fn predict(
        &mut self,
        batch: ArrayView5<'_, f32>,
        neighbor_count: usize,
    ) -> Result<Array4<f32>> {
        (**self).predict(batch, neighbor_count)
    }

    fn release_cache(&mut self) {
        (**self).release_cache()
    }
}

/// Per-variant constants the scheduler needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelSpec {
    pub name: &'static str,
    /// Working size `(width, height)` the variant was trained at, if it requires one.
    pub default_size: Option<(u32, u32)>,
    /// Spatial multiples `(height, width)` the network needs.
    pub pad_multiples: (usize, usize),
    /// Value range of model inputs and outputs, mapped from/to `[0, 255]`.
    pub value_range: (f32, f32),
}

impl ModelSpec {
    pub fn normalize(&self, value: u8) -> f32 {
        let (lo, hi) = self.value_range;
        lo + value as f32 / 255.0 * (hi - lo)
    }

    /// Maps a model output value back to 8 bits. Fractions are truncated, out-of-range
    /// values clamped.
    pub fn denormalize(&self, value: f32) -> u8 {
        let (lo, hi) = self.value_range;
        let scaled = (value - lo) / (hi - lo) * 255.0;
        scaled.clamp(0.0, 255.0) as u8
    }
}

const E2FGVI_SPEC: ModelSpec = ModelSpec {
    name: "e2fgvi",
    default_size: Some((432, 240)),
    pad_multiples: (60, 108),
    value_range: (-1.0, 1.0),
};

const E2FGVI_HQ_SPEC: ModelSpec = ModelSpec {
    name: "e2fgvi_hq",
    default_size: None,
    pad_multiples: (60, 108),
    value_range: (-1.0, 1.0),
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    #[default]
    E2fgvi,
    E2fgviHq,
}

impl ModelVariant {
    pub fn spec(&self) -> ModelSpec {
        match self {
            Self::E2fgvi => E2FGVI_SPEC,
            Self::E2fgviHq => E2FGVI_HQ_SPEC,
        }
    }

    /// Working size `(width, height)` frames are resized to when no explicit size is given.
    pub fn default_size(&self) -> Option<(u32, u32)> {
        self.spec().default_size
    }

    /// Loads an exported checkpoint of this variant.
    pub fn load(
        &self,
        checkpoint: &Path,
        backend: InferenceBackend,
        trt_cache_dir: Option<&Path>,
    ) -> Result<OnnxInpaintModel> {
        if !checkpoint.is_file() {
            bail!("checkpoint not found: {}", checkpoint.display());
        }
        info!(
            model = %self,
            path = %checkpoint.display(),
            %backend,
            "Loading ONNX inpainting model"
        );
        let session = build_session(&SessionConfig {
            model_path: checkpoint,
            backend,
            trt_cache_dir,
        })?;
        let model = OnnxInpaintModel::from_session(session)?;
        info!(fp16 = model.is_fp16, "Model ready");
        Ok(model)
    }
}

impl FromStr for ModelVariant {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "e2fgvi" => Ok(Self::E2fgvi),
            "e2fgvi_hq" => Ok(Self::E2fgviHq),
            other => bail!("unknown model variant '{other}' (expected e2fgvi or e2fgvi_hq)"),
        }
    }
}

impl std::fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.spec().name)
    }
}

/// [`InpaintModel`] backed by an `ort::Session`.
///
/// Graphs with a second input receive the neighbor count there as a 1-element `i64`
/// tensor. FP16 graphs are converted on the way in and out.
pub struct OnnxInpaintModel {
    session: Session,
    frames_input: String,
    count_input: Option<String>,
    output_name: String,
    is_fp16: bool,
}

impl OnnxInpaintModel {
    pub fn from_session(session: Session) -> Result<Self> {
        let Some(first_input) = session.inputs().first() else {
            bail!("ONNX model has no inputs");
        };
        let frames_input = first_input.name().to_string();
        let is_fp16 = match first_input.dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };
        let count_input = session.inputs().get(1).map(|i| i.name().to_string());
        let output_name = session
            .outputs()
            .first()
            .map(|o| o.name().to_string())
            .context("ONNX model has no outputs")?;

        debug!(
            %frames_input, ?count_input, %output_name, is_fp16,
            "Detected model IO"
        );

        Ok(Self {
            session,
            frames_input,
            count_input,
            output_name,
            is_fp16,
        })
    }

    fn run_f32(&mut self, batch: ArrayView5<'_, f32>, count: i64) -> Result<ArrayD<f32>> {
        let input_tensor = Tensor::from_array(batch.as_standard_layout().into_owned())?;
        let count_tensor = Tensor::from_array(arr1(&[count]))?;
        let outputs = match &self.count_input {
            Some(count_name) => self.session.run(ort::inputs![
                self.frames_input.as_str() => &input_tensor,
                count_name.as_str() => &count_tensor
            ])?,
            None => self
                .session
                .run(ort::inputs![self.frames_input.as_str() => &input_tensor])?,
        };
        let output_view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
        Ok(output_view.to_owned())
    }

    fn run_f16(&mut self, batch: ArrayView5<'_, f32>, count: i64) -> Result<ArrayD<f32>> {
        let standard = batch.as_standard_layout();
        let f32_slice = standard
            .as_slice()
            .context("input batch is not contiguous")?;

        let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
        fp16_data.convert_from_f32_slice(f32_slice);
        let fp16_array = ArrayD::from_shape_vec(batch.shape().to_vec(), fp16_data)?;
        let input_tensor = Tensor::from_array(fp16_array)?;

        let count_tensor = Tensor::from_array(arr1(&[count]))?;
        let outputs = match &self.count_input {
            Some(count_name) => self.session.run(ort::inputs![
                self.frames_input.as_str() => &input_tensor,
                count_name.as_str() => &count_tensor
            ])?,
            None => self
                .session
                .run(ort::inputs![self.frames_input.as_str() => &input_tensor])?,
        };
        let output_view = outputs[self.output_name.as_str()].try_extract_array::<f16>()?;
        let fp16_out = output_view.as_standard_layout();
        let fp16_slice = fp16_out
            .as_slice()
            .context("model output is not contiguous")?;
        let mut f32_data = vec![0.0f32; fp16_slice.len()];
        fp16_slice.convert_to_f32_slice(&mut f32_data);
        Ok(ArrayD::from_shape_vec(output_view.shape().to_vec(), f32_data)?)
    }
}

impl InpaintModel for OnnxInpaintModel {
    fn predict(
        &mut self,
        batch: ArrayView5<'_, f32>,
        neighbor_count: usize,
    ) -> Result<Array4<f32>> {
        let count = i64::try_from(neighbor_count).context("neighbor count overflows i64")?;
        let output = if self.is_fp16 {
            self.run_f16(batch, count)?
        } else {
            self.run_f32(batch, count)?
        };
        into_frame_batch(output)
    }
}

/// Accepts `[K, 3, H, W]` or `[1, K, 3, H, W]` model output.
fn into_frame_batch(output: ArrayD<f32>) -> Result<Array4<f32>> {
    let output = match output.ndim() {
        5 if output.shape()[0] == 1 => output.index_axis_move(Axis(0), 0),
        4 => output,
        _ => bail!("unexpected model output shape {:?}", output.shape()),
    };
    Ok(output.into_dimensionality::<Ix4>()?)
}

/// Checks a checkpoint file against an expected hex SHA-256 digest.
pub fn verify_checkpoint(path: &Path, expected_sha256: &str) -> Result<()> {
    let actual = sha256_file(path)?;
    if !actual.eq_ignore_ascii_case(expected_sha256.trim()) {
        bail!(
            "checkpoint {} has sha256 {actual}, expected {}",
            path.display(),
            expected_sha256.trim()
        );
    }
    debug!(path = %path.display(), "Checkpoint checksum verified");
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.write_all(&buf[..n])?;
    }
    let hash = hasher.finalize();
    Ok(format!("{hash:x}"))
}
