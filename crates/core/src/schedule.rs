//! Overlapping window scheduling and the per-window inference loop.
//!
//! Windows start at `0, s, 2s, ..` for neighbor stride `s` and each covers the neighbors
//! `[f - s, f + s]`, so interior frames are predicted by two or three windows. Their
//! predictions are fused by the [`Compositor`] in window order.

use ndarray::{Array4, Array5, Axis};
use tracing::{debug, info};

use crate::compositor::Compositor;
use crate::error::InpaintError;
use crate::model::{InpaintModel, ModelSpec};
use crate::padding::{crop_spatial, pad_spatial};
use crate::sampler::{neighbor_ids, select_references, ReferenceLimit};
use crate::types::{FrameStore, RgbFrame};

pub const DEFAULT_NEIGHBOR_STRIDE: usize = 5;
pub const DEFAULT_REFERENCE_STEP: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleParams {
    /// Window spacing and neighbor radius.
    pub neighbor_stride: usize,
    /// Spacing of reference frames.
    pub reference_step: usize,
    pub reference_limit: ReferenceLimit,
}

impl Default for ScheduleParams {
    fn default() -> Self {
        Self {
            neighbor_stride: DEFAULT_NEIGHBOR_STRIDE,
            reference_step: DEFAULT_REFERENCE_STEP,
            reference_limit: ReferenceLimit::Unbounded,
        }
    }
}

impl ScheduleParams {
    pub fn validate(&self) -> Result<(), InpaintError> {
        if self.neighbor_stride == 0 {
            return Err(InpaintError::InvalidConfig(
                "neighbor_stride must be at least 1".to_string(),
            ));
        }
        if self.reference_step == 0 {
            return Err(InpaintError::InvalidConfig(
                "step must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// One inference unit: neighbors first, then references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub start: usize,
    pub neighbor_ids: Vec<usize>,
    pub reference_ids: Vec<usize>,
}

impl Window {
    /// Batch order fed to the model.
    pub fn frame_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.neighbor_ids
            .iter()
            .chain(self.reference_ids.iter())
            .copied()
    }

    pub fn neighbor_count(&self) -> usize {
        self.neighbor_ids.len()
    }

    pub fn batch_len(&self) -> usize {
        self.neighbor_ids.len() + self.reference_ids.len()
    }
}

/// All windows for a video of `len` frames, in processing order.
pub fn plan_windows(len: usize, params: &ScheduleParams) -> Result<Vec<Window>, InpaintError> {
    params.validate()?;
    let windows = (0..len)
        .step_by(params.neighbor_stride)
        .map(|start| {
            let neighbors = neighbor_ids(start, params.neighbor_stride, len);
            let references = select_references(
                start,
                &neighbors,
                len,
                params.reference_step,
                params.reference_limit,
            );
            Window {
                start,
                neighbor_ids: neighbors,
                reference_ids: references,
            }
        })
        .collect();
    Ok(windows)
}

/// Progress report emitted after each window completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowProgress {
    /// Zero-based position of the finished window.
    pub index: usize,
    pub total: usize,
    pub start: usize,
    pub batch_len: usize,
}

pub struct WindowScheduler<'a> {
    store: &'a FrameStore,
    spec: ModelSpec,
    windows: Vec<Window>,
}

impl<'a> WindowScheduler<'a> {
    pub fn new(
        store: &'a FrameStore,
        params: ScheduleParams,
        spec: ModelSpec,
    ) -> Result<Self, InpaintError> {
        let windows = plan_windows(store.len(), &params)?;
        Ok(Self {
            store,
            spec,
            windows,
        })
    }

    pub fn windows(&self) -> &[Window] {
        &self.windows
    }

    /// Runs every window through `model` and returns the finalized frames in index order.
    ///
    /// The first failing window aborts the run; nothing is finalized in that case.
    pub fn run<M, F>(&self, model: &mut M, mut on_window: F) -> Result<Vec<RgbFrame>, InpaintError>
    where
        M: InpaintModel + ?Sized,
        F: FnMut(WindowProgress),
    {
        info!(
            frames = self.store.len(),
            windows = self.windows.len(),
            width = self.store.width(),
            height = self.store.height(),
            model = self.spec.name,
            "Starting inpainting"
        );

        let mut compositor = Compositor::new(self.store);
        let total = self.windows.len();
        for (index, window) in self.windows.iter().enumerate() {
            self.process_window(window, model, &mut compositor)?;
            on_window(WindowProgress {
                index,
                total,
                start: window.start,
                batch_len: window.batch_len(),
            });
        }

        compositor.finalize_all()
    }

    /// Predicts one window and submits its neighbor frames to `compositor`.
    pub fn process_window<M>(
        &self,
        window: &Window,
        model: &mut M,
        compositor: &mut Compositor<'_>,
    ) -> Result<(), InpaintError>
    where
        M: InpaintModel + ?Sized,
    {
        let batch = self.masked_batch(window);
        let (multiple_h, multiple_w) = self.spec.pad_multiples;
        let (padded, crop) = pad_spatial(&batch, multiple_h, multiple_w)?;

        debug!(
            window_start = window.start,
            neighbors = window.neighbor_count(),
            references = window.reference_ids.len(),
            padded_h = padded.shape()[3],
            padded_w = padded.shape()[4],
            "Running window"
        );

        let predicted = model
            .predict(padded.view(), window.neighbor_count())
            .map_err(|source| InpaintError::Inference {
                window_start: window.start,
                source,
            });
        model.release_cache();
        let predicted = predicted?;

        self.check_output(window, &predicted, padded.shape())?;
        let cropped = crop_spatial(&predicted, crop)?;

        for (slot, &frame_index) in window.neighbor_ids.iter().enumerate() {
            let frame = self.to_rgb(&cropped, slot)?;
            compositor.submit(frame_index, &frame)?;
        }
        Ok(())
    }

    /// `[1, K, 3, H, W]` batch in model range with masked pixels zeroed.
    fn masked_batch(&self, window: &Window) -> Array5<f32> {
        let height = self.store.height() as usize;
        let width = self.store.width() as usize;
        let ids: Vec<usize> = window.frame_ids().collect();
        let mut batch = Array5::<f32>::zeros((1, ids.len(), 3, height, width));

        for (k, &frame_index) in ids.iter().enumerate() {
            let frame = &self.store.frame(frame_index).data;
            let mask = self.store.mask(frame_index).as_slice();
            let mut dst = batch.index_axis_mut(Axis(0), 0);
            let mut dst = dst.index_axis_mut(Axis(0), k);
            for (pixel, (rgb, &m)) in frame.chunks_exact(3).zip(mask).enumerate() {
                if m != 0 {
                    continue;
                }
                let (y, x) = (pixel / width, pixel % width);
                for (c, &value) in rgb.iter().enumerate() {
                    dst[[c, y, x]] = self.spec.normalize(value);
                }
            }
        }
        batch
    }

    fn check_output(
        &self,
        window: &Window,
        predicted: &Array4<f32>,
        padded_shape: &[usize],
    ) -> Result<(), InpaintError> {
        let shape = predicted.shape();
        let expected_hw = (padded_shape[3], padded_shape[4]);
        if shape[0] < window.neighbor_count()
            || shape[1] != 3
            || (shape[2], shape[3]) != expected_hw
        {
            return Err(InpaintError::ModelOutput {
                window_start: window.start,
                reason: format!(
                    "expected at least [{}, 3, {}, {}], got {:?}",
                    window.neighbor_count(),
                    expected_hw.0,
                    expected_hw.1,
                    shape
                ),
            });
        }
        Ok(())
    }

    fn to_rgb(&self, predicted: &Array4<f32>, slot: usize) -> Result<RgbFrame, InpaintError> {
        let chw = predicted.index_axis(Axis(0), slot);
        let (height, width) = (chw.shape()[1], chw.shape()[2]);
        let mut data = Vec::with_capacity(height * width * 3);
        for y in 0..height {
            for x in 0..width {
                for c in 0..3 {
                    data.push(self.spec.denormalize(chw[[c, y, x]]));
                }
            }
        }
        RgbFrame::new(data, self.store.width(), self.store.height())
    }
}
