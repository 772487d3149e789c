//! Mask loading: per-frame images resized, binarized and dilated.
//!
//! Dilation grows every masked region with a cross-shaped structuring element, so the
//! model also repaints the fringe around an object where compression and motion blur
//! leave traces of it.

use std::path::Path;

use anyhow::{bail, Context, Result};
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::media::images::list_images;
use crate::types::BinaryMask;

pub const DEFAULT_DILATION_KERNEL: usize = 10;
pub const DEFAULT_DILATION_ITERATIONS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskOptions {
    /// Side length of the cross-shaped structuring element. `0` disables dilation.
    pub dilation_kernel: usize,
    pub dilation_iterations: usize,
}

impl Default for MaskOptions {
    fn default() -> Self {
        Self {
            dilation_kernel: DEFAULT_DILATION_KERNEL,
            dilation_iterations: DEFAULT_DILATION_ITERATIONS,
        }
    }
}

/// Loads the masks in `dir` (sorted by file name) at `size = (width, height)`.
pub fn load_masks(dir: &Path, size: (u32, u32), options: MaskOptions) -> Result<Vec<BinaryMask>> {
    if !dir.is_dir() {
        bail!("mask directory does not exist: {}", dir.display());
    }
    let (width, height) = size;

    let masks = list_images(dir)?
        .iter()
        .map(|path| {
            let luma = image::open(path)
                .with_context(|| format!("cannot decode mask {}", path.display()))?
                .to_luma8();
            let luma = if luma.dimensions() != size {
                image::imageops::resize(&luma, width, height, FilterType::Nearest)
            } else {
                luma
            };
            let binary: Vec<u8> = luma.into_raw().into_iter().map(|v| u8::from(v > 0)).collect();
            let dilated = dilate_cross(
                &binary,
                width as usize,
                height as usize,
                options.dilation_kernel,
                options.dilation_iterations,
            );
            Ok(BinaryMask::from_values(dilated, width, height)?)
        })
        .collect::<Result<Vec<_>>>()?;

    debug!(
        masks = masks.len(),
        kernel = options.dilation_kernel,
        iterations = options.dilation_iterations,
        "masks loaded"
    );
    Ok(masks)
}

/// Dilates a 0/1 mask with a `kernel`×`kernel` cross anchored at `kernel / 2`.
///
/// The cross reaches `kernel / 2` pixels up/left and `kernel - 1 - kernel / 2` pixels
/// down/right of the anchor. Pixels outside the image never contribute.
pub fn dilate_cross(
    mask: &[u8],
    width: usize,
    height: usize,
    kernel: usize,
    iterations: usize,
) -> Vec<u8> {
    let mut current = mask.to_vec();
    if kernel <= 1 {
        return current;
    }
    let before = kernel / 2;
    let after = kernel - 1 - before;

    for _ in 0..iterations {
        let mut next = vec![0u8; current.len()];
        for y in 0..height {
            for x in 0..width {
                // dst(x, y) = max over the cross of src(x + dx, y + dy), dx/dy in [-before, after].
                let x0 = x.saturating_sub(before);
                let x1 = (x + after).min(width - 1);
                let y0 = y.saturating_sub(before);
                let y1 = (y + after).min(height - 1);
                let row = &current[y * width..(y + 1) * width];
                let hit = row[x0..=x1].iter().any(|&v| v != 0)
                    || (y0..=y1).any(|yy| current[yy * width + x] != 0);
                next[y * width + x] = u8::from(hit);
            }
        }
        current = next;
    }
    current
}
