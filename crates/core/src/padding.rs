//! Mirror padding of frame batches to the spatial multiples a model requires.
//!
//! Padding is always appended below and to the right of the original content, so the
//! inverse crop starts at `(0, 0)`. The appended rows/columns are a reflection of the
//! content that includes the edge pixel: row `h + y` copies row `h - 1 - y`.

use ndarray::{Array, ArrayBase, Axis, Data, RemoveAxis, Slice};

use crate::error::InpaintError;

/// Region of a padded batch that holds the original content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropBox {
    pub height: usize,
    pub width: usize,
}

/// Rows (or columns) to append so that `dim` becomes a multiple of `multiple`.
///
/// A `multiple` of zero or one never pads.
pub fn pad_amount(dim: usize, multiple: usize) -> usize {
    if multiple <= 1 {
        return 0;
    }
    (multiple - dim % multiple) % multiple
}

/// Source index for every position of a mirror-padded axis of length `dim + pad`.
///
/// Positions past the original content walk back over it, and bounce again if the pad is
/// longer than the content itself.
pub fn mirror_indices(dim: usize, pad: usize) -> Vec<usize> {
    let period = 2 * dim;
    (0..dim + pad)
        .map(|p| {
            let q = p % period;
            if q < dim {
                q
            } else {
                period - 1 - q
            }
        })
        .collect()
}

/// Pads the last two axes (height, width) of `batch` up to the given multiples.
///
/// Works for any batch layout whose trailing axes are `[.., H, W]`, e.g. `[1, K, 3, H, W]`
/// or `[K, 3, H, W]`.
pub fn pad_spatial<A, S, D>(
    batch: &ArrayBase<S, D>,
    multiple_h: usize,
    multiple_w: usize,
) -> Result<(Array<A, D>, CropBox), InpaintError>
where
    A: Clone,
    S: Data<Elem = A>,
    D: RemoveAxis,
{
    let (h_axis, w_axis) = spatial_axes(batch.ndim())?;
    let height = batch.len_of(h_axis);
    let width = batch.len_of(w_axis);
    if height == 0 || width == 0 {
        return Err(InpaintError::InvalidInput(format!(
            "cannot pad an empty {height}x{width} batch"
        )));
    }

    let rows = mirror_indices(height, pad_amount(height, multiple_h));
    let cols = mirror_indices(width, pad_amount(width, multiple_w));

    let padded = batch.select(h_axis, &rows).select(w_axis, &cols);
    Ok((padded, CropBox { height, width }))
}

/// Cuts the top-left `crop` region out of the last two axes of `batch`.
pub fn crop_spatial<A, S, D>(
    batch: &ArrayBase<S, D>,
    crop: CropBox,
) -> Result<Array<A, D>, InpaintError>
where
    A: Clone,
    S: Data<Elem = A>,
    D: RemoveAxis,
{
    let (h_axis, w_axis) = spatial_axes(batch.ndim())?;
    let height = batch.len_of(h_axis);
    let width = batch.len_of(w_axis);
    if height < crop.height || width < crop.width {
        return Err(InpaintError::InvalidInput(format!(
            "cannot crop {}x{} out of a {height}x{width} batch",
            crop.height, crop.width
        )));
    }

    let cropped = batch
        .slice_axis(h_axis, Slice::from(0..crop.height))
        .slice_axis(w_axis, Slice::from(0..crop.width))
        .to_owned();
    Ok(cropped)
}

fn spatial_axes(ndim: usize) -> Result<(Axis, Axis), InpaintError> {
    if ndim < 2 {
        return Err(InpaintError::InvalidInput(format!(
            "expected at least 2 spatial axes, got {ndim}-d batch"
        )));
    }
    Ok((Axis(ndim - 2), Axis(ndim - 1)))
}
