//! Fuses overlapping window predictions into one frame per index.
//!
//! Every slot moves through `Empty -> Written -> Blended(n)`. The first prediction for a
//! frame is stored as-is (after mask compositing); each later one is averaged 50/50 with
//! the accumulator, so the most recent window always carries half the weight.

use crate::error::InpaintError;
use crate::types::{FrameStore, RgbFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Written,
    /// Number of blends applied on top of the first write.
    Blended(u32),
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    accum: Vec<f32>,
}

/// Per-frame accumulator for one run. `submit` takes `&mut self`, so there is exactly one
/// writer and blends happen in submission order.
#[derive(Debug)]
pub struct Compositor<'a> {
    store: &'a FrameStore,
    slots: Vec<Slot>,
}

impl<'a> Compositor<'a> {
    pub fn new(store: &'a FrameStore) -> Self {
        let slots = (0..store.len())
            .map(|_| Slot {
                state: SlotState::Empty,
                accum: Vec::new(),
            })
            .collect();
        Self { store, slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn state(&self, index: usize) -> Option<SlotState> {
        self.slots.get(index).map(|slot| slot.state)
    }

    /// Merges a predicted frame into slot `index`. Pixels outside the mask always come
    /// from the source frame.
    pub fn submit(&mut self, index: usize, predicted: &RgbFrame) -> Result<(), InpaintError> {
        if index >= self.slots.len() {
            return Err(InpaintError::InvalidInput(format!(
                "frame index {index} out of range for {} frames",
                self.slots.len()
            )));
        }
        let expected = (self.store.width(), self.store.height());
        if predicted.dimensions() != expected {
            return Err(InpaintError::InvalidInput(format!(
                "prediction for frame {index} is {}x{}, expected {}x{}",
                predicted.width, predicted.height, expected.0, expected.1
            )));
        }

        let store = self.store;
        let original = &store.frame(index).data;
        let mask = store.mask(index).as_slice();
        let composite = original
            .chunks_exact(3)
            .zip(predicted.data.chunks_exact(3))
            .zip(mask)
            .flat_map(|((src, pred), &m)| {
                let px = if m != 0 { pred } else { src };
                [px[0] as f32, px[1] as f32, px[2] as f32]
            });

        let slot = &mut self.slots[index];
        let blends = match slot.state {
            SlotState::Empty => {
                slot.accum = composite.collect();
                slot.state = SlotState::Written;
                return Ok(());
            }
            SlotState::Written => 0,
            SlotState::Blended(n) => n,
        };
        for (acc, new) in slot.accum.iter_mut().zip(composite) {
            *acc = 0.5 * *acc + 0.5 * new;
        }
        slot.state = SlotState::Blended(blends + 1);
        Ok(())
    }

    /// Converts slot `index` to 8-bit by truncation. A slot nobody wrote is a scheduling bug.
    pub fn finalize(&self, index: usize) -> Result<RgbFrame, InpaintError> {
        let slot = self
            .slots
            .get(index)
            .ok_or(InpaintError::SchedulingGap(index))?;
        if slot.state == SlotState::Empty {
            return Err(InpaintError::SchedulingGap(index));
        }
        let data = slot.accum.iter().map(|&v| v as u8).collect();
        RgbFrame::new(data, self.store.width(), self.store.height())
    }

    /// Finalizes every slot in index order, failing on the first gap.
    pub fn finalize_all(&self) -> Result<Vec<RgbFrame>, InpaintError> {
        (0..self.slots.len()).map(|i| self.finalize(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BinaryMask;

    fn store_with_masks(masks: Vec<BinaryMask>) -> FrameStore {
        let frames = masks
            .iter()
            .enumerate()
            .map(|(i, m)| RgbFrame::filled(m.width(), m.height(), 10 + i as u8))
            .collect();
        FrameStore::new(frames, masks).unwrap()
    }

    #[test]
    fn test_first_write_with_clear_mask_keeps_original() {
        let store = store_with_masks(vec![BinaryMask::clear(4, 3); 6]);
        let mut compositor = Compositor::new(&store);
        compositor.submit(5, &RgbFrame::filled(4, 3, 200)).unwrap();
        assert_eq!(compositor.state(5), Some(SlotState::Written));
        assert_eq!(&compositor.finalize(5).unwrap(), store.frame(5));
    }

    #[test]
    fn test_first_write_takes_prediction_inside_mask() {
        let mask = BinaryMask::from_values(vec![1, 0, 0, 1], 2, 2).unwrap();
        let store = store_with_masks(vec![mask]);
        let mut compositor = Compositor::new(&store);
        compositor.submit(0, &RgbFrame::filled(2, 2, 99)).unwrap();
        let out = compositor.finalize(0).unwrap();
        assert_eq!(out.data, vec![99, 99, 99, 10, 10, 10, 10, 10, 10, 99, 99, 99]);
    }

    #[test]
    fn test_blend_law_half_and_half() {
        let store = store_with_masks(vec![BinaryMask::full(2, 2)]);
        let mut compositor = Compositor::new(&store);
        compositor.submit(0, &RgbFrame::filled(2, 2, 100)).unwrap();
        compositor.submit(0, &RgbFrame::filled(2, 2, 201)).unwrap();
        assert_eq!(compositor.state(0), Some(SlotState::Blended(1)));
        // 0.5 * 100 + 0.5 * 201 = 150.5, truncated
        assert!(compositor.finalize(0).unwrap().data.iter().all(|&v| v == 150));
    }

    #[test]
    fn test_blend_is_not_count_weighted() {
        let store = store_with_masks(vec![BinaryMask::full(1, 1)]);
        let mut compositor = Compositor::new(&store);
        for value in [0, 0, 200] {
            compositor.submit(0, &RgbFrame::filled(1, 1, value)).unwrap();
        }
        assert_eq!(compositor.state(0), Some(SlotState::Blended(2)));
        // A count-weighted mean would give 66; the 50/50 rule gives 100.
        assert_eq!(compositor.finalize(0).unwrap().data, vec![100, 100, 100]);
    }

    #[test]
    fn test_blend_respects_mask() {
        let mask = BinaryMask::from_values(vec![0, 1], 2, 1).unwrap();
        let store = store_with_masks(vec![mask]);
        let mut compositor = Compositor::new(&store);
        compositor.submit(0, &RgbFrame::filled(2, 1, 50)).unwrap();
        compositor.submit(0, &RgbFrame::filled(2, 1, 150)).unwrap();
        let out = compositor.finalize(0).unwrap();
        assert_eq!(out.data, vec![10, 10, 10, 100, 100, 100]);
    }

    #[test]
    fn test_finalize_empty_slot_is_scheduling_gap() {
        let store = store_with_masks(vec![BinaryMask::clear(2, 2); 3]);
        let mut compositor = Compositor::new(&store);
        compositor.submit(0, &RgbFrame::filled(2, 2, 0)).unwrap();
        compositor.submit(2, &RgbFrame::filled(2, 2, 0)).unwrap();
        let err = compositor.finalize_all().unwrap_err();
        assert!(matches!(err, InpaintError::SchedulingGap(1)));
    }

    #[test]
    fn test_submit_rejects_bad_index_and_size() {
        let store = store_with_masks(vec![BinaryMask::clear(2, 2)]);
        let mut compositor = Compositor::new(&store);
        assert!(compositor.submit(1, &RgbFrame::filled(2, 2, 0)).is_err());
        assert!(compositor.submit(0, &RgbFrame::filled(3, 2, 0)).is_err());
        assert_eq!(compositor.state(0), Some(SlotState::Empty));
    }
}
