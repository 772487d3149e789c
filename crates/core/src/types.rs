use crate::error::InpaintError;

/// Packed 8-bit RGB frame, interleaved HWC, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl RgbFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self, InpaintError> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(InpaintError::InvalidInput(format!(
                "RGB frame data length mismatch: expected {expected} ({width}x{height}x3), got {}",
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// Frame with every channel of every pixel set to `value`.
    pub fn filled(width: u32, height: u32, value: u8) -> Self {
        Self {
            data: vec![value; width as usize * height as usize * 3],
            width,
            height,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Binary occlusion mask: `1` marks a pixel to synthesize, `0` a pixel kept from the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMask {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl BinaryMask {
    /// Builds a mask from arbitrary 8-bit values; any non-zero value becomes `1`.
    pub fn from_values(values: Vec<u8>, width: u32, height: u32) -> Result<Self, InpaintError> {
        let expected = width as usize * height as usize;
        if values.len() != expected {
            return Err(InpaintError::InvalidInput(format!(
                "mask data length mismatch: expected {expected} ({width}x{height}), got {}",
                values.len()
            )));
        }
        let data = values.into_iter().map(|v| u8::from(v != 0)).collect();
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// Mask with nothing to synthesize.
    pub fn clear(width: u32, height: u32) -> Self {
        Self {
            data: vec![0; width as usize * height as usize],
            width,
            height,
        }
    }

    /// Mask covering every pixel.
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            data: vec![1; width as usize * height as usize],
            width,
            height,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Per-pixel values, each `0` or `1`.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn is_set(&self, x: u32, y: u32) -> bool {
        self.data[y as usize * self.width as usize + x as usize] != 0
    }

    pub fn masked_count(&self) -> usize {
        self.data.iter().filter(|&&v| v != 0).count()
    }
}

/// Decoded frames and their masks, validated once and read-only afterwards.
#[derive(Debug, Clone)]
pub struct FrameStore {
    frames: Vec<RgbFrame>,
    masks: Vec<BinaryMask>,
    width: u32,
    height: u32,
}

impl FrameStore {
    pub fn new(frames: Vec<RgbFrame>, masks: Vec<BinaryMask>) -> Result<Self, InpaintError> {
        let first = frames
            .first()
            .ok_or_else(|| InpaintError::InvalidInput("video contains no frames".to_string()))?;
        let (width, height) = first.dimensions();

        if frames.len() != masks.len() {
            return Err(InpaintError::InvalidInput(format!(
                "frame/mask count mismatch: {} frames, {} masks",
                frames.len(),
                masks.len()
            )));
        }

        for (index, (frame, mask)) in frames.iter().zip(&masks).enumerate() {
            if frame.dimensions() != (width, height) {
                return Err(InpaintError::InvalidInput(format!(
                    "frame {index} is {}x{}, expected {width}x{height}",
                    frame.width, frame.height
                )));
            }
            if mask.dimensions() != (width, height) {
                return Err(InpaintError::InvalidInput(format!(
                    "mask {index} is {}x{}, expected {width}x{height}",
                    mask.width, mask.height
                )));
            }
        }

        Ok(Self {
            frames,
            masks,
            width,
            height,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Always `false`: construction rejects empty input.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn frame(&self, index: usize) -> &RgbFrame {
        &self.frames[index]
    }

    pub fn mask(&self, index: usize) -> &BinaryMask {
        &self.masks[index]
    }

    pub fn frames(&self) -> &[RgbFrame] {
        &self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb_frame_rejects_bad_length() {
        let err = RgbFrame::new(vec![0; 10], 2, 2).expect_err("length should be checked");
        assert!(err.to_string().contains("expected 12"));
    }

    #[test]
    fn test_binary_mask_binarizes_values() {
        let mask = BinaryMask::from_values(vec![0, 255, 1, 0], 2, 2).unwrap();
        assert_eq!(mask.as_slice(), &[0, 1, 1, 0]);
        assert!(mask.is_set(1, 0));
        assert!(!mask.is_set(1, 1));
        assert_eq!(mask.masked_count(), 2);
    }

    #[test]
    fn test_frame_store_rejects_empty_video() {
        let err = FrameStore::new(vec![], vec![]).expect_err("empty input should fail");
        assert!(matches!(err, InpaintError::InvalidInput(_)));
    }

    #[test]
    fn test_frame_store_rejects_count_mismatch() {
        let frames = vec![RgbFrame::filled(4, 4, 0); 3];
        let masks = vec![BinaryMask::clear(4, 4); 2];
        let err = FrameStore::new(frames, masks).expect_err("mismatch should fail");
        assert!(err.to_string().contains("3 frames, 2 masks"));
    }

    #[test]
    fn test_frame_store_rejects_size_mismatch() {
        let frames = vec![RgbFrame::filled(4, 4, 0), RgbFrame::filled(4, 4, 0)];
        let masks = vec![BinaryMask::clear(4, 4), BinaryMask::clear(8, 4)];
        let err = FrameStore::new(frames, masks).expect_err("size mismatch should fail");
        assert!(err.to_string().contains("mask 1"));
    }

    #[test]
    fn test_frame_store_accessors() {
        let frames = vec![RgbFrame::filled(6, 2, 7), RgbFrame::filled(6, 2, 9)];
        let masks = vec![BinaryMask::clear(6, 2), BinaryMask::full(6, 2)];
        let store = FrameStore::new(frames, masks).unwrap();
        assert_eq!(store.len(), 2);
        assert!(!store.is_empty());
        assert_eq!((store.width(), store.height()), (6, 2));
        assert_eq!(store.frame(1).data[0], 9);
        assert_eq!(store.mask(1).masked_count(), 12);
    }
}
