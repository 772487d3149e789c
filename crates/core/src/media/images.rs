//! Frame sources: a video file decoded by ffmpeg, or a directory of still images.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use image::imageops::FilterType;
use tracing::debug;

use crate::media::video_input::decode_video;
use crate::types::RgbFrame;

pub const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Image files directly inside `dir`, sorted by file name.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("cannot read image directory {}", dir.display()))?;

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if path.is_file() && is_image {
            paths.push(path);
        }
    }

    if paths.is_empty() {
        bail!("no images found in {}", dir.display());
    }
    paths.sort();
    Ok(paths)
}

/// Loads every image in `dir` as RGB, resized with bicubic filtering when `size` differs
/// from the source. All images must share the first image's size.
pub fn load_image_frames(dir: &Path, size: Option<(u32, u32)>) -> Result<Vec<RgbFrame>> {
    let paths = list_images(dir)?;
    let mut base_dimensions = None;
    let mut frames = Vec::with_capacity(paths.len());

    for path in &paths {
        let img = image::open(path)
            .with_context(|| format!("cannot decode frame {}", path.display()))?
            .to_rgb8();
        let dimensions = img.dimensions();
        match base_dimensions {
            None => base_dimensions = Some(dimensions),
            Some(base) if base != dimensions => bail!(
                "frame {} is {}x{}, expected {}x{} like the first frame",
                path.display(),
                dimensions.0,
                dimensions.1,
                base.0,
                base.1
            ),
            Some(_) => {}
        }

        let img = match size {
            Some((w, h)) if (w, h) != dimensions => {
                image::imageops::resize(&img, w, h, FilterType::CatmullRom)
            }
            _ => img,
        };
        let (width, height) = img.dimensions();
        frames.push(RgbFrame::new(img.into_raw(), width, height)?);
    }

    debug!(frames = frames.len(), dir = %dir.display(), "image sequence loaded");
    Ok(frames)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameSource {
    Video(PathBuf),
    ImageDir(PathBuf),
}

impl FrameSource {
    /// A directory is an image sequence; anything else is decoded as video.
    pub fn detect(path: &Path) -> Result<Self> {
        if path.is_dir() {
            Ok(Self::ImageDir(path.to_path_buf()))
        } else if path.is_file() {
            Ok(Self::Video(path.to_path_buf()))
        } else {
            bail!("input does not exist: {}", path.display())
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Video(path) | Self::ImageDir(path) => path,
        }
    }
}

#[derive(Debug)]
pub struct LoadedFrames {
    pub frames: Vec<RgbFrame>,
    /// Source frame rate, when the source has one.
    pub fps: Option<f64>,
}

pub fn load_frames(source: &FrameSource, size: Option<(u32, u32)>) -> Result<LoadedFrames> {
    match source {
        FrameSource::Video(path) => {
            let (frames, info) = decode_video(path, size)?;
            Ok(LoadedFrames {
                frames,
                fps: Some(info.fps),
            })
        }
        FrameSource::ImageDir(dir) => Ok(LoadedFrames {
            frames: load_image_frames(dir, size)?,
            fps: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn write_png(dir: &Path, name: &str, width: u32, height: u32, value: u8) {
        let img = RgbImage::from_pixel(width, height, Rgb([value, value / 2, 255 - value]));
        img.save(dir.join(name)).unwrap();
    }

    #[test]
    fn test_list_images_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "00002.png", 4, 4, 0);
        write_png(dir.path(), "00001.png", 4, 4, 0);
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        let paths = list_images(dir.path()).unwrap();
        let names: Vec<_> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["00001.png", "00002.png"]);
    }

    #[test]
    fn test_list_images_empty_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_images(dir.path()).is_err());
    }

    #[test]
    fn test_load_image_frames_keeps_source_size() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "a.png", 6, 4, 100);
        write_png(dir.path(), "b.png", 6, 4, 200);
        let frames = load_image_frames(dir.path(), None).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].dimensions(), (6, 4));
        assert_eq!(&frames[1].data[..3], &[200, 100, 55]);
    }

    #[test]
    fn test_load_image_frames_resizes() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "a.png", 6, 4, 100);
        let frames = load_image_frames(dir.path(), Some((12, 8))).unwrap();
        assert_eq!(frames[0].dimensions(), (12, 8));
        // Uniform images stay uniform under bicubic resampling.
        assert!(frames[0].data.chunks_exact(3).all(|px| px == [100, 50, 155]));
    }

    #[test]
    fn test_load_image_frames_rejects_mixed_sizes() {
        let dir = tempfile::tempdir().unwrap();
        write_png(dir.path(), "a.png", 6, 4, 0);
        write_png(dir.path(), "b.png", 4, 4, 0);
        let err = load_image_frames(dir.path(), None).unwrap_err();
        assert!(err.to_string().contains("like the first frame"));
    }

    #[test]
    fn test_frame_source_detect() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("clip.mp4");
        std::fs::write(&file, b"").unwrap();
        assert_eq!(
            FrameSource::detect(dir.path()).unwrap(),
            FrameSource::ImageDir(dir.path().to_path_buf())
        );
        assert_eq!(FrameSource::detect(&file).unwrap(), FrameSource::Video(file.clone()));
        assert!(FrameSource::detect(&dir.path().join("missing")).is_err());
    }
}
