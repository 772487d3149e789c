//! Video encoding through an `ffmpeg` subprocess fed raw `rgb24` frames on stdin.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Stdio};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, info};

use crate::pipeline::FrameSink;
use crate::types::RgbFrame;

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub output_path: PathBuf,
    /// Video codec (e.g. "libx264").
    pub codec: String,
    /// Constant Rate Factor; used as the constant quality value for NVENC codecs.
    pub crf: u32,
    /// Output pixel format (e.g. "yuv420p").
    pub pixel_format: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl EncoderConfig {
    pub fn build_ffmpeg_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-nostdin".into(),
            "-y".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-s".into(),
            format!("{}x{}", self.width, self.height),
            "-r".into(),
            format_fps(self.fps),
            "-i".into(),
            "pipe:0".into(),
            "-an".into(),
            "-c:v".into(),
            self.codec.clone(),
        ];

        if self.codec.contains("nvenc") {
            args.extend([
                "-rc".into(),
                "vbr".into(),
                "-cq".into(),
                self.crf.to_string(),
                "-b:v".into(),
                "0".into(),
            ]);
        } else {
            args.extend(["-crf".into(), self.crf.to_string()]);
        }

        args.extend([
            "-pix_fmt".into(),
            self.pixel_format.clone(),
            self.output_path.to_string_lossy().into_owned(),
        ]);
        args
    }

    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// `24.0` -> `"24"`, `23.976..` -> `"23.976"`.
fn format_fps(fps: f64) -> String {
    let text = format!("{fps:.3}");
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// FFmpeg encode subprocess. Accepts raw RGB frames via stdin pipe, drains stderr in a
/// background thread, kills FFmpeg on [`Drop`].
pub struct VideoEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_thread: Option<JoinHandle<()>>,
    frame_size: usize,
    frames_written: usize,
}

impl VideoEncoder {
    pub fn new(config: &EncoderConfig) -> Result<Self> {
        if let Some(parent) = config.output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create output directory {}", parent.display())
            })?;
        }

        let args = config.build_ffmpeg_args();
        debug!(
            cmd = %format!("ffmpeg {}", args.join(" ")),
            "launching FFmpeg encoder"
        );

        let mut child = crate::runtime::command_for("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg, is it installed?")?;

        let stdin = child.stdin.take().context("ffmpeg stdin was not piped")?;
        let stderr = child.stderr.take().context("ffmpeg stderr was not piped")?;
        let stderr_thread = thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                match line {
                    Ok(line) if !line.is_empty() => {
                        debug!(target: "ffmpeg_encode_stderr", "{}", line);
                    }
                    Err(e) => {
                        debug!(target: "ffmpeg_encode_stderr", "read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        debug!(
            width = config.width,
            height = config.height,
            fps = config.fps,
            codec = %config.codec,
            crf = config.crf,
            pix_fmt = %config.pixel_format,
            "FFmpeg encoder started"
        );

        Ok(Self {
            child,
            stdin: Some(stdin),
            stderr_thread: Some(stderr_thread),
            frame_size: config.frame_size(),
            frames_written: 0,
        })
    }
}

impl FrameSink for VideoEncoder {
    fn write_frame(&mut self, frame: &RgbFrame) -> Result<()> {
        if frame.data.len() != self.frame_size {
            bail!(
                "frame size mismatch: expected {} bytes, got {}",
                self.frame_size,
                frame.data.len()
            );
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("encoder stdin already closed"))?;
        stdin
            .write_all(&frame.data)
            .context("failed to write frame to ffmpeg stdin")?;
        self.frames_written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        drop(self.stdin.take());
        let status = self.child.wait().context("failed to wait for ffmpeg")?;
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
        if !status.success() {
            bail!("ffmpeg encoder exited with status {}", status);
        }
        debug!(frames = self.frames_written, "FFmpeg encoder finished successfully");
        Ok(())
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        drop(self.stdin.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Probes the written file and checks its resolution.
pub fn verify_output(output_path: &Path, expected_width: u32, expected_height: u32) -> Result<()> {
    let output = crate::runtime::command_for("ffprobe")
        .args(["-v", "quiet", "-print_format", "json", "-show_streams"])
        .arg(output_path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("failed to execute ffprobe for verification")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "ffprobe verification failed with status {}: {}",
            output.status,
            stderr.trim()
        );
    }

    let probe: serde_json::Value =
        serde_json::from_slice(&output.stdout).context("failed to parse ffprobe JSON")?;
    let video = probe["streams"]
        .as_array()
        .and_then(|streams| {
            streams
                .iter()
                .find(|s| s["codec_type"].as_str() == Some("video"))
        })
        .ok_or_else(|| anyhow!("output file has no video stream"))?;

    let width = video["width"].as_u64().unwrap_or(0);
    let height = video["height"].as_u64().unwrap_or(0);
    if width != expected_width as u64 || height != expected_height as u64 {
        bail!(
            "output resolution mismatch: expected {expected_width}x{expected_height}, got {width}x{height}"
        );
    }

    info!(
        path = %output_path.display(),
        width,
        height,
        codec = %video["codec_name"].as_str().unwrap_or("unknown"),
        "output verification passed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_config() -> EncoderConfig {
        EncoderConfig {
            output_path: PathBuf::from("out/result.mp4"),
            codec: "libx264".to_string(),
            crf: 18,
            pixel_format: "yuv420p".to_string(),
            width: 432,
            height: 240,
            fps: 24.0,
        }
    }

    #[test]
    fn test_ffmpeg_args_basic_structure() {
        let args = default_config().build_ffmpeg_args();
        assert_eq!(args[0], "-nostdin");
        assert_eq!(args[1], "-y");
        assert!(args.windows(2).any(|w| w[0] == "-f" && w[1] == "rawvideo"));
        assert!(args.windows(2).any(|w| w[0] == "-pix_fmt" && w[1] == "rgb24"));
        assert!(args.windows(2).any(|w| w[0] == "-s" && w[1] == "432x240"));
        assert!(args.windows(2).any(|w| w[0] == "-r" && w[1] == "24"));
        assert!(args.windows(2).any(|w| w[0] == "-c:v" && w[1] == "libx264"));
        assert!(args.windows(2).any(|w| w[0] == "-crf" && w[1] == "18"));
        assert!(args.windows(2).any(|w| w[0] == "-pix_fmt" && w[1] == "yuv420p"));
        assert_eq!(args.last().unwrap(), "out/result.mp4");
    }

    #[test]
    fn test_ffmpeg_args_nvenc_uses_cq() {
        let mut config = default_config();
        config.codec = "h264_nvenc".to_string();
        let args = config.build_ffmpeg_args();
        assert!(!args.contains(&"-crf".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-cq" && w[1] == "18"));
    }

    #[test]
    fn test_format_fps() {
        assert_eq!(format_fps(24.0), "24");
        assert_eq!(format_fps(24000.0 / 1001.0), "23.976");
        assert_eq!(format_fps(12.5), "12.5");
    }

    #[test]
    fn test_frame_size() {
        assert_eq!(default_config().frame_size(), 432 * 240 * 3);
    }

    #[test]
    #[ignore]
    fn test_encode_small_clip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = default_config();
        config.output_path = dir.path().join("clip.mp4");
        config.width = 64;
        config.height = 64;
        let mut encoder = VideoEncoder::new(&config).unwrap();
        for i in 0..10u8 {
            encoder
                .write_frame(&RgbFrame::filled(64, 64, i * 20))
                .unwrap();
        }
        encoder.finish().unwrap();
        verify_output(&config.output_path, 64, 64).unwrap();
    }
}
