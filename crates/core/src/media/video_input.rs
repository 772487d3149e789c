//! Video decoding through an `ffmpeg` subprocess, probed with `ffprobe`.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Stdio};
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::types::RgbFrame;

#[derive(Deserialize, Debug)]
pub struct FfprobeOutput {
    streams: Vec<FfprobeStream>,
}

#[derive(Deserialize, Debug)]
struct FfprobeStream {
    index: usize,
    codec_name: Option<String>,
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    pix_fmt: Option<String>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    #[serde(default)]
    disposition: std::collections::HashMap<String, serde_json::Value>,
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    if let Some((num, den)) = s.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        return (den > 0.0).then(|| num / den);
    }
    s.parse().ok()
}

fn disposition_flag(stream: &FfprobeStream, key: &str) -> bool {
    stream
        .disposition
        .get(key)
        .and_then(|value| {
            value
                .as_bool()
                .or_else(|| value.as_i64().map(|n| n != 0))
                .or_else(|| value.as_str().map(|s| s != "0"))
        })
        .unwrap_or(false)
}

/// Default, non-cover-art video stream with the lowest index.
fn select_primary_video_stream(streams: &[FfprobeStream]) -> Option<&FfprobeStream> {
    streams
        .iter()
        .filter(|stream| stream.codec_type.as_deref() == Some("video"))
        .min_by_key(|stream| {
            let is_attached_picture = disposition_flag(stream, "attached_pic");
            let is_default = disposition_flag(stream, "default");
            (is_attached_picture, !is_default, stream.index)
        })
}

pub fn run_ffprobe(path: &Path) -> Result<FfprobeOutput> {
    let output = crate::runtime::command_for("ffprobe")
        .args(["-v", "quiet", "-print_format", "json", "-show_streams"])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("failed to execute ffprobe, is FFmpeg installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        );
    }

    parse_ffprobe_json(&output.stdout)
}

pub fn parse_ffprobe_json(json: &[u8]) -> Result<FfprobeOutput> {
    serde_json::from_slice(json).context("failed to parse ffprobe JSON output")
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoStreamInfo {
    pub stream_index: usize,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub codec_name: String,
    pub pix_fmt: String,
    /// Container frame count, when the demuxer reports one.
    pub frame_count: Option<usize>,
}

pub fn extract_stream_info(probe: &FfprobeOutput) -> Result<VideoStreamInfo> {
    let stream = select_primary_video_stream(&probe.streams)
        .ok_or_else(|| anyhow!("no video stream found"))?;

    let width = stream
        .width
        .ok_or_else(|| anyhow!("video stream missing width"))?;
    let height = stream
        .height
        .ok_or_else(|| anyhow!("video stream missing height"))?;

    let fps_str = stream
        .r_frame_rate
        .as_deref()
        .or(stream.avg_frame_rate.as_deref())
        .unwrap_or("0/0");
    let fps = match parse_frame_rate(fps_str) {
        Some(fps) if fps > 0.0 => fps,
        _ => {
            warn!("could not determine frame rate (got {fps_str}), defaulting to 24");
            24.0
        }
    };

    let pix_fmt = stream.pix_fmt.clone().unwrap_or_else(|| "unknown".to_string());
    if !matches!(pix_fmt.as_str(), "yuv420p" | "yuvj420p" | "rgb24" | "unknown")
        && (pix_fmt.contains("10") || pix_fmt.contains("12") || pix_fmt.contains("16"))
    {
        warn!(%pix_fmt, "high bit depth source will be quantized to 8-bit RGB");
    }

    Ok(VideoStreamInfo {
        stream_index: stream.index,
        width,
        height,
        fps,
        codec_name: stream
            .codec_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        pix_fmt,
        frame_count: stream.nb_frames.as_deref().and_then(|n| n.parse().ok()),
    })
}

pub fn probe_video(path: &Path) -> Result<VideoStreamInfo> {
    if !path.is_file() {
        bail!("input video does not exist: {}", path.display());
    }
    debug!(path = %path.display(), "running ffprobe");
    let info = extract_stream_info(&run_ffprobe(path)?)?;
    debug!(
        stream_index = info.stream_index,
        width = info.width,
        height = info.height,
        fps = info.fps,
        codec = %info.codec_name,
        pix_fmt = %info.pix_fmt,
        "video input probed"
    );
    Ok(info)
}

fn build_decoder_args(path: &Path, stream_index: usize, scale: Option<(u32, u32)>) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-nostdin".to_string(),
        "-i".to_string(),
        path.to_string_lossy().into_owned(),
        "-map".to_string(),
        format!("0:{stream_index}"),
    ];
    if let Some((width, height)) = scale {
        args.extend([
            "-vf".to_string(),
            format!("scale={width}:{height}:flags=bicubic"),
        ]);
    }
    args.extend([
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "rgb24".to_string(),
        "-vsync".to_string(),
        "passthrough".to_string(),
        "-v".to_string(),
        "error".to_string(),
        "pipe:1".to_string(),
    ]);
    args
}

/// Decodes a video to `rgb24` frames, one at a time, optionally rescaled by ffmpeg.
/// Drains stderr in a background thread to prevent pipe deadlock and kills ffmpeg on
/// [`Drop`].
pub struct VideoDecoder {
    child: Child,
    width: u32,
    height: u32,
    frame_size: usize,
    stderr_thread: Option<thread::JoinHandle<()>>,
    buf: Vec<u8>,
    done: bool,
}

impl VideoDecoder {
    pub fn new(
        path: &Path,
        info: &VideoStreamInfo,
        output_size: Option<(u32, u32)>,
    ) -> Result<Self> {
        let (width, height) = output_size.unwrap_or((info.width, info.height));
        let scale = output_size.filter(|&size| size != (info.width, info.height));
        let frame_size = width as usize * height as usize * 3;

        let decode_args = build_decoder_args(path, info.stream_index, scale);
        let mut child = crate::runtime::command_for("ffmpeg")
            .args(&decode_args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg, is it installed?")?;

        let stderr = child.stderr.take().context("ffmpeg stderr was not piped")?;
        let stderr_thread = thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                match line {
                    Ok(line) if !line.is_empty() => {
                        debug!(target: "ffmpeg_stderr", "{}", line);
                    }
                    Err(e) => {
                        debug!(target: "ffmpeg_stderr", "read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        Ok(Self {
            child,
            width,
            height,
            frame_size,
            stderr_thread: Some(stderr_thread),
            buf: vec![0u8; frame_size],
            done: false,
        })
    }

    fn read_frame(&mut self) -> Result<Option<RgbFrame>> {
        let stdout = self
            .child
            .stdout
            .as_mut()
            .ok_or_else(|| anyhow!("ffmpeg stdout not available"))?;

        let mut total_read = 0;
        while total_read < self.frame_size {
            match stdout.read(&mut self.buf[total_read..]) {
                Ok(0) => {
                    if total_read > 0 {
                        warn!(
                            "partial frame at EOF ({total_read}/{} bytes), discarding",
                            self.frame_size
                        );
                    }
                    return Ok(None);
                }
                Ok(n) => total_read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("failed to read frame from ffmpeg stdout"),
            }
        }

        Ok(Some(RgbFrame::new(
            self.buf.clone(),
            self.width,
            self.height,
        )?))
    }

    pub fn finish(&mut self) -> Result<()> {
        let status = self.child.wait().context("failed to wait for ffmpeg")?;
        if !status.success() {
            bail!("ffmpeg exited with status {}", status);
        }
        Ok(())
    }
}

impl Iterator for VideoDecoder {
    type Item = Result<RgbFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl Drop for VideoDecoder {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Decodes every frame of `path`, resized to `output_size` when given.
pub fn decode_video(
    path: &Path,
    output_size: Option<(u32, u32)>,
) -> Result<(Vec<RgbFrame>, VideoStreamInfo)> {
    let info = probe_video(path)?;
    let mut decoder = VideoDecoder::new(path, &info, output_size)?;
    let mut frames = Vec::with_capacity(info.frame_count.unwrap_or(0));
    for frame in decoder.by_ref() {
        frames.push(frame?);
    }
    decoder.finish()?;
    if frames.is_empty() {
        bail!("ffmpeg produced no frames for {}", path.display());
    }
    debug!(frames = frames.len(), "video decoded");
    Ok((frames, info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const SAMPLE_FFPROBE_JSON: &str = r#"{
        "streams": [
            {
                "index": 0,
                "codec_name": "mjpeg",
                "codec_type": "video",
                "width": 320, "height": 320,
                "pix_fmt": "yuvj420p",
                "r_frame_rate": "90000/1",
                "disposition": { "default": 0, "attached_pic": 1 }
            },
            {
                "index": 1,
                "codec_name": "h264",
                "codec_type": "video",
                "width": 432, "height": 240,
                "pix_fmt": "yuv420p",
                "r_frame_rate": "24000/1001",
                "avg_frame_rate": "24000/1001",
                "nb_frames": "80",
                "disposition": { "default": 1, "attached_pic": 0 }
            },
            {
                "index": 2,
                "codec_name": "aac",
                "codec_type": "audio",
                "disposition": {}
            }
        ]
    }"#;

    #[test]
    fn test_extract_stream_info_skips_cover_art() {
        let probe = parse_ffprobe_json(SAMPLE_FFPROBE_JSON.as_bytes()).unwrap();
        let info = extract_stream_info(&probe).unwrap();
        assert_eq!(info.stream_index, 1);
        assert_eq!((info.width, info.height), (432, 240));
        assert!((info.fps - 23.976).abs() < 0.01);
        assert_eq!(info.codec_name, "h264");
        assert_eq!(info.frame_count, Some(80));
    }

    #[test]
    fn test_no_video_stream_error() {
        let json = r#"{ "streams": [{ "index": 0, "codec_type": "audio" }] }"#;
        let probe = parse_ffprobe_json(json.as_bytes()).unwrap();
        let err = extract_stream_info(&probe).unwrap_err();
        assert!(err.to_string().contains("no video stream"));
    }

    #[test]
    fn test_missing_frame_rate_defaults_to_24() {
        let json = r#"{ "streams": [{
            "index": 0, "codec_type": "video", "width": 64, "height": 64,
            "r_frame_rate": "0/0"
        }] }"#;
        let probe = parse_ffprobe_json(json.as_bytes()).unwrap();
        assert_eq!(extract_stream_info(&probe).unwrap().fps, 24.0);
    }

    #[test]
    fn test_parse_frame_rate() {
        assert!((parse_frame_rate("24000/1001").unwrap() - 23.976).abs() < 0.001);
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        assert_eq!(parse_frame_rate("30"), Some(30.0));
        assert!(parse_frame_rate("0/0").is_none());
        assert!(parse_frame_rate("abc").is_none());
    }

    #[test]
    fn test_decoder_args_without_scale() {
        let args = build_decoder_args(Path::new("in.mp4"), 1, None);
        assert_eq!(args[..5], ["-nostdin", "-i", "in.mp4", "-map", "0:1"]);
        assert!(!args.contains(&"-vf".to_string()));
        assert!(args.windows(2).any(|w| w == ["-pix_fmt", "rgb24"]));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
    }

    #[test]
    fn test_decoder_args_with_scale() {
        let args = build_decoder_args(Path::new("in.mp4"), 0, Some((432, 240)));
        assert!(args
            .windows(2)
            .any(|w| w == ["-vf", "scale=432:240:flags=bicubic"]));
    }

    #[test]
    fn test_probe_missing_file() {
        let err = probe_video(Path::new("/nonexistent/clip.mp4")).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    #[ignore]
    fn test_decode_real_file() {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../data/sample.mp4");
        let (frames, info) = decode_video(&path, Some((432, 240))).unwrap();
        assert!(!frames.is_empty());
        assert_eq!(frames[0].dimensions(), (432, 240));
        assert!(info.fps > 0.0);
    }
}
