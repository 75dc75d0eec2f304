//! Media discovery and frame sampling.
//!
//! Still images decode to a single frame. Videos are sampled through an
//! `ffmpeg` subprocess that emits raw RGB24 frames on stdout, one every
//! `frame_stride` frames.

use crate::detector::DetectionError;
use crate::frame::Frame;
use crate::record::SourceKind;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, instrument, warn};

/// Frame rate assumed when the container does not report one.
pub const DEFAULT_FPS: f64 = 30.0;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Source unavailable: {}: {reason}", .path.display())]
    Unavailable { path: PathBuf, reason: String },

    #[error("Failed to probe {}: {reason}", .path.display())]
    Probe { path: PathBuf, reason: String },

    #[error("Failed to start decoder for {}: {reason}", .path.display())]
    Spawn { path: PathBuf, reason: String },
}

/// A discovered input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub kind: SourceKind,
    pub path: PathBuf,
    /// File name, used as the record source id
    pub source_id: String,
}

impl SourceFile {
    pub fn new(kind: SourceKind, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let source_id = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            kind,
            path,
            source_id,
        }
    }
}

/// One frame taken from a source, with its position in the source.
#[derive(Debug, Clone)]
pub struct SampledFrame {
    pub frame_number: u64,
    pub timestamp_sec: f64,
    pub frame: Frame,
}

/// Frames of one source, in order. Per-frame errors do not end the stream.
pub type FrameStream = BoxStream<'static, Result<SampledFrame, DetectionError>>;

/// Opens sources as frame streams.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn open(&self, source: &SourceFile) -> Result<FrameStream, SourceError>;
}

/// List files in `dir` whose extension matches, case-insensitively, sorted
/// by file name.
pub async fn discover(
    dir: &Path,
    kind: SourceKind,
    extensions: &[String],
) -> Result<Vec<SourceFile>, SourceError> {
    let unavailable = |reason: String| SourceError::Unavailable {
        path: dir.to_path_buf(),
        reason,
    };

    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| unavailable(e.to_string()))?;

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| unavailable(e.to_string()))?
    {
        let path = entry.path();
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)))
            .unwrap_or(false);

        if matches && path.is_file() {
            files.push(SourceFile::new(kind, path));
        }
    }

    files.sort_by(|a, b| a.source_id.cmp(&b.source_id));

    info!(dir = %dir.display(), kind = %kind, count = files.len(), "Discovered sources");

    Ok(files)
}

/// Decodes images with the `image` crate and videos with ffmpeg.
#[derive(Debug, Clone)]
pub struct MediaFrameSource {
    ffmpeg_bin: String,
    ffprobe_bin: String,
    frame_stride: u32,
}

impl MediaFrameSource {
    pub fn new(
        ffmpeg_bin: impl Into<String>,
        ffprobe_bin: impl Into<String>,
        frame_stride: u32,
    ) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            ffprobe_bin: ffprobe_bin.into(),
            frame_stride: frame_stride.max(1),
        }
    }

    async fn open_image(&self, source: &SourceFile) -> Result<FrameStream, SourceError> {
        let bytes = tokio::fs::read(&source.path)
            .await
            .map_err(|e| SourceError::Unavailable {
                path: source.path.clone(),
                reason: e.to_string(),
            })?;

        let decode = async move {
            let frame = tokio::task::spawn_blocking(move || decode_image(&bytes))
                .await
                .map_err(|e| DetectionError::Decode(e.to_string()))??;
            Ok::<_, DetectionError>(SampledFrame {
                frame_number: 0,
                timestamp_sec: 0.0,
                frame,
            })
        };

        Ok(stream::once(decode).boxed())
    }

    #[instrument(skip(self, source), fields(source_id = %source.source_id))]
    async fn open_video(&self, source: &SourceFile) -> Result<FrameStream, SourceError> {
        let info = self.probe(&source.path).await?;
        let stride = self.frame_stride;

        let mut child = Command::new(&self.ffmpeg_bin)
            .arg("-v")
            .arg("error")
            .arg("-i")
            .arg(&source.path)
            .arg("-vf")
            .arg(format!("select=not(mod(n\\,{}))", stride))
            .arg("-vsync")
            .arg("0")
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("pipe:1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SourceError::Spawn {
                path: source.path.clone(),
                reason: e.to_string(),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| SourceError::Spawn {
            path: source.path.clone(),
            reason: "decoder stdout not captured".to_string(),
        })?;

        info!(
            width = info.width,
            height = info.height,
            fps = info.fps,
            stride = stride,
            "Sampling video frames"
        );

        let state = VideoState {
            child,
            stdout,
            info,
            stride,
            index: 0,
            done: false,
        };

        Ok(stream::unfold(state, next_video_frame).boxed())
    }

    async fn probe(&self, path: &Path) -> Result<VideoInfo, SourceError> {
        let output = Command::new(&self.ffprobe_bin)
            .args(["-v", "error", "-select_streams", "v:0"])
            .args(["-show_entries", "stream=width,height,r_frame_rate"])
            .args(["-of", "json"])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SourceError::Spawn {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(SourceError::Probe {
                path: path.to_path_buf(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        VideoInfo::from_probe_json(&output.stdout).map_err(|reason| SourceError::Probe {
            path: path.to_path_buf(),
            reason,
        })
    }
}

#[async_trait]
impl FrameSource for MediaFrameSource {
    async fn open(&self, source: &SourceFile) -> Result<FrameStream, SourceError> {
        match source.kind {
            SourceKind::Image => self.open_image(source).await,
            SourceKind::Video => self.open_video(source).await,
        }
    }
}

fn decode_image(bytes: &[u8]) -> Result<Frame, DetectionError> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| DetectionError::Decode(e.to_string()))?
        .to_rgb8();
    let (width, height) = image.dimensions();
    Frame::from_rgb(width, height, image.into_raw())
        .map_err(|e| DetectionError::Decode(e.to_string()))
}

/// Stream geometry and rate reported by ffprobe
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
}

impl VideoInfo {
    fn from_probe_json(json: &[u8]) -> Result<Self, String> {
        let probe: ProbeOutput = serde_json::from_slice(json).map_err(|e| e.to_string())?;
        let stream = probe
            .streams
            .into_iter()
            .next()
            .ok_or_else(|| "no video stream".to_string())?;

        let width = stream.width.filter(|w| *w > 0).ok_or("missing width")?;
        let height = stream.height.filter(|h| *h > 0).ok_or("missing height")?;
        let fps = stream
            .r_frame_rate
            .as_deref()
            .and_then(parse_frame_rate)
            .unwrap_or(DEFAULT_FPS);

        Ok(Self { width, height, fps })
    }

    fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// Parse `num/den` or a plain number. Zero or non-finite rates are rejected.
fn parse_frame_rate(rate: &str) -> Option<f64> {
    let fps = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.trim().parse().ok()?,
    };

    (fps.is_finite() && fps > 0.0).then_some(fps)
}

struct VideoState {
    // Held so the decoder is killed when the stream is dropped
    child: Child,
    stdout: ChildStdout,
    info: VideoInfo,
    stride: u32,
    index: u64,
    done: bool,
}

async fn next_video_frame(
    mut state: VideoState,
) -> Option<(Result<SampledFrame, DetectionError>, VideoState)> {
    if state.done {
        return None;
    }

    let mut buf = vec![0u8; state.info.frame_bytes()];
    let mut filled = 0;

    while filled < buf.len() {
        match state.stdout.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) => {
                state.done = true;
                return Some((Err(DetectionError::Decode(e.to_string())), state));
            }
        }
    }

    if filled == 0 {
        match state.child.wait().await {
            Ok(status) if !status.success() => {
                warn!(status = %status, "Video decoder exited with error");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to reap video decoder"),
        }
        debug!(frames = state.index, "Video stream finished");
        return None;
    }

    if filled < buf.len() {
        state.done = true;
        let err = DetectionError::Decode(format!(
            "truncated frame: {} of {} bytes",
            filled,
            buf.len()
        ));
        return Some((Err(err), state));
    }

    let frame_number = state.index * state.stride as u64;
    let timestamp_sec = frame_number as f64 / state.info.fps;
    state.index += 1;

    let item = Frame::from_rgb(state.info.width, state.info.height, buf)
        .map(|frame| SampledFrame {
            frame_number,
            timestamp_sec,
            frame,
        })
        .map_err(|e| DetectionError::Decode(e.to_string()));

    Some((item, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_discover_filters_and_sorts() {
        let dir = tempdir().unwrap();
        for name in ["b.JPG", "a.png", "notes.txt", "c.jpeg", "clip.mp4"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("sub.jpg")).unwrap();

        let files = discover(
            dir.path(),
            SourceKind::Image,
            &exts(&["jpg", "jpeg", "png", "bmp"]),
        )
        .await
        .unwrap();

        let ids: Vec<_> = files.iter().map(|f| f.source_id.as_str()).collect();
        assert_eq!(ids, vec!["a.png", "b.JPG", "c.jpeg"]);
        assert!(files.iter().all(|f| f.kind == SourceKind::Image));
    }

    #[tokio::test]
    async fn test_missing_directory_is_unavailable() {
        let dir = tempdir().unwrap();
        let result = discover(&dir.path().join("missing"), SourceKind::Video, &exts(&["mp4"])).await;
        assert!(matches!(result, Err(SourceError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn test_image_decodes_to_one_frame() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("red.png");
        image::RgbImage::from_pixel(6, 4, image::Rgb([255, 0, 0]))
            .save(&path)
            .unwrap();

        let source = MediaFrameSource::new("ffmpeg", "ffprobe", 30);
        let frames: Vec<_> = source
            .open(&SourceFile::new(SourceKind::Image, &path))
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(frames.len(), 1);
        let sampled = frames.into_iter().next().unwrap().unwrap();
        assert_eq!(sampled.frame_number, 0);
        assert_eq!(sampled.timestamp_sec, 0.0);
        assert_eq!((sampled.frame.width(), sampled.frame.height()), (6, 4));
        assert_eq!(sampled.frame.pixel(0, 0), Some([255, 0, 0]));
    }

    #[tokio::test]
    async fn test_corrupt_image_is_frame_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"not an image").unwrap();

        let source = MediaFrameSource::new("ffmpeg", "ffprobe", 30);
        let frames: Vec<_> = source
            .open(&SourceFile::new(SourceKind::Image, &path))
            .await
            .unwrap()
            .collect()
            .await;

        assert!(matches!(frames[0], Err(DetectionError::Decode(_))));
    }

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate("30/1"), Some(30.0));
        assert_eq!(parse_frame_rate("25"), Some(25.0));
        assert!((parse_frame_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("abc"), None);
    }

    #[test]
    fn test_probe_json() {
        let json = br#"{"streams":[{"width":1280,"height":720,"r_frame_rate":"0/0"}]}"#;
        let info = VideoInfo::from_probe_json(json).unwrap();
        assert_eq!(info.width, 1280);
        assert_eq!(info.height, 720);
        assert_eq!(info.fps, DEFAULT_FPS);

        assert!(VideoInfo::from_probe_json(br#"{"streams":[]}"#).is_err());
    }

    #[test]
    fn test_source_id_is_file_name() {
        let source = SourceFile::new(SourceKind::Video, "/data/videos/street.mp4");
        assert_eq!(source.source_id, "street.mp4");
    }
}
