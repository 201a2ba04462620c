use async_trait::async_trait;
use image::RgbImage;
use serde::Deserialize;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use tracing::{debug, info};

use crate::config::MediaConfig;
use crate::error::{Result, DubError};
use crate::lipsync::FrameSink;
use super::{MediaCommandBuilder, MediaProcessorTrait, SubtitleBand, VideoInfo};

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Parse an ffprobe rate such as `30000/1001` or `25`.
pub(crate) fn parse_frame_rate(rate: &str) -> Option<f64> {
    let value = match rate.split_once('/') {
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
    (value.is_finite() && value > 0.0).then_some(value)
}

pub(crate) fn parse_probe(json: &[u8]) -> Result<VideoInfo> {
    let probe: ProbeOutput = serde_json::from_slice(json)?;
    let stream = probe
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| DubError::Media("No video stream found".to_string()))?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(DubError::Media("Video stream has no dimensions".to_string())),
    };

    let fps = stream
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate))
        .ok_or_else(|| DubError::Media("Video stream has no usable frame rate".to_string()))?;

    Ok(VideoInfo {
        width,
        height,
        fps,
        duration: probe
            .format
            .and_then(|f| f.duration)
            .and_then(|d| d.parse().ok()),
        frame_count: stream.nb_frames.and_then(|n| n.parse().ok()),
    })
}

/// Split a packed rgb24 byte stream into frames.
pub(crate) fn split_frames(bytes: Vec<u8>, width: u32, height: u32) -> Result<Vec<RgbImage>> {
    let frame_len = width as usize * height as usize * 3;
    if frame_len == 0 {
        return Err(DubError::Media("Zero-sized frames".to_string()));
    }
    if bytes.len() % frame_len != 0 {
        return Err(DubError::Media(format!(
            "Decoded stream of {} bytes is not a whole number of {}x{} frames",
            bytes.len(),
            width,
            height
        )));
    }

    bytes
        .chunks_exact(frame_len)
        .map(|chunk| {
            RgbImage::from_raw(width, height, chunk.to_vec())
                .ok_or_else(|| DubError::Media("Frame buffer size mismatch".to_string()))
        })
        .collect()
}

/// Concrete implementation of media processor (FFmpeg-based)
pub struct MediaProcessorImpl {
    config: MediaConfig,
    command_builder: MediaCommandBuilder,
}

impl MediaProcessorImpl {
    /// Create a new media processor implementation
    pub fn new(config: MediaConfig) -> Self {
        let command_builder = MediaCommandBuilder::new(&config.binary_path, &config.probe_path);

        Self {
            config,
            command_builder,
        }
    }
}

#[async_trait]
impl MediaProcessorTrait for MediaProcessorImpl {
    async fn extract_audio(&self, video_path: &Path, audio_path: &Path) -> Result<()> {
        info!("Extracting audio from {} to {}", video_path.display(), audio_path.display());

        self.command_builder
            .extract_audio(video_path, audio_path)
            .execute()
            .await?;

        info!("Audio extraction completed");
        Ok(())
    }

    async fn extract_reference_audio(
        &self,
        video_path: &Path,
        audio_path: &Path,
        seconds: f64,
    ) -> Result<()> {
        info!(
            "Extracting {:.1}s reference audio from {}",
            seconds,
            video_path.display()
        );

        self.command_builder
            .extract_reference_audio(video_path, audio_path, seconds)
            .execute()
            .await
    }

    async fn probe_video(&self, video_path: &Path) -> Result<VideoInfo> {
        if !video_path.exists() {
            return Err(DubError::FileNotFound(video_path.display().to_string()));
        }

        let stdout = self.command_builder.probe_video(video_path).output_bytes().await?;
        let info = parse_probe(&stdout)?;
        debug!("Probed {}: {:?}", video_path.display(), info);
        Ok(info)
    }

    async fn decode_frames(&self, video_path: &Path, info: &VideoInfo) -> Result<Vec<RgbImage>> {
        info!("Reading video frames from {}", video_path.display());

        let stdout = self.command_builder.decode_frames(video_path).output_bytes().await?;
        let frames = split_frames(stdout, info.width, info.height)?;

        info!("Decoded {} frames at {}x{}", frames.len(), info.width, info.height);
        Ok(frames)
    }

    fn open_encoder(
        &self,
        output_path: &Path,
        width: u32,
        height: u32,
        fps: f64,
    ) -> Result<Box<dyn FrameSink>> {
        let command = self.command_builder.encode_frames(
            output_path,
            width,
            height,
            fps,
            &self.config.encode_options,
        );
        Ok(Box::new(FfmpegFrameEncoder::spawn(&command.binary_path, &command.args, width, height)?))
    }

    async fn mux_audio(&self, video_path: &Path, audio_path: &Path, output_path: &Path) -> Result<()> {
        info!(
            "Muxing {} with audio {} -> {}",
            video_path.display(),
            audio_path.display(),
            output_path.display()
        );

        self.command_builder
            .mux_audio(video_path, audio_path, output_path)
            .execute()
            .await
    }

    async fn stretch_audio(&self, input_path: &Path, output_path: &Path, tempo: f64) -> Result<()> {
        info!("Stretching {} by tempo {:.3}", input_path.display(), tempo);

        self.command_builder
            .stretch_audio(input_path, output_path, tempo)
            .execute()
            .await
    }

    async fn remove_subtitle_band(
        &self,
        input_path: &Path,
        output_path: &Path,
        band: SubtitleBand,
    ) -> Result<()> {
        info!(
            "Removing subtitle band {}x{}+{}+{} from {}",
            band.width,
            band.height,
            band.x,
            band.y,
            input_path.display()
        );

        self.command_builder
            .remove_subtitle_band(input_path, output_path, band)
            .execute()
            .await
    }

    fn check_availability(&self) -> Result<()> {
        let output = Command::new(&self.config.binary_path)
            .args(&self.command_builder.version_check().args)
            .output()
            .map_err(|e| DubError::Media(format!("Media processor not found: {}", e)))?;

        if output.status.success() {
            info!("Media processor is available");
            Ok(())
        } else {
            Err(DubError::Media("Media processor version check failed".to_string()))
        }
    }
}

/// Streams rgb24 frames into an ffmpeg child process.
pub struct FfmpegFrameEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    width: u32,
    height: u32,
    written: usize,
}

impl FfmpegFrameEncoder {
    pub fn spawn(binary_path: &str, args: &[String], width: u32, height: u32) -> Result<Self> {
        debug!("Spawning encoder: {} {:?}", binary_path, args);

        let mut child = Command::new(binary_path)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DubError::Media(format!("Failed to start encoder: {}", e)))?;

        let stdin = child.stdin.take();
        Ok(Self {
            child,
            stdin,
            width,
            height,
            written: 0,
        })
    }
}

impl FrameSink for FfmpegFrameEncoder {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        if frame.dimensions() != (self.width, self.height) {
            return Err(DubError::Media(format!(
                "Frame {} is {}x{}, encoder expects {}x{}",
                self.written,
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| DubError::Media("Encoder input already closed".to_string()))?;
        stdin
            .write_all(frame.as_raw())
            .map_err(|e| DubError::Media(format!("Encoder write failed at frame {}: {}", self.written, e)))?;

        self.written += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<usize> {
        // Closing stdin signals end of stream.
        drop(self.stdin.take());

        let status = self
            .child
            .wait()
            .map_err(|e| DubError::Media(format!("Encoder did not exit cleanly: {}", e)))?;

        if !status.success() {
            let mut stderr = String::new();
            if let Some(mut pipe) = self.child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            return Err(DubError::Media(format!("Frame encoding failed: {}", stderr)));
        }

        info!("Encoded {} frames", self.written);
        Ok(self.written)
    }
}
