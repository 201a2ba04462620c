// Codec service: everything that touches containers goes through ffmpeg/ffprobe.
//
// - Commands: argument builders for each ffmpeg invocation
// - Processor: the ffmpeg-backed MediaProcessorTrait implementation and the
//   streaming frame encoder

pub mod commands;
pub mod processor;

use async_trait::async_trait;
use image::RgbImage;
use std::path::Path;

pub use commands::*;
pub use processor::*;

use crate::config::MediaConfig;
use crate::error::Result;
use crate::lipsync::FrameSink;

/// Geometry and timing of the first video stream of a file
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Container duration in seconds, when reported
    pub duration: Option<f64>,
    /// Frame count, when reported by the container
    pub frame_count: Option<u64>,
}

/// Main trait for media processing operations
#[async_trait]
pub trait MediaProcessorTrait: Send + Sync {
    /// Extract audio from video as 16 kHz mono PCM WAV
    async fn extract_audio(&self, video_path: &Path, audio_path: &Path) -> Result<()>;

    /// Extract the first `seconds` of audio as the voice-cloning reference
    async fn extract_reference_audio(
        &self,
        video_path: &Path,
        audio_path: &Path,
        seconds: f64,
    ) -> Result<()>;

    /// Probe the first video stream
    async fn probe_video(&self, video_path: &Path) -> Result<VideoInfo>;

    /// Decode every frame of the first video stream
    async fn decode_frames(&self, video_path: &Path, info: &VideoInfo) -> Result<Vec<RgbImage>>;

    /// Open a streaming encoder writing raw frames into a video-only file
    fn open_encoder(
        &self,
        output_path: &Path,
        width: u32,
        height: u32,
        fps: f64,
    ) -> Result<Box<dyn FrameSink>>;

    /// Replace the audio of `video_path` with `audio_path`
    async fn mux_audio(&self, video_path: &Path, audio_path: &Path, output_path: &Path) -> Result<()>;

    /// Change audio tempo by `tempo` (> 1 speeds up) without changing pitch
    async fn stretch_audio(&self, input_path: &Path, output_path: &Path, tempo: f64) -> Result<()>;

    /// Blank the subtitle band of a video
    async fn remove_subtitle_band(
        &self,
        input_path: &Path,
        output_path: &Path,
        band: SubtitleBand,
    ) -> Result<()>;

    /// Check if media processor is available
    fn check_availability(&self) -> Result<()>;
}

/// Factory for creating media processor instances
pub struct MediaProcessorFactory;

impl MediaProcessorFactory {
    /// Create the default media processor implementation (FFmpeg-based)
    pub fn create_processor(config: MediaConfig) -> Box<dyn MediaProcessorTrait> {
        Box::new(processor::MediaProcessorImpl::new(config))
    }
}
