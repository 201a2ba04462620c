use image::RgbImage;
use image::imageops::{self, FilterType};
use std::path::Path;
use tracing::info;

use crate::error::{DubError, Result};
use crate::media::MediaProcessorTrait;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Frame transforms applied once at ingestion, in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOptions {
    /// Integer downscale divisor, 1 keeps the source size
    pub resize_factor: u32,
    /// Rotate 90 degrees clockwise
    pub rotate: bool,
    /// `(top, bottom, left, right)`; -1 for bottom or right means the far edge
    pub crop: Option<[i32; 4]>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            resize_factor: 1,
            rotate: false,
            crop: None,
        }
    }
}

/// Decoded face source.
#[derive(Debug, Clone)]
pub struct SourceFrames {
    pub frames: Vec<RgbImage>,
    pub fps: f64,
    /// A single image drives every output frame
    pub is_static: bool,
}

impl SourceFrames {
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.frames.first().map(RgbImage::dimensions)
    }
}

pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Load a face video or still image and apply the ingestion transforms.
/// `force_static` keeps only the first frame of a video.
pub async fn load_source(
    media: &dyn MediaProcessorTrait,
    path: &Path,
    static_fps: f64,
    force_static: bool,
    options: IngestOptions,
) -> Result<SourceFrames> {
    if !path.exists() {
        return Err(DubError::FileNotFound(path.display().to_string()));
    }

    let (raw, fps, is_static) = if is_image_path(path) {
        let image = image::open(path)?.to_rgb8();
        (vec![image], static_fps, true)
    } else {
        let info = media.probe_video(path).await?;
        let mut frames = media.decode_frames(path, &info).await?;
        if force_static {
            frames.truncate(1);
        }
        (frames, info.fps, force_static)
    };

    if raw.is_empty() {
        return Err(DubError::Media(format!("No frames decoded from {}", path.display())));
    }

    let frames = raw
        .into_iter()
        .enumerate()
        .map(|(i, frame)| prepare_frame(frame, options, i))
        .collect::<Result<Vec<_>>>()?;

    info!("Number of frames available for inference: {}", frames.len());
    Ok(SourceFrames {
        frames,
        fps,
        is_static,
    })
}

/// Resize, rotate, then crop one frame.
pub fn prepare_frame(frame: RgbImage, options: IngestOptions, index: usize) -> Result<RgbImage> {
    let mut frame = frame;

    if options.resize_factor > 1 {
        let width = (frame.width() / options.resize_factor).max(1);
        let height = (frame.height() / options.resize_factor).max(1);
        frame = imageops::resize(&frame, width, height, FilterType::Triangle);
    }

    if options.rotate {
        frame = imageops::rotate90(&frame);
    }

    match options.crop {
        Some(crop) => crop_frame(&frame, crop, index),
        None => Ok(frame),
    }
}

fn crop_frame(frame: &RgbImage, crop: [i32; 4], index: usize) -> Result<RgbImage> {
    let [top, bottom, left, right] = crop;
    let bottom = if bottom == -1 { frame.height() as i64 } else { bottom as i64 };
    let right = if right == -1 { frame.width() as i64 } else { right as i64 };
    let (top, left) = (top as i64, left as i64);

    let inside = 0 <= top
        && top < bottom
        && bottom <= frame.height() as i64
        && 0 <= left
        && left < right
        && right <= frame.width() as i64;
    if !inside {
        return Err(DubError::Config(format!(
            "Crop {:?} does not fit frame {} ({}x{})",
            crop,
            index,
            frame.width(),
            frame.height()
        )));
    }

    Ok(imageops::crop_imm(
        frame,
        left as u32,
        top as u32,
        (right - left) as u32,
        (bottom - top) as u32,
    )
    .to_image())
}
