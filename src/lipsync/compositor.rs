use image::RgbImage;
use image::imageops::{self, FilterType};

use crate::error::{DubError, Result};
use super::face::FaceBox;

/// Ordered consumer of finished frames.
pub trait FrameSink: Send {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()>;

    /// Flush and close the stream, returning the number of frames written.
    fn finish(&mut self) -> Result<usize>;
}

/// Paste a generated face `region` into a copy of `frame` at `face`.
pub fn composite(frame: &RgbImage, face: FaceBox, region: &RgbImage) -> Result<RgbImage> {
    if face.right() > frame.width() || face.bottom() > frame.height() {
        return Err(DubError::InvalidFaceRegion {
            index: 0,
            width: face.width(),
            height: face.height(),
        });
    }

    let patch = if region.dimensions() == (face.width(), face.height()) {
        region.clone()
    } else {
        imageops::resize(region, face.width(), face.height(), FilterType::Lanczos3)
    };

    let mut out = frame.clone();
    imageops::replace(&mut out, &patch, face.left() as i64, face.top() as i64);
    Ok(out)
}

/// Keeps frames in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub frames: Vec<RgbImage>,
    pub finished: bool,
}

impl FrameSink for MemorySink {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        if self.finished {
            return Err(DubError::Media("Sink already finished".to_string()));
        }
        self.frames.push(frame.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<usize> {
        self.finished = true;
        Ok(self.frames.len())
    }
}
