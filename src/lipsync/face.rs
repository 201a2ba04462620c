use async_trait::async_trait;
use image::RgbImage;
use thiserror::Error;

use crate::device::DeviceContext;
use crate::error::{DubError, Result};

/// Raw detector output in frame pixels, `(x1, y1)` top-left and `(x2, y2)` bottom-right.
/// Coordinates may fall outside the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Rect {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

/// Pixels added around a detected rect, `(top, bottom, left, right)`. Negative values shrink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Padding {
    pub top: i32,
    pub bottom: i32,
    pub left: i32,
    pub right: i32,
}

impl From<[i32; 4]> for Padding {
    fn from(pads: [i32; 4]) -> Self {
        Self {
            top: pads[0],
            bottom: pads[1],
            left: pads[2],
            right: pads[3],
        }
    }
}

/// Face region of one frame. Always satisfies
/// `top < bottom <= frame height` and `left < right <= frame width`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceBox {
    top: u32,
    bottom: u32,
    left: u32,
    right: u32,
}

impl FaceBox {
    /// Build a box, rejecting empty or out-of-frame regions.
    pub fn new(top: u32, bottom: u32, left: u32, right: u32, frame_width: u32, frame_height: u32) -> Option<Self> {
        (top < bottom && bottom <= frame_height && left < right && right <= frame_width).then_some(Self {
            top,
            bottom,
            left,
            right,
        })
    }

    /// Clamp signed edges to the frame, then validate.
    pub fn clamped(top: i64, bottom: i64, left: i64, right: i64, frame_width: u32, frame_height: u32) -> Option<Self> {
        let clamp = |v: i64, max: u32| v.clamp(0, max as i64) as u32;
        Self::new(
            clamp(top, frame_height),
            clamp(bottom, frame_height),
            clamp(left, frame_width),
            clamp(right, frame_width),
            frame_width,
            frame_height,
        )
    }

    /// Apply padding to a detector rect and clamp to the frame.
    pub fn from_rect(rect: Rect, padding: Padding, frame_width: u32, frame_height: u32) -> Option<Self> {
        Self::clamped(
            rect.y1 as i64 - padding.top as i64,
            rect.y2 as i64 + padding.bottom as i64,
            rect.x1 as i64 - padding.left as i64,
            rect.x2 as i64 + padding.right as i64,
            frame_width,
            frame_height,
        )
    }

    pub fn top(&self) -> u32 {
        self.top
    }

    pub fn bottom(&self) -> u32 {
        self.bottom
    }

    pub fn left(&self) -> u32 {
        self.left
    }

    pub fn right(&self) -> u32 {
        self.right
    }

    pub fn width(&self) -> u32 {
        self.right - self.left
    }

    pub fn height(&self) -> u32 {
        self.bottom - self.top
    }
}

/// Per-frame outcome of face tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceDetection {
    Detected(FaceBox),
    Missing,
}

impl FaceDetection {
    pub fn face_box(&self) -> Option<FaceBox> {
        match self {
            FaceDetection::Detected(face) => Some(*face),
            FaceDetection::Missing => None,
        }
    }

    pub fn is_detected(&self) -> bool {
        matches!(self, FaceDetection::Detected(_))
    }
}

impl From<Option<FaceBox>> for FaceDetection {
    fn from(face: Option<FaceBox>) -> Self {
        face.map_or(FaceDetection::Missing, FaceDetection::Detected)
    }
}

#[derive(Debug, Error)]
pub enum DetectError {
    /// The detector could not fit the batch in device memory.
    #[error("face detector ran out of device memory")]
    OutOfMemory,

    #[error(transparent)]
    Failed(#[from] DubError),
}

/// Single-face detector run over batches of frames.
#[async_trait]
pub trait FaceDetector: Send + Sync {
    /// Bring the detector onto the device.
    async fn load(&mut self, device: &DeviceContext) -> Result<()>;

    /// One entry per input frame, `None` when no face was found.
    async fn detect_batch(&mut self, frames: &[RgbImage]) -> std::result::Result<Vec<Option<Rect>>, DetectError>;

    /// Drop the detector weights.
    async fn unload(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_face_box_rejects_degenerate() {
        assert!(FaceBox::new(10, 10, 0, 5, 100, 100).is_none());
        assert!(FaceBox::new(0, 101, 0, 5, 100, 100).is_none());
        assert!(FaceBox::new(0, 20, 30, 20, 100, 100).is_none());

        let face = FaceBox::new(10, 40, 20, 60, 100, 100).unwrap();
        assert_eq!((face.width(), face.height()), (40, 30));
    }

    #[test]
    fn test_from_rect_pads_and_clamps() {
        let padding = Padding::from([0, 10, 0, 0]);
        let face = FaceBox::from_rect(Rect::new(-5, 20, 50, 95), padding, 64, 100).unwrap();
        assert_eq!(face.top(), 20);
        assert_eq!(face.bottom(), 100);
        assert_eq!(face.left(), 0);
        assert_eq!(face.right(), 50);

        // Entirely outside the frame collapses to nothing.
        assert!(FaceBox::from_rect(Rect::new(200, 200, 300, 300), padding, 64, 100).is_none());
    }
}
