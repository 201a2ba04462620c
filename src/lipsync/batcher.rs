use image::RgbImage;
use image::imageops::{self, FilterType};
use ndarray::Array4;
use tracing::debug;

use crate::error::{DubError, Result};
use super::audio::MelChunk;
use super::conditioning;
use super::face::{FaceBox, FaceDetection};

/// Fixed `(top, bottom, left, right)` face region that replaces detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxOverride {
    pub top: i32,
    pub bottom: i32,
    pub left: i32,
    pub right: i32,
}

impl BoxOverride {
    /// A first value of -1 means "detect instead".
    pub fn from_config(value: Option<[i32; 4]>) -> Option<Self> {
        value.filter(|b| b[0] != -1).map(|b| Self {
            top: b[0],
            bottom: b[1],
            left: b[2],
            right: b[3],
        })
    }

    /// The override clamped to every frame.
    pub fn detections_for(&self, frames: &[RgbImage]) -> Vec<FaceDetection> {
        frames
            .iter()
            .map(|frame| {
                FaceDetection::from(FaceBox::clamped(
                    self.top as i64,
                    self.bottom as i64,
                    self.left as i64,
                    self.right as i64,
                    frame.width(),
                    frame.height(),
                ))
            })
            .collect()
    }
}

/// One face crop with the audio it should speak and where it came from.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub face: RgbImage,
    pub mel: MelChunk,
    /// Index into the ingested frame list
    pub frame_index: usize,
    pub face_box: FaceBox,
}

#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub items: Vec<BatchItem>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Generator face input, `[B, 6, crop, crop]`.
    pub fn face_input(&self) -> Result<Array4<f32>> {
        let faces: Vec<RgbImage> = self.items.iter().map(|item| item.face.clone()).collect();
        conditioning::face_conditioning(&faces)
    }

    /// Generator audio input, `[B, 1, 80, 16]`.
    pub fn mel_input(&self) -> Result<Array4<f32>> {
        let mels: Vec<&MelChunk> = self.items.iter().map(|item| &item.mel).collect();
        conditioning::mel_conditioning(&mels)
    }
}

/// Crop `face` out of `frame` and resize it to `size x size`.
pub fn crop_face(frame: &RgbImage, face: FaceBox, size: u32, index: usize) -> Result<RgbImage> {
    if face.width() == 0 || face.height() == 0 || face.right() > frame.width() || face.bottom() > frame.height() {
        return Err(DubError::InvalidFaceRegion {
            index,
            width: face.width(),
            height: face.height(),
        });
    }

    let region = imageops::crop_imm(frame, face.left(), face.top(), face.width(), face.height()).to_image();
    Ok(imageops::resize(&region, size, size, FilterType::Lanczos3))
}

/// Pairs mel chunks with face crops, lazily, one batch at a time.
pub struct SynthesisBatcher<'a> {
    frames: &'a [RgbImage],
    mel_chunks: &'a [MelChunk],
    /// `(frame index, box)` for every frame with a face
    valid: Vec<(usize, FaceBox)>,
    batch_size: usize,
    crop_size: u32,
    is_static: bool,
    next_chunk: usize,
    failed: bool,
}

impl<'a> SynthesisBatcher<'a> {
    pub fn new(
        frames: &'a [RgbImage],
        detections: &[FaceDetection],
        mel_chunks: &'a [MelChunk],
        batch_size: usize,
        crop_size: u32,
        is_static: bool,
    ) -> Result<Self> {
        let valid: Vec<(usize, FaceBox)> = detections
            .iter()
            .enumerate()
            .take(frames.len())
            .filter_map(|(i, d)| d.face_box().map(|face| (i, face)))
            .collect();

        if valid.is_empty() {
            return Err(DubError::NoValidFrames);
        }
        if batch_size == 0 {
            return Err(DubError::Config("batch_size must be at least 1".to_string()));
        }

        let dropped = frames.len().min(detections.len()) - valid.len();
        if dropped > 0 {
            debug!("Dropping {} frames without a face", dropped);
        }

        Ok(Self {
            frames,
            mel_chunks,
            valid,
            batch_size,
            crop_size,
            is_static,
            next_chunk: 0,
            failed: false,
        })
    }

    pub fn valid_frames(&self) -> usize {
        self.valid.len()
    }

    /// Total number of batches this batcher yields.
    pub fn batch_count(&self) -> usize {
        self.mel_chunks.len().div_ceil(self.batch_size)
    }

    fn item(&self, chunk_index: usize) -> Result<BatchItem> {
        let slot = if self.is_static { 0 } else { chunk_index % self.valid.len() };
        let (frame_index, face_box) = self.valid[slot];
        let face = crop_face(&self.frames[frame_index], face_box, self.crop_size, frame_index)?;

        Ok(BatchItem {
            face,
            mel: self.mel_chunks[chunk_index].clone(),
            frame_index,
            face_box,
        })
    }
}

impl Iterator for SynthesisBatcher<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.next_chunk >= self.mel_chunks.len() {
            return None;
        }

        let end = (self.next_chunk + self.batch_size).min(self.mel_chunks.len());
        let mut batch = Batch {
            items: Vec::with_capacity(end - self.next_chunk),
        };

        for chunk_index in self.next_chunk..end {
            match self.item(chunk_index) {
                Ok(item) => batch.items.push(item),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }

        self.next_chunk = end;
        Some(Ok(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lipsync::audio::{MEL_STEP, NUM_MELS};
    use ndarray::Array2;

    fn frames(n: usize) -> Vec<RgbImage> {
        (0..n).map(|_| RgbImage::new(64, 48)).collect()
    }

    fn chunks(n: usize) -> Vec<MelChunk> {
        (0..n).map(|i| Array2::from_elem((NUM_MELS, MEL_STEP), i as f32)).collect()
    }

    fn detected(n: usize) -> Vec<FaceDetection> {
        let face = FaceBox::new(8, 40, 10, 50, 64, 48).unwrap();
        vec![FaceDetection::Detected(face); n]
    }

    #[test]
    fn test_batches_are_full_then_partial() {
        let frames = frames(100);
        let mels = chunks(100);
        let batcher = SynthesisBatcher::new(&frames, &detected(100), &mels, 32, 16, false).unwrap();
        assert_eq!(batcher.batch_count(), 4);

        let sizes: Vec<usize> = batcher.map(|b| b.unwrap().len()).collect();
        assert_eq!(sizes, vec![32, 32, 32, 4]);
    }

    #[test]
    fn test_missing_frames_are_dropped_and_cycled() {
        let frames = frames(4);
        let mels = chunks(6);
        let mut detections = detected(4);
        detections[1] = FaceDetection::Missing;

        let batch = SynthesisBatcher::new(&frames, &detections, &mels, 8, 16, false)
            .unwrap()
            .next()
            .unwrap()
            .unwrap();

        let indices: Vec<usize> = batch.items.iter().map(|item| item.frame_index).collect();
        assert_eq!(indices, vec![0, 2, 3, 0, 2, 3]);
        assert_eq!(batch.items[5].mel[[0, 0]], 5.0);
        assert!(batch.items.iter().all(|item| item.face.dimensions() == (16, 16)));
    }

    #[test]
    fn test_static_source_reuses_first_frame() {
        let frames = frames(1);
        let mels = chunks(5);
        let batch = SynthesisBatcher::new(&frames, &detected(1), &mels, 8, 16, true)
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 5);
        assert!(batch.items.iter().all(|item| item.frame_index == 0));
    }

    #[test]
    fn test_no_faces_is_an_error() {
        let frames = frames(3);
        let mels = chunks(3);
        let result = SynthesisBatcher::new(&frames, &vec![FaceDetection::Missing; 3], &mels, 8, 16, false);
        assert!(matches!(result, Err(DubError::NoValidFrames)));
    }

    #[test]
    fn test_box_from_another_geometry_is_rejected() {
        let small = RgbImage::new(20, 20);
        let face = FaceBox::new(0, 40, 0, 40, 64, 64).unwrap();
        let err = crop_face(&small, face, 16, 7).unwrap_err();
        assert!(matches!(err, DubError::InvalidFaceRegion { index: 7, width: 40, height: 40 }));
    }

    #[test]
    fn test_override_sentinel_and_clamping() {
        assert_eq!(BoxOverride::from_config(Some([-1, 10, 0, 10])), None);
        assert_eq!(BoxOverride::from_config(None), None);

        let forced = BoxOverride::from_config(Some([0, 500, 5, 30])).unwrap();
        let detections = forced.detections_for(&frames(2));
        let face = detections[0].face_box().unwrap();
        assert_eq!((face.top(), face.bottom(), face.left(), face.right()), (0, 48, 5, 30));
        assert_eq!(detections[1], detections[0]);
    }

    #[test]
    fn test_batch_inputs_have_generator_shapes() {
        let frames = frames(2);
        let mels = chunks(2);
        let batch = SynthesisBatcher::new(&frames, &detected(2), &mels, 8, 16, false)
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(batch.face_input().unwrap().dim(), (2, 6, 16, 16));
        assert_eq!(batch.mel_input().unwrap().dim(), (2, 1, NUM_MELS, MEL_STEP));
    }
}
