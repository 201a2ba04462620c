use image::RgbImage;
use tracing::{debug, info, warn};

use crate::error::{DubError, Result};
use super::face::{DetectError, FaceBox, FaceDetection, FaceDetector, Padding, Rect};

/// Batch sizing for face detection. Each out-of-memory failure halves the
/// batch size and restarts the pass; at size 1 there is nothing left to try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionRetryPolicy {
    initial_batch_size: usize,
}

impl DetectionRetryPolicy {
    pub fn new(initial_batch_size: usize) -> Self {
        Self {
            initial_batch_size: initial_batch_size.max(1),
        }
    }

    pub fn initial_batch_size(&self) -> usize {
        self.initial_batch_size
    }

    /// Batch size to retry with after `current` ran out of memory.
    pub fn next_batch_size(&self, current: usize) -> Option<usize> {
        (current > 1).then_some(current / 2)
    }

    /// Upper bound on the number of detection passes.
    pub fn max_attempts(&self) -> usize {
        let mut attempts = 1;
        let mut size = self.initial_batch_size;
        while let Some(next) = self.next_batch_size(size) {
            attempts += 1;
            size = next;
        }
        attempts
    }
}

impl Default for DetectionRetryPolicy {
    fn default() -> Self {
        Self::new(4)
    }
}

/// Detects one face per frame and stabilizes the boxes over time.
pub struct FaceTracker<'a> {
    detector: &'a mut dyn FaceDetector,
    policy: DetectionRetryPolicy,
    min_coverage: f64,
}

impl<'a> FaceTracker<'a> {
    pub fn new(detector: &'a mut dyn FaceDetector, policy: DetectionRetryPolicy, min_coverage: f64) -> Self {
        Self {
            detector,
            policy,
            min_coverage,
        }
    }

    /// One detection per input frame. `smoothing_window` of `None`, 0 or 1 keeps raw boxes.
    pub async fn detect(
        &mut self,
        frames: &[RgbImage],
        padding: Padding,
        smoothing_window: Option<usize>,
    ) -> Result<Vec<FaceDetection>> {
        let rects = self.detect_with_recovery(frames).await?;

        let detections: Vec<FaceDetection> = frames
            .iter()
            .zip(rects)
            .map(|(frame, rect)| {
                FaceDetection::from(
                    rect.and_then(|r| FaceBox::from_rect(r, padding, frame.width(), frame.height())),
                )
            })
            .collect();

        check_coverage(&detections, self.min_coverage)?;

        Ok(match smoothing_window {
            Some(window) if window > 1 => smooth_detections(&detections, window),
            _ => detections,
        })
    }

    async fn detect_with_recovery(&mut self, frames: &[RgbImage]) -> Result<Vec<Option<Rect>>> {
        let mut batch_size = self.policy.initial_batch_size();
        let attempts = self.policy.max_attempts();

        for attempt in 1..=attempts {
            match self.detect_pass(frames, batch_size).await {
                Ok(rects) => {
                    info!("Face detection finished with batch size {}", batch_size);
                    return Ok(rects);
                }
                Err(DetectError::OutOfMemory) => match self.policy.next_batch_size(batch_size) {
                    Some(next) => {
                        warn!(
                            "Recovering from OOM error; new batch size: {} (attempt {}/{})",
                            next,
                            attempt + 1,
                            attempts
                        );
                        batch_size = next;
                    }
                    None => break,
                },
                Err(DetectError::Failed(e)) => return Err(e),
            }
        }

        Err(DubError::ResourceExhausted {
            batch_size,
            frames: frames.len(),
        })
    }

    async fn detect_pass(
        &mut self,
        frames: &[RgbImage],
        batch_size: usize,
    ) -> std::result::Result<Vec<Option<Rect>>, DetectError> {
        let mut rects = Vec::with_capacity(frames.len());

        for (i, batch) in frames.chunks(batch_size).enumerate() {
            let found = self.detector.detect_batch(batch).await?;
            if found.len() != batch.len() {
                return Err(DubError::Inference(format!(
                    "Detector returned {} results for a batch of {} frames (batch {})",
                    found.len(),
                    batch.len(),
                    i
                ))
                .into());
            }
            debug!("Detection batch {}: {} frames", i, batch.len());
            rects.extend(found);
        }

        Ok(rects)
    }
}

/// Fail unless the detected fraction is strictly above `threshold`.
pub fn check_coverage(detections: &[FaceDetection], threshold: f64) -> Result<()> {
    let total = detections.len();
    let detected = detections.iter().filter(|d| d.is_detected()).count();
    let fraction = if total == 0 {
        0.0
    } else {
        detected as f64 / total as f64
    };

    info!("Face coverage {}/{} ({:.3})", detected, total, fraction);

    if fraction > threshold {
        Ok(())
    } else {
        Err(DubError::InsufficientFaceCoverage {
            fraction,
            threshold,
            detected,
            total,
        })
    }
}

/// Average each detected box with the following `window - 1` detected boxes.
/// Missing frames are skipped entirely; near the end the window shrinks.
pub fn smooth_detections(detections: &[FaceDetection], window: usize) -> Vec<FaceDetection> {
    let boxes: Vec<FaceBox> = detections.iter().filter_map(FaceDetection::face_box).collect();
    if boxes.is_empty() || window <= 1 {
        return detections.to_vec();
    }

    let mut smoothed = Vec::with_capacity(boxes.len());
    for i in 0..boxes.len() {
        let run = &boxes[i..(i + window).min(boxes.len())];
        smoothed.push(mean_box(run).unwrap_or(boxes[i]));
    }

    let mut next = smoothed.into_iter();
    detections
        .iter()
        .map(|detection| match detection {
            FaceDetection::Detected(original) => FaceDetection::Detected(next.next().unwrap_or(*original)),
            FaceDetection::Missing => FaceDetection::Missing,
        })
        .collect()
}

/// Truncated mean of a run of boxes. `None` if the mean collapses to an empty region.
fn mean_box(run: &[FaceBox]) -> Option<FaceBox> {
    let n = run.len() as u64;
    let sum = |f: fn(&FaceBox) -> u32| run.iter().map(|b| f(b) as u64).sum::<u64>() / n;

    let top = sum(FaceBox::top) as u32;
    let bottom = sum(FaceBox::bottom) as u32;
    let left = sum(FaceBox::left) as u32;
    let right = sum(FaceBox::right) as u32;

    // Every member already lies inside the frame, so the mean does too.
    FaceBox::new(top, bottom, left, right, u32::MAX, u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceContext;
    use async_trait::async_trait;

    /// Finds a face in the listed frames and runs out of memory above `max_batch`.
    struct ScriptedDetector {
        face_in: Box<dyn Fn(usize) -> bool + Send + Sync>,
        max_batch: usize,
        seen: usize,
        batch_sizes: Vec<usize>,
    }

    impl ScriptedDetector {
        fn new(face_in: impl Fn(usize) -> bool + Send + Sync + 'static, max_batch: usize) -> Self {
            Self {
                face_in: Box::new(face_in),
                max_batch,
                seen: 0,
                batch_sizes: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl FaceDetector for ScriptedDetector {
        async fn load(&mut self, _device: &DeviceContext) -> Result<()> {
            Ok(())
        }

        async fn detect_batch(
            &mut self,
            frames: &[RgbImage],
        ) -> std::result::Result<Vec<Option<Rect>>, DetectError> {
            self.batch_sizes.push(frames.len());
            if frames.len() > self.max_batch {
                self.seen = 0;
                return Err(DetectError::OutOfMemory);
            }
            let out = (0..frames.len())
                .map(|i| (self.face_in)(self.seen + i).then(|| Rect::new(8, 8, 24, 24)))
                .collect();
            self.seen += frames.len();
            Ok(out)
        }

        async fn unload(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn frames(n: usize) -> Vec<RgbImage> {
        (0..n).map(|_| RgbImage::new(32, 32)).collect()
    }

    fn face(top: u32, bottom: u32, left: u32, right: u32) -> FaceBox {
        FaceBox::new(top, bottom, left, right, 100, 100).unwrap()
    }

    #[tokio::test]
    async fn test_output_length_matches_input_and_keeps_missing() {
        let mut detector = ScriptedDetector::new(|i| i % 4 != 3, 4);
        let mut tracker = FaceTracker::new(&mut detector, DetectionRetryPolicy::new(4), 0.5);

        let detections = tracker.detect(&frames(12), Padding::default(), Some(5)).await.unwrap();

        assert_eq!(detections.len(), 12);
        for (i, d) in detections.iter().enumerate() {
            assert_eq!(d.is_detected(), i % 4 != 3, "frame {}", i);
        }
    }

    #[tokio::test]
    async fn test_coverage_boundary() {
        let mut detector = ScriptedDetector::new(|i| i < 50, 4);
        let mut tracker = FaceTracker::new(&mut detector, DetectionRetryPolicy::new(4), 0.5);
        let err = tracker.detect(&frames(100), Padding::default(), None).await.unwrap_err();
        assert!(matches!(
            err,
            DubError::InsufficientFaceCoverage { detected: 50, total: 100, .. }
        ));

        let mut detector = ScriptedDetector::new(|i| i < 51, 4);
        let mut tracker = FaceTracker::new(&mut detector, DetectionRetryPolicy::new(4), 0.5);
        let detections = tracker.detect(&frames(100), Padding::default(), None).await.unwrap();
        assert_eq!(detections.iter().filter(|d| d.is_detected()).count(), 51);
    }

    #[tokio::test]
    async fn test_oom_halves_and_restarts() {
        let mut detector = ScriptedDetector::new(|_| true, 1);
        {
            let mut tracker = FaceTracker::new(&mut detector, DetectionRetryPolicy::new(4), 0.5);
            let detections = tracker.detect(&frames(3), Padding::default(), None).await.unwrap();
            assert_eq!(detections.len(), 3);
        }
        // Sizes 4 and 2 run out of memory, then three single-frame batches succeed.
        assert_eq!(detector.batch_sizes, vec![3, 2, 1, 1, 1]);
    }

    #[tokio::test]
    async fn test_oom_at_batch_one_is_fatal() {
        let mut detector = ScriptedDetector::new(|_| true, 0);
        let mut tracker = FaceTracker::new(&mut detector, DetectionRetryPolicy::new(4), 0.5);

        let err = tracker.detect(&frames(6), Padding::default(), None).await.unwrap_err();
        assert!(matches!(err, DubError::ResourceExhausted { batch_size: 1, frames: 6 }));
    }

    #[test]
    fn test_retry_policy_is_bounded() {
        let policy = DetectionRetryPolicy::new(4);
        assert_eq!(policy.next_batch_size(4), Some(2));
        assert_eq!(policy.next_batch_size(2), Some(1));
        assert_eq!(policy.next_batch_size(1), None);
        assert_eq!(policy.max_attempts(), 3);
    }

    #[test]
    fn test_smoothing_identical_boxes_is_identity() {
        let detections = vec![FaceDetection::Detected(face(10, 50, 20, 60)); 10];
        assert_eq!(smooth_detections(&detections, 5), detections);
    }

    #[test]
    fn test_smoothing_skips_missing_slots() {
        let detections = vec![
            FaceDetection::Detected(face(0, 10, 0, 10)),
            FaceDetection::Missing,
            FaceDetection::Detected(face(10, 20, 10, 20)),
            FaceDetection::Detected(face(20, 30, 20, 30)),
        ];
        let smoothed = smooth_detections(&detections, 2);

        assert_eq!(smoothed[1], FaceDetection::Missing);
        // Detected run is [b0, b2, b3]; the window pairs b0 with b2, not the missing slot.
        assert_eq!(smoothed[0], FaceDetection::Detected(face(5, 15, 5, 15)));
        assert_eq!(smoothed[2], FaceDetection::Detected(face(15, 25, 15, 25)));
        // The last box has nothing ahead of it.
        assert_eq!(smoothed[3], FaceDetection::Detected(face(20, 30, 20, 30)));
    }

    #[test]
    fn test_smoothing_window_shrinks_at_the_tail() {
        let detections: Vec<FaceDetection> = (0..6)
            .map(|i| FaceDetection::Detected(face(i * 10, i * 10 + 20, i * 10, i * 10 + 20)))
            .collect();
        let smoothed = smooth_detections(&detections, 5);

        // Full windows: mean of tops 0..=40 and 10..=50.
        assert_eq!(smoothed[0], FaceDetection::Detected(face(20, 40, 20, 40)));
        assert_eq!(smoothed[1], FaceDetection::Detected(face(30, 50, 30, 50)));
        // Tail windows only look forward: [40, 50] and [50].
        assert_eq!(smoothed[4], FaceDetection::Detected(face(45, 65, 45, 65)));
        assert_eq!(smoothed[5], FaceDetection::Detected(face(50, 70, 50, 70)));
    }

    #[tokio::test]
    async fn test_detection_passes_never_exceed_policy_attempts() {
        let mut detector = ScriptedDetector::new(|_| true, 0);
        {
            let mut tracker = FaceTracker::new(&mut detector, DetectionRetryPolicy::new(8), 0.5);
            let err = tracker.detect(&frames(16), Padding::default(), None).await.unwrap_err();
            assert!(matches!(err, DubError::ResourceExhausted { batch_size: 1, frames: 16 }));
        }
        // Sizes 8, 4, 2 and 1 each fail on their first batch.
        assert_eq!(detector.batch_sizes, vec![8, 4, 2, 1]);
        assert_eq!(DetectionRetryPolicy::new(8).max_attempts(), 4);
    }
}
