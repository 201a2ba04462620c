use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::LipSyncConfig;
use crate::device::DeviceContext;
use crate::error::{DubError, Result};
use crate::media::MediaProcessorTrait;
use super::audio::{self, MelChunk, MelSpectrogram, SAMPLE_RATE, WavAudio};
use super::batcher::{BoxOverride, SynthesisBatcher};
use super::compositor::{FrameSink, composite};
use super::face::{FaceDetection, FaceDetector, Padding};
use super::frame::{self, IngestOptions, SourceFrames};
use super::synthesizer::{FrameSynthesizer, GeneratorLoader};
use super::tracker::{DetectionRetryPolicy, FaceTracker};

/// One lip resynthesis job.
#[derive(Debug, Clone)]
pub struct LipSyncRequest {
    /// Video or still image with the face
    pub face: PathBuf,
    /// Driving speech
    pub audio: PathBuf,
    pub output: PathBuf,
    /// Use only the first frame of the face source
    pub force_static: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LipSyncReport {
    pub frames_written: usize,
    pub mel_chunks: usize,
    pub batches: usize,
    pub valid_frames: usize,
    pub fps: f64,
}

/// Detects, batches, generates and composites faces for one video.
pub struct LipSyncEngine {
    config: LipSyncConfig,
    media: Arc<dyn MediaProcessorTrait>,
    detector: Box<dyn FaceDetector>,
    loader: Box<dyn GeneratorLoader>,
    show_progress: bool,
}

impl LipSyncEngine {
    pub fn new(
        config: LipSyncConfig,
        media: Arc<dyn MediaProcessorTrait>,
        detector: Box<dyn FaceDetector>,
        loader: Box<dyn GeneratorLoader>,
    ) -> Self {
        Self {
            config,
            media,
            detector,
            loader,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub async fn run(&mut self, request: &LipSyncRequest, device: &DeviceContext) -> Result<LipSyncReport> {
        info!(
            "Lip sync: face {} driven by {} on {}",
            request.face.display(),
            request.audio.display(),
            device.device()
        );

        let work_dir = tempfile::tempdir()?;

        let options = IngestOptions {
            resize_factor: self.config.resize_factor,
            rotate: self.config.rotate,
            crop: self.config.crop,
        };
        let mut source = frame::load_source(
            self.media.as_ref(),
            &request.face,
            self.config.static_fps,
            request.force_static,
            options,
        )
        .await?;

        let driving = self.load_driving_audio(&request.audio, work_dir.path()).await?;
        let mel = MelSpectrogram::new().compute(&driving.samples)?;
        let chunks = audio::mel_chunks(&mel, source.fps)?;

        if source.frames.len() > chunks.len() {
            source.frames.truncate(chunks.len());
        }

        let detections = self.detect_faces(&source, device).await?;

        let render_path = work_dir.path().join("render.mp4");
        let report = self
            .render(&source, &detections, &chunks, &render_path, device)
            .await?;

        if let Some(parent) = request.output.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        self.media
            .mux_audio(&render_path, &request.audio, &request.output)
            .await?;

        info!(
            "Lip sync finished: {} frames written to {}",
            report.frames_written,
            request.output.display()
        );
        Ok(report)
    }

    /// 16 kHz mono samples; anything else goes through the codec service first.
    async fn load_driving_audio(&self, path: &Path, work_dir: &Path) -> Result<WavAudio> {
        if !path.exists() {
            return Err(DubError::FileNotFound(path.display().to_string()));
        }

        let is_wav = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"));

        if is_wav {
            let wav = audio::read_wav(path)?;
            if wav.sample_rate == SAMPLE_RATE {
                return Ok(wav);
            }
            info!("Resampling {} Hz audio to {} Hz", wav.sample_rate, SAMPLE_RATE);
        } else {
            info!("Extracting raw audio...");
        }

        let converted = work_dir.join("driving.wav");
        self.media.extract_audio(path, &converted).await?;
        audio::read_wav(&converted)
    }

    async fn detect_faces(&mut self, source: &SourceFrames, device: &DeviceContext) -> Result<Vec<FaceDetection>> {
        if let Some(fixed) = BoxOverride::from_config(self.config.fixed_box) {
            info!("Using the specified bounding box instead of face detection...");
            return Ok(fixed.detections_for(&source.frames));
        }

        let frames = if source.is_static {
            &source.frames[..1]
        } else {
            &source.frames[..]
        };
        let smoothing = (self.config.smoothing_window > 1).then_some(self.config.smoothing_window);

        self.detector.load(device).await?;
        let detected = {
            let mut tracker = FaceTracker::new(
                self.detector.as_mut(),
                DetectionRetryPolicy::new(self.config.face_det_batch_size),
                self.config.min_face_coverage,
            );
            tracker
                .detect(frames, Padding::from(self.config.pads), smoothing)
                .await
        };
        let unloaded = self.detector.unload().await;

        let detections = detected?;
        unloaded?;
        Ok(detections)
    }

    async fn render(
        &self,
        source: &SourceFrames,
        detections: &[FaceDetection],
        chunks: &[MelChunk],
        render_path: &Path,
        device: &DeviceContext,
    ) -> Result<LipSyncReport> {
        let batcher = SynthesisBatcher::new(
            &source.frames,
            detections,
            chunks,
            self.config.batch_size,
            self.config.crop_size,
            source.is_static,
        )?;
        let batches = batcher.batch_count();
        let valid_frames = batcher.valid_frames();

        let (width, height) = source
            .dimensions()
            .ok_or_else(|| DubError::Media("Face source has no frames".to_string()))?;
        let mut sink = self.media.open_encoder(render_path, width, height, source.fps)?;
        let mut synthesizer = FrameSynthesizer::new(self.loader.as_ref(), &self.config.checkpoint_path);

        let progress = self.progress_bar(batches);
        let written = write_batches(batcher, &source.frames, &mut synthesizer, sink.as_mut(), device, &progress).await;
        progress.finish_and_clear();

        let released = synthesizer.release().await;
        let frames_written = match written {
            Ok(()) => sink.finish()?,
            Err(e) => {
                if let Err(finish_err) = sink.finish() {
                    warn!("Discarding partial render: {}", finish_err);
                }
                return Err(e);
            }
        };
        released?;

        Ok(LipSyncReport {
            frames_written,
            mel_chunks: chunks.len(),
            batches,
            valid_frames,
            fps: source.fps,
        })
    }

    fn progress_bar(&self, batches: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let progress = ProgressBar::new(batches as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} batches ({eta})")
        {
            progress.set_style(style.progress_chars("#>-"));
        }
        progress
    }
}

async fn write_batches(
    batcher: SynthesisBatcher<'_>,
    frames: &[image::RgbImage],
    synthesizer: &mut FrameSynthesizer<'_>,
    sink: &mut dyn FrameSink,
    device: &DeviceContext,
    progress: &ProgressBar,
) -> Result<()> {
    for batch in batcher {
        let batch = batch?;
        let regions = synthesizer.synthesize(&batch, device).await?;

        for (item, region) in batch.items.iter().zip(&regions) {
            let frame = composite(&frames[item.frame_index], item.face_box, region).map_err(|e| match e {
                DubError::InvalidFaceRegion { width, height, .. } => DubError::InvalidFaceRegion {
                    index: item.frame_index,
                    width,
                    height,
                },
                other => other,
            })?;
            sink.write_frame(&frame)?;
        }
        progress.inc(1);
    }
    Ok(())
}
