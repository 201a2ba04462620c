use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::device::DeviceContext;
use crate::error::{DubError, Result};
use crate::inpaint::SubtitleRemover;
use crate::lipsync::{LipSyncEngine, LipSyncRequest};
use crate::media::MediaProcessorTrait;
use crate::transcribe::TranscriberTrait;
use crate::translate::{self, TranslatorTrait};
use crate::voice::VoiceSynthesizer;
use super::{RunContext, Stage, StageKind};

/// Return the first error of two cleanup steps, after running both.
fn first_error(a: Result<()>, b: Result<()>) -> Result<()> {
    a.and(b)
}

/// Speech recognition followed by translation of every segment.
pub struct TranscribeTranslateStage {
    transcriber: Box<dyn TranscriberTrait>,
    translator: Box<dyn TranslatorTrait>,
    media: Arc<dyn MediaProcessorTrait>,
    reference_seconds: f64,
}

impl TranscribeTranslateStage {
    pub fn new(
        transcriber: Box<dyn TranscriberTrait>,
        translator: Box<dyn TranslatorTrait>,
        media: Arc<dyn MediaProcessorTrait>,
        reference_seconds: f64,
    ) -> Self {
        Self {
            transcriber,
            translator,
            media,
            reference_seconds,
        }
    }
}

#[async_trait]
impl Stage for TranscribeTranslateStage {
    fn kind(&self) -> StageKind {
        StageKind::TranscribeTranslate
    }

    async fn load(&mut self, device: &DeviceContext) -> Result<()> {
        self.transcriber.load(device).await?;
        self.translator.load(device).await
    }

    async fn run(&mut self, ctx: &mut RunContext, _device: &DeviceContext) -> Result<()> {
        let audio_path = ctx.work_path("source.wav");
        info!("Extracting audio from {}", ctx.input_video.display());
        self.media.extract_audio(&ctx.input_video, &audio_path).await?;

        let video = self.media.probe_video(&ctx.input_video).await?;
        ctx.video_duration = video.duration;

        let transcript = self.transcriber.transcribe(&audio_path).await?;
        if transcript.is_empty() {
            return Err(DubError::Transcriber(format!(
                "No speech recognized in {}",
                ctx.input_video.display()
            )));
        }

        ctx.reference_text = transcript.text_until(self.reference_seconds);
        info!("Reference text: {}", ctx.reference_text);

        let translation =
            translate::translate_transcription(self.translator.as_ref(), &transcript, &ctx.target_language).await;
        info!("Translated text: {}", translation.text());

        ctx.source_audio = Some(audio_path);
        ctx.transcript = Some(transcript);
        ctx.translation = Some(translation);
        Ok(())
    }

    async fn unload(&mut self) -> Result<()> {
        let translator = self.translator.unload().await;
        let transcriber = self.transcriber.unload().await;
        first_error(translator, transcriber)
    }
}

/// Voice-cloned speech for the translated text.
pub struct SynthesizeVoiceStage {
    synthesizer: Box<dyn VoiceSynthesizer>,
    media: Arc<dyn MediaProcessorTrait>,
    reference_seconds: f64,
    time_stretch: bool,
}

impl SynthesizeVoiceStage {
    pub fn new(
        synthesizer: Box<dyn VoiceSynthesizer>,
        media: Arc<dyn MediaProcessorTrait>,
        reference_seconds: f64,
        time_stretch: bool,
    ) -> Self {
        Self {
            synthesizer,
            media,
            reference_seconds,
            time_stretch,
        }
    }
}

#[async_trait]
impl Stage for SynthesizeVoiceStage {
    fn kind(&self) -> StageKind {
        StageKind::SynthesizeVoice
    }

    async fn load(&mut self, device: &DeviceContext) -> Result<()> {
        self.synthesizer.load(device).await
    }

    async fn run(&mut self, ctx: &mut RunContext, _device: &DeviceContext) -> Result<()> {
        let text = ctx.translation()?.text();

        let reference = ctx.work_path("reference.wav");
        info!("Extracting {:.0}s of reference audio", self.reference_seconds);
        self.media
            .extract_reference_audio(&ctx.input_video, &reference, self.reference_seconds)
            .await?;

        let target_duration = if self.time_stretch { ctx.video_duration } else { None };
        let output = ctx.work_path("dubbed.wav");
        let dubbed = self
            .synthesizer
            .synthesize(&text, &reference, &ctx.reference_text, &output, target_duration)
            .await?;

        ctx.reference_audio = Some(reference);
        ctx.dubbed_audio = Some(dubbed);
        Ok(())
    }

    async fn unload(&mut self) -> Result<()> {
        self.synthesizer.unload().await
    }
}

/// Subtitle removal; a failure leaves the original video in place.
pub struct RemoveSubtitlesStage {
    remover: Box<dyn SubtitleRemover>,
}

impl RemoveSubtitlesStage {
    pub fn new(remover: Box<dyn SubtitleRemover>) -> Self {
        Self { remover }
    }
}

#[async_trait]
impl Stage for RemoveSubtitlesStage {
    fn kind(&self) -> StageKind {
        StageKind::RemoveSubtitles
    }

    fn is_fatal(&self) -> bool {
        false
    }

    async fn load(&mut self, device: &DeviceContext) -> Result<()> {
        self.remover.load(device).await
    }

    async fn run(&mut self, ctx: &mut RunContext, _device: &DeviceContext) -> Result<()> {
        let output = ctx.work_path("no_subs.mp4");
        ctx.video_for_sync = self.remover.remove(&ctx.input_video, &output).await?;
        Ok(())
    }

    async fn unload(&mut self) -> Result<()> {
        self.remover.unload().await
    }
}

/// Lip resynthesis of the (possibly cleaned) video against the dubbed audio.
pub struct ResyncLipsStage {
    engine: LipSyncEngine,
    checkpoint_path: PathBuf,
}

impl ResyncLipsStage {
    pub fn new(engine: LipSyncEngine, checkpoint_path: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            checkpoint_path: checkpoint_path.into(),
        }
    }
}

#[async_trait]
impl Stage for ResyncLipsStage {
    fn kind(&self) -> StageKind {
        StageKind::ResyncLips
    }

    async fn load(&mut self, device: &DeviceContext) -> Result<()> {
        if !self.checkpoint_path.exists() {
            return Err(DubError::ModelLoad(format!(
                "Lip sync checkpoint not found: {}",
                self.checkpoint_path.display()
            )));
        }
        info!("Lip sync models load on first use on {}", device.device());
        Ok(())
    }

    async fn run(&mut self, ctx: &mut RunContext, device: &DeviceContext) -> Result<()> {
        let request = LipSyncRequest {
            face: ctx.video_for_sync.clone(),
            audio: ctx.dubbed_audio()?.to_path_buf(),
            output: ctx.output.clone(),
            force_static: false,
        };
        let report = self.engine.run(&request, device).await?;
        info!(
            "Resynced {} frames in {} batches ({} with faces)",
            report.frames_written, report.batches, report.valid_frames
        );
        Ok(())
    }

    async fn unload(&mut self) -> Result<()> {
        // The engine releases its detector and generator before `run` returns.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::inpaint::MockSubtitleRemover;
    use crate::lipsync::FrameSink;
    use crate::media::{SubtitleBand, VideoInfo};
    use crate::pipeline::PipelineOrchestrator;
    use crate::transcribe::{MockTranscriberTrait, Segment, Transcription};
    use crate::translate::MockTranslatorTrait;
    use crate::voice::MockVoiceSynthesizer;
    use image::RgbImage;
    use mockall::predicate::{always, eq};
    use std::path::Path;
    use tokio_test::{assert_err, assert_ok};

    /// Records extractions and reports a fixed 12 s duration.
    #[derive(Default)]
    struct FakeMedia {
        extracted: std::sync::Mutex<Vec<(PathBuf, Option<f64>)>>,
    }

    #[async_trait]
    impl MediaProcessorTrait for FakeMedia {
        async fn extract_audio(&self, _video: &Path, audio: &Path) -> Result<()> {
            self.extracted.lock().unwrap().push((audio.to_path_buf(), None));
            Ok(())
        }

        async fn extract_reference_audio(&self, _video: &Path, audio: &Path, seconds: f64) -> Result<()> {
            self.extracted.lock().unwrap().push((audio.to_path_buf(), Some(seconds)));
            Ok(())
        }

        async fn probe_video(&self, _video: &Path) -> Result<VideoInfo> {
            Ok(VideoInfo {
                width: 640,
                height: 360,
                fps: 25.0,
                duration: Some(12.0),
                frame_count: Some(300),
            })
        }

        async fn decode_frames(&self, _video: &Path, _info: &VideoInfo) -> Result<Vec<RgbImage>> {
            Ok(vec![])
        }

        fn open_encoder(&self, _output: &Path, _w: u32, _h: u32, _fps: f64) -> Result<Box<dyn FrameSink>> {
            Err(DubError::Media("no encoder".to_string()))
        }

        async fn mux_audio(&self, _video: &Path, _audio: &Path, _output: &Path) -> Result<()> {
            Ok(())
        }

        async fn stretch_audio(&self, _input: &Path, _output: &Path, _tempo: f64) -> Result<()> {
            Ok(())
        }

        async fn remove_subtitle_band(&self, _input: &Path, _output: &Path, _band: SubtitleBand) -> Result<()> {
            Ok(())
        }

        fn check_availability(&self) -> Result<()> {
            Ok(())
        }
    }

    fn transcript() -> Transcription {
        Transcription {
            language: "en".to_string(),
            segments: vec![
                Segment {
                    start: 0.0,
                    end: 4.0,
                    text: "Hello everyone.".to_string(),
                },
                Segment {
                    start: 4.0,
                    end: 10.0,
                    text: "Welcome to the show.".to_string(),
                },
                Segment {
                    start: 10.0,
                    end: 12.0,
                    text: "Let's begin.".to_string(),
                },
            ],
        }
    }

    fn context(work: &Path) -> RunContext {
        RunContext::new("talk.mp4", "es", work.join("talk.es.mp4"), work)
    }

    fn mock_transcriber() -> MockTranscriberTrait {
        let mut transcriber = MockTranscriberTrait::new();
        transcriber.expect_load().times(1).returning(|_| Ok(()));
        transcriber
            .expect_transcribe()
            .times(1)
            .returning(|_| Ok(transcript()));
        transcriber.expect_unload().times(1).returning(|| Ok(()));
        transcriber
    }

    #[tokio::test]
    async fn test_transcribe_translate_fills_context() {
        let work = tempfile::tempdir().unwrap();
        let media = Arc::new(FakeMedia::default());

        let mut translator = MockTranslatorTrait::new();
        translator.expect_load().times(1).returning(|_| Ok(()));
        translator
            .expect_translate()
            .with(always(), eq("es"))
            .times(3)
            .returning(|text, _| Ok(format!("[es] {}", text)));
        translator.expect_unload().times(1).returning(|| Ok(()));

        let mut stage = TranscribeTranslateStage::new(
            Box::new(mock_transcriber()),
            Box::new(translator),
            media.clone(),
            10.0,
        );
        let device = DeviceContext::new(Device::Cpu);
        let mut ctx = context(work.path());

        assert_ok!(stage.load(&device).await);
        assert_ok!(stage.run(&mut ctx, &device).await);
        assert_ok!(stage.unload().await);

        assert_eq!(ctx.reference_text, "Hello everyone. Welcome to the show.");
        assert_eq!(ctx.video_duration, Some(12.0));
        assert_eq!(ctx.source_audio, Some(work.path().join("source.wav")));
        let translation = ctx.translation().unwrap();
        assert_eq!(translation.segments.len(), 3);
        assert_eq!(translation.segments[2].text, "[es] Let's begin.");
    }

    #[tokio::test]
    async fn test_empty_transcript_fails_the_stage() {
        let work = tempfile::tempdir().unwrap();
        let mut transcriber = MockTranscriberTrait::new();
        transcriber.expect_transcribe().returning(|_| {
            Ok(Transcription {
                language: "en".to_string(),
                segments: vec![],
            })
        });
        let mut stage = TranscribeTranslateStage::new(
            Box::new(transcriber),
            Box::new(MockTranslatorTrait::new()),
            Arc::new(FakeMedia::default()),
            10.0,
        );

        let err = stage
            .run(&mut context(work.path()), &DeviceContext::new(Device::Cpu))
            .await
            .unwrap_err();
        assert!(matches!(err, DubError::Transcriber(_)));
    }

    #[tokio::test]
    async fn test_voice_stage_stretches_to_video_duration() {
        let work = tempfile::tempdir().unwrap();
        let media = Arc::new(FakeMedia::default());
        let reference = work.path().join("reference.wav");
        let dubbed = work.path().join("dubbed.wav");

        let mut synthesizer = MockVoiceSynthesizer::new();
        synthesizer
            .expect_synthesize()
            .with(
                eq("Hola a todos."),
                eq(reference.clone()),
                eq("Hello everyone."),
                eq(dubbed.clone()),
                eq(Some(12.0)),
            )
            .times(1)
            .returning(|_, _, _, output, _| Ok(output.to_path_buf()));

        let mut stage = SynthesizeVoiceStage::new(Box::new(synthesizer), media.clone(), 10.0, true);
        let mut ctx = context(work.path());
        ctx.video_duration = Some(12.0);
        ctx.reference_text = "Hello everyone.".to_string();
        ctx.translation = Some(Transcription {
            language: "es".to_string(),
            segments: vec![Segment {
                start: 0.0,
                end: 4.0,
                text: "Hola a todos.".to_string(),
            }],
        });

        assert_ok!(stage.run(&mut ctx, &DeviceContext::new(Device::Cpu)).await);

        assert_eq!(ctx.dubbed_audio, Some(dubbed));
        assert_eq!(ctx.reference_audio, Some(reference.clone()));
        assert_eq!(*media.extracted.lock().unwrap(), vec![(reference, Some(10.0))]);
    }

    #[tokio::test]
    async fn test_voice_stage_without_stretch_or_translation() {
        let work = tempfile::tempdir().unwrap();
        let mut synthesizer = MockVoiceSynthesizer::new();
        synthesizer
            .expect_synthesize()
            .with(always(), always(), always(), always(), eq(None::<f64>))
            .returning(|_, _, _, output, _| Ok(output.to_path_buf()));
        let mut stage =
            SynthesizeVoiceStage::new(Box::new(synthesizer), Arc::new(FakeMedia::default()), 10.0, false);
        let device = DeviceContext::new(Device::Cpu);

        let mut ctx = context(work.path());
        let err = assert_err!(stage.run(&mut ctx, &device).await);
        assert!(matches!(err, DubError::MissingArtifact(_)));

        ctx.video_duration = Some(30.0);
        ctx.translation = Some(transcript());
        assert_ok!(stage.run(&mut ctx, &device).await);
    }

    #[tokio::test]
    async fn test_failed_subtitle_removal_forwards_original_video() {
        let work = tempfile::tempdir().unwrap();
        let mut remover = MockSubtitleRemover::new();
        remover.expect_load().times(1).returning(|_| Ok(()));
        remover
            .expect_remove()
            .times(1)
            .returning(|_, _| Err(DubError::Media("delogo rejected the band".to_string())));
        remover.expect_unload().times(1).returning(|| Ok(()));

        let mut orch = PipelineOrchestrator::new(DeviceContext::new(Device::Cpu))
            .with_stage(Box::new(RemoveSubtitlesStage::new(Box::new(remover))));
        let mut ctx = context(work.path());

        let report = orch.run(&mut ctx).await.unwrap();

        assert_eq!(ctx.video_for_sync, PathBuf::from("talk.mp4"));
        assert_eq!(report.skips().len(), 1);
        assert!(report.skips()[0].to_string().contains("delogo rejected the band"));
        assert_eq!(orch.device().cache_clears(), 1);
    }

    #[tokio::test]
    async fn test_subtitle_removal_replaces_sync_video() {
        let work = tempfile::tempdir().unwrap();
        let mut remover = MockSubtitleRemover::new();
        remover
            .expect_remove()
            .with(eq(Path::new("talk.mp4")), always())
            .returning(|_, output| Ok(output.to_path_buf()));
        let mut stage = RemoveSubtitlesStage::new(Box::new(remover));
        let mut ctx = context(work.path());

        assert_ok!(stage.run(&mut ctx, &DeviceContext::new(Device::Cpu)).await);
        assert_eq!(ctx.video_for_sync, work.path().join("no_subs.mp4"));
    }

    #[tokio::test]
    async fn test_voice_failure_skips_later_stages() {
        let work = tempfile::tempdir().unwrap();
        let media = Arc::new(FakeMedia::default());

        let mut translator = MockTranslatorTrait::new();
        translator.expect_load().returning(|_| Ok(()));
        translator
            .expect_translate()
            .returning(|text, _| Ok(text.to_uppercase()));
        translator.expect_unload().returning(|| Ok(()));

        let mut synthesizer = MockVoiceSynthesizer::new();
        synthesizer.expect_load().times(1).returning(|_| Ok(()));
        synthesizer
            .expect_synthesize()
            .returning(|_, _, _, _, _| Err(DubError::Voice("model diverged".to_string())));
        synthesizer.expect_unload().times(1).returning(|| Ok(()));

        let mut remover = MockSubtitleRemover::new();
        remover.expect_load().never();
        remover.expect_remove().never();

        let mut orch = PipelineOrchestrator::new(DeviceContext::new(Device::Cpu))
            .with_stage(Box::new(TranscribeTranslateStage::new(
                Box::new(mock_transcriber()),
                Box::new(translator),
                media.clone(),
                10.0,
            )))
            .with_stage(Box::new(SynthesizeVoiceStage::new(
                Box::new(synthesizer),
                media.clone(),
                10.0,
                true,
            )))
            .with_stage(Box::new(RemoveSubtitlesStage::new(Box::new(remover))));

        let err = orch.run(&mut context(work.path())).await.unwrap_err();

        assert_eq!(err.stage(), Some(StageKind::SynthesizeVoice));
        assert_eq!(orch.report().unwrap().completed_stages(), 1);
        assert_eq!(orch.device().cache_clears(), 2);
    }
}
