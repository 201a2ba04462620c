use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

use crate::config::{Config, LipSyncConfig};
use crate::device::DeviceContext;
use crate::error::{DubError, Result};
use crate::inpaint::DelogoRemover;
use crate::lipsync::{LipSyncEngine, LipSyncReport, LipSyncRequest, RemoteFaceDetector, RemoteGeneratorLoader};
use crate::media::{MediaProcessorFactory, MediaProcessorTrait};
use crate::pipeline::{
    PipelineOrchestrator, RemoveSubtitlesStage, ResyncLipsStage, RunContext, RunReport,
    SynthesizeVoiceStage, TranscribeTranslateStage,
};
use crate::subtitle::generate_srt;
use crate::transcribe::TranscriberFactory;
use crate::translate::{self, TranslatorFactory};
use crate::voice::F5TtsSynthesizer;

/// Options of one `dub` run.
#[derive(Debug, Clone)]
pub struct DubOptions {
    pub target_language: String,
    pub output: Option<PathBuf>,
    pub remove_subtitles: bool,
    pub time_stretch: bool,
}

pub struct Workflow {
    config: Config,
    media: Arc<dyn MediaProcessorTrait>,
}

impl Workflow {
    pub fn new(config: Config) -> Result<Self> {
        let media: Arc<dyn MediaProcessorTrait> =
            Arc::from(MediaProcessorFactory::create_processor(config.media.clone()));

        // Check dependencies
        media.check_availability()?;

        Ok(Self { config, media })
    }

    /// `<dir>/<stem>.<lang>.mp4` next to the input.
    pub fn default_output(input: &Path, target_language: &str) -> PathBuf {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "output".to_string());
        let lang = target_language.replace(|c: char| !c.is_ascii_alphanumeric(), "_");
        input.with_file_name(format!("{}.{}.mp4", stem, lang))
    }

    /// Full dubbing run through the staged pipeline.
    pub async fn dub(&self, input: &Path, options: &DubOptions) -> Result<RunReport> {
        if !input.exists() {
            return Err(DubError::FileNotFound(input.display().to_string()));
        }

        let output = options
            .output
            .clone()
            .unwrap_or_else(|| Self::default_output(input, &options.target_language));
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let work_dir = tempfile::Builder::new().prefix("redub-").tempdir()?;
        let mut ctx = RunContext::new(input, &options.target_language, &output, work_dir.path());
        let mut orchestrator = self.build_orchestrator(options)?;

        let result = orchestrator.run(&mut ctx).await;

        if let Some(translation) = &ctx.translation {
            if let Err(e) = generate_srt(translation, output.with_extension("srt")).await {
                warn!("Failed to write translated subtitles: {}", e);
            }
        }
        if let Some(report) = orchestrator.report() {
            let report_path = output.with_extension("run.json");
            if let Err(e) = report.save(&report_path).await {
                warn!("Failed to write run report {}: {}", report_path.display(), e);
            }
        }

        let report = result?;
        info!("Dubbed video written to {}", output.display());
        Ok(report)
    }

    fn build_orchestrator(&self, options: &DubOptions) -> Result<PipelineOrchestrator> {
        let voice = &self.config.voice;
        let device = DeviceContext::from_kind(self.config.device.kind);

        let mut orchestrator = PipelineOrchestrator::new(device)
            .with_stage(Box::new(TranscribeTranslateStage::new(
                TranscriberFactory::create_default(self.config.transcriber.clone()),
                TranslatorFactory::create_translator(self.config.translate.clone())?,
                self.media.clone(),
                voice.reference_seconds,
            )))
            .with_stage(Box::new(SynthesizeVoiceStage::new(
                Box::new(F5TtsSynthesizer::new(voice.clone(), self.media.clone())),
                self.media.clone(),
                voice.reference_seconds,
                options.time_stretch,
            )));

        if options.remove_subtitles {
            orchestrator = orchestrator.with_stage(Box::new(RemoveSubtitlesStage::new(Box::new(
                DelogoRemover::new(self.config.subtitles.clone(), self.media.clone()),
            ))));
        }

        let engine = self.lipsync_engine(self.config.lipsync.clone())?;
        Ok(orchestrator.with_stage(Box::new(ResyncLipsStage::new(
            engine,
            &self.config.lipsync.checkpoint_path,
        ))))
    }

    fn lipsync_engine(&self, config: LipSyncConfig) -> Result<LipSyncEngine> {
        let detector = RemoteFaceDetector::new(&config.inference_endpoint)?;
        let loader = RemoteGeneratorLoader::new(&config.inference_endpoint)?;
        Ok(LipSyncEngine::new(config, self.media.clone(), Box::new(detector), Box::new(loader)).with_progress(true))
    }

    /// Lip resynthesis only, with `config` overriding the configured `[lipsync]` section.
    pub async fn lipsync(&self, config: LipSyncConfig, request: &LipSyncRequest) -> Result<LipSyncReport> {
        let device = DeviceContext::from_kind(self.config.device.kind);
        let mut engine = self.lipsync_engine(config)?;
        let report = engine.run(request, &device).await;
        device.clear_cache();
        report
    }

    /// Transcribe (and optionally translate) a media file into an SRT file.
    pub async fn transcribe<P: AsRef<Path>>(
        &self,
        input: P,
        output: P,
        target_language: Option<&str>,
    ) -> Result<()> {
        let input = input.as_ref();
        if !input.exists() {
            return Err(DubError::FileNotFound(input.display().to_string()));
        }

        let work_dir = tempfile::tempdir()?;
        let audio_path = work_dir.path().join("audio.wav");
        self.media.extract_audio(input, &audio_path).await?;

        let device = DeviceContext::from_kind(self.config.device.kind);
        let mut transcriber = TranscriberFactory::create_default(self.config.transcriber.clone());
        transcriber.load(&device).await?;
        let transcript = transcriber.transcribe(&audio_path).await;
        transcriber.unload().await?;
        device.clear_cache();
        let mut transcript = transcript?;

        if let Some(lang) = target_language {
            let mut translator = TranslatorFactory::create_translator(self.config.translate.clone())?;
            translator.load(&device).await?;
            transcript = translate::translate_transcription(translator.as_ref(), &transcript, lang).await;
            translator.unload().await?;
        }

        generate_srt(&transcript, output).await
    }

    /// Extract the first `seconds` of audio as a voice-cloning reference.
    pub async fn extract_reference<P: AsRef<Path>>(&self, input: P, output: P, seconds: Option<f64>) -> Result<()> {
        let input = input.as_ref();
        if !input.exists() {
            return Err(DubError::FileNotFound(input.display().to_string()));
        }
        let seconds = seconds.unwrap_or(self.config.voice.reference_seconds);
        if seconds <= 0.0 {
            return Err(DubError::Config(format!("Reference length must be positive, got {}", seconds)));
        }

        info!("Extracting {:.1}s reference from {}", seconds, input.display());
        self.media
            .extract_reference_audio(input, output.as_ref(), seconds)
            .await
    }
}
