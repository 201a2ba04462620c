// Staged dubbing run.
//
// - State: stage and run lifecycles with checked transitions
// - Orchestrator: drives stages one at a time over the shared device
// - Stages: the four concrete stages wrapping the collaborators
//
// Stages exchange artifacts through `RunContext`; only the orchestrator
// touches the device between stages.

pub mod orchestrator;
pub mod stages;
pub mod state;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::device::DeviceContext;
use crate::error::{DubError, Result};
use crate::transcribe::Transcription;

pub use orchestrator::{PipelineOrchestrator, RunReport, StageOutcome};
pub use stages::{RemoveSubtitlesStage, ResyncLipsStage, SynthesizeVoiceStage, TranscribeTranslateStage};
pub use state::{RunMachine, RunState, StageLifecycle, StageState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    TranscribeTranslate,
    SynthesizeVoice,
    RemoveSubtitles,
    ResyncLips,
}

impl StageKind {
    pub fn label(&self) -> &'static str {
        match self {
            StageKind::TranscribeTranslate => "transcribe-translate",
            StageKind::SynthesizeVoice => "synthesize-voice",
            StageKind::RemoveSubtitles => "remove-subtitles",
            StageKind::ResyncLips => "resync-lips",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One heavyweight step of a run. A stage owns at most one model and only
/// holds it between `load` and `unload`.
#[async_trait]
pub trait Stage: Send {
    fn kind(&self) -> StageKind;

    /// A non-fatal stage that fails is skipped and the run continues.
    fn is_fatal(&self) -> bool {
        true
    }

    async fn load(&mut self, device: &DeviceContext) -> Result<()>;

    async fn run(&mut self, ctx: &mut RunContext, device: &DeviceContext) -> Result<()>;

    /// Drop model references. Called after `run` whether it succeeded or not.
    async fn unload(&mut self) -> Result<()>;
}

/// Artifacts handed from stage to stage.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub input_video: PathBuf,
    pub target_language: String,
    pub output: PathBuf,
    /// Scratch directory for intermediate files
    pub work_dir: PathBuf,
    pub source_audio: Option<PathBuf>,
    pub video_duration: Option<f64>,
    pub transcript: Option<Transcription>,
    pub translation: Option<Transcription>,
    /// Transcript of the reference clip
    pub reference_text: String,
    pub reference_audio: Option<PathBuf>,
    pub dubbed_audio: Option<PathBuf>,
    /// Video the lips are resynthesized on; the input unless subtitles were removed
    pub video_for_sync: PathBuf,
}

impl RunContext {
    pub fn new(
        input_video: impl Into<PathBuf>,
        target_language: impl Into<String>,
        output: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        let input_video = input_video.into();
        Self {
            video_for_sync: input_video.clone(),
            input_video,
            target_language: target_language.into(),
            output: output.into(),
            work_dir: work_dir.into(),
            source_audio: None,
            video_duration: None,
            transcript: None,
            translation: None,
            reference_text: String::new(),
            reference_audio: None,
            dubbed_audio: None,
        }
    }

    pub fn work_path(&self, name: &str) -> PathBuf {
        self.work_dir.join(name)
    }

    pub fn translation(&self) -> Result<&Transcription> {
        self.translation
            .as_ref()
            .ok_or(DubError::MissingArtifact("translated transcript"))
    }

    pub fn dubbed_audio(&self) -> Result<&Path> {
        self.dubbed_audio
            .as_deref()
            .ok_or(DubError::MissingArtifact("dubbed audio"))
    }
}
