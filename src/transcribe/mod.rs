// Speech recognition behind a trait.
//
// - WhisperCpp: runs whisper.cpp's `whisper-cli` and maps its JSON output
//
// Implementations report segments in seconds; everything downstream
// (reference text, translation, SRT) works from `Transcription`.

pub mod whisper_cpp;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::TranscriberConfig;
use crate::device::DeviceContext;
use crate::error::Result;

pub use whisper_cpp::WhisperCppTranscriber;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    pub language: String,
    pub segments: Vec<Segment>,
}

impl Transcription {
    /// Segment texts joined with single spaces.
    pub fn text(&self) -> String {
        join_texts(self.segments.iter())
    }

    /// Text of the segments ending at or before `seconds`.
    pub fn text_until(&self, seconds: f64) -> String {
        join_texts(self.segments.iter().filter(|s| s.end <= seconds))
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

fn join_texts<'a>(segments: impl Iterator<Item = &'a Segment>) -> String {
    segments
        .map(|s| s.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Main trait for transcription operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TranscriberTrait: Send + Sync {
    /// Prepare the model for `device`
    async fn load(&mut self, device: &DeviceContext) -> Result<()>;

    /// Transcribe a 16 kHz mono WAV file
    async fn transcribe(&self, audio_path: &Path) -> Result<Transcription>;

    /// Release the model
    async fn unload(&mut self) -> Result<()>;
}

/// Transcriber implementation type
#[derive(Debug, Clone)]
pub enum TranscriberImplementation {
    WhisperCpp,
}

/// Factory for creating transcriber instances
pub struct TranscriberFactory;

impl TranscriberFactory {
    pub fn create_transcriber(
        implementation: TranscriberImplementation,
        config: TranscriberConfig,
    ) -> Box<dyn TranscriberTrait> {
        match implementation {
            TranscriberImplementation::WhisperCpp => Box::new(WhisperCppTranscriber::new(config)),
        }
    }

    pub fn create_default(config: TranscriberConfig) -> Box<dyn TranscriberTrait> {
        Self::create_transcriber(TranscriberImplementation::WhisperCpp, config)
    }
}
