// Text translation behind a trait.
//
// - Ollama: local LLM served by Ollama, prompted for JSON output
//
// Segments are translated one by one; a segment whose translation fails
// keeps its source text so the run can still produce speech.

pub mod ollama;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{info, warn};

use crate::config::TranslateConfig;
use crate::device::DeviceContext;
use crate::error::Result;
use crate::transcribe::{Segment, Transcription};

pub use ollama::{OllamaTranslator, check_ollama_availability, language_code_to_name};

/// Main trait for translation operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TranslatorTrait: Send + Sync {
    async fn load(&mut self, device: &DeviceContext) -> Result<()>;

    /// Translate one piece of text into `target_language` (code or name)
    async fn translate(&self, text: &str, target_language: &str) -> Result<String>;

    async fn unload(&mut self) -> Result<()>;
}

/// Factory for creating translator instances
pub struct TranslatorFactory;

impl TranslatorFactory {
    pub fn create_translator(config: TranslateConfig) -> Result<Box<dyn TranslatorTrait>> {
        Ok(Box::new(OllamaTranslator::new(config)?))
    }
}

/// Translate every segment, keeping timings. Failed segments fall back to the source text.
pub async fn translate_transcription(
    translator: &dyn TranslatorTrait,
    transcription: &Transcription,
    target_language: &str,
) -> Transcription {
    info!(
        "Translating {} segments to {}",
        transcription.segments.len(),
        target_language
    );

    let mut segments = Vec::with_capacity(transcription.segments.len());
    let mut fallbacks = 0;
    for (idx, segment) in transcription.segments.iter().enumerate() {
        let text = match translator.translate(&segment.text, target_language).await {
            Ok(translated) if !translated.trim().is_empty() => translated,
            Ok(_) => {
                warn!("Segment {} translated to empty text, keeping source", idx + 1);
                fallbacks += 1;
                segment.text.clone()
            }
            Err(e) => {
                warn!("Segment {} translation failed, keeping source: {}", idx + 1, e);
                fallbacks += 1;
                segment.text.clone()
            }
        };
        segments.push(Segment {
            start: segment.start,
            end: segment.end,
            text,
        });
    }

    if fallbacks > 0 {
        warn!("{} of {} segments kept their source text", fallbacks, segments.len());
    }

    Transcription {
        language: target_language.to_string(),
        segments,
    }
}
