use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::TranslateConfig;
use crate::device::DeviceContext;
use crate::error::{DubError, Result};
use super::TranslatorTrait;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationRequest {
    pub model: String,
    pub prompt: String,
    pub stream: bool,
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationResponse {
    pub response: String,
    pub done: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationResult {
    pub text: String,
}

/// Translator backed by Ollama's `/api/generate` with JSON output.
pub struct OllamaTranslator {
    client: Client,
    config: TranslateConfig,
}

impl OllamaTranslator {
    pub fn new(config: TranslateConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> &str {
        self.config.endpoint.trim_end_matches('/')
    }

    async fn translate_once(&self, text: &str, target_language: &str) -> Result<String> {
        let request = TranslationRequest {
            model: self.config.model.clone(),
            prompt: build_translation_prompt(text, target_language),
            stream: false,
            format: "json".to_string(),
        };

        let url = format!("{}/api/generate", self.endpoint());
        debug!("Sending translation request to: {}", url);

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| DubError::Translation(format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(DubError::Translation(format!(
                "Ollama API error {}: {}",
                status, error_text
            )));
        }

        let translation_response: TranslationResponse = response
            .json()
            .await
            .map_err(|e| DubError::Translation(format!("Failed to parse response: {}", e)))?;

        let raw_response = translation_response.response.trim();
        debug!("Raw Ollama response: {}", raw_response);

        parse_translation(raw_response)
    }
}

#[async_trait]
impl TranslatorTrait for OllamaTranslator {
    async fn load(&mut self, device: &DeviceContext) -> Result<()> {
        // Ollama places the model itself; an unreachable server only degrades to source text.
        match check_ollama_availability(self.endpoint(), &self.config.model).await {
            Ok(()) => info!("Translator {} ready ({})", self.config.model, device.device()),
            Err(e) => warn!("Translator unavailable, segments will keep source text: {}", e),
        }
        Ok(())
    }

    async fn translate(&self, text: &str, target_language: &str) -> Result<String> {
        if text.trim().is_empty() {
            return Ok(String::new());
        }

        let attempts = self.config.max_retries.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.translate_once(text, target_language).await {
                Ok(translation) => return Ok(translation),
                Err(e) => {
                    debug!("Translation attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| DubError::Translation("Translation was not attempted".to_string())))
    }

    async fn unload(&mut self) -> Result<()> {
        // keep_alive 0 evicts the model from the Ollama server.
        let url = format!("{}/api/generate", self.endpoint());
        let request = json!({ "model": self.config.model, "keep_alive": 0 });
        if let Err(e) = self.client.post(&url).json(&request).send().await {
            warn!("Failed to unload Ollama model '{}': {}", self.config.model, e);
        }
        Ok(())
    }
}

/// Extract the translation from a model response, JSON first, then plain text.
fn parse_translation(raw_response: &str) -> Result<String> {
    if raw_response.is_empty() {
        return Err(DubError::Translation("Empty translation received".to_string()));
    }

    if let Ok(result) = serde_json::from_str::<TranslationResult>(raw_response) {
        return Ok(result.text.trim().to_string());
    }

    Ok(clean_translation_response(raw_response))
}

fn build_translation_prompt(text: &str, target_language: &str) -> String {
    let language_name = language_code_to_name(target_language);
    format!(
        "You are a professional translator for video dubbing.\n\
         \n\
         CRITICAL: You must translate the text to {} ONLY. Do not translate to any other language.\n\
         The translation will be spoken aloud, so keep it natural and about as long as the source.\n\
         \n\
         Return ONLY the translation in JSON format as {{\"text\":\"your {} translation here\"}}.\n\
         Do not include any explanations, alternatives, or text in other languages.\n\
         \n\
         [Text to translate]\n\
         {}\n",
        language_name, language_name, text
    )
}

/// Convert language code to full language name for clearer prompts
pub fn language_code_to_name(code: &str) -> String {
    let name = match code.to_lowercase().as_str() {
        "ja" => "Japanese",
        "ko" => "Korean",
        "zh" | "zh-cn" => "Simplified Chinese",
        "zh-tw" => "Traditional Chinese",
        "fr" => "French",
        "de" => "German",
        "es" => "Spanish",
        "ru" => "Russian",
        "it" => "Italian",
        "pt" => "Portuguese",
        "pl" => "Polish",
        "nl" => "Dutch",
        "tr" => "Turkish",
        "ar" => "Arabic",
        "hi" => "Hindi",
        "th" => "Thai",
        "vi" => "Vietnamese",
        "id" => "Indonesian",
        "sv" => "Swedish",
        "uk" => "Ukrainian",
        "en" => "English",
        _ => return code.to_string(),
    };
    name.to_string()
}

/// Clean up translation response to extract just the translation
fn clean_translation_response(response: &str) -> String {
    let lines: Vec<&str> = response.lines().map(str::trim).filter(|l| !l.is_empty()).collect();

    for &line in &lines {
        if line.starts_with("Here are")
            || line.starts_with("Option")
            || line.starts_with("**Option")
            || line.starts_with("Translation:")
            || line.starts_with("- ")
            || line.starts_with("* ")
        {
            continue;
        }

        if line.starts_with("**") && line.ends_with("**") {
            continue;
        }

        if line.chars().count() > 3 {
            return line.to_string();
        }
    }

    lines.first().map(|l| l.to_string()).unwrap_or_else(|| response.to_string())
}

/// Check if Ollama is available and the model is loaded
pub async fn check_ollama_availability(endpoint: &str, model: &str) -> Result<()> {
    let client = Client::new();
    let url = format!("{}/api/show", endpoint.trim_end_matches('/'));

    let response = client
        .post(&url)
        .json(&json!({ "name": model }))
        .send()
        .await
        .map_err(|e| DubError::Translation(format!("Failed to connect to Ollama: {}", e)))?;

    if response.status().is_success() {
        info!("Ollama model '{}' is available", model);
        Ok(())
    } else {
        Err(DubError::Translation(format!(
            "Ollama model '{}' not found. Please pull the model first: ollama pull {}",
            model, model
        )))
    }
}
