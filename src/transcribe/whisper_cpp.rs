use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, info};

use crate::config::TranscriberConfig;
use crate::device::{Device, DeviceContext};
use crate::error::{DubError, Result};
use super::{Segment, TranscriberTrait, Transcription};

/// `whisper-cli -oj` output
#[derive(Debug, Deserialize)]
struct WhisperCppOutput {
    #[serde(default)]
    result: Option<WhisperCppResult>,
    transcription: Vec<WhisperCppSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperCppResult {
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WhisperCppSegment {
    offsets: WhisperCppOffsets,
    text: String,
}

/// Milliseconds from the start of the audio
#[derive(Debug, Deserialize)]
struct WhisperCppOffsets {
    from: u64,
    to: u64,
}

fn parse_output(json: &str) -> Result<Transcription> {
    let output: WhisperCppOutput = serde_json::from_str(json)
        .map_err(|e| DubError::Transcriber(format!("Failed to parse whisper.cpp JSON: {}", e)))?;

    let segments = output
        .transcription
        .into_iter()
        .map(|seg| Segment {
            start: seg.offsets.from as f64 / 1000.0,
            end: seg.offsets.to as f64 / 1000.0,
            text: seg.text.trim().to_string(),
        })
        .filter(|seg| !seg.text.is_empty())
        .collect();

    Ok(Transcription {
        language: output
            .result
            .and_then(|r| r.language)
            .unwrap_or_else(|| "unknown".to_string()),
        segments,
    })
}

/// Runs whisper.cpp's CLI once per audio file.
pub struct WhisperCppTranscriber {
    config: TranscriberConfig,
    device: Option<Device>,
}

impl WhisperCppTranscriber {
    pub fn new(config: TranscriberConfig) -> Self {
        Self { config, device: None }
    }

    fn build_args(&self, audio_path: &Path, output_base: &Path, device: Device) -> Vec<String> {
        let mut args = vec![
            "-m".to_string(),
            self.config.model.clone(),
            "-f".to_string(),
            audio_path.display().to_string(),
            "-oj".to_string(),
            "-of".to_string(),
            output_base.display().to_string(),
            "-tp".to_string(),
            format!("{:.2}", self.config.temperature),
            "-l".to_string(),
            self.config.language.clone().unwrap_or_else(|| "auto".to_string()),
        ];

        if device == Device::Cpu {
            args.push("-ng".to_string());
        }

        args
    }
}

#[async_trait]
impl TranscriberTrait for WhisperCppTranscriber {
    async fn load(&mut self, device: &DeviceContext) -> Result<()> {
        if !Path::new(&self.config.model).exists() {
            return Err(DubError::ModelLoad(format!(
                "Whisper model not found: {}",
                self.config.model
            )));
        }
        info!("Loading Whisper model {} on {}", self.config.model, device.device());
        self.device = Some(device.device());
        Ok(())
    }

    async fn transcribe(&self, audio_path: &Path) -> Result<Transcription> {
        let device = self
            .device
            .ok_or_else(|| DubError::ModelLoad("Transcriber used before load".to_string()))?;
        if !audio_path.exists() {
            return Err(DubError::FileNotFound(audio_path.display().to_string()));
        }

        let temp_dir = tempfile::tempdir()
            .map_err(|e| DubError::Transcriber(format!("Failed to create temp directory: {}", e)))?;
        let output_base = temp_dir.path().join("transcript");
        let args = self.build_args(audio_path, &output_base, device);

        info!("Transcribing: {}", audio_path.display());
        debug!("Executing: {} {:?}", self.config.binary_path, args);

        let output = Command::new(&self.config.binary_path)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| DubError::Transcriber(format!("Failed to execute whisper-cli: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DubError::Transcriber(format!("whisper-cli failed: {}", stderr)));
        }

        let json_file = output_base.with_extension("json");
        let json_content = std::fs::read_to_string(&json_file)
            .map_err(|e| DubError::Transcriber(format!("Failed to read output: {}", e)))?;

        let transcription = parse_output(&json_content)?;
        info!(
            "Transcription complete: {} segments, language {}",
            transcription.segments.len(),
            transcription.language
        );
        Ok(transcription)
    }

    async fn unload(&mut self) -> Result<()> {
        self.device = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "systeminfo": "AVX = 1",
        "result": { "language": "en" },
        "transcription": [
            {
                "timestamps": { "from": "00:00:00,000", "to": "00:00:02,500" },
                "offsets": { "from": 0, "to": 2500 },
                "text": " Good morning."
            },
            {
                "timestamps": { "from": "00:00:02,500", "to": "00:00:03,000" },
                "offsets": { "from": 2500, "to": 3000 },
                "text": "  "
            },
            {
                "timestamps": { "from": "00:00:03,000", "to": "00:00:11,040" },
                "offsets": { "from": 3000, "to": 11040 },
                "text": " Welcome back."
            }
        ]
    }"#;

    #[test]
    fn test_parse_whisper_cpp_json() {
        let transcription = parse_output(SAMPLE).unwrap();
        assert_eq!(transcription.language, "en");
        assert_eq!(transcription.segments.len(), 2);
        assert_eq!(transcription.segments[0].text, "Good morning.");
        assert_eq!(transcription.segments[1].start, 3.0);
        assert_eq!(transcription.segments[1].end, 11.04);
    }

    #[test]
    fn test_args_request_json_and_language() {
        let config = TranscriberConfig {
            language: Some("ja".to_string()),
            ..TranscriberConfig::default()
        };
        let transcriber = WhisperCppTranscriber::new(config);
        let args = transcriber.build_args(Path::new("a.wav"), Path::new("/tmp/out"), Device::Cpu);

        assert!(args.windows(2).any(|w| w == ["-l", "ja"]));
        assert!(args.windows(2).any(|w| w == ["-of", "/tmp/out"]));
        assert!(args.contains(&"-oj".to_string()));
        assert!(args.contains(&"-ng".to_string()));

        let gpu_args = transcriber.build_args(Path::new("a.wav"), Path::new("/tmp/out"), Device::Cuda);
        assert!(!gpu_args.contains(&"-ng".to_string()));
    }

    #[tokio::test]
    async fn test_load_requires_model_file() {
        let mut transcriber = WhisperCppTranscriber::new(TranscriberConfig {
            model: "/nonexistent/ggml.bin".to_string(),
            ..TranscriberConfig::default()
        });
        let device = DeviceContext::new(Device::Cpu);
        let err = transcriber.load(&device).await.unwrap_err();
        assert!(matches!(err, DubError::ModelLoad(_)));
    }
}
