//! Voice-cloned speech synthesis.
//!
//! The synthesizer clones the speaker from a short reference clip and its
//! transcript, then optionally stretches the result so the dubbed speech
//! spans the source video.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::VoiceConfig;
use crate::device::{Device, DeviceContext};
use crate::error::{DubError, Result};
use crate::media::MediaProcessorTrait;

/// Stretch ratios this close to 1 leave the audio untouched.
const TEMPO_TOLERANCE: f64 = 0.01;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait VoiceSynthesizer: Send + Sync {
    async fn load(&mut self, device: &DeviceContext) -> Result<()>;

    /// Speak `text` in the voice of `ref_audio` and write a WAV to `output_path`.
    /// With a `target_duration` the result is time-stretched to that length.
    async fn synthesize(
        &self,
        text: &str,
        ref_audio: &Path,
        ref_text: &str,
        output_path: &Path,
        target_duration: Option<f64>,
    ) -> Result<PathBuf>;

    async fn unload(&mut self) -> Result<()>;
}

/// Duration of a WAV file in seconds.
pub fn wav_duration(path: &Path) -> Result<f64> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return Err(DubError::Voice(format!("{} has a zero sample rate", path.display())));
    }
    Ok(reader.duration() as f64 / spec.sample_rate as f64)
}

/// Tempo that turns `actual` seconds into `target` seconds, or `None` when no stretch is needed.
pub fn stretch_tempo(actual: f64, target: f64) -> Option<f64> {
    if actual <= 0.0 || target <= 0.0 {
        return None;
    }
    let tempo = actual / target;
    if (tempo - 1.0).abs() < TEMPO_TOLERANCE {
        None
    } else {
        Some(tempo)
    }
}

/// F5-TTS style inference CLI.
pub struct F5TtsSynthesizer {
    config: VoiceConfig,
    media: Arc<dyn MediaProcessorTrait>,
    device: Option<Device>,
}

impl F5TtsSynthesizer {
    pub fn new(config: VoiceConfig, media: Arc<dyn MediaProcessorTrait>) -> Self {
        Self {
            config,
            media,
            device: None,
        }
    }

    fn build_args(
        &self,
        text: &str,
        ref_audio: &Path,
        ref_text: &str,
        output_dir: &Path,
        output_file: &str,
        device: Device,
    ) -> Vec<String> {
        let mut args = vec![
            "--model".to_string(),
            self.config.model.clone(),
            "--ref_audio".to_string(),
            ref_audio.display().to_string(),
            "--ref_text".to_string(),
            ref_text.to_string(),
            "--gen_text".to_string(),
            text.to_string(),
            "--output_dir".to_string(),
            output_dir.display().to_string(),
            "--output_file".to_string(),
            output_file.to_string(),
            "--device".to_string(),
            device.as_str().to_string(),
        ];
        args.extend(self.config.extra_args.iter().cloned());
        args
    }
}

#[async_trait]
impl VoiceSynthesizer for F5TtsSynthesizer {
    async fn load(&mut self, device: &DeviceContext) -> Result<()> {
        info!("Loading voice model {} on {}", self.config.model, device.device());
        self.device = Some(device.device());
        Ok(())
    }

    async fn synthesize(
        &self,
        text: &str,
        ref_audio: &Path,
        ref_text: &str,
        output_path: &Path,
        target_duration: Option<f64>,
    ) -> Result<PathBuf> {
        let device = self
            .device
            .ok_or_else(|| DubError::ModelLoad("Voice synthesizer used before load".to_string()))?;
        if text.trim().is_empty() {
            return Err(DubError::Voice("Nothing to synthesize".to_string()));
        }
        if !ref_audio.exists() {
            return Err(DubError::FileNotFound(ref_audio.display().to_string()));
        }

        let work_dir = tempfile::tempdir()?;
        let raw_name = "speech.wav";
        let args = self.build_args(text, ref_audio, ref_text, work_dir.path(), raw_name, device);

        info!("Generating audio for text: {:.50}...", text);
        debug!("Executing: {} {:?}", self.config.binary_path, args);

        let output = Command::new(&self.config.binary_path)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| DubError::Voice(format!("Failed to execute voice synthesizer: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DubError::Voice(format!("Voice synthesis failed: {}", stderr)));
        }

        let raw_path = work_dir.path().join(raw_name);
        if !raw_path.exists() {
            return Err(DubError::Voice(format!(
                "Voice synthesizer produced no audio at {}",
                raw_path.display()
            )));
        }

        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let actual = wav_duration(&raw_path)?;
        match target_duration.and_then(|target| stretch_tempo(actual, target).map(|t| (target, t))) {
            Some((target, tempo)) => {
                info!(
                    "Stretching speech from {:.2}s to {:.2}s (tempo {:.3})",
                    actual, target, tempo
                );
                self.media.stretch_audio(&raw_path, output_path, tempo).await?;
            }
            None => {
                std::fs::copy(&raw_path, output_path)?;
            }
        }

        info!("Audio saved to {}", output_path.display());
        Ok(output_path.to_path_buf())
    }

    async fn unload(&mut self) -> Result<()> {
        self.device = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaProcessorFactory;
    use crate::config::MediaConfig;

    fn write_silence(path: &Path, seconds: f64, sample_rate: u32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for _ in 0..(seconds * sample_rate as f64) as usize {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_wav_duration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        write_silence(&path, 1.5, 24_000);
        assert!((wav_duration(&path).unwrap() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_stretch_tempo() {
        assert_eq!(stretch_tempo(12.0, 10.0), Some(1.2));
        assert_eq!(stretch_tempo(5.0, 10.0), Some(0.5));
        assert_eq!(stretch_tempo(10.05, 10.0), None);
        assert_eq!(stretch_tempo(0.0, 10.0), None);
    }

    #[test]
    fn test_args_carry_reference_and_extra_args() {
        let config = VoiceConfig {
            extra_args: vec!["--nfe_step".to_string(), "16".to_string()],
            ..VoiceConfig::default()
        };
        let synthesizer = F5TtsSynthesizer::new(
            config,
            Arc::from(MediaProcessorFactory::create_processor(MediaConfig::default())),
        );
        let args = synthesizer.build_args(
            "Bonjour",
            Path::new("ref.wav"),
            "Hello",
            Path::new("/tmp/out"),
            "speech.wav",
            Device::Cuda,
        );

        assert!(args.windows(2).any(|w| w == ["--ref_text", "Hello"]));
        assert!(args.windows(2).any(|w| w == ["--gen_text", "Bonjour"]));
        assert!(args.windows(2).any(|w| w == ["--device", "cuda"]));
        assert_eq!(args[args.len() - 2..], ["--nfe_step", "16"]);
    }

    #[tokio::test]
    async fn test_synthesize_requires_load() {
        let synthesizer = F5TtsSynthesizer::new(
            VoiceConfig::default(),
            Arc::from(MediaProcessorFactory::create_processor(MediaConfig::default())),
        );
        let err = synthesizer
            .synthesize("text", Path::new("ref.wav"), "", Path::new("out.wav"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DubError::ModelLoad(_)));
    }
}
