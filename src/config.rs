use serde::{Deserialize, Serialize};
use std::path::Path;
use crate::error::{Result, DubError};

fn default_face_det_batch_size() -> usize {
    4
}

fn default_batch_size() -> usize {
    32
}

fn default_crop_size() -> u32 {
    96
}

fn default_smoothing_window() -> usize {
    5
}

fn default_min_face_coverage() -> f64 {
    0.5
}

fn default_pads() -> [i32; 4] {
    [0, 10, 0, 0]
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub transcriber: TranscriberConfig,
    #[serde(default)]
    pub translate: TranslateConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub subtitles: SubtitleRemovalConfig,
    #[serde(default)]
    pub lipsync: LipSyncConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriberConfig {
    /// Path to transcriber binary (e.g., whisper-cli)
    pub binary_path: String,
    /// Model file passed to the transcriber
    pub model: String,
    /// Source language hint, auto-detected when unset
    pub language: Option<String>,
    /// Decoding temperature
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslateConfig {
    /// Ollama endpoint URL
    pub endpoint: String,
    /// LLM model to use for translation
    pub model: String,
    /// Maximum retries for failed translations
    pub max_retries: u32,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Voice-cloning CLI (F5-TTS style: --ref_audio/--ref_text/--gen_text/--output_file)
    pub binary_path: String,
    /// Model name handed to the CLI
    pub model: String,
    /// Seconds of source audio used as the cloning reference
    pub reference_seconds: f64,
    /// Stretch synthesized speech to the source video duration
    pub time_stretch: bool,
    /// Extra arguments appended to every invocation
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubtitleRemovalConfig {
    /// Run the subtitle removal stage
    pub enabled: bool,
    /// Top of the subtitle band as a fraction of frame height
    pub band_top: f64,
    /// Horizontal margin on each side as a fraction of frame width
    pub band_margin: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LipSyncConfig {
    /// Generator checkpoint (safetensors)
    pub checkpoint_path: String,
    /// Inference service endpoint hosting the detector and generator
    pub inference_endpoint: String,
    #[serde(default = "default_face_det_batch_size")]
    pub face_det_batch_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_crop_size")]
    pub crop_size: u32,
    /// Padding (top, bottom, left, right) applied to detected boxes
    #[serde(default = "default_pads")]
    pub pads: [i32; 4],
    /// Fixed box (top, bottom, left, right); a first value of -1 means "detect"
    pub fixed_box: Option<[i32; 4]>,
    /// Pre-crop (top, bottom, left, right) with -1 meaning the far edge
    pub crop: Option<[i32; 4]>,
    /// Integer downscale applied at ingestion
    pub resize_factor: u32,
    /// Rotate frames 90 degrees clockwise at ingestion
    pub rotate: bool,
    /// Temporal smoothing window; 0 or 1 disables smoothing
    #[serde(default = "default_smoothing_window")]
    pub smoothing_window: usize,
    /// Detected-frame fraction that must be exceeded
    #[serde(default = "default_min_face_coverage")]
    pub min_face_coverage: f64,
    /// Frame rate used when the face source is a still image
    pub static_fps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Path to ffmpeg binary
    pub binary_path: String,
    /// Path to ffprobe binary
    pub probe_path: String,
    /// Extra encoder options for the rendered video stream
    /// Common options: ["-preset", "medium", "-crf", "23"]
    pub encode_options: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Auto,
    Cpu,
    Cuda,
    Mps,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub kind: DeviceKind,
}

impl Default for TranscriberConfig {
    fn default() -> Self {
        Self {
            binary_path: "whisper-cli".to_string(),
            model: "models/ggml-large-v3.bin".to_string(),
            language: None,
            temperature: 0.0,
        }
    }
}

impl Default for TranslateConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            model: "llama3.2:3b".to_string(),
            max_retries: 3,
            timeout_secs: 300,
        }
    }
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            binary_path: "f5-tts_infer-cli".to_string(),
            model: "F5TTS_v1_Base".to_string(),
            reference_seconds: 10.0,
            time_stretch: true,
            extra_args: vec![],
        }
    }
}

impl Default for SubtitleRemovalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            band_top: 0.85,
            band_margin: 0.1,
        }
    }
}

impl Default for LipSyncConfig {
    fn default() -> Self {
        Self {
            checkpoint_path: "checkpoints/wav2lip.safetensors".to_string(),
            inference_endpoint: "http://localhost:8765".to_string(),
            face_det_batch_size: default_face_det_batch_size(),
            batch_size: default_batch_size(),
            crop_size: default_crop_size(),
            pads: default_pads(),
            fixed_box: None,
            crop: None,
            resize_factor: 1,
            rotate: false,
            smoothing_window: default_smoothing_window(),
            min_face_coverage: default_min_face_coverage(),
            static_fps: 25.0,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            binary_path: "ffmpeg".to_string(),
            probe_path: "ffprobe".to_string(),
            encode_options: vec![],
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            kind: DeviceKind::Auto,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DubError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| DubError::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| DubError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| DubError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Reject values the lip-sync engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let lipsync = &self.lipsync;
        if lipsync.batch_size == 0 || lipsync.face_det_batch_size == 0 {
            return Err(DubError::Config("batch sizes must be at least 1".to_string()));
        }
        if lipsync.crop_size < 2 {
            return Err(DubError::Config(format!(
                "crop_size must be at least 2, got {}",
                lipsync.crop_size
            )));
        }
        if lipsync.resize_factor == 0 {
            return Err(DubError::Config("resize_factor must be at least 1".to_string()));
        }
        if !(0.0..1.0).contains(&lipsync.min_face_coverage) {
            return Err(DubError::Config(format!(
                "min_face_coverage must be in [0, 1), got {}",
                lipsync.min_face_coverage
            )));
        }
        if lipsync.static_fps <= 0.0 {
            return Err(DubError::Config("static_fps must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::TempDir;

    #[test]
    fn test_default_round_trips_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("redub.toml");

        let mut config = Config::default();
        config.lipsync.fixed_box = Some([10, 120, 20, 140]);
        config.subtitles.enabled = true;
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.lipsync.fixed_box, Some([10, 120, 20, 140]));
        assert!(loaded.subtitles.enabled);
        assert_eq!(loaded.lipsync.batch_size, 32);
        assert_eq!(loaded.device.kind, DeviceKind::Auto);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(
            &path,
            "[device]\nkind = \"cuda\"\n",
        )
        .unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.device.kind, DeviceKind::Cuda);
        assert_eq!(loaded.lipsync.smoothing_window, 5);
        assert_eq!(loaded.lipsync.pads, [0, 10, 0, 0]);
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = Config::default();
        config.lipsync.batch_size = 0;
        assert!(matches!(config.validate(), Err(DubError::Config(_))));
    }
}
