use thiserror::Error;

use crate::pipeline::StageKind;

#[derive(Error, Debug)]
pub enum DubError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WAV decoding error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Transcription error: {0}")]
    Transcriber(String),

    #[error("Translation error: {0}")]
    Translation(String),

    #[error("Voice synthesis error: {0}")]
    Voice(String),

    #[error("Media processing error: {0}")]
    Media(String),

    #[error("Audio feature error: {0}")]
    Audio(String),

    #[error("Inference service error: {0}")]
    Inference(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error(
        "Face detection ran out of device memory at batch size {batch_size} over {frames} frames; \
         lower the resolution with --resize-factor"
    )]
    ResourceExhausted { batch_size: usize, frames: usize },

    #[error(
        "Too few faces detected: {detected}/{total} frames (coverage {fraction:.3}, need more than {threshold:.2})"
    )]
    InsufficientFaceCoverage {
        fraction: f64,
        threshold: f64,
        detected: usize,
        total: usize,
    },

    #[error("No valid frames with detected faces")]
    NoValidFrames,

    #[error("Invalid face region at frame {index}: {width}x{height}")]
    InvalidFaceRegion {
        index: usize,
        width: u32,
        height: u32,
    },

    #[error("Model load failed: {0}")]
    ModelLoad(String),

    #[error("Missing pipeline artifact: {0}")]
    MissingArtifact(&'static str),

    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        stage: StageKind,
        #[source]
        source: Box<DubError>,
    },

    #[error("Stage '{stage}' skipped: {reason}")]
    NonFatalStageSkip { stage: StageKind, reason: String },

    #[error("Illegal state transition for {subject}: {from} -> {to}")]
    IllegalTransition {
        subject: String,
        from: String,
        to: String,
    },

    #[error("Device is held by stage '{holder}', cannot hand it to '{requested}'")]
    DeviceBusy {
        holder: StageKind,
        requested: StageKind,
    },
}

impl DubError {
    /// Attach the failing stage to an error. Errors already carrying a stage are kept as-is.
    pub fn in_stage(self, stage: StageKind) -> Self {
        match self {
            err @ DubError::Stage { .. } => err,
            other => DubError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The stage a wrapped error came from, if any.
    pub fn stage(&self) -> Option<StageKind> {
        match self {
            DubError::Stage { stage, .. } | DubError::NonFatalStageSkip { stage, .. } => {
                Some(*stage)
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_stage_wraps_once() {
        let err = DubError::NoValidFrames
            .in_stage(StageKind::ResyncLips)
            .in_stage(StageKind::SynthesizeVoice);

        assert_eq!(err.stage(), Some(StageKind::ResyncLips));
        assert!(err.to_string().contains("resync-lips"));
    }

    #[test]
    fn test_coverage_message_reports_fraction() {
        let err = DubError::InsufficientFaceCoverage {
            fraction: 0.25,
            threshold: 0.5,
            detected: 1,
            total: 4,
        };
        let message = err.to_string();
        assert!(message.contains("1/4"));
        assert!(message.contains("0.250"));
    }
}
