//! redub - offline video dubbing
//!
//! Speech recognition, translation, voice-cloned synthesis, optional subtitle
//! removal and audio-driven lip resynthesis, run as one staged pipeline over a
//! single video using whisper-cpp, ollama, an F5-TTS style CLI and ffmpeg.

pub mod cli;
pub mod config;
pub mod device;
pub mod error;
pub mod inpaint;
pub mod lipsync;
pub mod media;
pub mod pipeline;
pub mod subtitle;
pub mod transcribe;
pub mod translate;
pub mod voice;
pub mod workflow;
