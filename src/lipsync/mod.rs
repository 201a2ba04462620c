// Audio-driven lip resynthesis.
//
// - Frame: face source ingestion and per-frame transforms
// - Face / Tracker: per-frame detection with OOM recovery and temporal smoothing
// - Audio: WAV loading, mel spectrogram and per-frame mel chunks
// - Conditioning / Batcher: masked face + mel inputs grouped into batches
// - Checkpoint / Synthesizer: generator weights and lazy per-run model
// - Compositor: pastes generated faces back and streams frames out
// - Remote: HTTP inference service backing the detector and generator
// - Engine: wires the above into one run

pub mod audio;
pub mod batcher;
pub mod checkpoint;
pub mod compositor;
pub mod conditioning;
pub mod engine;
pub mod face;
pub mod frame;
pub mod remote;
pub mod synthesizer;
pub mod tracker;

pub use audio::{MelChunk, MelSpectrogram, mel_chunks, read_wav};
pub use batcher::{Batch, BatchItem, BoxOverride, SynthesisBatcher};
pub use checkpoint::{Checkpoint, strip_parallel_prefix};
pub use compositor::{FrameSink, MemorySink, composite};
pub use engine::{LipSyncEngine, LipSyncReport, LipSyncRequest};
pub use face::{DetectError, FaceBox, FaceDetection, FaceDetector, Padding, Rect};
pub use frame::{IngestOptions, SourceFrames};
pub use remote::{RemoteFaceDetector, RemoteGeneratorLoader};
pub use synthesizer::{FrameSynthesizer, GeneratorLoader, LipSyncGenerator};
pub use tracker::{DetectionRetryPolicy, FaceTracker};
