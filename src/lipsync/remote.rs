//! Detector and generator hosted by a local inference service.
//!
//! The service exchanges JSON: frames travel as PNG files in a shared temp
//! directory, tensors as `{shape, data}` with row-major data.

use async_trait::async_trait;
use image::RgbImage;
use ndarray::{Array4, IxDyn};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

use crate::device::{Device, DeviceContext};
use crate::error::{DubError, Result};
use super::checkpoint::Checkpoint;
use super::face::{DetectError, FaceDetector, Rect};
use super::synthesizer::{GeneratorLoader, LipSyncGenerator};

/// Tensor name prefixes every generator checkpoint must provide.
pub const GENERATOR_MODULES: [&str; 4] = [
    "face_encoder_blocks",
    "audio_encoder",
    "face_decoder_blocks",
    "output_block",
];

const OUT_OF_MEMORY: &str = "out_of_memory";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorPayload {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorPayload {
    pub fn from_array(array: &Array4<f32>) -> Self {
        Self {
            shape: array.shape().to_vec(),
            data: array.iter().copied().collect(),
        }
    }

    pub fn into_array4(self) -> Result<Array4<f32>> {
        if self.shape.len() != 4 {
            return Err(DubError::Inference(format!(
                "Expected a 4-d tensor, got shape {:?}",
                self.shape
            )));
        }
        ndarray::Array::from_shape_vec(IxDyn(&self.shape), self.data)
            .and_then(|a| a.into_dimensionality::<ndarray::Ix4>())
            .map_err(|e| DubError::Inference(format!("Malformed tensor payload: {}", e)))
    }
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    faces: Vec<Option<[i32; 4]>>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    frames: Option<TensorPayload>,
    error: Option<String>,
}

fn build_client(timeout_secs: u64) -> Result<Client> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

/// Face detector served at `{endpoint}/v1/detect`.
pub struct RemoteFaceDetector {
    client: Client,
    endpoint: String,
    device: Option<Device>,
}

impl RemoteFaceDetector {
    pub fn new(endpoint: &str) -> Result<Self> {
        Ok(Self {
            client: build_client(600)?,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            device: None,
        })
    }
}

#[async_trait]
impl FaceDetector for RemoteFaceDetector {
    async fn load(&mut self, device: &DeviceContext) -> Result<()> {
        info!("Using face detector at {} on {}", self.endpoint, device.device());
        self.device = Some(device.device());
        Ok(())
    }

    async fn detect_batch(&mut self, frames: &[RgbImage]) -> std::result::Result<Vec<Option<Rect>>, DetectError> {
        let device = self
            .device
            .ok_or_else(|| DubError::ModelLoad("Face detector used before load".to_string()))?;

        let batch_dir = tempfile::tempdir().map_err(DubError::from)?;
        let mut paths = Vec::with_capacity(frames.len());
        for (i, frame) in frames.iter().enumerate() {
            let path = batch_dir.path().join(format!("{:05}.png", i));
            frame.save(&path).map_err(DubError::from)?;
            paths.push(path.display().to_string());
        }

        let url = format!("{}/v1/detect", self.endpoint);
        debug!("Sending {} frames to {}", frames.len(), url);

        let response = self
            .client
            .post(&url)
            .json(&json!({ "frames": paths, "device": device.as_str() }))
            .send()
            .await
            .map_err(DubError::from)?;

        if response.status() == StatusCode::INSUFFICIENT_STORAGE {
            return Err(DetectError::OutOfMemory);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DubError::Inference(format!("Face detection failed {}: {}", status, body)).into());
        }

        let parsed: DetectResponse = response.json().await.map_err(DubError::from)?;
        match parsed.error.as_deref() {
            Some(OUT_OF_MEMORY) => return Err(DetectError::OutOfMemory),
            Some(other) => return Err(DubError::Inference(format!("Face detection failed: {}", other)).into()),
            None => {}
        }

        Ok(parsed
            .faces
            .into_iter()
            .map(|face| face.map(|[x1, y1, x2, y2]| Rect::new(x1, y1, x2, y2)))
            .collect())
    }

    async fn unload(&mut self) -> Result<()> {
        self.device = None;
        Ok(())
    }
}

/// Loads the generator into the inference service.
pub struct RemoteGeneratorLoader {
    client: Client,
    endpoint: String,
}

impl RemoteGeneratorLoader {
    pub fn new(endpoint: &str) -> Result<Self> {
        Ok(Self {
            client: build_client(600)?,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

/// Fail unless every generator module has at least one tensor.
pub fn validate_generator_keys(checkpoint: &Checkpoint) -> Result<()> {
    let missing: Vec<&str> = GENERATOR_MODULES
        .iter()
        .copied()
        .filter(|module| !checkpoint.names().any(|name| name.starts_with(module)))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(DubError::ModelLoad(format!(
            "{} is missing generator modules: {}",
            checkpoint.path().display(),
            missing.join(", ")
        )))
    }
}

#[async_trait]
impl GeneratorLoader for RemoteGeneratorLoader {
    async fn load(&self, checkpoint: &Checkpoint, device: &DeviceContext) -> Result<Box<dyn LipSyncGenerator>> {
        validate_generator_keys(checkpoint)?;

        let tensors: Vec<&str> = checkpoint.names().collect();
        let url = format!("{}/v1/generator/load", self.endpoint);
        let response = self
            .client
            .post(&url)
            .json(&json!({
                "checkpoint": checkpoint.path().display().to_string(),
                "tensors": tensors,
                "device": device.device().as_str(),
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DubError::ModelLoad(format!("Generator load failed {}: {}", status, body)));
        }

        Ok(Box::new(RemoteGenerator {
            client: self.client.clone(),
            endpoint: self.endpoint.clone(),
        }))
    }
}

pub struct RemoteGenerator {
    client: Client,
    endpoint: String,
}

#[async_trait]
impl LipSyncGenerator for RemoteGenerator {
    async fn generate(&mut self, mel: &Array4<f32>, faces: &Array4<f32>) -> Result<Array4<f32>> {
        let url = format!("{}/v1/generate", self.endpoint);
        let response = self
            .client
            .post(&url)
            .json(&json!({
                "mel": TensorPayload::from_array(mel),
                "faces": TensorPayload::from_array(faces),
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DubError::Inference(format!("Generation failed {}: {}", status, body)));
        }

        let parsed: GenerateResponse = response.json().await?;
        if let Some(error) = parsed.error {
            return Err(DubError::Inference(format!("Generation failed: {}", error)));
        }
        parsed
            .frames
            .ok_or_else(|| DubError::Inference("Generation returned no frames".to_string()))?
            .into_array4()
    }

    async fn unload(&mut self) -> Result<()> {
        let url = format!("{}/v1/generator/unload", self.endpoint);
        let response = self.client.post(&url).json(&json!({})).send().await?;
        if !response.status().is_success() {
            return Err(DubError::Inference(format!(
                "Generator unload failed: {}",
                response.status()
            )));
        }
        Ok(())
    }
}
