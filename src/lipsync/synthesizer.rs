use async_trait::async_trait;
use image::{Rgb, RgbImage};
use ndarray::Array4;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::device::DeviceContext;
use crate::error::{DubError, Result};
use super::batcher::Batch;
use super::checkpoint::Checkpoint;

/// A loaded audio-conditioned face generator.
#[async_trait]
pub trait LipSyncGenerator: Send + Sync {
    /// `mel` is `[B, 1, 80, 16]`, `faces` is `[B, 6, H, W]`; returns `[B, 3, H, W]` in `[0, 1]`.
    async fn generate(&mut self, mel: &Array4<f32>, faces: &Array4<f32>) -> Result<Array4<f32>>;

    async fn unload(&mut self) -> Result<()>;
}

/// Builds a generator from a checkpoint on the run's device.
#[async_trait]
pub trait GeneratorLoader: Send + Sync {
    async fn load(&self, checkpoint: &Checkpoint, device: &DeviceContext) -> Result<Box<dyn LipSyncGenerator>>;
}

/// Runs the generator batch by batch, loading it on first use.
pub struct FrameSynthesizer<'a> {
    loader: &'a dyn GeneratorLoader,
    checkpoint_path: PathBuf,
    model: Option<Box<dyn LipSyncGenerator>>,
    loads: usize,
}

impl<'a> FrameSynthesizer<'a> {
    pub fn new(loader: &'a dyn GeneratorLoader, checkpoint_path: impl Into<PathBuf>) -> Self {
        Self {
            loader,
            checkpoint_path: checkpoint_path.into(),
            model: None,
            loads: 0,
        }
    }

    /// Number of times the generator was loaded.
    pub fn loads(&self) -> usize {
        self.loads
    }

    /// One generated face per batch item, at crop resolution.
    pub async fn synthesize(&mut self, batch: &Batch, device: &DeviceContext) -> Result<Vec<RgbImage>> {
        let faces = batch.face_input()?;
        let mel = batch.mel_input()?;
        let model = self.model(device).await?;

        let output = model.generate(&mel, &faces).await?;
        let (b, _, h, w) = faces.dim();
        if output.dim() != (b, 3, h, w) {
            return Err(DubError::Inference(format!(
                "Generator returned shape {:?}, expected ({}, 3, {}, {})",
                output.dim(),
                b,
                h,
                w
            )));
        }

        debug!("Generated {} faces", b);
        Ok(to_images(&output))
    }

    /// Drop the generator if it was loaded.
    pub async fn release(&mut self) -> Result<()> {
        match self.model.take() {
            Some(mut model) => {
                debug!("Unloading generator");
                model.unload().await
            }
            None => Ok(()),
        }
    }

    async fn model(&mut self, device: &DeviceContext) -> Result<&mut Box<dyn LipSyncGenerator>> {
        if self.model.is_none() {
            let checkpoint = Checkpoint::open(&self.checkpoint_path)?;
            let model = self.loader.load(&checkpoint, device).await?;
            self.loads += 1;
            info!("Model loaded on {}", device.device());
            self.model = Some(model);
        }
        self.model
            .as_mut()
            .ok_or_else(|| DubError::ModelLoad("Generator is not loaded".to_string()))
    }
}

/// Rescale `[B, 3, H, W]` values in `[0, 1]` to 8-bit images.
pub fn to_images(output: &Array4<f32>) -> Vec<RgbImage> {
    let (b, _, h, w) = output.dim();
    (0..b)
        .map(|i| {
            RgbImage::from_fn(w as u32, h as u32, |x, y| {
                let px = |c: usize| (output[[i, c, y as usize, x as usize]] * 255.0).clamp(0.0, 255.0) as u8;
                Rgb([px(0), px(1), px(2)])
            })
        })
        .collect()
}
