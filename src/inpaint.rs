//! Burned-in subtitle removal.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::config::SubtitleRemovalConfig;
use crate::device::DeviceContext;
use crate::error::{DubError, Result};
use crate::media::{MediaProcessorTrait, SubtitleBand};

#[cfg_attr(test, automock)]
#[async_trait]
pub trait SubtitleRemover: Send + Sync {
    async fn load(&mut self, device: &DeviceContext) -> Result<()>;

    /// Write a copy of `video_path` without subtitles to `output_path`.
    async fn remove(&self, video_path: &Path, output_path: &Path) -> Result<PathBuf>;

    async fn unload(&mut self) -> Result<()>;
}

/// Blurs the lower subtitle band with ffmpeg's `delogo` filter.
pub struct DelogoRemover {
    config: SubtitleRemovalConfig,
    media: Arc<dyn MediaProcessorTrait>,
}

impl DelogoRemover {
    pub fn new(config: SubtitleRemovalConfig, media: Arc<dyn MediaProcessorTrait>) -> Self {
        Self { config, media }
    }
}

#[async_trait]
impl SubtitleRemover for DelogoRemover {
    async fn load(&mut self, device: &DeviceContext) -> Result<()> {
        info!("Subtitle removal runs in the codec service; {} is left idle", device.device());
        Ok(())
    }

    async fn remove(&self, video_path: &Path, output_path: &Path) -> Result<PathBuf> {
        let info = self.media.probe_video(video_path).await?;
        let band = SubtitleBand::for_frame(
            info.width,
            info.height,
            self.config.band_top,
            self.config.band_margin,
        )
        .ok_or_else(|| {
            DubError::Media(format!(
                "No subtitle band fits a {}x{} frame (top {}, margin {})",
                info.width, info.height, self.config.band_top, self.config.band_margin
            ))
        })?;

        info!(
            "Removing subtitles in band x={} y={} {}x{}",
            band.x, band.y, band.width, band.height
        );
        self.media.remove_subtitle_band(video_path, output_path, band).await?;
        Ok(output_path.to_path_buf())
    }

    async fn unload(&mut self) -> Result<()> {
        Ok(())
    }
}
