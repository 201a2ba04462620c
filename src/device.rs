//! Compute device description shared by every pipeline stage.
//!
//! The orchestrator owns the [`DeviceContext`] and hands `&DeviceContext` to each
//! stage. Stages read the device; only the orchestrator claims, releases and
//! clears it, and it does so between stages.

use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};

use crate::config::DeviceKind;
use crate::error::{DubError, Result};
use crate::pipeline::StageKind;

/// Concrete accelerator a run executes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda,
    Mps,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
            Device::Mps => "mps",
        }
    }

    /// Resolve a configured kind into a device. `Auto` prefers CUDA when a
    /// device is visible, then Apple silicon, then CPU.
    pub fn resolve(kind: DeviceKind) -> Self {
        match kind {
            DeviceKind::Cpu => Device::Cpu,
            DeviceKind::Cuda => Device::Cuda,
            DeviceKind::Mps => Device::Mps,
            DeviceKind::Auto => {
                let cuda_visible = std::env::var("CUDA_VISIBLE_DEVICES")
                    .map(|v| !v.trim().is_empty() && v.trim() != "-1")
                    .unwrap_or(false);
                if cuda_visible {
                    Device::Cuda
                } else if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
                    Device::Mps
                } else {
                    Device::Cpu
                }
            }
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hook run on every cache clear, e.g. to ask an external runtime to trim its pools.
pub trait CacheReclaimer: Send + Sync {
    fn reclaim(&self, device: Device);
}

pub struct DeviceContext {
    device: Device,
    resident: Mutex<Option<StageKind>>,
    clears: AtomicUsize,
    reclaimers: Vec<Box<dyn CacheReclaimer>>,
}

impl DeviceContext {
    pub fn new(device: Device) -> Self {
        info!("Device context initialized using device: {}", device);
        Self {
            device,
            resident: Mutex::new(None),
            clears: AtomicUsize::new(0),
            reclaimers: Vec::new(),
        }
    }

    pub fn from_kind(kind: DeviceKind) -> Self {
        Self::new(Device::resolve(kind))
    }

    pub fn with_reclaimer(mut self, reclaimer: Box<dyn CacheReclaimer>) -> Self {
        self.reclaimers.push(reclaimer);
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Stage currently holding the device, if any.
    pub fn resident(&self) -> Option<StageKind> {
        *self.lock_resident()
    }

    /// Record `stage` as the single holder of device memory.
    pub(crate) fn claim(&self, stage: StageKind) -> Result<()> {
        let mut resident = self.lock_resident();
        match *resident {
            Some(holder) => Err(DubError::DeviceBusy {
                holder,
                requested: stage,
            }),
            None => {
                debug!("Stage '{}' claimed {}", stage, self.device);
                *resident = Some(stage);
                Ok(())
            }
        }
    }

    pub(crate) fn release(&self, stage: StageKind) {
        let mut resident = self.lock_resident();
        if *resident == Some(stage) {
            debug!("Stage '{}' released {}", stage, self.device);
            *resident = None;
        }
    }

    /// Drop cached allocations on the device. Invoked by the orchestrator between stages.
    pub(crate) fn clear_cache(&self) {
        let count = self.clears.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Clearing {} memory cache (#{})", self.device, count);
        for reclaimer in &self.reclaimers {
            reclaimer.reclaim(self.device);
        }
    }

    /// Number of cache clears performed so far.
    pub fn cache_clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    fn lock_resident(&self) -> std::sync::MutexGuard<'_, Option<StageKind>> {
        // The guarded value is a plain Copy enum, so a poisoned lock still holds a usable state.
        self.resident.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("device", &self.device)
            .field("resident", &self.resident())
            .field("clears", &self.cache_clears())
            .finish()
    }
}
