//! Safetensors-backed generator checkpoint.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use memmap2::MmapOptions;
use tracing::info;

use crate::error::{DubError, Result};

/// Key prefix left behind by data-parallel training wrappers.
pub const PARALLEL_PREFIX: &str = "module.";

pub fn strip_parallel_prefix(name: &str) -> &str {
    name.strip_prefix(PARALLEL_PREFIX).unwrap_or(name)
}

/// Validated checkpoint file and its tensor names, already stripped of
/// [`PARALLEL_PREFIX`]. The weights themselves are read by the backend.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    path: PathBuf,
    names: BTreeSet<String>,
}

impl Checkpoint {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DubError::ModelLoad(format!(
                "Checkpoint not found: {}",
                path.display()
            )));
        }

        let file = std::fs::File::open(path)?;
        // SAFETY: read-only mapping of a file nothing in this process writes to.
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        let tensors = safetensors::SafeTensors::deserialize(&mmap)
            .map_err(|e| DubError::ModelLoad(format!("{}: {}", path.display(), e)))?;
        let names: BTreeSet<String> = tensors
            .names()
            .into_iter()
            .map(|raw| strip_parallel_prefix(raw).to_string())
            .collect();

        info!("Load checkpoint from: {} ({} tensors)", path.display(), names.len());

        Ok(Self {
            path: path.to_path_buf(),
            names,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use safetensors::tensor::{Dtype, View, serialize_to_file};
    use std::borrow::Cow;

    #[derive(Debug, Clone)]
    pub(crate) struct TestTensor {
        pub dtype: Dtype,
        pub shape: Vec<usize>,
        pub data: Vec<u8>,
    }

    impl View for TestTensor {
        fn dtype(&self) -> Dtype {
            self.dtype
        }

        fn shape(&self) -> &[usize] {
            &self.shape
        }

        fn data(&self) -> Cow<'_, [u8]> {
            Cow::Borrowed(&self.data)
        }

        fn data_len(&self) -> usize {
            self.data.len()
        }
    }

    pub(crate) fn f32_tensor(values: &[f32]) -> TestTensor {
        TestTensor {
            dtype: Dtype::F32,
            shape: vec![values.len()],
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    /// Write a small checkpoint with the given tensor names.
    pub(crate) fn write_checkpoint(path: &Path, names: &[&str]) {
        let tensors: Vec<(String, TestTensor)> = names
            .iter()
            .map(|name| (name.to_string(), f32_tensor(&[1.0, -2.0])))
            .collect();
        serialize_to_file(tensors, &None, path).unwrap();
    }

    #[test]
    fn test_strip_parallel_prefix() {
        assert_eq!(strip_parallel_prefix("module.face_encoder_blocks.0.weight"), "face_encoder_blocks.0.weight");
        assert_eq!(strip_parallel_prefix("output_block.1.bias"), "output_block.1.bias");
    }

    #[test]
    fn test_open_strips_parallel_prefix_from_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gen.safetensors");
        write_checkpoint(&path, &["module.audio_encoder.0.weight", "output_block.0.bias"]);

        let checkpoint = Checkpoint::open(&path).unwrap();
        assert_eq!(checkpoint.len(), 2);
        assert_eq!(
            checkpoint.names().collect::<Vec<_>>(),
            vec!["audio_encoder.0.weight", "output_block.0.bias"]
        );
    }

    #[test]
    fn test_corrupt_file_is_model_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gen.safetensors");
        std::fs::write(&path, b"not a checkpoint").unwrap();

        let err = Checkpoint::open(&path).unwrap_err();
        assert!(matches!(err, DubError::ModelLoad(_)));
    }

    #[test]
    fn test_missing_file_is_model_load_error() {
        let err = Checkpoint::open("/nonexistent/gen.safetensors").unwrap_err();
        assert!(matches!(err, DubError::ModelLoad(_)));
    }
}
