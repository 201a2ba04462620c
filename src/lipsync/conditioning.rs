//! Generator input construction.
//!
//! The generator sees each face twice: once with the mouth region hidden and
//! once intact as a pose reference. Every step here is a pure function over
//! `[batch, height, width, channel]` arrays.

use image::RgbImage;
use ndarray::{Array4, Axis, concatenate, s};

use crate::error::{DubError, Result};
use super::audio::{MEL_STEP, MelChunk, NUM_MELS};

/// Stack equally sized crops into `[B, H, W, 3]` pixel values.
pub fn faces_to_array(faces: &[RgbImage]) -> Result<Array4<f32>> {
    let first = faces
        .first()
        .ok_or_else(|| DubError::Inference("Cannot build an empty face batch".to_string()))?;
    let (width, height) = first.dimensions();

    let mut out = Array4::<f32>::zeros((faces.len(), height as usize, width as usize, 3));
    for (b, face) in faces.iter().enumerate() {
        if face.dimensions() != (width, height) {
            return Err(DubError::Inference(format!(
                "Face {} is {}x{}, batch expects {}x{}",
                b,
                face.width(),
                face.height(),
                width,
                height
            )));
        }
        for (x, y, pixel) in face.enumerate_pixels() {
            for c in 0..3 {
                out[[b, y as usize, x as usize, c]] = pixel.0[c] as f32;
            }
        }
    }
    Ok(out)
}

/// Copy with the lower half of every face zeroed.
pub fn mask_lower_half(faces: &Array4<f32>) -> Array4<f32> {
    let mut masked = faces.clone();
    let half = faces.len_of(Axis(1)) / 2;
    masked.slice_mut(s![.., half.., .., ..]).fill(0.0);
    masked
}

/// Masked copy first, then the reference copy, along the channel axis.
pub fn concat_channels(masked: &Array4<f32>, reference: &Array4<f32>) -> Result<Array4<f32>> {
    concatenate(Axis(3), &[masked.view(), reference.view()])
        .map_err(|e| DubError::Inference(format!("Cannot concatenate face channels: {}", e)))
}

pub fn scale_to_unit(pixels: Array4<f32>) -> Array4<f32> {
    pixels / 255.0
}

/// Full face conditioning: `[B, 6, H, W]` in `[0, 1]`.
pub fn face_conditioning(faces: &[RgbImage]) -> Result<Array4<f32>> {
    let pixels = faces_to_array(faces)?;
    let masked = mask_lower_half(&pixels);
    let stacked = scale_to_unit(concat_channels(&masked, &pixels)?);
    Ok(stacked.permuted_axes([0, 3, 1, 2]).as_standard_layout().to_owned())
}

/// Audio conditioning: `[B, 1, NUM_MELS, MEL_STEP]`.
pub fn mel_conditioning(chunks: &[&MelChunk]) -> Result<Array4<f32>> {
    let mut out = Array4::<f32>::zeros((chunks.len(), 1, NUM_MELS, MEL_STEP));
    for (b, chunk) in chunks.iter().enumerate() {
        if chunk.dim() != (NUM_MELS, MEL_STEP) {
            return Err(DubError::Inference(format!(
                "Mel chunk {} has shape {:?}, expected ({}, {})",
                b,
                chunk.dim(),
                NUM_MELS,
                MEL_STEP
            )));
        }
        out.slice_mut(s![b, 0, .., ..]).assign(*chunk);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use ndarray::Array2;

    fn solid(size: u32, value: u8) -> RgbImage {
        RgbImage::from_pixel(size, size, Rgb([value, value, value]))
    }

    #[test]
    fn test_mask_zeroes_lower_rows_only() {
        let pixels = faces_to_array(&[solid(4, 200)]).unwrap();
        let masked = mask_lower_half(&pixels);

        assert!(masked.slice(s![0, ..2, .., ..]).iter().all(|&v| v == 200.0));
        assert!(masked.slice(s![0, 2.., .., ..]).iter().all(|&v| v == 0.0));
        // The input is left untouched.
        assert!(pixels.iter().all(|&v| v == 200.0));
    }

    #[test]
    fn test_conditioning_layout() {
        let cond = face_conditioning(&[solid(8, 255), solid(8, 51)]).unwrap();
        assert_eq!(cond.dim(), (2, 6, 8, 8));

        // Masked channels come first: zero below the midline, scaled above it.
        assert_eq!(cond[[0, 0, 0, 0]], 1.0);
        assert_eq!(cond[[0, 2, 7, 7]], 0.0);
        // Reference channels keep the whole face.
        assert_eq!(cond[[0, 3, 7, 7]], 1.0);
        assert!((cond[[1, 5, 7, 0]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_mixed_sizes_rejected() {
        assert!(faces_to_array(&[solid(8, 0), solid(4, 0)]).is_err());
    }

    #[test]
    fn test_mel_conditioning_shape() {
        let a = Array2::<f32>::from_elem((NUM_MELS, MEL_STEP), 1.5);
        let b = Array2::<f32>::zeros((NUM_MELS, MEL_STEP));
        let mel = mel_conditioning(&[&a, &b]).unwrap();
        assert_eq!(mel.dim(), (2, 1, NUM_MELS, MEL_STEP));
        assert_eq!(mel[[0, 0, 79, 15]], 1.5);
        assert_eq!(mel[[1, 0, 0, 0]], 0.0);
    }
}
