//! Log-mel features driving the lip generator.
//!
//! Parameters follow the generator's training setup: 16 kHz input, 800-sample
//! periodic Hann window with hop 200, 80 Slaney mel bins over 55-7600 Hz, and
//! symmetric normalization to `[-4, 4]`.

use ndarray::{Array2, s};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{DubError, Result};

pub const SAMPLE_RATE: u32 = 16_000;
pub const N_FFT: usize = 800;
pub const HOP_LENGTH: usize = 200;
pub const WIN_LENGTH: usize = 800;
pub const NUM_MELS: usize = 80;
pub const MEL_STEP: usize = 16;

const N_FREQ: usize = N_FFT / 2 + 1;
const FMIN: f64 = 55.0;
const FMAX: f64 = 7600.0;
const PREEMPHASIS: f32 = 0.97;
const REF_LEVEL_DB: f32 = 20.0;
const MIN_LEVEL_DB: f32 = -100.0;
const MAX_ABS_VALUE: f32 = 4.0;

/// `NUM_MELS x MEL_STEP` window of the spectrogram aligned with one video frame.
pub type MelChunk = Array2<f32>;

/// Mono PCM samples in `[-1, 1]`.
#[derive(Debug, Clone)]
pub struct WavAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl WavAudio {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Read a PCM WAV file, averaging channels down to mono.
pub fn read_wav<P: AsRef<Path>>(path: P) -> Result<WavAudio> {
    let mut reader = hound::WavReader::open(path.as_ref())?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|sample| sample as f32 / max_val))
                .collect::<std::result::Result<Vec<f32>, hound::Error>>()?
        }
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<std::result::Result<Vec<f32>, hound::Error>>()?,
    };

    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    debug!(
        "Read {} samples at {} Hz from {}",
        samples.len(),
        spec.sample_rate,
        path.as_ref().display()
    );

    Ok(WavAudio {
        samples,
        sample_rate: spec.sample_rate,
    })
}

/// Precomputed window, FFT plan and mel filter bank.
pub struct MelSpectrogram {
    window: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
    filters: Vec<f32>,
}

impl MelSpectrogram {
    pub fn new() -> Self {
        let mut planner = FftPlanner::<f32>::new();
        Self {
            window: build_hann_window(),
            fft: planner.plan_fft_forward(N_FFT),
            filters: build_mel_filters(),
        }
    }

    /// Normalized log-mel spectrogram, shape `[NUM_MELS, 1 + samples / HOP_LENGTH]`.
    pub fn compute(&self, samples: &[f32]) -> Result<Array2<f32>> {
        if samples.is_empty() {
            return Err(DubError::Audio("Audio track is empty".to_string()));
        }

        let emphasized = preemphasis(samples);
        let padded = reflect_pad(&emphasized, N_FFT / 2);
        let frames = 1 + samples.len() / HOP_LENGTH;

        let mut mel = Array2::<f32>::zeros((NUM_MELS, frames));
        let mut buffer = vec![Complex::<f32>::new(0.0, 0.0); N_FFT];
        let mut magnitude = vec![0.0f32; N_FREQ];

        for t in 0..frames {
            let start = t * HOP_LENGTH;
            for (i, bin) in buffer.iter_mut().enumerate() {
                *bin = Complex::new(padded[start + i] * self.window[i], 0.0);
            }

            self.fft.process(&mut buffer);

            for (mag, bin) in magnitude.iter_mut().zip(&buffer) {
                *mag = bin.norm();
            }

            for m in 0..NUM_MELS {
                let filter = &self.filters[m * N_FREQ..(m + 1) * N_FREQ];
                let energy: f32 = filter.iter().zip(&magnitude).map(|(w, x)| w * x).sum();
                mel[[m, t]] = normalize(amp_to_db(energy) - REF_LEVEL_DB);
            }
        }

        if mel.iter().any(|v| v.is_nan()) {
            return Err(DubError::Audio(
                "Mel contains nan! Using a TTS voice? Add a small epsilon noise to the wav file and try again"
                    .to_string(),
            ));
        }

        info!("Computed mel spectrogram with {} frames", frames);
        Ok(mel)
    }
}

impl Default for MelSpectrogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Split the spectrogram into one chunk per video frame. Chunk `i` starts at
/// `floor(i * 80 / fps)`; the last chunk is the spectrogram tail.
pub fn mel_chunks(mel: &Array2<f32>, fps: f64) -> Result<Vec<MelChunk>> {
    let total = mel.ncols();
    if total < MEL_STEP {
        return Err(DubError::Audio(format!(
            "Audio too short: {} mel frames, need at least {}",
            total, MEL_STEP
        )));
    }
    if !(fps.is_finite() && fps > 0.0) {
        return Err(DubError::Audio(format!("Invalid frame rate {}", fps)));
    }

    let multiplier = 80.0 / fps;
    let mut chunks = Vec::new();
    let mut i = 0usize;
    loop {
        let start = (i as f64 * multiplier) as usize;
        if start + MEL_STEP > total {
            chunks.push(mel.slice(s![.., total - MEL_STEP..]).to_owned());
            break;
        }
        chunks.push(mel.slice(s![.., start..start + MEL_STEP]).to_owned());
        i += 1;
    }

    info!("Length of mel chunks: {}", chunks.len());
    Ok(chunks)
}

fn preemphasis(samples: &[f32]) -> Vec<f32> {
    let mut out = Vec::with_capacity(samples.len());
    let mut previous = 0.0f32;
    for &x in samples {
        out.push(x - PREEMPHASIS * previous);
        previous = x;
    }
    out
}

/// Mirror `pad` samples on each side without repeating the edge sample.
fn reflect_pad(samples: &[f32], pad: usize) -> Vec<f32> {
    let len = samples.len() as isize;
    (-(pad as isize)..len + pad as isize)
        .map(|i| samples[reflect_index(i, samples.len())])
        .collect()
}

fn reflect_index(i: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len as isize - 1);
    let m = i.rem_euclid(period);
    if m >= len as isize {
        (period - m) as usize
    } else {
        m as usize
    }
}

fn amp_to_db(x: f32) -> f32 {
    // 10^(min_level_db / 20)
    const MIN_LEVEL: f32 = 1e-5;
    // NaN must survive the floor so the caller can reject it.
    20.0 * (if x < MIN_LEVEL { MIN_LEVEL } else { x }).log10()
}

fn normalize(db: f32) -> f32 {
    let scaled = (2.0 * MAX_ABS_VALUE) * ((db - MIN_LEVEL_DB) / -MIN_LEVEL_DB) - MAX_ABS_VALUE;
    scaled.clamp(-MAX_ABS_VALUE, MAX_ABS_VALUE)
}

fn build_hann_window() -> Vec<f32> {
    // Periodic Hann, zero-padded to N_FFT when the window is shorter.
    let offset = (N_FFT - WIN_LENGTH) / 2;
    let mut window = vec![0.0f32; N_FFT];
    for i in 0..WIN_LENGTH {
        let angle = 2.0 * std::f64::consts::PI * i as f64 / WIN_LENGTH as f64;
        window[offset + i] = (0.5 * (1.0 - angle.cos())) as f32;
    }
    window
}

fn hz_to_mel(freq: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;
    let logstep = 6.4f64.ln() / 27.0;

    if freq >= MIN_LOG_HZ {
        MIN_LOG_MEL + (freq / MIN_LOG_HZ).ln() / logstep
    } else {
        freq / F_SP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;
    let logstep = 6.4f64.ln() / 27.0;

    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * (logstep * (mel - MIN_LOG_MEL)).exp()
    } else {
        F_SP * mel
    }
}

/// Slaney-normalized triangular filters, row-major `[NUM_MELS, N_FREQ]`.
fn build_mel_filters() -> Vec<f32> {
    let fft_freqs: Vec<f64> = (0..N_FREQ)
        .map(|k| k as f64 * SAMPLE_RATE as f64 / N_FFT as f64)
        .collect();

    let mel_min = hz_to_mel(FMIN);
    let mel_max = hz_to_mel(FMAX);
    let mel_points: Vec<f64> = (0..NUM_MELS + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f64 / (NUM_MELS + 1) as f64))
        .collect();

    let mut filters = vec![0.0f32; NUM_MELS * N_FREQ];
    for m in 0..NUM_MELS {
        let lower_width = mel_points[m + 1] - mel_points[m];
        let upper_width = mel_points[m + 2] - mel_points[m + 1];
        let enorm = 2.0 / (mel_points[m + 2] - mel_points[m]);
        for (k, &freq) in fft_freqs.iter().enumerate() {
            let lower = (freq - mel_points[m]) / lower_width;
            let upper = (mel_points[m + 2] - freq) / upper_width;
            filters[m * N_FREQ + k] = (lower.min(upper).max(0.0) * enorm) as f32;
        }
    }
    filters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_count_follows_hop() {
        let mel = MelSpectrogram::new().compute(&vec![0.0f32; 4000]).unwrap();
        assert_eq!(mel.dim(), (NUM_MELS, 21));
    }

    #[test]
    fn test_silence_is_floor_value() {
        let mel = MelSpectrogram::new().compute(&vec![0.0f32; 1600]).unwrap();
        assert!(mel.iter().all(|&v| (v + MAX_ABS_VALUE).abs() < 1e-6));
    }

    #[test]
    fn test_tone_lands_in_expected_band() {
        // 1 kHz tone: energy peaks in the bin whose centre is closest to 1 kHz.
        let samples: Vec<f32> = (0..8000)
            .map(|n| 0.1 * (2.0 * std::f32::consts::PI * 1000.0 * n as f32 / SAMPLE_RATE as f32).sin())
            .collect();
        let mel = MelSpectrogram::new().compute(&samples).unwrap();
        let column = mel.column(20);
        let (peak, _) = column
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best });

        let mel_min = hz_to_mel(FMIN);
        let mel_max = hz_to_mel(FMAX);
        let centre = mel_to_hz(mel_min + (mel_max - mel_min) * (peak + 1) as f64 / (NUM_MELS + 1) as f64);
        assert!((centre - 1000.0).abs() < 120.0, "peak bin {} centred at {}", peak, centre);
        assert!(column.iter().all(|v| (-4.0..=4.0).contains(v)));
    }

    #[test]
    fn test_chunk_count_for_ten_seconds_at_25_fps() {
        let mel = Array2::<f32>::zeros((NUM_MELS, 801));
        let chunks = mel_chunks(&mel, 25.0).unwrap();
        assert_eq!(chunks.len(), 247);
        assert!(chunks.iter().all(|c| c.dim() == (NUM_MELS, MEL_STEP)));
    }

    #[test]
    fn test_tail_chunk_is_spectrogram_end() {
        let mut mel = Array2::<f32>::zeros((NUM_MELS, 40));
        for t in 0..40 {
            mel.column_mut(t).fill(t as f32);
        }
        let chunks = mel_chunks(&mel, 25.0).unwrap();
        let last = chunks.last().unwrap();
        assert_eq!(last[[0, 0]], 24.0);
        assert_eq!(last[[0, MEL_STEP - 1]], 39.0);
    }

    #[test]
    fn test_short_audio_is_rejected() {
        let mel = Array2::<f32>::zeros((NUM_MELS, 10));
        assert!(matches!(mel_chunks(&mel, 25.0), Err(DubError::Audio(_))));
    }

    #[test]
    fn test_nan_input_is_rejected() {
        let mut samples = vec![0.0f32; 1600];
        samples[800] = f32::NAN;
        assert!(matches!(MelSpectrogram::new().compute(&samples), Err(DubError::Audio(_))));
    }

    #[test]
    fn test_reflect_pad_mirrors_without_edge() {
        let padded = reflect_pad(&[1.0, 2.0, 3.0, 4.0], 2);
        assert_eq!(padded, vec![3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0, 2.0]);
    }

    #[test]
    fn test_read_wav_downmixes_stereo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..100 {
            writer.write_sample(16384i16).unwrap();
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();

        let audio = read_wav(&path).unwrap();
        assert_eq!(audio.samples.len(), 100);
        assert_eq!(audio.sample_rate, SAMPLE_RATE);
        assert!((audio.samples[0] - 0.25).abs() < 1e-4);
    }
}
