/*
 * Channel Ingest CLI - Audio File Helpers
 * Copyright (c) 2025 Channel Ingest Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use anyhow::{Context, Result};
use std::path::Path;

/// Pipeline-wide sample rate. Acquisition normalizes everything to mono
/// 16 kHz PCM before ASR or diarization see it.
pub const SAMPLE_RATE: u32 = 16_000;

/// Decoded mono audio ready for spectral analysis.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn duration_s(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// The leading window used by the monologue probe. Clamped to the
    /// buffer length.
    pub fn leading_window(&self, seconds: f64) -> &[f32] {
        let n = ((seconds * self.sample_rate as f64) as usize).min(self.samples.len());
        &self.samples[..n]
    }

    /// Samples within `[start_s, end_s)`, clamped to the buffer.
    pub fn slice_seconds(&self, start_s: f64, end_s: f64) -> &[f32] {
        let start = ((start_s.max(0.0) * self.sample_rate as f64) as usize).min(self.samples.len());
        let end = ((end_s.max(0.0) * self.sample_rate as f64) as usize)
            .clamp(start, self.samples.len());
        &self.samples[start..end]
    }
}

/// Load a WAV file as mono f32 samples. Multi-channel input is downmixed
/// by averaging; 16-bit and 32-bit integer PCM and f32 are accepted.
pub fn load_wav(path: &Path) -> Result<AudioBuffer> {
    let mut reader = hound::WavReader::open(path)
        .with_context(|| format!("failed to open WAV file {}", path.display()))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .context("failed to decode float samples")?,
        hound::SampleFormat::Int => {
            let max = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max))
                .collect::<Result<Vec<_>, _>>()
                .context("failed to decode integer samples")?
        }
    };

    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };

    Ok(AudioBuffer { samples, sample_rate: spec.sample_rate })
}

/// Measured duration of a WAV file without decoding the sample data.
pub fn wav_duration_s(path: &Path) -> Result<f64> {
    let reader = hound::WavReader::open(path)
        .with_context(|| format!("failed to open WAV file {}", path.display()))?;
    let spec = reader.spec();
    Ok(reader.duration() as f64 / spec.sample_rate as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn write_test_wav(path: &Path, seconds: f64, channels: u16) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        let frames = (seconds * SAMPLE_RATE as f64) as usize;
        for i in 0..frames {
            let t = i as f32 / SAMPLE_RATE as f32;
            let sample = (0.4 * (2.0 * PI * 220.0 * t).sin() * i16::MAX as f32) as i16;
            for _ in 0..channels {
                writer.write_sample(sample).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn loads_mono_wav_and_measures_duration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_test_wav(&path, 2.0, 1);

        let buffer = load_wav(&path).unwrap();
        assert_eq!(buffer.sample_rate, SAMPLE_RATE);
        assert!((buffer.duration_s() - 2.0).abs() < 0.01);
        assert!((wav_duration_s(&path).unwrap() - 2.0).abs() < 0.01);
    }

    #[test]
    fn downmixes_stereo_to_mono() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        write_test_wav(&path, 1.0, 2);

        let buffer = load_wav(&path).unwrap();
        assert!((buffer.duration_s() - 1.0).abs() < 0.01);
    }

    #[test]
    fn leading_window_clamps_to_buffer() {
        let buffer = AudioBuffer { samples: vec![0.0; 16_000], sample_rate: SAMPLE_RATE };
        assert_eq!(buffer.leading_window(0.5).len(), 8_000);
        assert_eq!(buffer.leading_window(10.0).len(), 16_000);
    }

    #[test]
    fn slice_seconds_clamps_and_orders() {
        let buffer = AudioBuffer { samples: vec![0.0; 32_000], sample_rate: SAMPLE_RATE };
        assert_eq!(buffer.slice_seconds(0.5, 1.5).len(), 16_000);
        assert_eq!(buffer.slice_seconds(1.9, 5.0).len(), 32_000 - 30_400);
        assert_eq!(buffer.slice_seconds(3.0, 2.0).len(), 0);
    }
}
