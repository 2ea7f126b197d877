/*
 * Channel Ingest CLI - Spectral Diarization Backend
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

use crate::audio::AudioBuffer;
use crate::config::DiarizationConfig;
use anyhow::{bail, Result};
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

const FRAME_SIZE: usize = 400; // 25 ms at 16 kHz
const HOP_SIZE: usize = 160; // 10 ms at 16 kHz
const FFT_SIZE: usize = 512;
const MEL_FILTERS: usize = 26;
const MFCC_COEFFS: usize = 13;

/// Dimension of the spectral voice embedding: MFCC means + MFCC stds +
/// pitch and spectral-shape statistics. Voice profiles must match this.
pub const VOICE_EMBEDDING_DIM: usize = 2 * MFCC_COEFFS + 6;

/// One contiguous run of speech assigned to a single cluster.
#[derive(Debug, Clone)]
pub struct SpeakerTurn {
    pub start_s: f64,
    pub end_s: f64,
    pub cluster: usize,
    /// Top-2 cluster similarities were too close somewhere in this turn.
    pub is_overlap: bool,
}

/// A diarization cluster with its centroid voice embedding.
#[derive(Debug, Clone)]
pub struct SpeakerCluster {
    pub id: usize,
    pub centroid: Vec<f32>,
    pub total_speech_s: f64,
    pub window_count: usize,
}

/// Full diarization output for one audio artifact.
#[derive(Debug, Clone, Default)]
pub struct Diarization {
    pub turns: Vec<SpeakerTurn>,
    pub clusters: Vec<SpeakerCluster>,
}

impl Diarization {
    /// The cluster covering the given instant, if any.
    pub fn cluster_at(&self, t: f64) -> Option<&SpeakerTurn> {
        self.turns.iter().find(|turn| t >= turn.start_s && t < turn.end_s)
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Spectral feature extractor shared by the monologue probe, diarization,
/// and voice enrollment. Holds the FFT plan and mel filterbank.
pub struct VoiceEmbedder {
    fft: std::sync::Arc<dyn rustfft::Fft<f32>>,
    mel_bank: Vec<Vec<(usize, f32)>>,
    window: Vec<f32>,
    sample_rate: u32,
}

impl VoiceEmbedder {
    pub fn new(sample_rate: u32) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);
        let window = (0..FRAME_SIZE)
            .map(|i| {
                0.54 - 0.46 * (2.0 * std::f32::consts::PI * i as f32 / (FRAME_SIZE - 1) as f32).cos()
            })
            .collect();
        let mel_bank = build_mel_filterbank(sample_rate);
        Self { fft, mel_bank, window, sample_rate }
    }

    /// Compute an L2-normalized voice embedding for a span of samples.
    /// Returns an error when the span is too short to frame.
    pub fn embed(&self, samples: &[f32]) -> Result<Vec<f32>> {
        if samples.len() < FRAME_SIZE {
            bail!("audio span too short for a voice embedding: {} samples", samples.len());
        }

        let mut mfcc_frames: Vec<[f32; MFCC_COEFFS]> = Vec::new();
        let mut centroids = Vec::new();
        let mut rolloffs = Vec::new();
        let mut zcrs = Vec::new();
        let mut pitches = Vec::new();

        let mut spectrum = vec![Complex::new(0.0f32, 0.0f32); FFT_SIZE];
        for start in (0..=samples.len() - FRAME_SIZE).step_by(HOP_SIZE) {
            let frame = &samples[start..start + FRAME_SIZE];

            // Skip near-silent frames so pauses do not wash out the voice.
            let energy = frame.iter().map(|x| x * x).sum::<f32>() / FRAME_SIZE as f32;
            if energy < 1e-7 {
                continue;
            }

            for (i, slot) in spectrum.iter_mut().enumerate() {
                let sample = if i < FRAME_SIZE { frame[i] * self.window[i] } else { 0.0 };
                *slot = Complex::new(sample, 0.0);
            }
            self.fft.process(&mut spectrum);

            let power: Vec<f32> =
                spectrum[..FFT_SIZE / 2 + 1].iter().map(|c| c.norm_sqr() / FFT_SIZE as f32).collect();

            mfcc_frames.push(self.mfcc(&power));
            centroids.push(spectral_centroid(&power, self.sample_rate));
            rolloffs.push(spectral_rolloff(&power, self.sample_rate));
            zcrs.push(zero_crossing_rate(frame));
            if let Some(f0) = pitch_autocorrelation(frame, self.sample_rate) {
                pitches.push(f0);
            }
        }

        if mfcc_frames.is_empty() {
            bail!("no voiced frames in audio span");
        }

        let mut embedding = Vec::with_capacity(VOICE_EMBEDDING_DIM);
        for c in 0..MFCC_COEFFS {
            let values: Vec<f32> = mfcc_frames.iter().map(|f| f[c]).collect();
            embedding.push(mean(&values));
        }
        for c in 0..MFCC_COEFFS {
            let values: Vec<f32> = mfcc_frames.iter().map(|f| f[c]).collect();
            embedding.push(stddev(&values));
        }
        embedding.push(mean(&centroids) / 1000.0);
        embedding.push(stddev(&centroids) / 1000.0);
        embedding.push(mean(&rolloffs) / 1000.0);
        embedding.push(mean(&zcrs));
        if pitches.is_empty() {
            embedding.push(0.0);
            embedding.push(0.0);
        } else {
            embedding.push(mean(&pitches) / 100.0);
            embedding.push(stddev(&pitches) / 100.0);
        }

        debug_assert_eq!(embedding.len(), VOICE_EMBEDDING_DIM);
        l2_normalize(&mut embedding);
        Ok(embedding)
    }

    fn mfcc(&self, power: &[f32]) -> [f32; MFCC_COEFFS] {
        let mut log_mel = [0.0f32; MEL_FILTERS];
        for (m, filter) in self.mel_bank.iter().enumerate() {
            let energy: f32 = filter.iter().map(|&(bin, w)| power.get(bin).copied().unwrap_or(0.0) * w).sum();
            log_mel[m] = (energy + 1e-10).ln();
        }
        // DCT-II
        let mut coeffs = [0.0f32; MFCC_COEFFS];
        for (k, coeff) in coeffs.iter_mut().enumerate() {
            let mut acc = 0.0;
            for (m, &e) in log_mel.iter().enumerate() {
                acc += e
                    * (std::f32::consts::PI * k as f32 * (m as f32 + 0.5) / MEL_FILTERS as f32)
                        .cos();
            }
            *coeff = acc;
        }
        coeffs
    }
}

/// Energy + zero-crossing voice activity detection with an adaptive
/// threshold, smoothed over a short frame window.
pub fn detect_speech_regions(buffer: &AudioBuffer, config: &DiarizationConfig) -> Vec<(f64, f64)> {
    let samples = &buffer.samples;
    if samples.len() < FRAME_SIZE {
        return Vec::new();
    }

    let mut energies = Vec::new();
    for start in (0..=samples.len() - FRAME_SIZE).step_by(HOP_SIZE) {
        let frame = &samples[start..start + FRAME_SIZE];
        let rms = (frame.iter().map(|x| x * x).sum::<f32>() / FRAME_SIZE as f32).sqrt();
        energies.push(rms);
    }
    if energies.is_empty() {
        return Vec::new();
    }

    let mean_energy = mean(&energies);
    let std_energy = stddev(&energies);
    let threshold = mean_energy + config.vad_threshold * std_energy;

    let speech: Vec<bool> = energies.iter().map(|&e| e > threshold).collect();

    // Majority smoothing over +/-5 frames closes brief dips inside words.
    let smoothed: Vec<bool> = (0..speech.len())
        .map(|i| {
            let lo = i.saturating_sub(5);
            let hi = (i + 6).min(speech.len());
            let votes = speech[lo..hi].iter().filter(|&&s| s).count();
            votes * 2 > hi - lo
        })
        .collect();

    let hop_s = HOP_SIZE as f64 / buffer.sample_rate as f64;
    let mut regions = Vec::new();
    let mut region_start: Option<usize> = None;
    for (i, &is_speech) in smoothed.iter().enumerate() {
        match (is_speech, region_start) {
            (true, None) => region_start = Some(i),
            (false, Some(start)) => {
                regions.push((start as f64 * hop_s, i as f64 * hop_s));
                region_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = region_start {
        regions.push((start as f64 * hop_s, smoothed.len() as f64 * hop_s));
    }

    // Bridge pauses shorter than half the analysis window.
    let mut merged: Vec<(f64, f64)> = Vec::new();
    for (start, end) in regions {
        match merged.last_mut() {
            Some(last) if start - last.1 < config.window_s / 2.0 => last.1 = end,
            _ => merged.push((start, end)),
        }
    }
    merged.retain(|(start, end)| end - start >= config.min_turn_s / 2.0);
    merged
}

/// Run full diarization: VAD, windowed voice embeddings, greedy
/// agglomerative clustering, and turn assembly with overlap marks.
pub fn diarize(buffer: &AudioBuffer, config: &DiarizationConfig) -> Result<Diarization> {
    let embedder = VoiceEmbedder::new(buffer.sample_rate);
    let regions = detect_speech_regions(buffer, config);
    if regions.is_empty() {
        return Ok(Diarization::default());
    }

    // Cut speech regions into fixed analysis windows and embed each.
    struct Window {
        start_s: f64,
        end_s: f64,
        embedding: Vec<f32>,
    }
    let mut windows: Vec<Window> = Vec::new();
    for &(region_start, region_end) in &regions {
        let mut t = region_start;
        while t < region_end {
            let end = (t + config.window_s).min(region_end);
            if end - t >= config.window_s / 3.0 {
                let span = buffer.slice_seconds(t, end);
                if let Ok(embedding) = embedder.embed(span) {
                    windows.push(Window { start_s: t, end_s: end, embedding });
                }
            }
            t = end;
        }
    }
    if windows.is_empty() {
        return Ok(Diarization::default());
    }

    // Greedy agglomerative assignment: join the closest cluster above the
    // threshold, otherwise open a new one up to the speaker cap.
    let mut centroids: Vec<Vec<f32>> = Vec::new();
    let mut counts: Vec<usize> = Vec::new();
    let mut assignments: Vec<usize> = Vec::with_capacity(windows.len());
    let mut overlap_flags: Vec<bool> = Vec::with_capacity(windows.len());

    for window in &windows {
        let mut sims: Vec<(usize, f32)> = centroids
            .iter()
            .enumerate()
            .map(|(id, centroid)| (id, cosine_similarity(&window.embedding, centroid)))
            .collect();
        sims.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let best = sims.first().copied();
        let second = sims.get(1).map(|&(_, sim)| sim);

        let assigned = match best {
            Some((id, sim)) if sim > config.cluster_threshold || centroids.len() >= config.max_speakers => id,
            _ => {
                centroids.push(window.embedding.clone());
                counts.push(0);
                centroids.len() - 1
            }
        };

        // Running-mean centroid update, renormalized.
        counts[assigned] += 1;
        let n = counts[assigned] as f32;
        for (c, x) in centroids[assigned].iter_mut().zip(&window.embedding) {
            *c += (x - *c) / n;
        }
        l2_normalize(&mut centroids[assigned]);

        let ambiguous = matches!((best, second), (Some((_, top)), Some(next))
            if (top - next) < config.overlap_margin);
        assignments.push(assigned);
        overlap_flags.push(ambiguous);
    }

    // Assemble turns from contiguous same-cluster windows.
    let mut turns: Vec<SpeakerTurn> = Vec::new();
    for (i, window) in windows.iter().enumerate() {
        let cluster = assignments[i];
        match turns.last_mut() {
            Some(turn) if turn.cluster == cluster && window.start_s - turn.end_s < config.window_s => {
                turn.end_s = window.end_s;
                turn.is_overlap |= overlap_flags[i];
            }
            _ => turns.push(SpeakerTurn {
                start_s: window.start_s,
                end_s: window.end_s,
                cluster,
                is_overlap: overlap_flags[i],
            }),
        }
    }
    turns.retain(|turn| turn.end_s - turn.start_s >= config.min_turn_s);

    let mut clusters: Vec<SpeakerCluster> = centroids
        .into_iter()
        .enumerate()
        .map(|(id, centroid)| SpeakerCluster { id, centroid, total_speech_s: 0.0, window_count: counts[id] })
        .collect();
    for turn in &turns {
        clusters[turn.cluster].total_speech_s += turn.end_s - turn.start_s;
    }
    clusters.retain(|c| c.window_count > 0);

    Ok(Diarization { turns, clusters })
}

fn build_mel_filterbank(sample_rate: u32) -> Vec<Vec<(usize, f32)>> {
    let mel = |hz: f32| 2595.0 * (1.0 + hz / 700.0).log10();
    let inv_mel = |m: f32| 700.0 * (10.0f32.powf(m / 2595.0) - 1.0);

    let low_mel = mel(0.0);
    let high_mel = mel(sample_rate as f32 / 2.0);
    let points: Vec<f32> = (0..MEL_FILTERS + 2)
        .map(|i| {
            let m = low_mel + (high_mel - low_mel) * i as f32 / (MEL_FILTERS + 1) as f32;
            inv_mel(m)
        })
        .collect();

    let hz_per_bin = sample_rate as f32 / FFT_SIZE as f32;
    let to_bin = |hz: f32| ((hz / hz_per_bin).round() as usize).min(FFT_SIZE / 2);

    (0..MEL_FILTERS)
        .map(|m| {
            let (left, center, right) = (to_bin(points[m]), to_bin(points[m + 1]), to_bin(points[m + 2]));
            let mut filter = Vec::new();
            for bin in left..=right {
                let weight = if bin <= center {
                    if center == left { 1.0 } else { (bin - left) as f32 / (center - left) as f32 }
                } else if right == center {
                    1.0
                } else {
                    (right - bin) as f32 / (right - center) as f32
                };
                if weight > 0.0 {
                    filter.push((bin, weight));
                }
            }
            filter
        })
        .collect()
}

fn spectral_centroid(power: &[f32], sample_rate: u32) -> f32 {
    let hz_per_bin = sample_rate as f32 / FFT_SIZE as f32;
    let total: f32 = power.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }
    power.iter().enumerate().map(|(i, &p)| i as f32 * hz_per_bin * p).sum::<f32>() / total
}

fn spectral_rolloff(power: &[f32], sample_rate: u32) -> f32 {
    let hz_per_bin = sample_rate as f32 / FFT_SIZE as f32;
    let total: f32 = power.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }
    let mut acc = 0.0;
    for (i, &p) in power.iter().enumerate() {
        acc += p;
        if acc >= 0.85 * total {
            return i as f32 * hz_per_bin;
        }
    }
    (power.len() - 1) as f32 * hz_per_bin
}

fn zero_crossing_rate(frame: &[f32]) -> f32 {
    if frame.len() < 2 {
        return 0.0;
    }
    let crossings = frame.windows(2).filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0)).count();
    crossings as f32 / (frame.len() - 1) as f32
}

/// Fundamental frequency by autocorrelation peak in the 60-400 Hz band.
/// Returns None for unvoiced frames.
fn pitch_autocorrelation(frame: &[f32], sample_rate: u32) -> Option<f32> {
    let min_lag = (sample_rate / 400) as usize;
    let max_lag = (sample_rate / 60) as usize;
    if frame.len() <= max_lag {
        return None;
    }

    let energy: f32 = frame.iter().map(|x| x * x).sum();
    if energy <= 1e-6 {
        return None;
    }

    let mut best_lag = 0;
    let mut best_corr = 0.0f32;
    for lag in min_lag..=max_lag {
        let corr: f32 = frame[..frame.len() - lag]
            .iter()
            .zip(&frame[lag..])
            .map(|(a, b)| a * b)
            .sum();
        if corr > best_corr {
            best_corr = corr;
            best_lag = lag;
        }
    }

    // Voicing gate: the peak must carry a meaningful share of the energy.
    if best_lag == 0 || best_corr / energy < 0.3 {
        return None;
    }
    Some(sample_rate as f32 / best_lag as f32)
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

fn stddev(values: &[f32]) -> f32 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f32>() / values.len() as f32).sqrt()
}
