/*
 * Channel Ingest CLI - Voice Enrollment Tool
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
use clap::Parser;
use std::path::PathBuf;

use channel_ingest_rs::audio::load_wav;
use channel_ingest_rs::diarize::{l2_normalize, VoiceEmbedder};
use channel_ingest_rs::voices::{save_profile, VoiceProfile};

/// Enroll a speaker voice profile from clean WAV samples.
///
/// Samples should be mono 16 kHz, each containing only the target speaker
/// (30-120 seconds total works well). The profile named "host" is the one
/// the ingestion pipeline requires when speaker identification is on.
#[derive(Parser)]
#[command(name = "enroll-voice")]
#[command(version = "0.1.0")]
struct Cli {
    /// Profile name ("host" for the channel host)
    #[arg(long)]
    name: String,

    /// Directory the profile JSON is written to
    #[arg(long, default_value = "voices")]
    voices_dir: PathBuf,

    /// Optional per-speaker similarity floor override
    #[arg(long)]
    threshold_hint: Option<f32>,

    /// WAV samples of the speaker
    #[arg(required = true)]
    samples: Vec<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut embeddings = Vec::new();
    let mut embedder: Option<VoiceEmbedder> = None;

    for sample in &cli.samples {
        let buffer = load_wav(sample)?;
        let embedder = embedder.get_or_insert_with(|| VoiceEmbedder::new(buffer.sample_rate));
        let embedding = embedder
            .embed(&buffer.samples)
            .with_context(|| format!("could not embed {}", sample.display()))?;
        println!("  embedded {} ({:.1}s)", sample.display(), buffer.duration_s());
        embeddings.push(embedding);
    }

    let dim = embeddings[0].len();
    let mut centroid = vec![0.0f32; dim];
    for embedding in &embeddings {
        for (c, x) in centroid.iter_mut().zip(embedding) {
            *c += x;
        }
    }
    for c in centroid.iter_mut() {
        *c /= embeddings.len() as f32;
    }
    l2_normalize(&mut centroid);

    let profile = VoiceProfile {
        name: cli.name.clone(),
        centroid,
        sample_count: embeddings.len(),
        threshold_hint: cli.threshold_hint,
        created_at: Some(chrono::Utc::now()),
    };
    let path = save_profile(&cli.voices_dir, &profile)?;
    println!("enrolled '{}' from {} samples -> {}", cli.name, embeddings.len(), path.display());
    Ok(())
}
