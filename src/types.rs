/*
 * Channel Ingest CLI - Core Types
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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Where a video came from. Controls listing, acquisition, and the
/// monologue fast path (YouTube is the canonical host channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Youtube,
    Local,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceType::Youtube => write!(f, "youtube"),
            SourceType::Local => write!(f, "local"),
        }
    }
}

impl std::str::FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "youtube" | "yt" => Ok(SourceType::Youtube),
            "local" => Ok(SourceType::Local),
            other => Err(format!("unrecognized source type: {other}")),
        }
    }
}

/// Immutable reference to a single video, as produced by a listing adapter.
/// `video_id` is opaque and globally unique within its source type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoReference {
    pub video_id: String,
    pub title: Option<String>,
    pub duration_seconds: Option<u64>,
    pub published_at: Option<DateTime<Utc>>,
    pub channel_name: Option<String>,
    pub channel_url: Option<String>,
    pub tags: Vec<String>,
    pub thumbnail_url: Option<String>,
    pub view_count: Option<i64>,
    pub like_count: Option<i64>,
    pub comment_count: Option<i64>,
    pub description: Option<String>,
    pub canonical_url: Option<String>,
    /// Flagged by the listing adapter when the entry is known to be
    /// unplayable (private, removed, members-only). Prefilter rejects these.
    pub accessible: bool,
}

impl VideoReference {
    pub fn new(video_id: impl Into<String>) -> Self {
        Self {
            video_id: video_id.into(),
            title: None,
            duration_seconds: None,
            published_at: None,
            channel_name: None,
            channel_url: None,
            tags: Vec::new(),
            thumbnail_url: None,
            view_count: None,
            like_count: None,
            comment_count: None,
            description: None,
            canonical_url: None,
            accessible: true,
        }
    }
}

/// Speaker label attached to every segment. `Unknown` is always a safe
/// outcome; `Host` requires full positive evidence from attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpeakerLabel {
    Host,
    Guest,
    Unknown,
}

impl SpeakerLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpeakerLabel::Host => "HOST",
            SpeakerLabel::Guest => "GUEST",
            SpeakerLabel::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for SpeakerLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SpeakerLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HOST" => Ok(SpeakerLabel::Host),
            "GUEST" => Ok(SpeakerLabel::Guest),
            "UNKNOWN" => Ok(SpeakerLabel::Unknown),
            other => Err(format!("unrecognized speaker label: {other}")),
        }
    }
}

/// Word-level timing from the ASR backend, when available. Used for exact
/// text redistribution when a segment is split at a speaker boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordTiming {
    pub start_s: f64,
    pub end_s: f64,
    pub word: String,
}

/// A timed transcript segment as emitted by ASR + attribution. Transient;
/// lives only inside a single task, never persisted directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSegment {
    pub start_s: f64,
    pub end_s: f64,
    pub text: String,
    pub speaker_label: SpeakerLabel,
    pub speaker_confidence: Option<f32>,
    pub avg_logprob: Option<f32>,
    pub compression_ratio: Option<f32>,
    pub no_speech_prob: Option<f32>,
    pub temperature_used: Option<f32>,
    pub is_overlap: bool,
    pub needs_refinement: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub words: Vec<WordTiming>,
}

impl RawSegment {
    pub fn duration_s(&self) -> f64 {
        (self.end_s - self.start_s).max(0.0)
    }
}

/// A retrieval-sized, speaker-homogeneous, deduplicated transcript unit.
/// `embedding` is attached by the embedder before commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizedSegment {
    pub start_s: f64,
    pub end_s: f64,
    pub text: String,
    pub speaker_label: SpeakerLabel,
    pub speaker_confidence: Option<f32>,
    pub avg_logprob: Option<f32>,
    pub compression_ratio: Option<f32>,
    pub no_speech_prob: Option<f32>,
    pub is_overlap: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl OptimizedSegment {
    pub fn duration_s(&self) -> f64 {
        (self.end_s - self.start_s).max(0.0)
    }
}

impl From<&RawSegment> for OptimizedSegment {
    fn from(raw: &RawSegment) -> Self {
        Self {
            start_s: raw.start_s,
            end_s: raw.end_s,
            text: raw.text.trim().to_string(),
            speaker_label: raw.speaker_label,
            speaker_confidence: raw.speaker_confidence,
            avg_logprob: raw.avg_logprob,
            compression_ratio: raw.compression_ratio,
            no_speech_prob: raw.no_speech_prob,
            is_overlap: raw.is_overlap,
            embedding: None,
        }
    }
}

/// How the transcript for a video was produced. Persisted as provenance on
/// the Source row so re-ingestion decisions can see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptMethod {
    /// Monologue probe matched the host; diarization skipped.
    FastPath,
    /// Full ASR + diarization + attribution.
    FullAsr,
    /// Pre-existing captions parsed instead of running ASR.
    Captions,
}

impl fmt::Display for TranscriptMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranscriptMethod::FastPath => write!(f, "fast_path"),
            TranscriptMethod::FullAsr => write!(f, "full_asr"),
            TranscriptMethod::Captions => write!(f, "captions"),
        }
    }
}

/// Ingestion provenance stored in `sources.metadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provenance {
    pub transcript_method: TranscriptMethod,
    pub model_identifier: String,
    pub profile_version: String,
}

/// A local, normalized audio artifact ready for ASR: mono PCM WAV at the
/// pipeline sample rate, plus the measured duration.
#[derive(Debug, Clone)]
pub struct AudioArtifact {
    pub wav_path: PathBuf,
    pub duration_s: f64,
    /// Manual caption track fetched alongside the audio, when external
    /// captions are allowed and the video has one.
    pub captions_path: Option<PathBuf>,
}

/// Failure classification used for exit accounting. Kinds, not identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Acquisition,
    Model,
    Optimizer,
    Commit,
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Acquisition => write!(f, "acquisition"),
            FailureKind::Model => write!(f, "model"),
            FailureKind::Optimizer => write!(f, "optimizer"),
            FailureKind::Commit => write!(f, "commit"),
            FailureKind::Internal => write!(f, "internal"),
        }
    }
}

/// End-of-run accounting returned by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct IngestionSummary {
    pub attempted: usize,
    pub persisted: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub segments_committed: usize,
    pub duplicates_removed: usize,
    pub failures_by_kind: HashMap<FailureKind, usize>,
    /// Up to three representative redacted error summaries per kind.
    pub representative_errors: HashMap<FailureKind, Vec<String>>,
    pub wall_time_s: f64,
    pub media_seconds_processed: f64,
    pub was_cancelled: bool,
}

impl IngestionSummary {
    /// Rolling real-time factor for the whole run: wall clock over media
    /// duration. Zero media processed reports 0.0.
    pub fn real_time_factor(&self) -> f64 {
        if self.media_seconds_processed > 0.0 {
            self.wall_time_s / self.media_seconds_processed
        } else {
            0.0
        }
    }

    pub fn record_failure(&mut self, kind: FailureKind, summary: &str) {
        self.failed += 1;
        *self.failures_by_kind.entry(kind).or_insert(0) += 1;
        let examples = self.representative_errors.entry(kind).or_default();
        if examples.len() < 3 {
            examples.push(summary.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speaker_label_round_trips_through_str() {
        for label in [SpeakerLabel::Host, SpeakerLabel::Guest, SpeakerLabel::Unknown] {
            assert_eq!(label.as_str().parse::<SpeakerLabel>().unwrap(), label);
        }
        assert!("SPEAKER_00".parse::<SpeakerLabel>().is_err());
    }

    #[test]
    fn summary_keeps_three_representative_errors() {
        let mut summary = IngestionSummary::default();
        for i in 0..5 {
            summary.record_failure(FailureKind::Acquisition, &format!("error {i}"));
        }
        assert_eq!(summary.failed, 5);
        assert_eq!(summary.failures_by_kind[&FailureKind::Acquisition], 5);
        assert_eq!(summary.representative_errors[&FailureKind::Acquisition].len(), 3);
    }

    #[test]
    fn real_time_factor_handles_zero_media() {
        let summary = IngestionSummary::default();
        assert_eq!(summary.real_time_factor(), 0.0);
    }
}
