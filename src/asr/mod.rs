/*
 * Channel Ingest CLI - ASR + Speaker Attribution Engine
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

pub mod alignment;
pub mod attribution;
pub mod captions;
pub mod whisper;

use crate::audio::{load_wav, AudioBuffer};
use crate::config::{Config, DiarizationConfig, SpeakerConfig};
use crate::diarize::{cosine_similarity, diarize};
use crate::error::IngestError;
use crate::model_pool::ModelPool;
use crate::types::{AudioArtifact, RawSegment, SourceType, SpeakerLabel, TranscriptMethod};
use crate::voices::VoiceProfileStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use whisper::WhisperRunner;

/// Per-task progression through the transcription stage. Logged on every
/// transition for postmortems; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskPhase {
    LoadedAudio,
    Probed,
    FastPathTranscribed,
    FullTranscribed,
    Diarized,
    Attributed,
    Aligned,
    RawSegmentsReady,
}

/// Result of transcribing one artifact, with the provenance the Source
/// row records.
#[derive(Debug, Clone)]
pub struct TranscriptionOutcome {
    pub segments: Vec<RawSegment>,
    pub method: TranscriptMethod,
    pub model_identifier: String,
}

/// Drives ASR, the monologue probe, diarization, attribution, and
/// alignment for one audio artifact at a time. Model parameters always
/// come from a pool lease.
pub struct TranscribeEngine {
    speaker: SpeakerConfig,
    diarization: DiarizationConfig,
    source_type: SourceType,
    runner: WhisperRunner,
    soft_timeout: std::time::Duration,
}

impl TranscribeEngine {
    pub fn new(config: &Config, runner: WhisperRunner) -> Self {
        Self {
            speaker: config.speaker.clone(),
            diarization: config.diarization.clone(),
            source_type: config.source_type,
            runner,
            soft_timeout: std::time::Duration::from_secs(config.task_timeout_s),
        }
    }

    /// Transcribe one artifact into labelled raw segments.
    pub async fn transcribe(
        &self,
        video_id: &str,
        artifact: &AudioArtifact,
        profiles: &VoiceProfileStore,
        pool: &Arc<ModelPool>,
        cancel: &CancellationToken,
    ) -> Result<TranscriptionOutcome, IngestError> {
        // External caption bypass: only reachable when speaker ID is off
        // (enforced at config validation), and only when a track exists.
        if self.speaker.allow_external_captions {
            if let Some(captions_path) = &artifact.captions_path {
                tracing::info!("{video_id}: using external captions, skipping ASR");
                let segments = captions::parse_vtt_file(captions_path)?;
                return Ok(TranscriptionOutcome {
                    segments,
                    method: TranscriptMethod::Captions,
                    model_identifier: "external-captions".to_string(),
                });
            }
        }

        let wav_path = artifact.wav_path.clone();
        let buffer = tokio::task::spawn_blocking(move || load_wav(&wav_path))
            .await
            .map_err(|e| IngestError::model(format!("audio load task panicked: {e}"), false))?
            .map_err(|e| IngestError::model(format!("unreadable audio artifact: {e}"), false))?;
        let mut phase = TaskPhase::LoadedAudio;
        self.advance(video_id, &mut phase, TaskPhase::LoadedAudio);

        // Monologue probe: a leading window that already sounds like the
        // host lets us skip diarization entirely.
        let probe_similarity = self.monologue_probe(&buffer, profiles, pool);
        self.advance(video_id, &mut phase, TaskPhase::Probed);
        let fast_path = match probe_similarity {
            Some(sim) if sim > self.speaker.host_min_sim + self.speaker.monologue_bonus => {
                tracing::info!("{video_id}: monologue probe matched host (sim {sim:.3}), fast path");
                true
            }
            Some(sim) => {
                tracing::debug!("{video_id}: monologue probe sim {sim:.3}, full path");
                false
            }
            None => false,
        };

        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        let (mut segments, model_identifier) =
            self.run_asr_with_degradation(artifact, pool, cancel).await?;

        if fast_path {
            self.advance(video_id, &mut phase, TaskPhase::FastPathTranscribed);
            let confidence = probe_similarity;
            for segment in &mut segments {
                segment.speaker_label = SpeakerLabel::Host;
                segment.speaker_confidence = confidence;
                segment.start_s = segment.start_s.clamp(0.0, artifact.duration_s);
                segment.end_s = segment.end_s.clamp(0.0, artifact.duration_s);
            }
            segments.retain(|s| s.end_s > s.start_s);
            self.advance(video_id, &mut phase, TaskPhase::RawSegmentsReady);
            return Ok(TranscriptionOutcome {
                segments,
                method: TranscriptMethod::FastPath,
                model_identifier,
            });
        }
        self.advance(video_id, &mut phase, TaskPhase::FullTranscribed);

        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        let segments = if self.speaker.enable_speaker_id && profiles.host.is_some() {
            let diar_config = self.diarization.clone();
            let diar_result =
                tokio::task::spawn_blocking(move || diarize(&buffer, &diar_config)).await;

            match diar_result {
                Ok(Ok(diar)) => {
                    self.advance(video_id, &mut phase, TaskPhase::Diarized);
                    let attributions =
                        attribution::label_clusters(&diar.clusters, profiles, &self.speaker);
                    self.advance(video_id, &mut phase, TaskPhase::Attributed);
                    let aligned = alignment::align_segments(
                        segments,
                        &diar,
                        &attributions,
                        &self.speaker,
                        artifact.duration_s,
                    );
                    self.advance(video_id, &mut phase, TaskPhase::Aligned);
                    aligned
                }
                // Diarization failure never defaults to HOST: everything
                // falls back to UNKNOWN and is flagged for refinement.
                Ok(Err(e)) => {
                    tracing::warn!("{video_id}: diarization failed, labelling all UNKNOWN: {e}");
                    all_unknown(segments)
                }
                Err(e) => {
                    tracing::warn!("{video_id}: diarization task panicked, labelling all UNKNOWN: {e}");
                    all_unknown(segments)
                }
            }
        } else {
            // Speaker ID disabled: labels stay UNKNOWN, timings clamped.
            for segment in &mut segments {
                segment.start_s = segment.start_s.clamp(0.0, artifact.duration_s);
                segment.end_s = segment.end_s.clamp(0.0, artifact.duration_s);
            }
            segments.retain(|s| s.end_s > s.start_s);
            segments
        };

        self.advance(video_id, &mut phase, TaskPhase::RawSegmentsReady);
        Ok(TranscriptionOutcome { segments, method: TranscriptMethod::FullAsr, model_identifier })
    }

    /// Run the transcriber, walking the degradation ladder on OOM until it
    /// succeeds or the ladder is exhausted.
    async fn run_asr_with_degradation(
        &self,
        artifact: &AudioArtifact,
        pool: &Arc<ModelPool>,
        cancel: &CancellationToken,
    ) -> Result<(Vec<RawSegment>, String), IngestError> {
        let out_dir = artifact
            .wav_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::path::PathBuf::from("."));

        loop {
            let lease = pool.acquire_asr(cancel).await?;
            let spec = lease.spec.clone();
            // The soft timeout walks the ladder instead of failing: a
            // smaller model or chunk usually gets a stuck file through.
            let attempt = tokio::time::timeout(
                self.soft_timeout,
                self.runner.transcribe(&artifact.wav_path, &spec, &out_dir, cancel),
            )
            .await
            .unwrap_or_else(|_| {
                Err(IngestError::model(
                    format!("transcription exceeded soft timeout of {}s", self.soft_timeout.as_secs()),
                    true,
                ))
            });

            match attempt {
                Ok(segments) => {
                    return Ok((segments, format!("{}/{}", spec.model_identifier, spec.compute_precision)))
                }
                Err(IngestError::Model { message, oom: true }) => {
                    drop(lease);
                    pool.degrade_asr(&message)?;
                    if cancel.is_cancelled() {
                        return Err(IngestError::Cancelled);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn monologue_probe(
        &self,
        buffer: &AudioBuffer,
        profiles: &VoiceProfileStore,
        pool: &Arc<ModelPool>,
    ) -> Option<f32> {
        if !self.speaker.enable_speaker_id || self.speaker.force_full_asr {
            return None;
        }
        // The fast path is scoped to the canonical host channel; local
        // files always take the full path.
        if self.source_type != SourceType::Youtube {
            return None;
        }
        let host = profiles.host.as_ref()?;
        let window = buffer.leading_window(self.speaker.monologue_probe_window_s);
        match pool.voice_embedder().embed(window) {
            Ok(embedding) => Some(cosine_similarity(&embedding, &host.centroid)),
            Err(e) => {
                tracing::debug!("monologue probe skipped: {e}");
                None
            }
        }
    }

    fn advance(&self, video_id: &str, phase: &mut TaskPhase, next: TaskPhase) {
        if *phase != next {
            tracing::debug!("{video_id}: {:?} -> {next:?}", *phase);
        }
        *phase = next;
    }
}

fn all_unknown(mut segments: Vec<RawSegment>) -> Vec<RawSegment> {
    for segment in &mut segments {
        segment.speaker_label = SpeakerLabel::Unknown;
        segment.speaker_confidence = None;
        segment.needs_refinement = true;
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_unknown_clears_confidence_and_flags() {
        let segments = vec![RawSegment {
            start_s: 0.0,
            end_s: 2.0,
            text: "hello".into(),
            speaker_label: SpeakerLabel::Host,
            speaker_confidence: Some(0.9),
            avg_logprob: None,
            compression_ratio: None,
            no_speech_prob: None,
            temperature_used: None,
            is_overlap: false,
            needs_refinement: false,
            words: Vec::new(),
        }];
        let out = all_unknown(segments);
        assert_eq!(out[0].speaker_label, SpeakerLabel::Unknown);
        assert!(out[0].speaker_confidence.is_none());
        assert!(out[0].needs_refinement);
    }
}
