/*
 * Channel Ingest CLI - Whisper Subprocess Backend
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

use crate::error::IngestError;
use crate::model_pool::AsrSpec;
use crate::types::{RawSegment, SpeakerLabel, WordTiming};
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Transcriber CLIs probed in preference order. All of them accept the
/// faster-whisper argument surface and write OpenAI-schema JSON.
const CANDIDATE_COMMANDS: &[&str] = &["whisper-ctranslate2", "faster-whisper", "whisper"];

/// Runs a whisper-family CLI against a WAV file and parses its JSON
/// output. The ASR parameters come from a model-pool lease; this type
/// never chooses them itself.
#[derive(Debug, Clone)]
pub struct WhisperRunner {
    command: String,
    word_timestamps: bool,
}

#[derive(Debug, Deserialize)]
struct WhisperOutput {
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    start: f64,
    end: f64,
    text: String,
    #[serde(default)]
    avg_logprob: Option<f32>,
    #[serde(default)]
    compression_ratio: Option<f32>,
    #[serde(default)]
    no_speech_prob: Option<f32>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    words: Vec<WhisperWord>,
}

#[derive(Debug, Deserialize)]
struct WhisperWord {
    start: f64,
    end: f64,
    word: String,
}

impl WhisperRunner {
    pub fn new(command: String, word_timestamps: bool) -> Self {
        Self { command, word_timestamps }
    }

    /// Probe for a usable transcriber CLI, preferring an explicitly
    /// configured command. Mirrors the startup environment checks.
    pub async fn detect(explicit: Option<String>, word_timestamps: bool) -> Option<Self> {
        if let Some(command) = explicit {
            return Some(Self::new(command, word_timestamps));
        }
        for candidate in CANDIDATE_COMMANDS {
            if command_exists(candidate).await {
                tracing::info!("Found transcriber backend: {candidate}");
                return Some(Self::new(candidate.to_string(), word_timestamps));
            }
        }
        None
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Transcribe one WAV with the given model parameters. OOM-looking
    /// failures are tagged for the degradation ladder; empty or
    /// unparseable output is a terminal model error.
    pub async fn transcribe(
        &self,
        wav_path: &Path,
        spec: &AsrSpec,
        out_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawSegment>, IngestError> {
        let mut command = Command::new(&self.command);
        command
            .arg(wav_path)
            .arg("--model")
            .arg(&spec.model_identifier)
            .arg("--compute_type")
            .arg(&spec.compute_precision)
            .arg("--beam_size")
            .arg(spec.beam_size.to_string())
            .arg("--chunk_length")
            .arg(spec.chunk_length_s.to_string())
            .arg("--language")
            .arg("en")
            .arg("--output_format")
            .arg("json")
            .arg("--output_dir")
            .arg(out_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if self.word_timestamps {
            command.arg("--word_timestamps").arg("True");
        }

        let child = command
            .spawn()
            .map_err(|e| IngestError::Environment(format!("{} is not runnable: {e}", self.command)))?;

        let output = tokio::select! {
            output = child.wait_with_output() => output
                .map_err(|e| IngestError::model(format!("transcriber failed to run: {e}"), false))?,
            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = stderr.lines().rev().take(4).collect::<Vec<_>>().join(" | ");
            let oom = looks_like_oom(&stderr);
            return Err(IngestError::model(
                format!("transcriber exited {}: {tail}", output.status),
                oom,
            ));
        }

        let json_path = out_dir.join(
            wav_path
                .file_stem()
                .map(|stem| format!("{}.json", stem.to_string_lossy()))
                .unwrap_or_else(|| "audio.json".to_string()),
        );
        let raw = std::fs::read_to_string(&json_path).map_err(|e| {
            IngestError::model(format!("transcriber produced no JSON output: {e}"), false)
        })?;

        parse_whisper_json(&raw)
    }
}

/// Parse the OpenAI-schema JSON a whisper CLI writes. Empty or negative
/// spans and empty texts are dropped; output is sorted by start time.
pub fn parse_whisper_json(raw: &str) -> Result<Vec<RawSegment>, IngestError> {
    let output: WhisperOutput = serde_json::from_str(raw)
        .map_err(|e| IngestError::model(format!("invalid transcriber JSON: {e}"), false))?;

    let mut segments: Vec<RawSegment> = output
        .segments
        .into_iter()
        .filter_map(|seg| {
            let text = seg.text.trim().to_string();
            if text.is_empty() || seg.end <= seg.start || seg.start < 0.0 {
                return None;
            }
            Some(RawSegment {
                start_s: seg.start,
                end_s: seg.end,
                text,
                speaker_label: SpeakerLabel::Unknown,
                speaker_confidence: None,
                avg_logprob: seg.avg_logprob,
                compression_ratio: seg.compression_ratio,
                no_speech_prob: seg.no_speech_prob,
                temperature_used: seg.temperature,
                is_overlap: false,
                needs_refinement: false,
                words: seg
                    .words
                    .into_iter()
                    .filter(|w| w.end > w.start)
                    .map(|w| WordTiming {
                        start_s: w.start,
                        end_s: w.end,
                        word: w.word.trim().to_string(),
                    })
                    .collect(),
            })
        })
        .collect();

    if segments.is_empty() {
        return Err(IngestError::model("transcriber produced zero usable segments", false));
    }

    segments.sort_by(|a, b| a.start_s.partial_cmp(&b.start_s).unwrap_or(std::cmp::Ordering::Equal));
    Ok(segments)
}

fn looks_like_oom(stderr: &str) -> bool {
    const NEEDLES: &[&str] = &[
        "out of memory",
        "CUDA out of memory",
        "cudaErrorMemoryAllocation",
        "CUBLAS_STATUS_ALLOC_FAILED",
        "CUDA failed with error out of memory",
        "MemoryError",
    ];
    NEEDLES.iter().any(|needle| stderr.contains(needle))
}

async fn command_exists(command: &str) -> bool {
    Command::new(command)
        .arg("--help")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .stdin(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_JSON: &str = r#"{
        "text": "hello world how are you",
        "segments": [
            {"id": 0, "seek": 0, "start": 0.0, "end": 2.4, "text": " Hello world.",
             "avg_logprob": -0.21, "compression_ratio": 1.3, "no_speech_prob": 0.02,
             "temperature": 0.0,
             "words": [{"start": 0.0, "end": 1.1, "word": " Hello"},
                       {"start": 1.1, "end": 2.4, "word": " world."}]},
            {"id": 1, "seek": 0, "start": 2.4, "end": 4.0, "text": " How are you?",
             "avg_logprob": -0.35, "compression_ratio": 1.1, "no_speech_prob": 0.01,
             "temperature": 0.2},
            {"id": 2, "seek": 0, "start": 4.0, "end": 4.0, "text": " "}
        ]
    }"#;

    #[test]
    fn parses_segments_and_drops_empty_ones() {
        let segments = parse_whisper_json(SAMPLE_JSON).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].text, "Hello world.");
        assert_eq!(segments[0].words.len(), 2);
        assert_eq!(segments[0].speaker_label, SpeakerLabel::Unknown);
        assert_eq!(segments[1].temperature_used, Some(0.2));
        assert!(segments[1].words.is_empty());
    }

    #[test]
    fn zero_usable_segments_is_a_model_error() {
        let result = parse_whisper_json(r#"{"segments": []}"#);
        assert!(matches!(result, Err(IngestError::Model { oom: false, .. })));
    }

    #[test]
    fn malformed_json_is_a_model_error() {
        assert!(parse_whisper_json("not json").is_err());
    }

    #[test]
    fn oom_detection_matches_cuda_failures() {
        assert!(looks_like_oom("RuntimeError: CUDA out of memory. Tried to allocate 2.00 GiB"));
        assert!(looks_like_oom("CUDA failed with error out of memory"));
        assert!(!looks_like_oom("FileNotFoundError: model not found"));
    }

    #[test]
    fn output_is_sorted_by_start_time() {
        let raw = r#"{"segments": [
            {"start": 5.0, "end": 6.0, "text": "second"},
            {"start": 1.0, "end": 2.0, "text": "first"}
        ]}"#;
        let segments = parse_whisper_json(raw).unwrap();
        assert_eq!(segments[0].text, "first");
        assert_eq!(segments[1].text, "second");
    }
}
