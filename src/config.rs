/*
 * Channel Ingest CLI - Configuration
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
use crate::types::SourceType;
use anyhow::Result;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Immutable run configuration. Read once at startup from the environment
/// (`INGEST_*` keys, `.env` supported), overridden by CLI flags, validated,
/// then passed by value into every component. Nothing reads the environment
/// after startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub source_type: SourceType,
    pub database_url: String,
    pub temp_root: PathBuf,
    pub voices_dir: PathBuf,
    pub speaker: SpeakerConfig,
    pub segments: SegmentConfig,
    pub asr: AsrConfig,
    pub diarization: DiarizationConfig,
    pub embedding: EmbeddingConfig,
    pub runtime: RuntimeConfig,
    pub filters: FilterConfig,
    pub fail_fast: bool,
    pub io_retries: u32,
    pub task_timeout_s: u64,
}

/// Speaker identification and attribution thresholds. Similarities are
/// cosine over L2-normalized embeddings, compared with strict inequality.
#[derive(Debug, Clone)]
pub struct SpeakerConfig {
    pub enable_speaker_id: bool,
    pub allow_external_captions: bool,
    pub force_full_asr: bool,
    pub host_profile_name: String,
    pub host_min_sim: f32,
    pub guest_min_sim: f32,
    pub attr_margin: f32,
    pub overlap_bonus: f32,
    pub monologue_bonus: f32,
    pub min_attribution_duration_s: f64,
    pub monologue_probe_window_s: f64,
    /// Rewrite unlabeled segments to HOST on a host-dominant channel.
    /// Logged every time it fires.
    pub default_unlabeled_to_host: bool,
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        Self {
            enable_speaker_id: true,
            allow_external_captions: false,
            force_full_asr: false,
            host_profile_name: "host".to_string(),
            host_min_sim: 0.82,
            guest_min_sim: 0.80,
            attr_margin: 0.05,
            overlap_bonus: 0.05,
            monologue_bonus: 0.08,
            min_attribution_duration_s: 1.0,
            monologue_probe_window_s: 15.0,
            default_unlabeled_to_host: false,
        }
    }
}

/// Segment optimizer knobs. Lengths in characters, gaps and durations in
/// seconds.
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    pub min_chars: usize,
    pub max_chars: usize,
    pub hard_cap_chars: usize,
    pub overlap_chars: usize,
    pub max_gap_s: f64,
    pub max_duration_s: f64,
    pub min_coalesce_chars: usize,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            min_chars: 300,
            max_chars: 1100,
            hard_cap_chars: 1400,
            overlap_chars: 120,
            max_gap_s: 2.0,
            max_duration_s: 90.0,
            min_coalesce_chars: 40,
        }
    }
}

/// ASR backend configuration. The model pool owns the live values; these
/// are the starting rungs of the degradation ladder.
#[derive(Debug, Clone)]
pub struct AsrConfig {
    pub model_identifier: String,
    pub compute_precision: String,
    pub chunk_length_s: u32,
    pub beam_size: u32,
    /// Explicit transcriber command. Autodetected when unset.
    pub command: Option<String>,
    pub word_timestamps: bool,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            model_identifier: "large-v3".to_string(),
            compute_precision: "float16".to_string(),
            chunk_length_s: 30,
            beam_size: 5,
            command: None,
            word_timestamps: true,
        }
    }
}

/// Diarization backend knobs (voice activity + clustering).
#[derive(Debug, Clone)]
pub struct DiarizationConfig {
    pub vad_threshold: f32,
    pub window_s: f64,
    pub cluster_threshold: f32,
    pub max_speakers: usize,
    pub min_turn_s: f64,
    /// Margin between top-2 cluster similarities below which a window is
    /// marked as an overlap region.
    pub overlap_margin: f32,
}

impl Default for DiarizationConfig {
    fn default() -> Self {
        Self {
            vad_threshold: 0.4,
            window_s: 1.5,
            cluster_threshold: 0.72,
            max_speakers: 6,
            min_turn_s: 0.6,
            overlap_margin: 0.06,
        }
    }
}

/// Text embedding configuration. `dimension` is the system-wide constant D;
/// a batch whose vectors disagree with it is rejected before any write.
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub model_identifier: String,
    pub dimension: usize,
    pub batch_size: usize,
    pub api_base: String,
    pub api_key: Option<String>,
    /// Worst-case VRAM claim per batch item, for the pool's budget math.
    pub vram_per_item_bytes: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_identifier: "BAAI/bge-small-en-v1.5".to_string(),
            dimension: 384,
            batch_size: 256,
            api_base: "http://127.0.0.1:8080/v1".to_string(),
            api_key: None,
            vram_per_item_bytes: 2 * 1024 * 1024,
        }
    }
}

/// Worker pools, queue capacities, and resource caps.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub io_workers: usize,
    pub asr_workers: usize,
    pub embed_workers: usize,
    pub db_workers: usize,
    pub audio_queue: usize,
    pub asr_queue: usize,
    pub embed_queue: usize,
    pub write_queue: usize,
    pub max_in_flight: usize,
    pub vram_budget_bytes: u64,
    pub db_pool_size: u32,
    pub telemetry_interval_s: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            io_workers: 4,
            asr_workers: 1,
            embed_workers: 1,
            db_workers: 2,
            audio_queue: 8,
            asr_queue: 4,
            embed_queue: 8,
            write_queue: 8,
            max_in_flight: 12,
            vram_budget_bytes: 8 * 1024 * 1024 * 1024,
            db_pool_size: 8,
            telemetry_interval_s: 15,
        }
    }
}

/// Prefilter admission bounds.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub skip_shorter_than_s: u64,
    pub skip_longer_than_s: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            skip_shorter_than_s: 120,
            skip_longer_than_s: 6 * 60 * 60,
        }
    }
}

const PRECISION_LADDER: &[&str] = &["float16", "int8_float16", "int8"];

impl Config {
    /// Load from the environment. CLI overrides are applied by the caller
    /// before `validate()`.
    pub fn load() -> Result<Self, IngestError> {
        dotenv::dotenv().ok();

        let source_type = match env::var("INGEST_SOURCE_TYPE") {
            Ok(raw) => SourceType::from_str(&raw).map_err(IngestError::Config)?,
            Err(_) => SourceType::Youtube,
        };

        let database_url = env::var("DATABASE_URL").unwrap_or_default();

        let temp_root = env::var("INGEST_TEMP_DIR").map(PathBuf::from).unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".channel-ingest")
                .join("temp")
        });

        let voices_dir = env::var("INGEST_VOICES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("voices"));

        let mut speaker = SpeakerConfig::default();
        speaker.enable_speaker_id = env_bool("INGEST_ENABLE_SPEAKER_ID", speaker.enable_speaker_id)?;
        speaker.allow_external_captions =
            env_bool("INGEST_ALLOW_EXTERNAL_CAPTIONS", speaker.allow_external_captions)?;
        speaker.host_profile_name =
            env::var("INGEST_HOST_PROFILE_NAME").unwrap_or(speaker.host_profile_name);
        speaker.host_min_sim = env_parse("INGEST_HOST_MIN_SIM", speaker.host_min_sim)?;
        speaker.guest_min_sim = env_parse("INGEST_GUEST_MIN_SIM", speaker.guest_min_sim)?;
        speaker.attr_margin = env_parse("INGEST_ATTR_MARGIN", speaker.attr_margin)?;
        speaker.overlap_bonus = env_parse("INGEST_OVERLAP_BONUS", speaker.overlap_bonus)?;
        speaker.monologue_bonus = env_parse("INGEST_MONOLOGUE_BONUS", speaker.monologue_bonus)?;
        speaker.min_attribution_duration_s =
            env_parse("INGEST_MIN_ATTRIBUTION_DURATION_S", speaker.min_attribution_duration_s)?;
        speaker.monologue_probe_window_s =
            env_parse("INGEST_MONOLOGUE_PROBE_WINDOW_S", speaker.monologue_probe_window_s)?;
        speaker.default_unlabeled_to_host =
            env_bool("INGEST_DEFAULT_UNLABELED_TO_HOST", speaker.default_unlabeled_to_host)?;

        let mut segments = SegmentConfig::default();
        segments.min_chars = env_parse("INGEST_SEGMENT_MIN_CHARS", segments.min_chars)?;
        segments.max_chars = env_parse("INGEST_SEGMENT_MAX_CHARS", segments.max_chars)?;
        segments.hard_cap_chars = env_parse("INGEST_SEGMENT_HARD_CAP_CHARS", segments.hard_cap_chars)?;
        segments.overlap_chars = env_parse("INGEST_SEGMENT_OVERLAP_CHARS", segments.overlap_chars)?;
        segments.max_gap_s = env_parse("INGEST_SEGMENT_MAX_GAP_S", segments.max_gap_s)?;
        segments.max_duration_s = env_parse("INGEST_SEGMENT_MAX_DURATION_S", segments.max_duration_s)?;
        segments.min_coalesce_chars =
            env_parse("INGEST_SEGMENT_MIN_COALESCE_CHARS", segments.min_coalesce_chars)?;

        let mut asr = AsrConfig::default();
        asr.model_identifier = env::var("INGEST_ASR_MODEL").unwrap_or(asr.model_identifier);
        asr.compute_precision =
            env::var("INGEST_ASR_COMPUTE_PRECISION").unwrap_or(asr.compute_precision);
        asr.chunk_length_s = env_parse("INGEST_ASR_CHUNK_LENGTH_S", asr.chunk_length_s)?;
        asr.beam_size = env_parse("INGEST_ASR_BEAM_SIZE", asr.beam_size)?;
        asr.command = env::var("INGEST_ASR_COMMAND").ok().filter(|s| !s.is_empty());
        asr.word_timestamps = env_bool("INGEST_ASR_WORD_TIMESTAMPS", asr.word_timestamps)?;

        let mut diarization = DiarizationConfig::default();
        diarization.vad_threshold = env_parse("INGEST_DIAR_VAD_THRESHOLD", diarization.vad_threshold)?;
        diarization.window_s = env_parse("INGEST_DIAR_WINDOW_S", diarization.window_s)?;
        diarization.cluster_threshold =
            env_parse("INGEST_DIAR_CLUSTER_THRESHOLD", diarization.cluster_threshold)?;
        diarization.max_speakers = env_parse("INGEST_DIAR_MAX_SPEAKERS", diarization.max_speakers)?;
        diarization.min_turn_s = env_parse("INGEST_DIAR_MIN_TURN_S", diarization.min_turn_s)?;
        diarization.overlap_margin =
            env_parse("INGEST_DIAR_OVERLAP_MARGIN", diarization.overlap_margin)?;

        let mut embedding = EmbeddingConfig::default();
        embedding.model_identifier = env::var("INGEST_EMBEDDING_MODEL").unwrap_or(embedding.model_identifier);
        embedding.dimension = env_parse("INGEST_EMBEDDING_DIMENSION", embedding.dimension)?;
        embedding.batch_size = env_parse("INGEST_EMBEDDING_BATCH_SIZE", embedding.batch_size)?;
        embedding.api_base = env::var("EMBEDDING_API_BASE").unwrap_or(embedding.api_base);
        embedding.api_key = env::var("EMBEDDING_API_KEY").ok().filter(|s| !s.is_empty());
        embedding.vram_per_item_bytes =
            env_parse("INGEST_EMBEDDING_VRAM_PER_ITEM_BYTES", embedding.vram_per_item_bytes)?;

        let mut runtime = RuntimeConfig::default();
        runtime.io_workers = env_parse("INGEST_IO_WORKERS", runtime.io_workers)?;
        runtime.asr_workers = env_parse("INGEST_ASR_WORKERS", runtime.asr_workers)?;
        runtime.embed_workers = env_parse("INGEST_EMBED_WORKERS", runtime.embed_workers)?;
        runtime.db_workers = env_parse("INGEST_DB_WORKERS", runtime.db_workers)?;
        runtime.audio_queue = env_parse("INGEST_AUDIO_QUEUE", runtime.audio_queue)?;
        runtime.asr_queue = env_parse("INGEST_ASR_QUEUE", runtime.asr_queue)?;
        runtime.embed_queue = env_parse("INGEST_EMBED_QUEUE", runtime.embed_queue)?;
        runtime.write_queue = env_parse("INGEST_WRITE_QUEUE", runtime.write_queue)?;
        runtime.max_in_flight = env_parse("INGEST_MAX_IN_FLIGHT", runtime.max_in_flight)?;
        runtime.vram_budget_bytes = env_parse("INGEST_VRAM_BUDGET_BYTES", runtime.vram_budget_bytes)?;
        runtime.db_pool_size = env_parse("INGEST_DB_POOL_SIZE", runtime.db_pool_size)?;
        runtime.telemetry_interval_s =
            env_parse("INGEST_TELEMETRY_INTERVAL_S", runtime.telemetry_interval_s)?;

        let mut filters = FilterConfig::default();
        filters.skip_shorter_than_s =
            env_parse("INGEST_SKIP_SHORTER_THAN_S", filters.skip_shorter_than_s)?;
        filters.skip_longer_than_s =
            env_parse("INGEST_SKIP_LONGER_THAN_S", filters.skip_longer_than_s)?;

        let fail_fast = env_bool("INGEST_FAIL_FAST", false)?;
        let io_retries = env_parse("INGEST_IO_RETRIES", 3u32)?;
        let task_timeout_s = env_parse("INGEST_TASK_TIMEOUT_S", 1800u64)?;

        Ok(Config {
            source_type,
            database_url,
            temp_root,
            voices_dir,
            speaker,
            segments,
            asr,
            diarization,
            embedding,
            runtime,
            filters,
            fail_fast,
            io_retries,
            task_timeout_s,
        })
    }

    /// Validate the frozen configuration. Every violation is a
    /// `ConfigError`; the first one found aborts startup with exit code 2.
    pub fn validate(&self) -> Result<(), IngestError> {
        let err = |msg: String| Err(IngestError::Config(msg));

        if self.database_url.is_empty() {
            return err("DATABASE_URL is required".into());
        }
        if self.speaker.allow_external_captions && self.speaker.enable_speaker_id {
            return err(
                "external captions cannot be combined with speaker identification; \
                 disable one of INGEST_ALLOW_EXTERNAL_CAPTIONS / INGEST_ENABLE_SPEAKER_ID"
                    .into(),
            );
        }
        for (name, value) in [
            ("host_min_sim", self.speaker.host_min_sim),
            ("guest_min_sim", self.speaker.guest_min_sim),
            ("attr_margin", self.speaker.attr_margin),
            ("overlap_bonus", self.speaker.overlap_bonus),
            ("monologue_bonus", self.speaker.monologue_bonus),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return err(format!("{name} must be within [0, 1], got {value}"));
            }
        }
        if self.speaker.min_attribution_duration_s < 0.0 {
            return err("min_attribution_duration_s must be non-negative".into());
        }
        if self.segments.min_chars == 0 {
            return err("segment_min_chars must be positive".into());
        }
        if self.segments.min_chars > self.segments.max_chars {
            return err(format!(
                "segment_min_chars ({}) exceeds segment_max_chars ({})",
                self.segments.min_chars, self.segments.max_chars
            ));
        }
        if self.segments.max_chars > self.segments.hard_cap_chars {
            return err(format!(
                "segment_max_chars ({}) exceeds segment_hard_cap_chars ({})",
                self.segments.max_chars, self.segments.hard_cap_chars
            ));
        }
        if self.segments.overlap_chars >= self.segments.hard_cap_chars {
            return err("segment_overlap_chars must be below the hard cap".into());
        }
        if self.segments.max_gap_s < 0.0 || self.segments.max_duration_s <= 0.0 {
            return err("segment gap/duration limits must be positive".into());
        }
        if self.embedding.dimension == 0 {
            return err("embedding_dimension must be positive".into());
        }
        if self.embedding.batch_size == 0 {
            return err("embedding_batch_size must be positive".into());
        }
        if !PRECISION_LADDER.contains(&self.asr.compute_precision.as_str()) {
            return err(format!(
                "asr_compute_precision must be one of {:?}, got {}",
                PRECISION_LADDER, self.asr.compute_precision
            ));
        }
        if self.asr.chunk_length_s == 0 || self.asr.beam_size == 0 {
            return err("asr_chunk_length_s and asr_beam_size must be positive".into());
        }
        let r = &self.runtime;
        if r.io_workers == 0 || r.asr_workers == 0 || r.embed_workers == 0 || r.db_workers == 0 {
            return err("all worker pools must have at least one worker".into());
        }
        if r.audio_queue == 0 || r.asr_queue == 0 || r.embed_queue == 0 || r.write_queue == 0 {
            return err("queue capacities must be positive".into());
        }
        if r.max_in_flight == 0 {
            return err("max_in_flight must be positive".into());
        }
        if r.vram_budget_bytes == 0 {
            return err("vram_budget_bytes must be positive".into());
        }
        if r.db_pool_size == 0 {
            return err("db_pool_size must be positive".into());
        }
        if self.filters.skip_shorter_than_s >= self.filters.skip_longer_than_s {
            return err(format!(
                "skip_shorter_than_s ({}) must be below skip_longer_than_s ({})",
                self.filters.skip_shorter_than_s, self.filters.skip_longer_than_s
            ));
        }
        if self.speaker.allow_external_captions && self.source_type == SourceType::Local {
            return err("external captions are only meaningful for the youtube source".into());
        }
        Ok(())
    }

    /// The ordered precision rungs below (and including) the configured
    /// starting precision.
    pub fn precision_ladder(&self) -> Vec<String> {
        let start = PRECISION_LADDER
            .iter()
            .position(|p| *p == self.asr.compute_precision)
            .unwrap_or(0);
        PRECISION_LADDER[start..].iter().map(|p| p.to_string()).collect()
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, IngestError>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| IngestError::Config(format!("invalid {key}={raw}: {e}"))),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool, IngestError> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(IngestError::Config(format!("invalid {key}={other}: expected a boolean"))),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            source_type: SourceType::Youtube,
            database_url: "postgres://ingest@localhost/corpus".to_string(),
            temp_root: PathBuf::from("/tmp/ingest"),
            voices_dir: PathBuf::from("voices"),
            speaker: SpeakerConfig::default(),
            segments: SegmentConfig::default(),
            asr: AsrConfig::default(),
            diarization: DiarizationConfig::default(),
            embedding: EmbeddingConfig::default(),
            runtime: RuntimeConfig::default(),
            filters: FilterConfig::default(),
            fail_fast: false,
            io_retries: 3,
            task_timeout_s: 1800,
        }
    }

    #[test]
    fn default_shaped_config_validates() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn captions_and_speaker_id_are_mutually_exclusive() {
        let mut config = valid_config();
        config.speaker.allow_external_captions = true;
        config.speaker.enable_speaker_id = true;
        assert!(matches!(config.validate(), Err(IngestError::Config(_))));

        config.speaker.enable_speaker_id = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_inverted_segment_bounds() {
        let mut config = valid_config();
        config.segments.min_chars = 2000;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.segments.max_chars = config.segments.hard_cap_chars + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_precision() {
        let mut config = valid_config();
        config.asr.compute_precision = "bfloat64".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn precision_ladder_starts_at_configured_rung() {
        let mut config = valid_config();
        config.asr.compute_precision = "int8_float16".to_string();
        assert_eq!(config.precision_ladder(), vec!["int8_float16", "int8"]);
    }

    #[test]
    fn rejects_zero_workers_and_queues() {
        let mut config = valid_config();
        config.runtime.asr_workers = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.runtime.write_queue = 0;
        assert!(config.validate().is_err());
    }
}
