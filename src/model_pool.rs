/*
 * Channel Ingest CLI - Model Pool
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

use crate::audio::SAMPLE_RATE;
use crate::config::Config;
use crate::diarize::VoiceEmbedder;
use crate::error::IngestError;
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

const MIN_CHUNK_LENGTH_S: u32 = 10;
const MODEL_LADDER: &[&str] = &["large-v3", "medium", "small"];

/// The live ASR parameters a worker runs with. Only the pool may change
/// these, and only through a degradation step.
#[derive(Debug, Clone, PartialEq)]
pub struct AsrSpec {
    pub model_identifier: String,
    pub compute_precision: String,
    pub chunk_length_s: u32,
    pub beam_size: u32,
}

impl AsrSpec {
    /// Worst-case VRAM claim for this model at this precision, in MiB.
    pub fn vram_claim_mb(&self) -> u32 {
        let base: f32 = match self.model_identifier.as_str() {
            id if id.starts_with("large") => 4_700.0,
            "medium" => 2_600.0,
            "small" => 1_500.0,
            "base" => 800.0,
            "tiny" => 400.0,
            _ => 2_500.0,
        };
        let scale: f32 = match self.compute_precision.as_str() {
            "float16" => 1.0,
            "int8_float16" => 0.7,
            _ => 0.55,
        };
        (base * scale) as u32
    }
}

/// Owner of long-lived model state: the current ASR rung, the shared
/// spectral voice embedder, and the VRAM budget all handles draw from.
/// Workers acquire leases; they never mutate model state directly.
pub struct ModelPool {
    vram: Arc<Semaphore>,
    budget_mb: u32,
    asr_spec: Mutex<AsrSpec>,
    precision_ladder: Vec<String>,
    embed_vram_per_item_mb: u32,
    voice_embedder: OnceLock<Arc<VoiceEmbedder>>,
    degradations: Mutex<Vec<String>>,
}

/// Holder of an ASR model claim. VRAM returns to the budget on drop.
pub struct AsrLease {
    pub spec: AsrSpec,
    _permit: OwnedSemaphorePermit,
}

/// Holder of an embedding batch claim. VRAM returns to the budget on drop.
pub struct EmbedLease {
    pub batch_size: usize,
    _permit: OwnedSemaphorePermit,
}

impl ModelPool {
    pub fn new(config: &Config) -> Arc<Self> {
        let budget_mb = (config.runtime.vram_budget_bytes / (1024 * 1024)).max(1) as u32;
        let per_item_mb = (config.embedding.vram_per_item_bytes / (1024 * 1024)).max(1) as u32;
        Arc::new(Self {
            vram: Arc::new(Semaphore::new(budget_mb as usize)),
            budget_mb,
            asr_spec: Mutex::new(AsrSpec {
                model_identifier: config.asr.model_identifier.clone(),
                compute_precision: config.asr.compute_precision.clone(),
                chunk_length_s: config.asr.chunk_length_s,
                beam_size: config.asr.beam_size,
            }),
            precision_ladder: config.precision_ladder(),
            embed_vram_per_item_mb: per_item_mb,
            voice_embedder: OnceLock::new(),
            degradations: Mutex::new(Vec::new()),
        })
    }

    /// Current ASR parameters without taking a lease. Used for provenance.
    pub fn current_asr_spec(&self) -> AsrSpec {
        self.asr_spec.lock().clone()
    }

    /// Block until the current ASR model's VRAM claim fits in the budget,
    /// or the run is cancelled.
    pub async fn acquire_asr(self: &Arc<Self>, cancel: &CancellationToken) -> Result<AsrLease, IngestError> {
        loop {
            let spec = self.current_asr_spec();
            let claim = spec.vram_claim_mb().min(self.budget_mb);
            let acquire = self.vram.clone().acquire_many_owned(claim);
            tokio::select! {
                permit = acquire => {
                    let permit = permit.map_err(|_| IngestError::Cancelled)?;
                    // The spec may have been degraded while we waited; a
                    // smaller claim is fine, a larger one must re-acquire.
                    let now = self.current_asr_spec();
                    if now.vram_claim_mb() > spec.vram_claim_mb() {
                        drop(permit);
                        continue;
                    }
                    return Ok(AsrLease { spec: now, _permit: permit });
                }
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
            }
        }
    }

    /// Claim VRAM for an embedding batch of the given size, capped so a
    /// single batch can never exceed the whole budget.
    pub async fn acquire_embed(
        self: &Arc<Self>,
        batch_size: usize,
        cancel: &CancellationToken,
    ) -> Result<EmbedLease, IngestError> {
        let claim = ((batch_size as u64 * self.embed_vram_per_item_mb as u64)
            .min(self.budget_mb as u64)) as u32;
        tokio::select! {
            permit = self.vram.clone().acquire_many_owned(claim.max(1)) => {
                let permit = permit.map_err(|_| IngestError::Cancelled)?;
                Ok(EmbedLease { batch_size, _permit: permit })
            }
            _ = cancel.cancelled() => Err(IngestError::Cancelled),
        }
    }

    /// Lazily built spectral voice embedder, shared by the probe,
    /// diarization, and enrollment. CPU-resident; no VRAM claim.
    pub fn voice_embedder(&self) -> Arc<VoiceEmbedder> {
        self.voice_embedder.get_or_init(|| Arc::new(VoiceEmbedder::new(SAMPLE_RATE))).clone()
    }

    /// Step the degradation ladder after an OOM or soft timeout: precision
    /// first, then chunk length, then a smaller model. Returns the new
    /// spec, or a terminal model error once the ladder is exhausted.
    pub fn degrade_asr(&self, reason: &str) -> Result<AsrSpec, IngestError> {
        let mut spec = self.asr_spec.lock();

        let step = if let Some(next) = self.next_precision(&spec.compute_precision) {
            spec.compute_precision = next;
            format!("precision -> {}", spec.compute_precision)
        } else if spec.chunk_length_s / 2 >= MIN_CHUNK_LENGTH_S {
            spec.chunk_length_s /= 2;
            format!("chunk length -> {}s", spec.chunk_length_s)
        } else if let Some(next) = next_model(&spec.model_identifier) {
            spec.model_identifier = next.to_string();
            // A fresh model starts back at the top of the precision ladder.
            spec.compute_precision =
                self.precision_ladder.first().cloned().unwrap_or_else(|| "int8".to_string());
            format!("model -> {}", spec.model_identifier)
        } else {
            return Err(IngestError::model(
                format!("degradation ladder exhausted after {reason}"),
                false,
            ));
        };

        tracing::warn!("ASR degraded ({reason}): {step}");
        self.degradations.lock().push(step);
        Ok(spec.clone())
    }

    /// VRAM currently claimed by live leases, in MiB. Telemetry only.
    pub fn vram_resident_mb(&self) -> u32 {
        self.budget_mb - self.vram.available_permits() as u32
    }

    pub fn vram_budget_mb(&self) -> u32 {
        self.budget_mb
    }

    pub fn degradation_history(&self) -> Vec<String> {
        self.degradations.lock().clone()
    }

    fn next_precision(&self, current: &str) -> Option<String> {
        let idx = self.precision_ladder.iter().position(|p| p == current)?;
        self.precision_ladder.get(idx + 1).cloned()
    }
}

fn next_model(current: &str) -> Option<&'static str> {
    let idx = MODEL_LADDER
        .iter()
        .position(|m| current.starts_with(m) || *m == current)?;
    MODEL_LADDER.get(idx + 1).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, SegmentConfig};
    use crate::types::SourceType;
    use std::path::PathBuf;

    fn test_config() -> Config {
        Config {
            source_type: SourceType::Youtube,
            database_url: "postgres://ingest@localhost/corpus".to_string(),
            temp_root: PathBuf::from("/tmp"),
            voices_dir: PathBuf::from("voices"),
            speaker: Default::default(),
            segments: SegmentConfig::default(),
            asr: Default::default(),
            diarization: Default::default(),
            embedding: Default::default(),
            runtime: Default::default(),
            filters: Default::default(),
            fail_fast: false,
            io_retries: 3,
            task_timeout_s: 1800,
        }
    }

    #[test]
    fn vram_claim_scales_with_model_and_precision() {
        let large_fp16 = AsrSpec {
            model_identifier: "large-v3".into(),
            compute_precision: "float16".into(),
            chunk_length_s: 30,
            beam_size: 5,
        };
        let small_int8 = AsrSpec {
            model_identifier: "small".into(),
            compute_precision: "int8".into(),
            chunk_length_s: 30,
            beam_size: 5,
        };
        assert!(large_fp16.vram_claim_mb() > small_int8.vram_claim_mb());
    }

    #[test]
    fn ladder_steps_precision_then_chunk_then_model() {
        let pool = ModelPool::new(&test_config());

        let spec = pool.degrade_asr("test oom").unwrap();
        assert_eq!(spec.compute_precision, "int8_float16");
        let spec = pool.degrade_asr("test oom").unwrap();
        assert_eq!(spec.compute_precision, "int8");

        let spec = pool.degrade_asr("test oom").unwrap();
        assert_eq!(spec.chunk_length_s, 15);
        // 15 / 2 = 7 would fall below the floor, so the next step swaps models.
        let spec = pool.degrade_asr("test oom").unwrap();
        assert_eq!(spec.model_identifier, "medium");
        assert_eq!(spec.compute_precision, "float16");
    }

    #[test]
    fn ladder_exhaustion_is_terminal() {
        let pool = ModelPool::new(&test_config());
        let mut last = Ok(pool.current_asr_spec());
        for _ in 0..32 {
            last = pool.degrade_asr("test oom");
            if last.is_err() {
                break;
            }
        }
        assert!(matches!(last, Err(IngestError::Model { oom: false, .. })));
        assert!(!pool.degradation_history().is_empty());
    }

    #[tokio::test]
    async fn asr_lease_returns_vram_on_drop() {
        let mut config = test_config();
        config.runtime.vram_budget_bytes = 8 * 1024 * 1024 * 1024;
        let pool = ModelPool::new(&config);
        let cancel = CancellationToken::new();

        let lease = pool.acquire_asr(&cancel).await.unwrap();
        assert!(pool.vram_resident_mb() >= lease.spec.vram_claim_mb());
        drop(lease);
        assert_eq!(pool.vram_resident_mb(), 0);
    }

    #[tokio::test]
    async fn embed_claim_caps_at_budget() {
        let mut config = test_config();
        config.runtime.vram_budget_bytes = 64 * 1024 * 1024;
        let pool = ModelPool::new(&config);
        let cancel = CancellationToken::new();

        // A batch far larger than the budget still fits (capped claim).
        let lease = pool.acquire_embed(100_000, &cancel).await.unwrap();
        assert_eq!(pool.vram_resident_mb(), pool.vram_budget_mb());
        drop(lease);
    }

    #[tokio::test]
    async fn acquire_respects_cancellation() {
        let mut config = test_config();
        config.runtime.vram_budget_bytes = 64 * 1024 * 1024;
        let pool = ModelPool::new(&config);
        let cancel = CancellationToken::new();

        // Hold the whole budget, then ask again with a cancelled token.
        let _hold = pool.acquire_embed(100_000, &cancel).await.unwrap();
        cancel.cancel();
        let result = pool.acquire_asr(&cancel).await;
        assert!(matches!(result, Err(IngestError::Cancelled)));
    }
}
