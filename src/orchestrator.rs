/*
 * Channel Ingest CLI - Pipeline Orchestrator
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

use crate::acquire::{AudioAcquirer, TaskWorkspace};
use crate::asr::TranscribeEngine;
use crate::config::Config;
use crate::embed::EmbeddingClient;
use crate::error::IngestError;
use crate::model_pool::ModelPool;
use crate::optimize::{optimize, LabelPolicy};
use crate::sources::VideoSource;
use crate::stats::{BusyGuard, SharedStats};
use crate::store::{IngestedState, SourceRecord, Store};
use crate::types::{
    AudioArtifact, IngestionSummary, Provenance, VideoReference,
};
use crate::voices::VoiceProfileStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Context that travels with one video through every stage. Dropping it
/// anywhere releases the in-flight permit; dropping a stage message also
/// drops whatever resources (temp workspace) it carried.
struct TaskCtx {
    reference: VideoReference,
    replace_existing: bool,
    started: Instant,
    _permit: OwnedSemaphorePermit,
}

struct AsrMsg {
    ctx: TaskCtx,
    artifact: AudioArtifact,
    workspace: TaskWorkspace,
}

struct EmbedMsg {
    ctx: TaskCtx,
    segments: Vec<crate::types::OptimizedSegment>,
    provenance: Provenance,
}

struct WriteMsg {
    ctx: TaskCtx,
    segments: Vec<crate::types::OptimizedSegment>,
    provenance: Provenance,
}

/// Terminal status report sent to the accountant. The sender drops the
/// task context (and its permit) right after reporting.
enum Report {
    Persisted { video_id: String, segments: usize, dedup_conflicts: usize },
    Skipped { video_id: String, reason: String },
    Failed { video_id: String, error: IngestError },
}

/// Bounded queue with a depth gauge the telemetry sampler can read
/// without touching channel internals.
struct QueueTx<T> {
    tx: mpsc::Sender<T>,
    depth: Arc<AtomicUsize>,
}

impl<T> Clone for QueueTx<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone(), depth: self.depth.clone() }
    }
}

struct QueueRx<T> {
    rx: mpsc::Receiver<T>,
    depth: Arc<AtomicUsize>,
}

fn queue<T>(capacity: usize) -> (QueueTx<T>, QueueRx<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    let depth = Arc::new(AtomicUsize::new(0));
    (QueueTx { tx, depth: depth.clone() }, QueueRx { rx, depth })
}

impl<T> QueueTx<T> {
    /// Blocking put with backpressure; aborts on shutdown. `Err` means the
    /// message was dropped (cancelled or downstream gone).
    async fn send(&self, item: T, cancel: &CancellationToken) -> Result<(), ()> {
        tokio::select! {
            sent = self.tx.send(item) => match sent {
                Ok(()) => {
                    self.depth.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Err(_) => Err(()),
            },
            _ = cancel.cancelled() => Err(()),
        }
    }
}

impl<T> QueueRx<T> {
    /// Blocking take; `None` on shutdown or when all producers are done.
    async fn recv(&mut self, cancel: &CancellationToken) -> Option<T> {
        tokio::select! {
            item = self.rx.recv() => {
                if item.is_some() {
                    self.depth.fetch_sub(1, Ordering::Relaxed);
                }
                item
            }
            _ = cancel.cancelled() => None,
        }
    }
}

/// Drives VideoReferences through the five-stage pipeline and accounts
/// for every one of them.
pub struct Orchestrator {
    config: Config,
    store: Arc<Store>,
    pool: Arc<ModelPool>,
    acquirer: Arc<AudioAcquirer>,
    engine: Arc<TranscribeEngine>,
    embedder: Arc<EmbeddingClient>,
    profiles: Arc<VoiceProfileStore>,
    stats: SharedStats,
    cancel: CancellationToken,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        store: Arc<Store>,
        pool: Arc<ModelPool>,
        acquirer: Arc<AudioAcquirer>,
        engine: Arc<TranscribeEngine>,
        embedder: Arc<EmbeddingClient>,
        profiles: Arc<VoiceProfileStore>,
        stats: SharedStats,
        cancel: CancellationToken,
    ) -> Self {
        Self { config, store, pool, acquirer, engine, embedder, profiles, stats, cancel }
    }

    /// Run the pipeline to completion (or cancellation). Every reference
    /// pulled from the source ends up persisted, skipped, failed, or
    /// cancelled; task-level failures never end the run unless
    /// `fail_fast` is set.
    pub async fn run(self, mut source: Box<dyn VideoSource>) -> IngestionSummary {
        let run_id = uuid::Uuid::new_v4();
        let run_started = Instant::now();
        let r = &self.config.runtime;
        tracing::info!(
            "ingestion run {run_id}: source={}, max_in_flight={}, workers io={}/asr={}/embed={}/db={}",
            source.describe(),
            r.max_in_flight,
            r.io_workers,
            r.asr_workers,
            r.embed_workers,
            r.db_workers
        );

        let (prefilter_tx, prefilter_rx) = queue::<TaskCtx>(r.max_in_flight.max(1));
        let (audio_tx, audio_rx) = queue::<TaskCtx>(r.audio_queue);
        let (asr_tx, asr_rx) = queue::<AsrMsg>(r.asr_queue);
        let (embed_tx, embed_rx) = queue::<EmbedMsg>(r.embed_queue);
        let (write_tx, write_rx) = queue::<WriteMsg>(r.write_queue);
        let (report_tx, report_rx) = mpsc::unbounded_channel::<Report>();

        let depths = [
            ("prefilter", prefilter_tx.depth.clone()),
            ("audio", audio_tx.depth.clone()),
            ("asr", asr_tx.depth.clone()),
            ("embed", embed_tx.depth.clone()),
            ("write", write_tx.depth.clone()),
        ];

        let telemetry = self.spawn_telemetry(depths);
        let accountant = self.spawn_accountant(report_rx);

        // Stage worker pools, head to tail. Each stage owns clones of its
        // output sender; channel closure is the poison pill.
        let mut prefilter_pool = JoinSet::new();
        prefilter_pool.spawn(Self::prefilter_worker(
            self.store.clone(),
            self.config.clone(),
            self.profiles.clone(),
            self.stats.clone(),
            prefilter_rx,
            audio_tx.clone(),
            report_tx.clone(),
            self.cancel.clone(),
        ));
        drop(audio_tx);

        let audio_rx = Arc::new(tokio::sync::Mutex::new(audio_rx));
        let mut io_pool = JoinSet::new();
        for _ in 0..r.io_workers {
            io_pool.spawn(Self::io_worker(
                self.acquirer.clone(),
                self.stats.clone(),
                audio_rx.clone(),
                asr_tx.clone(),
                report_tx.clone(),
                self.cancel.clone(),
            ));
        }
        drop(asr_tx);

        let asr_rx = Arc::new(tokio::sync::Mutex::new(asr_rx));
        let mut asr_pool = JoinSet::new();
        for _ in 0..r.asr_workers {
            asr_pool.spawn(Self::asr_worker(
                self.engine.clone(),
                self.pool.clone(),
                self.profiles.clone(),
                self.config.clone(),
                self.stats.clone(),
                asr_rx.clone(),
                embed_tx.clone(),
                report_tx.clone(),
                self.cancel.clone(),
            ));
        }
        drop(embed_tx);

        let embed_rx = Arc::new(tokio::sync::Mutex::new(embed_rx));
        let mut embed_pool = JoinSet::new();
        for _ in 0..r.embed_workers {
            embed_pool.spawn(Self::embed_worker(
                self.embedder.clone(),
                self.pool.clone(),
                self.stats.clone(),
                embed_rx.clone(),
                write_tx.clone(),
                report_tx.clone(),
                self.cancel.clone(),
            ));
        }
        drop(write_tx);

        let write_rx = Arc::new(tokio::sync::Mutex::new(write_rx));
        let mut db_pool = JoinSet::new();
        for _ in 0..r.db_workers {
            db_pool.spawn(Self::db_worker(
                self.store.clone(),
                self.config.source_type,
                self.config.io_retries,
                self.stats.clone(),
                write_rx.clone(),
                report_tx.clone(),
                self.cancel.clone(),
            ));
        }
        drop(report_tx);

        // Feed the head queue from the listing adapter, bounded by the
        // in-flight cap.
        let in_flight = Arc::new(Semaphore::new(r.max_in_flight));
        let mut attempted = 0usize;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let reference = match source.next_reference().await {
                Ok(Some(reference)) => reference,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("listing adapter failed, ending intake: {e:#}");
                    break;
                }
            };

            let permit = tokio::select! {
                permit = in_flight.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.cancel.cancelled() => break,
            };

            attempted += 1;
            self.stats.task_attempted();
            let ctx = TaskCtx {
                reference,
                replace_existing: false,
                started: Instant::now(),
                _permit: permit,
            };
            if prefilter_tx.send(ctx, &self.cancel).await.is_err() {
                break;
            }
        }
        drop(prefilter_tx);
        drop(source);

        // Stages drain in order once their input closes.
        while prefilter_pool.join_next().await.is_some() {}
        while io_pool.join_next().await.is_some() {}
        while asr_pool.join_next().await.is_some() {}
        while embed_pool.join_next().await.is_some() {}
        while db_pool.join_next().await.is_some() {}

        telemetry.abort();
        let mut summary = accountant.await.unwrap_or_default();

        summary.attempted = attempted;
        summary.cancelled =
            attempted.saturating_sub(summary.persisted + summary.skipped + summary.failed);
        summary.was_cancelled = self.cancel.is_cancelled();
        summary.wall_time_s = run_started.elapsed().as_secs_f64();
        let snapshot = self.stats.snapshot();
        summary.duplicates_removed = snapshot.duplicates_removed;
        summary.media_seconds_processed = snapshot.media_seconds;
        summary
    }

    /// Cheap admission test: accessibility, duration bounds, and the
    /// already-ingested check against the store.
    #[allow(clippy::too_many_arguments)]
    async fn prefilter_worker(
        store: Arc<Store>,
        config: Config,
        profiles: Arc<VoiceProfileStore>,
        stats: SharedStats,
        mut input: QueueRx<TaskCtx>,
        output: QueueTx<TaskCtx>,
        reports: mpsc::UnboundedSender<Report>,
        cancel: CancellationToken,
    ) {
        while let Some(mut ctx) = input.recv(&cancel).await {
            let video_id = ctx.reference.video_id.clone();

            if !ctx.reference.accessible {
                stats.task_skipped();
                let _ = reports.send(Report::Skipped {
                    video_id,
                    reason: "flagged inaccessible by listing".into(),
                });
                continue;
            }

            if let Some(duration) = ctx.reference.duration_seconds {
                if duration < config.filters.skip_shorter_than_s {
                    stats.task_skipped();
                    let _ = reports.send(Report::Skipped {
                        video_id,
                        reason: format!("shorter than {}s", config.filters.skip_shorter_than_s),
                    });
                    continue;
                }
                if duration > config.filters.skip_longer_than_s {
                    stats.task_skipped();
                    let _ = reports.send(Report::Skipped {
                        video_id,
                        reason: format!("longer than {}s", config.filters.skip_longer_than_s),
                    });
                    continue;
                }
            }

            match store
                .ingested_state(config.source_type, &video_id, profiles.version())
                .await
            {
                Ok(IngestedState::Ingested) => {
                    stats.task_skipped();
                    let _ = reports.send(Report::Skipped {
                        video_id,
                        reason: "already ingested under current profile version".into(),
                    });
                    continue;
                }
                Ok(IngestedState::Stale) => ctx.replace_existing = true,
                Ok(IngestedState::Fresh) => {}
                Err(e) => {
                    stats.task_failed(e.failure_kind());
                    let _ = reports.send(Report::Failed { video_id, error: e });
                    continue;
                }
            }

            if output.send(ctx, &cancel).await.is_err() {
                break;
            }
        }
    }

    async fn io_worker(
        acquirer: Arc<AudioAcquirer>,
        stats: SharedStats,
        input: Arc<tokio::sync::Mutex<QueueRx<TaskCtx>>>,
        output: QueueTx<AsrMsg>,
        reports: mpsc::UnboundedSender<Report>,
        cancel: CancellationToken,
    ) {
        loop {
            let Some(ctx) = input.lock().await.recv(&cancel).await else { break };
            let _busy = BusyGuard::enter(&stats.io_busy);
            let video_id = ctx.reference.video_id.clone();

            match acquirer.acquire(&ctx.reference, 0, &cancel).await {
                Ok((artifact, workspace)) => {
                    if output.send(AsrMsg { ctx, artifact, workspace }, &cancel).await.is_err() {
                        break;
                    }
                }
                Err(IngestError::Cancelled) => continue,
                Err(e) => {
                    stats.task_failed(e.failure_kind());
                    tracing::warn!("{video_id}: acquisition failed terminally: {}", e.redacted_summary());
                    let _ = reports.send(Report::Failed { video_id, error: e });
                }
            }
        }
    }

    /// Transcription plus the inline optimizer: the optimizer is
    /// CPU-cheap, and coupling it here avoids an extra queue hop.
    #[allow(clippy::too_many_arguments)]
    async fn asr_worker(
        engine: Arc<TranscribeEngine>,
        pool: Arc<ModelPool>,
        profiles: Arc<VoiceProfileStore>,
        config: Config,
        stats: SharedStats,
        input: Arc<tokio::sync::Mutex<QueueRx<AsrMsg>>>,
        output: QueueTx<EmbedMsg>,
        reports: mpsc::UnboundedSender<Report>,
        cancel: CancellationToken,
    ) {
        // Default-label policy only applies when attribution never ran.
        let policy = LabelPolicy {
            default_to_host: config.speaker.default_unlabeled_to_host
                && !config.speaker.enable_speaker_id,
        };

        loop {
            let Some(AsrMsg { ctx, artifact, workspace }) = input.lock().await.recv(&cancel).await
            else {
                break;
            };
            let _busy = BusyGuard::enter(&stats.asr_busy);
            let video_id = ctx.reference.video_id.clone();
            let stage_started = Instant::now();

            let outcome = engine
                .transcribe(&video_id, &artifact, &profiles, &pool, &cancel)
                .await;
            // Temp audio is no longer needed whatever happened.
            drop(workspace);

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(IngestError::Cancelled) => continue,
                Err(e) => {
                    stats.task_failed(e.failure_kind());
                    tracing::warn!("{video_id}: transcription failed: {}", e.redacted_summary());
                    let _ = reports.send(Report::Failed { video_id, error: e });
                    continue;
                }
            };

            stats.transcribed(
                outcome.method,
                outcome.segments.len(),
                artifact.duration_s,
                stage_started.elapsed().as_secs_f64(),
            );

            let report = match optimize(&outcome.segments, &config.segments, policy) {
                Ok(report) => report,
                Err(e) => {
                    stats.task_failed(e.failure_kind());
                    tracing::error!("{video_id}: optimizer failure: {}", e.redacted_summary());
                    let _ = reports.send(Report::Failed { video_id, error: e });
                    continue;
                }
            };
            stats.duplicates_removed(report.duplicates_removed);
            stats.default_label_applied(report.default_labels_applied);
            stats.unknown_labels(
                report
                    .segments
                    .iter()
                    .filter(|s| s.speaker_label == crate::types::SpeakerLabel::Unknown)
                    .count(),
            );
            if report.duplicates_removed > 0 {
                tracing::info!("{video_id}: duplicates_removed={}", report.duplicates_removed);
            }

            let provenance = Provenance {
                transcript_method: outcome.method,
                model_identifier: outcome.model_identifier,
                profile_version: profiles.version().to_string(),
            };
            let msg = EmbedMsg { ctx, segments: report.segments, provenance };
            if output.send(msg, &cancel).await.is_err() {
                break;
            }
        }
    }

    async fn embed_worker(
        embedder: Arc<EmbeddingClient>,
        pool: Arc<ModelPool>,
        stats: SharedStats,
        input: Arc<tokio::sync::Mutex<QueueRx<EmbedMsg>>>,
        output: QueueTx<WriteMsg>,
        reports: mpsc::UnboundedSender<Report>,
        cancel: CancellationToken,
    ) {
        loop {
            let Some(EmbedMsg { ctx, mut segments, provenance }) =
                input.lock().await.recv(&cancel).await
            else {
                break;
            };
            let _busy = BusyGuard::enter(&stats.embed_busy);
            let video_id = ctx.reference.video_id.clone();

            match embedder.embed_segments(&mut segments, &pool, &cancel).await {
                Ok(final_batch) => {
                    tracing::debug!("{video_id}: embedded {} segments (batch {final_batch})", segments.len());
                    stats.embedded(segments.len());
                    if output.send(WriteMsg { ctx, segments, provenance }, &cancel).await.is_err() {
                        break;
                    }
                }
                Err(IngestError::Cancelled) => continue,
                Err(e) => {
                    stats.task_failed(e.failure_kind());
                    tracing::warn!("{video_id}: embedding failed: {}", e.redacted_summary());
                    let _ = reports.send(Report::Failed { video_id, error: e });
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn db_worker(
        store: Arc<Store>,
        source_type: crate::types::SourceType,
        retries: u32,
        stats: SharedStats,
        input: Arc<tokio::sync::Mutex<QueueRx<WriteMsg>>>,
        reports: mpsc::UnboundedSender<Report>,
        cancel: CancellationToken,
    ) {
        loop {
            let Some(WriteMsg { ctx, segments, provenance }) =
                input.lock().await.recv(&cancel).await
            else {
                break;
            };
            let _busy = BusyGuard::enter(&stats.db_busy);
            let video_id = ctx.reference.video_id.clone();

            let record = SourceRecord {
                source_type,
                reference: ctx.reference.clone(),
                provenance,
            };

            let mut attempt = 0u32;
            let commit = loop {
                match store.commit(&record, &segments, ctx.replace_existing).await {
                    Ok(result) => break Ok(result),
                    Err(e) if e.is_retriable() && attempt < retries && !cancel.is_cancelled() => {
                        attempt += 1;
                        tracing::warn!(
                            "{video_id}: commit attempt {attempt} failed, retrying: {}",
                            e.redacted_summary()
                        );
                        tokio::time::sleep(Duration::from_millis(500 * (1 << attempt.min(4)))).await;
                    }
                    Err(e) => break Err(e),
                }
            };

            match commit {
                Ok(result) => {
                    stats.committed(result.inserted, result.dedup_conflicts);
                    tracing::info!(
                        "{video_id}: persisted {} segments ({} dedup conflicts) in {:.1}s",
                        result.inserted,
                        result.dedup_conflicts,
                        ctx.started.elapsed().as_secs_f64()
                    );
                    let _ = reports.send(Report::Persisted {
                        video_id,
                        segments: result.inserted,
                        dedup_conflicts: result.dedup_conflicts,
                    });
                }
                Err(e) => {
                    stats.task_failed(e.failure_kind());
                    tracing::warn!("{video_id}: commit failed: {}", e.redacted_summary());
                    let _ = reports.send(Report::Failed { video_id, error: e });
                }
            }
        }
    }

    /// Builds the run summary from terminal reports. On `fail_fast` the
    /// first terminal failure cancels the run.
    fn spawn_accountant(
        &self,
        mut reports: mpsc::UnboundedReceiver<Report>,
    ) -> tokio::task::JoinHandle<IngestionSummary> {
        let cancel = self.cancel.clone();
        let fail_fast = self.config.fail_fast;

        tokio::spawn(async move {
            let mut summary = IngestionSummary::default();
            while let Some(report) = reports.recv().await {
                match report {
                    Report::Persisted { video_id, segments, dedup_conflicts } => {
                        summary.persisted += 1;
                        summary.segments_committed += segments;
                        tracing::debug!(
                            "terminal status for {video_id}: persisted ({segments} segments, {dedup_conflicts} conflicts)"
                        );
                    }
                    Report::Skipped { video_id, reason } => {
                        summary.skipped += 1;
                        tracing::info!("terminal status for {video_id}: skipped ({reason})");
                    }
                    Report::Failed { video_id, error } => {
                        let kind = error.failure_kind();
                        summary.record_failure(kind, &error.redacted_summary());
                        tracing::warn!(
                            "terminal status for {video_id}: failed ({kind}: {})",
                            error.redacted_summary()
                        );
                        if fail_fast {
                            tracing::error!("fail-fast set; cancelling run after first failure");
                            cancel.cancel();
                        }
                    }
                }
            }
            summary
        })
    }

    /// Periodic, non-blocking sampler: queue depths, busy workers, VRAM
    /// residency, rolling real-time factor.
    fn spawn_telemetry(
        &self,
        depths: [(&'static str, Arc<AtomicUsize>); 5],
    ) -> tokio::task::JoinHandle<()> {
        let stats = self.stats.clone();
        let pool = self.pool.clone();
        let interval_s = self.config.runtime.telemetry_interval_s.max(1);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_s));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel.cancelled() => break,
                }
                let snapshot = stats.snapshot();
                let queue_line = depths
                    .iter()
                    .map(|(name, depth)| format!("{name}={}", depth.load(Ordering::Relaxed)))
                    .collect::<Vec<_>>()
                    .join(" ");
                tracing::info!(
                    "telemetry: queues[{queue_line}] busy[io={} asr={} embed={} db={}] \
                     vram={}MiB/{}MiB rtf={:.2} persisted={} failed={}",
                    stats.io_busy.load(Ordering::Relaxed),
                    stats.asr_busy.load(Ordering::Relaxed),
                    stats.embed_busy.load(Ordering::Relaxed),
                    stats.db_busy.load(Ordering::Relaxed),
                    pool.vram_resident_mb(),
                    pool.vram_budget_mb(),
                    snapshot.real_time_factor(),
                    snapshot.persisted,
                    snapshot.failures.values().sum::<usize>(),
                );
            }
        })
    }
}

