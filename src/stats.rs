/*
 * Channel Ingest CLI - Ingestion Stats
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

use crate::types::{FailureKind, TranscriptMethod};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Process-wide ingestion counters. Guarded by a mutex and updated at
/// coarse granularity only (per task, per batch) so it never becomes a
/// contention point. Queue depths and busy-worker gauges are atomics so the
/// telemetry sampler can read them without taking the lock.
#[derive(Debug, Default)]
pub struct IngestionStats {
    inner: Mutex<StatsInner>,
    pub asr_busy: AtomicUsize,
    pub embed_busy: AtomicUsize,
    pub io_busy: AtomicUsize,
    pub db_busy: AtomicUsize,
}

#[derive(Debug, Default, Clone)]
struct StatsInner {
    attempted: usize,
    persisted: usize,
    skipped: usize,
    segments_produced: usize,
    segments_embedded: usize,
    segments_committed: usize,
    duplicates_removed: usize,
    dedup_conflicts: usize,
    unknown_labels: usize,
    default_label_applied: usize,
    media_seconds: f64,
    processing_seconds: f64,
    failures: HashMap<FailureKind, usize>,
    methods: HashMap<TranscriptMethod, usize>,
}

/// Point-in-time copy for telemetry and the run summary.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub attempted: usize,
    pub persisted: usize,
    pub skipped: usize,
    pub segments_produced: usize,
    pub segments_embedded: usize,
    pub segments_committed: usize,
    pub duplicates_removed: usize,
    pub dedup_conflicts: usize,
    pub unknown_labels: usize,
    pub default_label_applied: usize,
    pub media_seconds: f64,
    pub processing_seconds: f64,
    pub failures: HashMap<FailureKind, usize>,
    pub methods: HashMap<TranscriptMethod, usize>,
}

impl StatsSnapshot {
    /// Wall clock spent processing over media duration processed.
    pub fn real_time_factor(&self) -> f64 {
        if self.media_seconds > 0.0 {
            self.processing_seconds / self.media_seconds
        } else {
            0.0
        }
    }
}

pub type SharedStats = Arc<IngestionStats>;

impl IngestionStats {
    pub fn new() -> SharedStats {
        Arc::new(IngestionStats::default())
    }

    pub fn task_attempted(&self) {
        self.inner.lock().attempted += 1;
    }

    pub fn task_skipped(&self) {
        self.inner.lock().skipped += 1;
    }

    pub fn task_failed(&self, kind: FailureKind) {
        *self.inner.lock().failures.entry(kind).or_insert(0) += 1;
    }

    /// Record a successful transcription: method used, raw segments
    /// produced, media/wall seconds for the real-time factor.
    pub fn transcribed(&self, method: TranscriptMethod, segments: usize, media_s: f64, wall_s: f64) {
        let mut inner = self.inner.lock();
        inner.segments_produced += segments;
        inner.media_seconds += media_s;
        inner.processing_seconds += wall_s;
        *inner.methods.entry(method).or_insert(0) += 1;
    }

    pub fn embedded(&self, segments: usize) {
        self.inner.lock().segments_embedded += segments;
    }

    pub fn committed(&self, segments: usize, dedup_conflicts: usize) {
        let mut inner = self.inner.lock();
        inner.persisted += 1;
        inner.segments_committed += segments;
        inner.dedup_conflicts += dedup_conflicts;
    }

    pub fn duplicates_removed(&self, count: usize) {
        if count > 0 {
            self.inner.lock().duplicates_removed += count;
        }
    }

    pub fn unknown_labels(&self, count: usize) {
        if count > 0 {
            self.inner.lock().unknown_labels += count;
        }
    }

    pub fn default_label_applied(&self, count: usize) {
        if count > 0 {
            self.inner.lock().default_label_applied += count;
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.lock().clone();
        StatsSnapshot {
            attempted: inner.attempted,
            persisted: inner.persisted,
            skipped: inner.skipped,
            segments_produced: inner.segments_produced,
            segments_embedded: inner.segments_embedded,
            segments_committed: inner.segments_committed,
            duplicates_removed: inner.duplicates_removed,
            dedup_conflicts: inner.dedup_conflicts,
            unknown_labels: inner.unknown_labels,
            default_label_applied: inner.default_label_applied,
            media_seconds: inner.media_seconds,
            processing_seconds: inner.processing_seconds,
            failures: inner.failures,
            methods: inner.methods,
        }
    }
}

/// RAII busy marker for a worker gauge. Increments on creation, decrements
/// on drop, so a panicking worker cannot leave the gauge stuck.
pub struct BusyGuard<'a> {
    gauge: &'a AtomicUsize,
}

impl<'a> BusyGuard<'a> {
    pub fn enter(gauge: &'a AtomicUsize) -> Self {
        gauge.fetch_add(1, Ordering::Relaxed);
        Self { gauge }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = IngestionStats::new();
        stats.task_attempted();
        stats.task_attempted();
        stats.transcribed(TranscriptMethod::FastPath, 10, 60.0, 12.0);
        stats.embedded(10);
        stats.committed(9, 1);
        stats.duplicates_removed(3);
        stats.task_failed(FailureKind::Acquisition);

        let snap = stats.snapshot();
        assert_eq!(snap.attempted, 2);
        assert_eq!(snap.persisted, 1);
        assert_eq!(snap.segments_produced, 10);
        assert_eq!(snap.segments_embedded, 10);
        assert_eq!(snap.segments_committed, 9);
        assert_eq!(snap.dedup_conflicts, 1);
        assert_eq!(snap.duplicates_removed, 3);
        assert_eq!(snap.failures[&FailureKind::Acquisition], 1);
        assert_eq!(snap.methods[&TranscriptMethod::FastPath], 1);
        assert!((snap.real_time_factor() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn busy_guard_restores_gauge_on_drop() {
        let stats = IngestionStats::new();
        {
            let _guard = BusyGuard::enter(&stats.asr_busy);
            assert_eq!(stats.asr_busy.load(Ordering::Relaxed), 1);
        }
        assert_eq!(stats.asr_busy.load(Ordering::Relaxed), 0);
    }
}
