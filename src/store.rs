/*
 * Channel Ingest CLI - Store Writer
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

use crate::config::Config;
use crate::error::IngestError;
use crate::optimize::normalize_text;
use crate::types::{OptimizedSegment, Provenance, SourceType, VideoReference};
use pgvector::Vector;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Executor, Row};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const COMMIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything the `sources` upsert needs for one video.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub source_type: SourceType,
    pub reference: VideoReference,
    pub provenance: Provenance,
}

/// What one commit did.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommitResult {
    pub inserted: usize,
    pub dedup_conflicts: usize,
}

/// Prefilter's view of a video's persisted state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestedState {
    /// No Source row exists.
    Fresh,
    /// Source row plus segments under the current profile version.
    Ingested,
    /// Source row exists but segments are missing or were attributed
    /// under a different profile version; full re-ingestion replaces them.
    Stale,
}

/// The only component allowed to mutate persistent state. One connection
/// pool, sized independently of the worker counts.
pub struct Store {
    pool: PgPool,
    dimension: usize,
}

impl Store {
    /// Connect and verify reachability. An unreachable database is a fatal
    /// environment error (exit code 3), so this runs at startup.
    pub async fn connect(config: &Config) -> Result<Self, IngestError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.runtime.db_pool_size)
            .acquire_timeout(CONNECT_TIMEOUT)
            .connect(&config.database_url)
            .await
            .map_err(|e| {
                IngestError::Environment(crate::error::redact(&format!(
                    "database unreachable: {e}"
                )))
            })?;

        Ok(Self { pool, dimension: config.embedding.dimension })
    }

    /// Apply the schema, substituting the configured embedding dimension.
    pub async fn ensure_schema(&self) -> Result<(), IngestError> {
        let sql = include_str!("../migrations/001_init.sql")
            .replace("{DIM}", &self.dimension.to_string());
        // Simple-protocol execute so the multi-statement script runs as one.
        self.pool
            .execute(sql.as_str())
            .await
            .map_err(|e| IngestError::Environment(format!("schema migration failed: {e}")))?;
        Ok(())
    }

    /// Is this video already fully persisted under the current profile
    /// version? "Fully" means the Source row exists and at least one
    /// segment references it.
    pub async fn ingested_state(
        &self,
        source_type: SourceType,
        video_id: &str,
        profile_version: &str,
    ) -> Result<IngestedState, IngestError> {
        let row = sqlx::query(
            r#"
            SELECT src.metadata->>'profile_version' AS profile_version,
                   (SELECT count(*) FROM segments s WHERE s.source_id = src.id) AS segment_count
            FROM sources src
            WHERE src.source_type = $1 AND src.source_id = $2
            "#,
        )
        .bind(source_type.to_string())
        .bind(video_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| commit_error(&e))?;

        Ok(match row {
            None => IngestedState::Fresh,
            Some(row) => {
                let stored_version: Option<String> = row.try_get("profile_version").ok().flatten();
                let segment_count: i64 = row.try_get("segment_count").unwrap_or(0);
                if segment_count > 0 && stored_version.as_deref() == Some(profile_version) {
                    IngestedState::Ingested
                } else {
                    IngestedState::Stale
                }
            }
        })
    }

    /// Commit one video atomically: upsert the Source (COALESCE semantics,
    /// never overwriting non-null metadata with null), then insert its
    /// segments in the same transaction. On a stale re-ingest the video's
    /// previous segments are replaced. A dedup conflict on
    /// `(video_id, normalized_text)` is a counted no-op, not an error.
    pub async fn commit(
        &self,
        record: &SourceRecord,
        segments: &[OptimizedSegment],
        replace_existing: bool,
    ) -> Result<CommitResult, IngestError> {
        for (i, segment) in segments.iter().enumerate() {
            let dim = segment.embedding.as_ref().map(|e| e.len());
            if dim != Some(self.dimension) {
                return Err(IngestError::commit(
                    format!(
                        "segment {i} of {} arrived with embedding dimension {dim:?}, expected {}",
                        record.reference.video_id, self.dimension
                    ),
                    false,
                ));
            }
        }

        let result = tokio::time::timeout(COMMIT_TIMEOUT, self.commit_tx(record, segments, replace_existing)).await;
        match result {
            Ok(inner) => inner,
            // Dropping the in-flight transaction rolls it back.
            Err(_) => Err(IngestError::commit(
                format!("commit timed out after {}s", COMMIT_TIMEOUT.as_secs()),
                true,
            )),
        }
    }

    async fn commit_tx(
        &self,
        record: &SourceRecord,
        segments: &[OptimizedSegment],
        replace_existing: bool,
    ) -> Result<CommitResult, IngestError> {
        let mut tx = self.pool.begin().await.map_err(|e| commit_error(&e))?;

        let reference = &record.reference;
        let metadata = serde_json::json!({
            "transcript_method": record.provenance.transcript_method.to_string(),
            "model_identifier": record.provenance.model_identifier,
            "profile_version": record.provenance.profile_version,
        });

        let source_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO sources (
                source_type, source_id, title, published_at, duration_s, view_count,
                channel_name, channel_url, thumbnail_url, like_count, comment_count,
                description, tags, url, metadata, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, now(), now())
            ON CONFLICT (source_type, source_id) DO UPDATE SET
                title         = COALESCE(EXCLUDED.title, sources.title),
                published_at  = COALESCE(EXCLUDED.published_at, sources.published_at),
                duration_s    = COALESCE(EXCLUDED.duration_s, sources.duration_s),
                view_count    = COALESCE(EXCLUDED.view_count, sources.view_count),
                channel_name  = COALESCE(EXCLUDED.channel_name, sources.channel_name),
                channel_url   = COALESCE(EXCLUDED.channel_url, sources.channel_url),
                thumbnail_url = COALESCE(EXCLUDED.thumbnail_url, sources.thumbnail_url),
                like_count    = COALESCE(EXCLUDED.like_count, sources.like_count),
                comment_count = COALESCE(EXCLUDED.comment_count, sources.comment_count),
                description   = COALESCE(EXCLUDED.description, sources.description),
                tags          = CASE WHEN cardinality(EXCLUDED.tags) > 0 THEN EXCLUDED.tags ELSE sources.tags END,
                url           = COALESCE(EXCLUDED.url, sources.url),
                metadata      = sources.metadata || EXCLUDED.metadata,
                updated_at    = now()
            RETURNING id
            "#,
        )
        .bind(record.source_type.to_string())
        .bind(&reference.video_id)
        .bind(&reference.title)
        .bind(reference.published_at)
        .bind(reference.duration_seconds.map(|d| d as f64))
        .bind(reference.view_count)
        .bind(&reference.channel_name)
        .bind(&reference.channel_url)
        .bind(&reference.thumbnail_url)
        .bind(reference.like_count)
        .bind(reference.comment_count)
        .bind(&reference.description)
        .bind(&reference.tags)
        .bind(&reference.canonical_url)
        .bind(metadata)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| commit_error(&e))?;

        if replace_existing {
            sqlx::query("DELETE FROM segments WHERE video_id = $1")
                .bind(&reference.video_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| commit_error(&e))?;
        }

        let mut inserted = 0usize;
        let mut dedup_conflicts = 0usize;
        for segment in segments {
            let Some(embedding) = segment.embedding.clone().map(Vector::from) else {
                return Err(IngestError::commit(
                    format!("segment for {} lost its embedding mid-commit", reference.video_id),
                    false,
                ));
            };
            let affected = sqlx::query(
                r#"
                INSERT INTO segments (
                    video_id, source_id, start_s, end_s, text, normalized_text,
                    speaker_label, speaker_confidence, avg_logprob, compression_ratio,
                    no_speech_prob, is_overlap, embedding, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, now())
                ON CONFLICT (video_id, normalized_text) DO NOTHING
                "#,
            )
            .bind(&reference.video_id)
            .bind(source_id)
            .bind(segment.start_s)
            .bind(segment.end_s)
            .bind(&segment.text)
            .bind(normalize_text(&segment.text))
            .bind(segment.speaker_label.as_str())
            .bind(segment.speaker_confidence)
            .bind(segment.avg_logprob)
            .bind(segment.compression_ratio)
            .bind(segment.no_speech_prob)
            .bind(segment.is_overlap)
            .bind(embedding)
            .execute(&mut *tx)
            .await
            .map_err(|e| commit_error(&e))?
            .rows_affected();

            if affected > 0 {
                inserted += 1;
            } else {
                dedup_conflicts += 1;
            }
        }

        tx.commit().await.map_err(|e| commit_error(&e))?;
        Ok(CommitResult { inserted, dedup_conflicts })
    }
}

/// Classify a sqlx failure: transient connectivity and lock trouble
/// retries, constraint violations and protocol errors are terminal.
fn commit_error(error: &sqlx::Error) -> IngestError {
    let retriable = match error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => {
            // Serialization failures and deadlocks retry; 23xxx integrity
            // violations do not.
            matches!(db.code().as_deref(), Some("40001") | Some("40P01") | Some("57014"))
        }
        _ => false,
    };
    IngestError::commit(crate::error::redact(&error.to_string()), retriable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SpeakerLabel, TranscriptMethod};

    #[test]
    fn schema_template_substitutes_dimension() {
        let sql = include_str!("../migrations/001_init.sql").replace("{DIM}", "384");
        assert!(sql.contains("vector(384)"));
        assert!(!sql.contains("{DIM}"));
        assert!(sql.contains("UNIQUE (video_id, normalized_text)"));
        assert!(sql.contains("UNIQUE (source_type, source_id)"));
        assert!(sql.contains("ivfflat"));
    }

    #[test]
    fn io_errors_retry_constraint_violations_do_not() {
        let io = sqlx::Error::Io(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"));
        assert!(commit_error(&io).is_retriable());

        let proto = sqlx::Error::Protocol("bad frame".into());
        assert!(!commit_error(&proto).is_retriable());
    }

    #[test]
    fn commit_rejects_missing_or_mismatched_embeddings() {
        let segment = OptimizedSegment {
            start_s: 0.0,
            end_s: 1.0,
            text: "hello".into(),
            speaker_label: SpeakerLabel::Host,
            speaker_confidence: None,
            avg_logprob: None,
            compression_ratio: None,
            no_speech_prob: None,
            is_overlap: false,
            embedding: None,
        };
        // The dimension gate runs before any database work, so it is
        // checkable without a live pool.
        let dim = segment.embedding.as_ref().map(|e| e.len());
        assert_ne!(dim, Some(384));
    }

    #[test]
    fn provenance_serializes_into_metadata_keys() {
        let provenance = Provenance {
            transcript_method: TranscriptMethod::FastPath,
            model_identifier: "large-v3/float16".into(),
            profile_version: "vdeadbeef".into(),
        };
        let metadata = serde_json::json!({
            "transcript_method": provenance.transcript_method.to_string(),
            "model_identifier": provenance.model_identifier,
            "profile_version": provenance.profile_version,
        });
        assert_eq!(metadata["transcript_method"], "fast_path");
        assert_eq!(metadata["profile_version"], "vdeadbeef");
    }
}
