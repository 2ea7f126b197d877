/*
 * Channel Ingest CLI - Text Embedder
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

use crate::config::EmbeddingConfig;
use crate::error::IngestError;
use crate::model_pool::ModelPool;
use crate::types::OptimizedSegment;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TRANSIENT_RETRIES: u32 = 3;

/// Computes dense vectors for optimized segments through an
/// OpenAI-compatible `/embeddings` endpoint. Batch size adapts downward on
/// memory-classified failures and honours a server-reported batch cap.
pub struct EmbeddingClient {
    client: Client,
    api_base: String,
    api_key: Option<String>,
    model: String,
    dimension: usize,
    initial_batch: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    index: usize,
    embedding: Vec<f32>,
}

enum BatchFailure {
    /// Memory-classified: halve the batch and retry.
    Memory(String),
    /// Server said the batch is over its native limit.
    BatchCap(usize, String),
    /// Worth retrying at the same size (network, 429, 5xx).
    Transient(String),
    /// Anything else.
    Terminal(String),
}

impl EmbeddingClient {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            client: Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model_identifier.clone(),
            dimension: config.dimension,
            initial_batch: config.batch_size.max(1),
        }
    }

    /// Attach an embedding to every segment, in place. Per-video order is
    /// preserved. Returns the batch size the run settled on.
    pub async fn embed_segments(
        &self,
        segments: &mut [OptimizedSegment],
        pool: &Arc<ModelPool>,
        cancel: &CancellationToken,
    ) -> Result<usize, IngestError> {
        if segments.is_empty() {
            return Ok(self.initial_batch);
        }

        let mut batch_size = self.initial_batch;
        let mut cursor = 0usize;

        while cursor < segments.len() {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }

            let upper = (cursor + batch_size).min(segments.len());
            let texts: Vec<String> =
                segments[cursor..upper].iter().map(|s| s.text.clone()).collect();

            let lease = pool.acquire_embed(texts.len(), cancel).await?;
            let outcome = self.request_batch(&texts).await;
            drop(lease);

            match outcome {
                Ok(vectors) => {
                    for (segment, vector) in segments[cursor..upper].iter_mut().zip(vectors) {
                        segment.embedding = Some(vector);
                    }
                    cursor = upper;
                }
                Err(BatchFailure::Memory(message)) => {
                    if batch_size == 1 {
                        return Err(IngestError::model(
                            format!("embedding OOM at batch size 1: {message}"),
                            true,
                        ));
                    }
                    batch_size = (batch_size / 2).max(1);
                    tracing::warn!("embedding batch halved to {batch_size}: {message}");
                }
                Err(BatchFailure::BatchCap(cap, message)) => {
                    let cap = cap.max(1);
                    if cap >= batch_size {
                        return Err(IngestError::model(
                            format!("embedding server rejected batch without a usable cap: {message}"),
                            false,
                        ));
                    }
                    batch_size = cap;
                    tracing::warn!("embedding batch capped at {batch_size} by server");
                }
                Err(BatchFailure::Transient(message)) => {
                    let mut tries = 1;
                    loop {
                        if tries > TRANSIENT_RETRIES {
                            return Err(IngestError::model(
                                format!("embedding request kept failing: {message}"),
                                false,
                            ));
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_millis(500 * tries as u64)) => {}
                            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                        }
                        let lease = pool.acquire_embed(texts.len(), cancel).await?;
                        let retry = self.request_batch(&texts).await;
                        drop(lease);
                        match retry {
                            Ok(vectors) => {
                                for (segment, vector) in
                                    segments[cursor..upper].iter_mut().zip(vectors)
                                {
                                    segment.embedding = Some(vector);
                                }
                                cursor = upper;
                                break;
                            }
                            Err(BatchFailure::Transient(_)) => tries += 1,
                            Err(BatchFailure::Memory(m)) => {
                                batch_size = (batch_size / 2).max(1);
                                tracing::warn!("embedding batch halved to {batch_size}: {m}");
                                break;
                            }
                            Err(BatchFailure::BatchCap(cap, _)) => {
                                batch_size = cap.max(1).min(batch_size);
                                break;
                            }
                            Err(BatchFailure::Terminal(m)) => {
                                return Err(IngestError::model(m, false))
                            }
                        }
                    }
                }
                Err(BatchFailure::Terminal(message)) => {
                    return Err(IngestError::model(message, false));
                }
            }
        }

        Ok(batch_size)
    }

    /// One POST to `/embeddings`. The response is validated in full
    /// (count, order, dimension) before anything is returned.
    async fn request_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BatchFailure> {
        let url = format!("{}/embeddings", self.api_base);
        let mut request = self
            .client
            .post(&url)
            .json(&json!({ "model": self.model, "input": texts }));
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| BatchFailure::Transient(format!("embedding request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status.as_u16(), &body));
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| BatchFailure::Terminal(format!("invalid embeddings response: {e}")))?;

        if parsed.data.len() != texts.len() {
            return Err(BatchFailure::Terminal(format!(
                "embedding count mismatch: sent {}, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        let mut rows = parsed.data;
        rows.sort_by_key(|row| row.index);
        for row in &rows {
            if row.embedding.len() != self.dimension {
                return Err(BatchFailure::Terminal(format!(
                    "embedding dimension mismatch: expected {}, got {}",
                    self.dimension,
                    row.embedding.len()
                )));
            }
        }

        Ok(rows.into_iter().map(|row| row.embedding).collect())
    }
}

fn classify_failure(status: u16, body: &str) -> BatchFailure {
    let lowered = body.to_lowercase();

    if let Some(cap) = parse_batch_cap(&lowered) {
        return BatchFailure::BatchCap(cap, truncate(body));
    }
    if status == 413
        || lowered.contains("out of memory")
        || lowered.contains("oom")
        || lowered.contains("cuda")
        || lowered.contains("insufficient memory")
    {
        return BatchFailure::Memory(truncate(body));
    }
    if status == 429 || status >= 500 {
        return BatchFailure::Transient(format!("status {status}: {}", truncate(body)));
    }
    BatchFailure::Terminal(format!("embedding server status {status}: {}", truncate(body)))
}

/// Servers phrase their native limit as "maximum batch size is N" or
/// "batch size N exceeded"; pick the number out either way.
fn parse_batch_cap(body: &str) -> Option<usize> {
    let re = regex::Regex::new(r"(?:maximum batch size(?: is)?|batch size limit(?: of)?)\s+(\d+)")
        .ok()?;
    re.captures(body)?.get(1)?.as_str().parse().ok()
}

fn truncate(body: &str) -> String {
    let mut out: String = body.chars().take(200).collect();
    if out.len() < body.len() {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::types::SpeakerLabel;

    fn segment(text: &str) -> OptimizedSegment {
        OptimizedSegment {
            start_s: 0.0,
            end_s: 1.0,
            text: text.to_string(),
            speaker_label: SpeakerLabel::Host,
            speaker_confidence: Some(0.9),
            avg_logprob: None,
            compression_ratio: None,
            no_speech_prob: None,
            is_overlap: false,
            embedding: None,
        }
    }

    fn client_for(server: &mockito::ServerGuard, dimension: usize, batch: usize) -> EmbeddingClient {
        let mut config = crate::config::EmbeddingConfig::default();
        config.api_base = server.url();
        config.dimension = dimension;
        config.batch_size = batch;
        EmbeddingClient::new(&config)
    }

    fn test_pool() -> Arc<ModelPool> {
        let config = Config::load().unwrap();
        ModelPool::new(&config)
    }

    fn embeddings_body(count: usize, dimension: usize) -> String {
        let data: Vec<serde_json::Value> = (0..count)
            .map(|i| json!({ "index": i, "embedding": vec![0.1f32; dimension] }))
            .collect();
        json!({ "data": data }).to_string()
    }

    #[tokio::test]
    async fn embeds_all_segments_in_one_batch() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/embeddings")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(embeddings_body(3, 8))
            .create_async()
            .await;

        let client = client_for(&server, 8, 64);
        let pool = test_pool();
        let cancel = CancellationToken::new();
        let mut segments = vec![segment("one"), segment("two"), segment("three")];

        let final_batch = client.embed_segments(&mut segments, &pool, &cancel).await.unwrap();
        assert_eq!(final_batch, 64);
        assert!(segments.iter().all(|s| s.embedding.as_ref().map(|e| e.len()) == Some(8)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn oom_halves_the_batch_until_it_fits() {
        let mut server = mockito::Server::new_async().await;
        // The full four-text batch hits an OOM; the two halves succeed.
        // Later mocks take precedence in mockito, so the catch-all comes
        // first and the regex-matched failure second.
        let ok = server
            .mock("POST", "/embeddings")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(embeddings_body(2, 4))
            .expect(2)
            .create_async()
            .await;
        let oom = server
            .mock("POST", "/embeddings")
            .match_body(mockito::Matcher::Regex("t0(.|\n)*t3".to_string()))
            .with_status(500)
            .with_body("CUDA out of memory")
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server, 4, 4);
        let pool = test_pool();
        let cancel = CancellationToken::new();
        let mut segments = vec![segment("t0"), segment("t1"), segment("t2"), segment("t3")];

        let final_batch = client.embed_segments(&mut segments, &pool, &cancel).await.unwrap();
        assert_eq!(final_batch, 2);
        assert!(segments.iter().all(|s| s.embedding.is_some()));
        oom.assert_async().await;
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn wrong_dimension_is_rejected_before_any_write() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/embeddings")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(embeddings_body(2, 16))
            .create_async()
            .await;

        let client = client_for(&server, 8, 64);
        let pool = test_pool();
        let cancel = CancellationToken::new();
        let mut segments = vec![segment("a"), segment("b")];

        let result = client.embed_segments(&mut segments, &pool, &cancel).await;
        assert!(matches!(result, Err(IngestError::Model { oom: false, .. })));
        assert!(segments.iter().all(|s| s.embedding.is_none()));
    }

    #[tokio::test]
    async fn server_batch_cap_is_honoured() {
        let mut server = mockito::Server::new_async().await;
        let ok = server
            .mock("POST", "/embeddings")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(embeddings_body(2, 4))
            .create_async()
            .await;
        let capped = server
            .mock("POST", "/embeddings")
            .match_body(mockito::Matcher::Regex("t0(.|\n)*t2".to_string()))
            .with_status(400)
            .with_body("maximum batch size is 2")
            .expect(1)
            .create_async()
            .await;

        let client = client_for(&server, 4, 8);
        let pool = test_pool();
        let cancel = CancellationToken::new();
        let mut segments = vec![segment("t0"), segment("t1"), segment("t2"), segment("t3")];

        let final_batch = client.embed_segments(&mut segments, &pool, &cancel).await.unwrap();
        assert_eq!(final_batch, 2);
        assert!(segments.iter().all(|s| s.embedding.is_some()));
        capped.assert_async().await;
        drop(ok);
    }

    #[test]
    fn parses_batch_cap_phrasings() {
        assert_eq!(parse_batch_cap("maximum batch size is 32"), Some(32));
        assert_eq!(parse_batch_cap("maximum batch size 16"), Some(16));
        assert_eq!(parse_batch_cap("batch size limit of 8 reached"), Some(8));
        assert_eq!(parse_batch_cap("out of memory"), None);
    }

    #[test]
    fn classification_separates_memory_transient_terminal() {
        assert!(matches!(classify_failure(500, "CUDA out of memory"), BatchFailure::Memory(_)));
        assert!(matches!(classify_failure(413, "payload too large"), BatchFailure::Memory(_)));
        assert!(matches!(classify_failure(429, "slow down"), BatchFailure::Transient(_)));
        assert!(matches!(classify_failure(503, "warming up"), BatchFailure::Transient(_)));
        assert!(matches!(classify_failure(401, "bad key"), BatchFailure::Terminal(_)));
    }
}
