//! Optional cross-encoder reranking of recalled chunks.
//!
//! [`HttpReranker`] targets the `/rerank` endpoint of a Text Embeddings
//! Inference (TEI) server. Reranking is an enhancement: [`apply_rerank`]
//! keeps the vector-similarity order whenever the reranker is absent or
//! fails.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::RerankerConfig;
use crate::http::post_json_with_retry;
use crate::models::RetrievedChunk;

#[async_trait]
pub trait Reranker: Send + Sync {
    /// Relevance score of each text for `query`, aligned with `texts`.
    async fn rerank(&self, query: &str, texts: &[String]) -> Result<Vec<f32>>;
}

pub struct HttpReranker {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpReranker {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            endpoint: format!("{}/rerank", base_url.trim_end_matches('/')),
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

#[derive(Deserialize)]
struct RankedText {
    index: usize,
    score: f32,
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn rerank(&self, query: &str, texts: &[String]) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "query": query,
            "texts": texts,
            "truncate": true,
        });
        let json = post_json_with_retry("Reranker", 1, || {
            self.client.post(&self.endpoint).json(&body)
        })
        .await?;
        let ranked: Vec<RankedText> = serde_json::from_value(json)
            .map_err(|e| anyhow!("Invalid reranker response: {}", e))?;
        align_scores(&ranked, texts.len())
    }
}

fn align_scores(ranked: &[RankedText], count: usize) -> Result<Vec<f32>> {
    let mut scores: Vec<Option<f32>> = vec![None; count];
    for r in ranked {
        match scores.get_mut(r.index) {
            Some(slot) => *slot = Some(r.score),
            None => bail!("reranker returned out-of-range index {}", r.index),
        }
    }
    scores
        .into_iter()
        .enumerate()
        .map(|(i, s)| s.ok_or_else(|| anyhow!("reranker returned no score for text {}", i)))
        .collect()
}

/// Build the configured reranker; `None` when disabled.
pub fn create_reranker(config: &RerankerConfig) -> Result<Option<Arc<dyn Reranker>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "tei" => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| anyhow!("reranker.url required for tei provider"))?;
            Ok(Some(Arc::new(HttpReranker::new(
                url,
                Duration::from_secs(config.timeout_secs),
            )?)))
        }
        other => bail!("Unknown reranker provider: {}", other),
    }
}

/// Reorder `chunks` by reranker score, best first.
///
/// Without a reranker, or when it errors, the input order is returned
/// unchanged.
pub async fn apply_rerank(
    reranker: Option<&dyn Reranker>,
    query: &str,
    mut chunks: Vec<RetrievedChunk>,
) -> Vec<RetrievedChunk> {
    let Some(reranker) = reranker else {
        return chunks;
    };
    if chunks.is_empty() {
        return chunks;
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    match reranker.rerank(query, &texts).await {
        Ok(scores) if scores.len() == chunks.len() => {
            for (chunk, score) in chunks.iter_mut().zip(scores) {
                chunk.rerank_score = Some(score);
            }
            chunks.sort_by(|a, b| {
                b.rerank_score
                    .partial_cmp(&a.rerank_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            debug!(candidates = chunks.len(), "reranked");
            chunks
        }
        Ok(scores) => {
            warn!(
                expected = chunks.len(),
                got = scores.len(),
                "reranker score count mismatch, keeping vector order"
            );
            chunks
        }
        Err(e) => {
            warn!(error = %e, "reranker failed, keeping vector order");
            chunks
        }
    }
}
