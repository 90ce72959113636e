//! Query-time retrieval and answer generation.
//!
//! `retrieve`: embed the query, recall `initial_top_k` candidates by cosine
//! similarity, load their chunk text, optionally rerank, keep `top_k`.
//! `ask`: `retrieve` plus a grounded prompt sent to the configured generator.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::embedding::{embed_query, EmbeddingProvider};
use crate::generate::Generator;
use crate::models::RetrievedChunk;
use crate::rerank::{apply_rerank, Reranker};
use crate::store::{MetadataStore, VectorStore};

pub const NO_CONTEXT_ANSWER: &str =
    "I could not find any relevant information in the knowledge base to answer this question.";

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<RetrievedChunk>,
}

#[derive(Clone)]
pub struct Retriever {
    metadata: Arc<dyn MetadataStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    reranker: Option<Arc<dyn Reranker>>,
    generator: Option<Arc<dyn Generator>>,
    system_prompt: String,
    settings: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        settings: RetrievalConfig,
    ) -> Self {
        Self {
            metadata,
            vectors,
            embedder,
            reranker: None,
            generator: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            settings,
        }
    }

    pub fn with_reranker(mut self, reranker: Option<Arc<dyn Reranker>>) -> Self {
        self.reranker = reranker;
        self
    }

    pub fn with_generator(mut self, generator: Option<Arc<dyn Generator>>, system_prompt: &str) -> Self {
        self.generator = generator;
        self.system_prompt = system_prompt.to_string();
        self
    }

    /// Most relevant chunks for `query`, best first.
    pub async fn retrieve(&self, query: &str, top_k: Option<usize>) -> Result<Vec<RetrievedChunk>> {
        let query = query.trim();
        if query.is_empty() {
            bail!("query must not be empty");
        }
        if !self.embedder.is_enabled() {
            bail!("retrieval requires an embedding provider; set [embedding] provider in config");
        }
        let top_k = top_k.unwrap_or(self.settings.final_top_k);
        if top_k == 0 {
            bail!("top_k must be >= 1");
        }

        let vector = embed_query(self.embedder.as_ref(), query).await?;
        let recall = self.settings.initial_top_k.max(top_k);
        let hits = self.vectors.query(&vector, recall).await?;
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = hits.iter().map(|h| h.chunk_id.clone()).collect();
        let mut by_id: HashMap<String, _> = self
            .metadata
            .get_chunks_by_ids(&ids)
            .await?
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        let mut candidates = Vec::with_capacity(hits.len());
        for hit in hits {
            match by_id.remove(&hit.chunk_id) {
                Some(chunk) => candidates.push(RetrievedChunk {
                    chunk_id: chunk.id,
                    document_id: chunk.document_id,
                    chunk_index: chunk.chunk_index,
                    text: chunk.text,
                    score: hit.score,
                    rerank_score: None,
                }),
                None => warn!(chunk_id = %hit.chunk_id, "vector has no matching chunk, skipping"),
            }
        }
        debug!(candidates = candidates.len(), "recalled");

        let mut ranked = apply_rerank(self.reranker.as_deref(), query, candidates).await;
        ranked.truncate(top_k);
        Ok(ranked)
    }

    /// Answer `question` from retrieved context.
    pub async fn ask(&self, question: &str, top_k: Option<usize>) -> Result<Answer> {
        let Some(generator) = self.generator.as_ref() else {
            bail!("answer generation is disabled; set [generation] provider in config");
        };

        let sources = self.retrieve(question, top_k).await?;
        if sources.is_empty() {
            return Ok(Answer {
                answer: NO_CONTEXT_ANSWER.to_string(),
                sources,
            });
        }

        let prompt = build_prompt(question.trim(), &sources);
        let answer = generator.generate(&self.system_prompt, &prompt).await?;
        Ok(Answer { answer, sources })
    }
}

fn build_prompt(question: &str, sources: &[RetrievedChunk]) -> String {
    let mut prompt = String::from(
        "Answer the question using only the context below. \
         If the context does not contain the answer, say so.\n\nContext:\n",
    );
    for (i, source) in sources.iter().enumerate() {
        prompt.push_str(&format!("[{}] {}\n\n", i + 1, source.text));
    }
    prompt.push_str(&format!("Question: {}\nAnswer:", question));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_numbers_sources_in_order() {
        let sources = vec![
            RetrievedChunk {
                chunk_id: "a".into(),
                document_id: "d".into(),
                chunk_index: 0,
                text: "The sky is blue.".into(),
                score: 0.9,
                rerank_score: None,
            },
            RetrievedChunk {
                chunk_id: "b".into(),
                document_id: "d".into(),
                chunk_index: 1,
                text: "Grass is green.".into(),
                score: 0.8,
                rerank_score: None,
            },
        ];
        let prompt = build_prompt("What colour is the sky?", &sources);
        let first = prompt.find("[1] The sky is blue.").unwrap();
        let second = prompt.find("[2] Grass is green.").unwrap();
        assert!(first < second);
        assert!(prompt.ends_with("Question: What colour is the sky?\nAnswer:"));
    }
}
