//! Wiring of configured backends into the ingestion and query services.

use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::info;

use crate::config::Config;
use crate::embedding::create_provider;
use crate::extract::unstructured::UnstructuredParser;
use crate::extract::{Extractor, LocalParser};
use crate::generate::create_generator;
use crate::ingest::Ingestor;
use crate::query::Retriever;
use crate::rerank::create_reranker;
use crate::store::{FsObjectStore, ObjectStore, S3ObjectStore, SqliteStore};

/// Everything a CLI command or the HTTP server needs.
#[derive(Clone)]
pub struct App {
    pub config: Arc<Config>,
    pub ingestor: Ingestor,
    pub retriever: Retriever,
}

impl App {
    pub async fn from_config(config: Config) -> Result<Self> {
        let store = Arc::new(SqliteStore::open(&config.db.path).await?);

        let objects: Arc<dyn ObjectStore> = match config.storage.backend.as_str() {
            "fs" => Arc::new(FsObjectStore::new(config.storage.root.clone())),
            "s3" => Arc::new(S3ObjectStore::from_config(&config.storage)?),
            other => bail!("Unknown storage backend: '{}'", other),
        };

        let mut extractor = Extractor::new(config.extract.resolver()?, config.extract.parser_timeout())
            .with_local(LocalParser::default());
        if let Some(unstructured) = &config.extract.unstructured {
            let api_key = std::env::var(&unstructured.api_key_env).ok();
            extractor = extractor.with_primary(Arc::new(UnstructuredParser::new(
                &unstructured.url,
                api_key,
                &unstructured.strategy,
            )));
            info!(url = %unstructured.url, "primary parser enabled");
        }

        let embedder = create_provider(&config.embedding)?;
        let reranker = create_reranker(&config.reranker)?;
        let generator = create_generator(&config.generation)?;

        let ingestor = Ingestor::new(
            store.clone(),
            store.clone(),
            objects,
            Arc::new(extractor),
            embedder.clone(),
            config.chunking.params()?,
        )
        .with_embed_batch_size(config.embedding.batch_size)
        .with_max_file_bytes(config.extract.max_file_bytes);

        let retriever = Retriever::new(store.clone(), store, embedder, config.retrieval.clone())
            .with_reranker(reranker)
            .with_generator(generator, &config.generation.system_prompt);

        Ok(Self {
            config: Arc::new(config),
            ingestor,
            retriever,
        })
    }
}
