//! Primary parser backed by the Unstructured partition API.
//!
//! Posts the raw file as multipart form data to
//! `{url}/general/v0/general` and joins the `text` of every returned
//! element with a blank line.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

use super::{content_type_for, extension_of, DocumentParser, FileKind};

const PARTITION_PATH: &str = "/general/v0/general";

#[derive(Debug, Deserialize)]
struct Element {
    #[serde(default)]
    text: String,
}

pub struct UnstructuredParser {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    strategy: String,
}

impl UnstructuredParser {
    pub fn new(base_url: &str, api_key: Option<String>, strategy: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), PARTITION_PATH),
            api_key,
            strategy: strategy.to_string(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl DocumentParser for UnstructuredParser {
    fn name(&self) -> &str {
        "unstructured"
    }

    async fn parse(&self, bytes: &[u8], _kind: FileKind, filename: &str) -> Result<String> {
        let part = Part::bytes(bytes.to_vec())
            .file_name(filename.to_string())
            .mime_str(content_type_for(&extension_of(filename)))?;
        let form = Form::new()
            .part("files", part)
            .text("strategy", self.strategy.clone());

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("accept", "application/json")
            .multipart(form);
        if let Some(key) = &self.api_key {
            request = request.header("unstructured-api-key", key);
        }

        let resp = request
            .send()
            .await
            .with_context(|| format!("request to {} failed", self.endpoint))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("partition API error ({}): {}", status, body);
        }

        let elements: Vec<Element> = resp
            .json()
            .await
            .context("failed to parse partition API response")?;
        Ok(join_elements(&elements))
    }
}

fn join_elements(elements: &[Element]) -> String {
    elements
        .iter()
        .map(|e| e.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}
