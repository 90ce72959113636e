//! Answer generation through an OpenAI-compatible chat completions API.
//!
//! One client covers OpenAI, Ollama and any server that speaks
//! `/v1/chat/completions` (llama.cpp, vLLM, TGI). Used at query time only.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::config::GenerationConfig;
use crate::http::post_json_with_retry;

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, system: &str, prompt: &str) -> Result<String>;
}

pub struct ChatCompletionsGenerator {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    client: reqwest::Client,
}

impl ChatCompletionsGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("generation.model required"))?;

        let (base, api_key) = match config.provider.as_str() {
            "openai" => {
                let key = std::env::var("OPENAI_API_KEY")
                    .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
                (
                    config
                        .url
                        .clone()
                        .unwrap_or_else(|| "https://api.openai.com".to_string()),
                    Some(key),
                )
            }
            "ollama" => (
                config
                    .url
                    .clone()
                    .unwrap_or_else(|| "http://localhost:11434".to_string()),
                None,
            ),
            "openai-compatible" => (
                config
                    .url
                    .clone()
                    .ok_or_else(|| anyhow!("generation.url required for openai-compatible"))?,
                std::env::var("GENERATION_API_KEY").ok(),
            ),
            other => bail!("Unknown generation provider: {}", other),
        };

        Ok(Self {
            endpoint: format!("{}/v1/chat/completions", base.trim_end_matches('/')),
            model,
            api_key,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
        })
    }

    fn request_body(&self, system: &str, prompt: &str) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "top_p": self.top_p,
            "stream": false,
        })
    }
}

#[async_trait]
impl Generator for ChatCompletionsGenerator {
    async fn generate(&self, system: &str, prompt: &str) -> Result<String> {
        let body = self.request_body(system, prompt);
        let json = post_json_with_retry("Generation", 2, || {
            let req = self.client.post(&self.endpoint).json(&body);
            match &self.api_key {
                Some(key) => req.header("Authorization", format!("Bearer {}", key)),
                None => req,
            }
        })
        .await?;
        parse_completion(&json)
    }
}

fn parse_completion(json: &serde_json::Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|c| c.trim().to_string())
        .ok_or_else(|| anyhow!("Invalid completion response: missing choices[0].message.content"))
}

/// Build the configured generator; `None` when disabled.
pub fn create_generator(config: &GenerationConfig) -> Result<Option<Arc<dyn Generator>>> {
    if !config.is_enabled() {
        return Ok(None);
    }
    Ok(Some(Arc::new(ChatCompletionsGenerator::new(config)?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ollama_config() -> GenerationConfig {
        GenerationConfig {
            provider: "ollama".to_string(),
            model: Some("qwen2.5:7b".to_string()),
            ..GenerationConfig::default()
        }
    }

    #[test]
    fn ollama_endpoint_and_sampling_parameters() {
        let generator = ChatCompletionsGenerator::new(&ollama_config()).unwrap();
        assert_eq!(generator.endpoint, "http://localhost:11434/v1/chat/completions");

        let body = generator.request_body("sys", "question");
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["messages"][0]["content"], "sys");
        assert_eq!(body["messages"][1]["role"], "user");
        assert!((body["top_p"].as_f64().unwrap() - 0.9).abs() < 1e-6);
    }

    #[test]
    fn completion_content_extracted() {
        let json = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "  The answer.  "}}]
        });
        assert_eq!(parse_completion(&json).unwrap(), "The answer.");
        assert!(parse_completion(&serde_json::json!({"choices": []})).is_err());
    }

    #[test]
    fn disabled_builds_none() {
        assert!(create_generator(&GenerationConfig::default()).unwrap().is_none());
    }
}
