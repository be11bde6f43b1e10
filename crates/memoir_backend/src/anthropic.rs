use anyhow::{Context, Result};
use async_trait::async_trait;
use memoir_core::config::LlmConfig;
use memoir_core::{
    DraftChapter, GenerationMode, GenerationRequest, NarrativeDraft, TextBackend,
};
use reqwest::Client;
use serde_json::json;
use std::env;

use crate::prompt;
use crate::retry::{classify_response, with_retry, RetryConfig};

/// Anthropic messages-API implementation of the text backend.
///
/// Without `ANTHROPIC_API_KEY` set it runs in mock mode, returning a
/// deterministic draft so local development never needs credentials.
#[derive(Debug, Clone)]
pub struct AnthropicBackend {
    client: Client,
    api_key: String,
    config: LlmConfig,
    retry: RetryConfig,
}

impl AnthropicBackend {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = env::var("ANTHROPIC_API_KEY").unwrap_or_else(|_| "mock".to_string());
        Ok(Self {
            client: Client::new(),
            api_key,
            config: config.clone(),
            retry: RetryConfig::from_llm(config),
        })
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.anthropic.com".to_string());
        format!("{}/v1/messages", base.trim_end_matches('/'))
    }

    fn mock_draft(request: &GenerationRequest) -> NarrativeDraft {
        let chapters = match request.mode {
            GenerationMode::FullBiography => vec![DraftChapter {
                title: "(mock) The Whole Story".to_string(),
                content: format!(
                    "(mock) A chapter woven from {} memories.",
                    request.context.memories.len()
                ),
                life_period: memoir_core::LifePeriod::Comprehensive,
                age_range_start: None,
                age_range_end: None,
                memory_ids: request.context.memories.iter().map(|m| m.id).collect(),
            }],
            GenerationMode::ChapterUpdate | GenerationMode::MemoryInsertion => {
                let memory = request.context.memories.first();
                vec![DraftChapter {
                    title: "(mock) A New Thread".to_string(),
                    content: format!(
                        "(mock) Woven around \"{}\".",
                        memory.map(|m| m.title.as_str()).unwrap_or("nothing")
                    ),
                    life_period: memoir_core::LifePeriod::Comprehensive,
                    age_range_start: None,
                    age_range_end: None,
                    memory_ids: memory.map(|m| vec![m.id]).unwrap_or_default(),
                }]
            }
        };
        NarrativeDraft {
            introduction: "(mock) An introduction.".to_string(),
            chapters,
            conclusion: "(mock) A conclusion.".to_string(),
        }
    }
}

#[async_trait]
impl TextBackend for AnthropicBackend {
    async fn generate(&self, request: &GenerationRequest) -> Result<NarrativeDraft> {
        if self.api_key == "mock" {
            // Mock delay to simulate network
            tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
            return Ok(Self::mock_draft(request));
        }

        let prompt_text = prompt::render(request)?;
        let url = self.endpoint();
        let body = json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "messages": [
                {"role": "user", "content": prompt_text}
            ]
        });

        let response = with_retry(&self.retry, "Anthropic", || async {
            let sent = self
                .client
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01")
                .json(&body)
                .send()
                .await;
            classify_response(sent).await
        })
        .await?;

        let json: serde_json::Value = response
            .json()
            .await
            .context("Failed to read Anthropic response body")?;
        let text = json["content"][0]["text"]
            .as_str()
            .context("Failed to parse response content")?;

        prompt::parse_draft(text)
    }
}
