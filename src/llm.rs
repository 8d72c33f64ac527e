use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;

const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const MAX_TOKENS: u32 = 8192;
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Binary payload attached to a generation request (PDF filings, page images).
pub struct Attachment {
    pub media_type: &'static str,
    pub data: Vec<u8>,
}

/// The entire model dependency of the pipeline: a prompt (plus optional
/// attachments) in, text that should contain JSON out. Which model answers
/// is configuration, not architecture.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, prompt: &str, attachments: &[Attachment]) -> Result<String>;

    fn model_name(&self) -> &str;
}

/// Anthropic Messages API client.
pub struct AnthropicClient {
    api_key: String,
    client: reqwest::Client,
    model: String,
}

impl AnthropicClient {
    pub fn new(api_key: String, model: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            api_key,
            client,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        })
    }

    pub fn from_env(model: Option<String>) -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| anyhow!("ANTHROPIC_API_KEY environment variable not set"))?;
        Self::new(api_key, model)
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn generate(&self, prompt: &str, attachments: &[Attachment]) -> Result<String> {
        let mut content = Vec::new();
        let b64 = base64::engine::general_purpose::STANDARD;
        for att in attachments {
            let block_type = if att.media_type == "application/pdf" {
                "document"
            } else {
                "image"
            };
            content.push(json!({
                "type": block_type,
                "source": {
                    "type": "base64",
                    "media_type": att.media_type,
                    "data": b64.encode(&att.data),
                }
            }));
        }
        content.push(json!({ "type": "text", "text": prompt }));

        let response = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&json!({
                "model": &self.model,
                "max_tokens": MAX_TOKENS,
                "messages": [{ "role": "user", "content": content }]
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("model API error {}: {}", status, body));
        }

        #[derive(Deserialize)]
        struct ContentBlock {
            text: Option<String>,
        }
        #[derive(Deserialize)]
        struct ApiResponse {
            content: Vec<ContentBlock>,
        }

        let api_response: ApiResponse = response.json().await?;
        api_response
            .content
            .first()
            .and_then(|c| c.text.clone())
            .ok_or_else(|| anyhow!("empty model response"))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_model() {
        let client = AnthropicClient::new("test-key".into(), None).unwrap();
        assert_eq!(client.model_name(), DEFAULT_MODEL);
    }

    #[test]
    fn model_override() {
        let client =
            AnthropicClient::new("test-key".into(), Some("claude-3-haiku".into())).unwrap();
        assert_eq!(client.model_name(), "claude-3-haiku");
    }
}
