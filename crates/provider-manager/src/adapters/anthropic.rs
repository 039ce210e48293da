//! Anthropic messages adapter

use super::{
    build_http_client, openai::classify_status, Completion, CompletionOptions, ProbeResult,
    ProviderAdapter, TokenUsage,
};
use crate::config::AiProviderConfig;
use crate::error::{ProviderError, ProviderResult};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const DEFAULT_ENDPOINT: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: Option<MessagesUsage>,
}

/// Adapter for the Anthropic messages API
pub struct AnthropicAdapter {
    provider_id: String,
    client: Client,
    base_url: String,
    model: String,
    api_key: SecretString,
}

impl AnthropicAdapter {
    pub fn new(
        config: &AiProviderConfig,
        api_key: Option<SecretString>,
    ) -> ProviderResult<Self> {
        let api_key = api_key.ok_or_else(|| {
            ProviderError::Config(format!(
                "provider '{}' requires a credential_ref",
                config.provider_id
            ))
        })?;

        let base_url = config
            .endpoint
            .clone()
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

        Ok(Self {
            provider_id: config.provider_id.clone(),
            client: build_http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
        deadline: Duration,
    ) -> ProviderResult<Completion> {
        let mut body = json!({
            "model": self.model,
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
            "messages": [{"role": "user", "content": prompt}],
        });
        if let Some(ref system) = options.system {
            body["system"] = json!(system);
        }

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .timeout(deadline)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(deadline)
                } else {
                    ProviderError::from(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), message));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        let text = parsed
            .content
            .iter()
            .filter(|b| b.block_type == "text")
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        if text.is_empty() {
            return Err(ProviderError::MalformedResponse(
                "response contained no text blocks".to_string(),
            ));
        }

        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.input_tokens.unwrap_or(0),
                completion_tokens: u.output_tokens.unwrap_or(0),
            })
            .unwrap_or_default();

        Ok(Completion { text, usage })
    }

    async fn probe(&self) -> ProbeResult {
        // A minimal one-token request doubles as an auth check
        let body = json!({
            "model": self.model,
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "ping"}],
        });

        let result = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .timeout(Duration::from_secs(5))
            .json(&body)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
            _ => ProbeResult::Unhealthy,
        }
    }
}
