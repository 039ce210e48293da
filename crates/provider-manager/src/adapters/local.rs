//! Local model adapter (Ollama-compatible generate API)
//!
//! The only adapter admissible in air-gapped mode without further
//! qualification. No credential is required; the endpoint is mandatory.

use super::{
    build_http_client, Completion, CompletionOptions, ProbeResult, ProviderAdapter, TokenUsage,
};
use crate::config::AiProviderConfig;
use crate::error::{ProviderError, ProviderResult};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    prompt_eval_count: Option<u64>,
    eval_count: Option<u64>,
}

/// Adapter for locally hosted models speaking the Ollama API
pub struct LocalAdapter {
    provider_id: String,
    client: Client,
    base_url: String,
    model: String,
}

impl LocalAdapter {
    pub fn new(config: &AiProviderConfig) -> ProviderResult<Self> {
        let base_url = config.endpoint.clone().ok_or_else(|| {
            ProviderError::Config(format!(
                "local provider '{}' requires an endpoint",
                config.provider_id
            ))
        })?;

        Ok(Self {
            provider_id: config.provider_id.clone(),
            client: build_http_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl ProviderAdapter for LocalAdapter {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
        deadline: Duration,
    ) -> ProviderResult<Completion> {
        let full_prompt = match options.system {
            Some(ref system) => format!("{}\n\n{}", system, prompt),
            None => prompt.to_string(),
        };

        let body = json!({
            "model": self.model,
            "prompt": full_prompt,
            "stream": false,
            "options": {
                "temperature": options.temperature,
                "num_predict": options.max_tokens,
            },
        });

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
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
            return Err(if status.is_server_error() {
                ProviderError::Retriable {
                    status: status.as_u16(),
                    message,
                }
            } else {
                ProviderError::Client {
                    status: status.as_u16(),
                    message,
                }
            });
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        Ok(Completion {
            text: parsed.response,
            usage: TokenUsage {
                prompt_tokens: parsed.prompt_eval_count.unwrap_or(0),
                completion_tokens: parsed.eval_count.unwrap_or(0),
            },
        })
    }

    async fn probe(&self) -> ProbeResult {
        match self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
            _ => ProbeResult::Unhealthy,
        }
    }
}
