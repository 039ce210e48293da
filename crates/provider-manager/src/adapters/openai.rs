//! OpenAI chat-completions adapter
//!
//! Also serves `custom` providers: any OpenAI-compatible endpoint works
//! by overriding the base URL.

use super::{
    build_http_client, Completion, CompletionOptions, ProbeResult, ProviderAdapter, TokenUsage,
};
use crate::config::AiProviderConfig;
use crate::error::{ProviderError, ProviderResult};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1";

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

/// Adapter for OpenAI and OpenAI-compatible APIs
pub struct OpenAiAdapter {
    provider_id: String,
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
}

impl OpenAiAdapter {
    pub fn new(
        config: &AiProviderConfig,
        api_key: Option<SecretString>,
    ) -> ProviderResult<Self> {
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

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.post(format!("{}{}", self.base_url, path));
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key.expose_secret());
        }
        req
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
        deadline: Duration,
    ) -> ProviderResult<Completion> {
        let mut messages = Vec::new();
        if let Some(ref system) = options.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": prompt}));

        let body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
        });

        let response = self
            .request("/chat/completions")
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

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        let text = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| {
                ProviderError::MalformedResponse("response contained no choices".to_string())
            })?;

        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens.unwrap_or(0),
                completion_tokens: u.completion_tokens.unwrap_or(0),
            })
            .unwrap_or_default();

        Ok(Completion { text, usage })
    }

    async fn probe(&self) -> ProbeResult {
        // Models listing is the cheapest authenticated call
        let mut req = self
            .client
            .get(format!("{}/models", self.base_url))
            .timeout(Duration::from_secs(5));
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        match req.send().await {
            Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
            _ => ProbeResult::Unhealthy,
        }
    }
}

/// Map an HTTP status into the retriable/terminal split
pub(crate) fn classify_status(status: u16, message: String) -> ProviderError {
    match status {
        429 => ProviderError::Retriable { status, message },
        s if s >= 500 => ProviderError::Retriable { status, message },
        s => ProviderError::Client { status: s, message },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert!(classify_status(500, "".into()).is_retryable());
        assert!(classify_status(429, "".into()).is_retryable());
        assert!(!classify_status(401, "".into()).is_retryable());
        assert!(!classify_status(422, "".into()).is_retryable());
    }

    #[test]
    fn test_response_parsing() {
        let raw = r#"{
            "choices": [{"message": {"content": "SELECT 1"}}],
            "usage": {"prompt_tokens": 42, "completion_tokens": 7}
        }"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(
            parsed.choices[0].message.content.as_deref(),
            Some("SELECT 1")
        );
        assert_eq!(parsed.usage.unwrap().prompt_tokens, Some(42));
    }
}
