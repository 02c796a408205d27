use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use thiserror::Error;

use crate::core::config::Settings;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionOptions {
    pub max_tokens: u32,
    pub temperature: f64,
}

/// The reasoning service could not produce a completion. Distinct from a
/// completion that arrived but cannot be parsed.
#[derive(Debug, Error)]
pub enum ReasoningUnavailable {
    #[error("reasoning service is not configured")]
    NotConfigured,
    #[error("reasoning service returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("reasoning service transport error: {0}")]
    Transport(String),
    #[error("reasoning service response has no completion text")]
    MalformedEnvelope,
    #[error("reasoning service did not answer within {0:?}")]
    Timeout(Duration),
}

impl ReasoningUnavailable {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            Self::NotConfigured => "not_configured",
            Self::Status { .. } => "status",
            Self::Transport(_) => "transport",
            Self::MalformedEnvelope => "malformed",
            Self::Timeout(_) => "timeout",
        }
    }
}

#[async_trait]
pub trait ReasoningClient: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: CompletionOptions,
    ) -> Result<String, ReasoningUnavailable>;
}

/// Runs one completion with an overall deadline, whatever the client does internally.
pub(crate) async fn complete_within(
    client: &dyn ReasoningClient,
    timeout: Duration,
    system_prompt: &str,
    user_prompt: &str,
    options: CompletionOptions,
) -> Result<String, ReasoningUnavailable> {
    let timer = Instant::now();
    let result = bounded(timeout, client.complete(system_prompt, user_prompt, options)).await;

    let status = match &result {
        Ok(_) => "ok",
        Err(err) => err.label(),
    };
    metrics::counter!("reasoning_requests_total", "status" => status).increment(1);
    metrics::histogram!("reasoning_duration_seconds").record(timer.elapsed().as_secs_f64());

    result
}

async fn bounded<F>(timeout: Duration, call: F) -> Result<String, ReasoningUnavailable>
where
    F: Future<Output = Result<String, ReasoningUnavailable>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ReasoningUnavailable::Timeout(timeout)),
    }
}

/// Chat-completions client for OpenAI-compatible endpoints.
#[derive(Debug, Clone)]
pub(crate) struct OpenAiReasoningClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_retries: u32,
}

impl OpenAiReasoningClient {
    pub(crate) fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(settings.ai().ai_request_timeout);
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_key: settings.ai().openai_api_key.clone(),
            base_url: settings.ai().openai_base_url.trim_end_matches('/').to_string(),
            model: settings.ai().ai_model.clone(),
            max_retries: settings.ai().ai_max_retries,
        })
    }

    fn payload(&self, system_prompt: &str, user_prompt: &str, options: CompletionOptions) -> Value {
        json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt}
            ],
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
        })
    }

    async fn send_once(&self, url: &str, payload: &Value) -> Result<Value, ReasoningUnavailable> {
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .await
            .map_err(|err| ReasoningUnavailable::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReasoningUnavailable::Status { status: status.as_u16(), body });
        }

        response.json().await.map_err(|_| ReasoningUnavailable::MalformedEnvelope)
    }
}

#[async_trait]
impl ReasoningClient for OpenAiReasoningClient {
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: CompletionOptions,
    ) -> Result<String, ReasoningUnavailable> {
        if self.api_key.is_empty() {
            return Err(ReasoningUnavailable::NotConfigured);
        }

        let url = format!("{}/chat/completions", self.base_url);
        let payload = self.payload(system_prompt, user_prompt, options);

        let mut attempt = 0;
        let body = loop {
            match self.send_once(&url, &payload).await {
                Ok(body) => break body,
                Err(err) if attempt < self.max_retries && is_retryable(&err) => {
                    tracing::warn!(attempt, error = %err, "Reasoning request failed; retrying");
                    tokio::time::sleep(Duration::from_secs(2_u64.pow(attempt))).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        };

        let tokens_used = body
            .get("usage")
            .and_then(|usage| usage.get("total_tokens"))
            .and_then(|value| value.as_u64());
        tracing::debug!(model = %self.model, tokens_used, "Reasoning completion received");

        completion_text(&body).ok_or(ReasoningUnavailable::MalformedEnvelope)
    }
}

fn is_retryable(err: &ReasoningUnavailable) -> bool {
    match err {
        ReasoningUnavailable::Transport(_) => true,
        ReasoningUnavailable::Status { status, .. } => *status == 429 || *status >= 500,
        _ => false,
    }
}

fn completion_text(body: &Value) -> Option<String> {
    body.get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|value| value.as_str())
        .map(str::to_string)
}
