use crate::error::SyncError;
use crate::retry::{with_retry_if, RetryConfig};
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Pluggable translation backend.
///
/// Implementations may fail or be slow; the orchestrator owns timeout and
/// fallback policy, the implementation owns its own retry policy for
/// transient faults.
#[async_trait]
pub trait TranslationProvider: Send + Sync {
    async fn translate(&self, text: &str, source: &str, target: &str)
        -> Result<String, SyncError>;
}

/// Request body for the translation HTTP API
#[derive(Debug, Serialize)]
struct TranslateRequest<'a> {
    q: &'a str,
    source: &'a str,
    target: &'a str,
    format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    #[serde(rename = "translatedText")]
    translated_text: String,
}

/// Translation backend speaking the LibreTranslate-style JSON API.
pub struct HttpTranslationProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    retry: RetryConfig,
}

impl HttpTranslationProvider {
    /// `base_url` is the provider root; the translate endpoint is derived
    /// from it.
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        api_key: Option<String>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            client,
            endpoint: format!("{}/translate", base_url.trim_end_matches('/')),
            api_key,
            retry,
        }
    }
}

#[async_trait]
impl TranslationProvider for HttpTranslationProvider {
    async fn translate(
        &self,
        text: &str,
        source: &str,
        target: &str,
    ) -> Result<String, SyncError> {
        // Locale codes like "en-US" are sent as their primary subtag
        let request = TranslateRequest {
            q: text,
            source: primary_subtag(source),
            target: primary_subtag(target),
            format: "text",
            api_key: self.api_key.as_deref(),
        };

        with_retry_if(
            &self.retry,
            &format!("Translation {} -> {}", source, target),
            || async {
                let response = self
                    .client
                    .post(&self.endpoint)
                    .json(&request)
                    .send()
                    .await
                    .context("Failed to send request to translation provider")?;

                if !response.status().is_success() {
                    let status = response.status();
                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|e| format!("<failed to read body: {}>", e));
                    anyhow::bail!("Translation provider error ({}): {}", status, body);
                }

                let parsed: TranslateResponse = response
                    .json()
                    .await
                    .context("Failed to parse translation provider response")?;

                Ok(parsed.translated_text)
            },
            is_retryable_error,
        )
        .await
        .map_err(SyncError::Provider)
    }
}

/// "en-US" -> "en"; codes without a region pass through unchanged.
fn primary_subtag(code: &str) -> &str {
    code.split('-').next().unwrap_or(code)
}

/// Determine if an error is retryable (5xx errors, 429 rate limit, network errors)
/// Other 4xx client errors should not be retried
fn is_retryable_error(error: &anyhow::Error) -> bool {
    let error_str = error.to_string();

    // Error format: "Translation provider error (503 Service Unavailable): ..."
    if error_str.contains("Translation provider error") {
        if let Some(start) = error_str.find('(') {
            if let Some(end) = error_str[start..].find(')') {
                let status_str = &error_str[start + 1..start + end];
                let status_num = status_str.split_whitespace().next().unwrap_or("");
                if let Ok(status) = status_num.parse::<u16>() {
                    // Retry 429 (rate limit) and 5xx errors
                    // Don't retry other 4xx errors (400, 401, 403, etc.)
                    return status == 429 || status >= 500;
                }
            }
        }
    }

    // Retry network errors, timeouts, and other transient failures
    true
}
