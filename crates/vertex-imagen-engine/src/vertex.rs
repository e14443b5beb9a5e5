use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::Value;
use vertex_imagen_contracts::events::sanitize_payload;
use vertex_imagen_contracts::CredentialBundle;

use crate::auth::ServiceAccountSigner;

/// An authenticated handle on the Vertex AI REST API for one project/location.
///
/// Creating a session does no I/O. Callers fetch an access token with
/// [`VertexSession::access_token`] and pass it to each model call.
pub struct VertexSession {
    http: HttpClient,
    api_base: String,
    project_id: String,
    location: String,
    signer: ServiceAccountSigner,
    request_timeout: Duration,
}

impl VertexSession {
    pub fn new(
        http: HttpClient,
        bundle: &CredentialBundle,
        signer: ServiceAccountSigner,
        api_base: Option<&str>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            http,
            api_base: api_base
                .map(|base| base.trim_end_matches('/').to_string())
                .unwrap_or_else(|| api_base_for_location(&bundle.location)),
            project_id: bundle.project_id.clone(),
            location: bundle.location.clone(),
            signer,
            request_timeout,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn model_endpoint(&self, model: &str, method: &str) -> String {
        format!(
            "{}/v1/projects/{}/locations/{}/{}:{}",
            self.api_base,
            self.project_id,
            self.location,
            publisher_model_path(model),
            method
        )
    }

    /// Exchanges the service-account assertion for a bearer token.
    pub fn access_token(&self) -> Result<String> {
        self.signer
            .fetch_access_token(&self.http, self.request_timeout)
    }

    /// POSTs a JSON payload to a model method and returns the decoded body.
    ///
    /// No retries: a failed generation is reported to the caller as-is.
    pub fn call_model(
        &self,
        provider: &str,
        token: &str,
        model: &str,
        method: &str,
        payload: &Value,
    ) -> Result<Value> {
        let endpoint = self.model_endpoint(model, method);
        tracing::debug!(
            provider,
            endpoint = %endpoint,
            payload = %sanitize_payload(payload),
            "sending model request"
        );
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(token)
            .timeout(self.request_timeout)
            .json(payload)
            .send()
            .with_context(|| format!("{provider} request failed ({endpoint})"))?;
        response_json_or_error(provider, response)
    }
}

pub fn api_base_for_location(location: &str) -> String {
    let location = location.trim();
    if location.is_empty() || location.eq_ignore_ascii_case("global") {
        "https://aiplatform.googleapis.com".to_string()
    } else {
        format!("https://{location}-aiplatform.googleapis.com")
    }
}

/// Accepts `name`, `models/name` or a full `publishers/.../models/name` path.
fn publisher_model_path(model: &str) -> String {
    let trimmed = model.trim().trim_start_matches('/');
    if trimmed.starts_with("publishers/") || trimmed.starts_with("projects/") {
        return trimmed.to_string();
    }
    format!(
        "publishers/google/models/{}",
        trimmed.trim_start_matches("models/")
    )
}

pub(crate) fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&provider_error_message(&body), 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn provider_error_message(body: &str) -> String {
    let Ok(parsed) = serde_json::from_str::<Value>(body) else {
        return body.trim().to_string();
    };
    let structured = parsed
        .get("error")
        .and_then(|error| error.get("message"))
        .or_else(|| parsed.get("error_description"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|message| !message.is_empty());
    match structured {
        Some(message) => message.to_string(),
        None => body.trim().to_string(),
    }
}

pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
