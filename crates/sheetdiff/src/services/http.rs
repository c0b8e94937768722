//! OpenAI-compatible chat-completions client.

use std::time::Duration;

use base64::Engine;
use log::{debug, warn};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::{resolve_model_api_key, ModelConfig};
use crate::services::{
    DiffMetadata, OcrDocument, ServiceError, SummaryContent, SummaryService, VisionService,
};

/// Longest response body kept in error messages.
const MAX_ERROR_BODY: usize = 500;

pub struct HostedModelClient {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<SecretString>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl HostedModelClient {
    pub fn new(
        endpoint: &str,
        model: &str,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Http(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        })
    }

    pub fn from_config(config: &ModelConfig) -> Result<Self, ServiceError> {
        let api_key =
            resolve_model_api_key(config).map_err(|e| ServiceError::NotConfigured(e.to_string()))?;
        Self::new(
            &config.endpoint,
            &config.model,
            api_key,
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn complete<T: DeserializeOwned>(&self, prompt: &str, image_png: &[u8]) -> Result<T, ServiceError> {
        let _span = tracing::info_span!("model.complete", model = %self.model).entered();
        let url = format!("{}/chat/completions", self.endpoint);
        let body = request_body(&self.model, prompt, image_png);

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }
        let response = request
            .send()
            .map_err(|e| ServiceError::Http(format!("POST {} failed: {}", url, e)))?;

        let status = response.status();
        let text = response
            .text()
            .map_err(|e| ServiceError::Http(format!("Failed to read response: {}", e)))?;
        check_status(status, &text)?;
        debug!("Model responded with {} bytes", text.len());
        parse_completion(&text)
    }
}

impl VisionService for HostedModelClient {
    fn extract(&self, image_png: &[u8], prompt: &str) -> Result<OcrDocument, ServiceError> {
        self.complete(prompt, image_png)
    }
}

impl SummaryService for HostedModelClient {
    fn summarize(
        &self,
        overlay_png: &[u8],
        _metadata: &DiffMetadata,
        prompt: &str,
    ) -> Result<SummaryContent, ServiceError> {
        self.complete(prompt, overlay_png)
    }
}

fn request_body(model: &str, prompt: &str, image_png: &[u8]) -> Value {
    let data_url = format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(image_png)
    );
    json!({
        "model": model,
        "response_format": {"type": "json_object"},
        "messages": [{
            "role": "user",
            "content": [
                {"type": "text", "text": prompt},
                {"type": "image_url", "image_url": {"url": data_url}},
            ],
        }],
    })
}

fn check_status(status: StatusCode, body: &str) -> Result<(), ServiceError> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        warn!("Model endpoint is rate limiting requests");
        return Err(ServiceError::RateLimited);
    }
    if !status.is_success() {
        return Err(ServiceError::Status {
            status: status.as_u16(),
            body: body.chars().take(MAX_ERROR_BODY).collect(),
        });
    }
    Ok(())
}

fn parse_completion<T: DeserializeOwned>(body: &str) -> Result<T, ServiceError> {
    let response: CompletionResponse = serde_json::from_str(body)
        .map_err(|e| ServiceError::MalformedResponse(format!("Invalid completion JSON: {}", e)))?;
    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| ServiceError::MalformedResponse("Completion has no content".to_string()))?;

    let json_str = extract_json(&content);
    serde_json::from_str(json_str).map_err(|e| {
        ServiceError::MalformedResponse(format!(
            "Failed to parse JSON: {}. Response was: {}",
            e,
            json_str.chars().take(MAX_ERROR_BODY).collect::<String>()
        ))
    })
}

/// The outermost `{...}` of a reply that may be wrapped in prose or fences.
fn extract_json(response: &str) -> &str {
    match (response.find('{'), response.rfind('}')) {
        (Some(start), Some(end)) if end > start => &response[start..=end],
        _ => response.trim(),
    }
}
