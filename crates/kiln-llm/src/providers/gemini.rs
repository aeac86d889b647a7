use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::ModelError;
use crate::provider::ProviderAdapter;
use crate::types::{ModelRequest, ModelResponse, Role, Usage};

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

const API_KEY_HEADER: &str = "x-goog-api-key";

/// Adapter for the Gemini `generateContent` endpoint.
#[derive(Clone)]
pub struct GeminiAdapter {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiAdapter {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, DEFAULT_GEMINI_BASE_URL)
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/models/{model}:generateContent", self.base_url)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

fn text_content(role: Option<&str>, text: String) -> Content {
    Content {
        role: role.map(str::to_string),
        parts: vec![Part { text: Some(text) }],
    }
}

fn build_body(request: &ModelRequest) -> GenerateContentRequest {
    let mut system = Vec::new();
    let mut contents = Vec::new();

    for message in &request.messages {
        match message.role {
            Role::System if contents.is_empty() => system.push(message.content.clone()),
            Role::System | Role::User => {
                contents.push(text_content(Some("user"), message.content.clone()))
            }
            Role::Tool => contents.push(text_content(
                Some("user"),
                format!("Tool result:\n{}", message.content),
            )),
            Role::Assistant => contents.push(text_content(Some("model"), message.content.clone())),
        }
    }

    let generation_config = (request.temperature.is_some() || request.max_output_tokens.is_some())
        .then(|| GenerationConfig {
            temperature: request.temperature,
            max_output_tokens: request.max_output_tokens,
        });

    GenerateContentRequest {
        contents,
        system_instruction: (!system.is_empty()).then(|| text_content(None, system.join("\n\n"))),
        generation_config,
    }
}

fn extract_text(response: GenerateContentResponse) -> Result<(String, Option<Usage>), ModelError> {
    let usage = response.usage_metadata.map(|usage| Usage {
        input_tokens: usage.prompt_token_count,
        output_tokens: usage.candidates_token_count,
    });
    let content = response
        .candidates
        .into_iter()
        .find_map(|candidate| candidate.content)
        .ok_or_else(|| ModelError::transient("response contained no candidates"))?;
    let text = content
        .parts
        .into_iter()
        .filter_map(|part| part.text)
        .collect::<Vec<_>>()
        .join("");
    Ok((text, usage))
}

fn retry_after_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(|seconds| seconds.saturating_mul(1_000))
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, ModelError> {
        if self.api_key.trim().is_empty() {
            return Err(ModelError::Auth("no API key configured".to_string()));
        }

        let body = build_body(request);
        debug!(model = %request.model, contents = body.contents.len(), "sending gemini request");

        let response = self
            .http
            .post(self.endpoint(&request.model))
            .header(API_KEY_HEADER, &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| ModelError::transient(format!("request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_ms(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(ModelError::from_status(status.as_u16(), text, retry_after));
        }

        let decoded = response
            .json::<GenerateContentResponse>()
            .await
            .map_err(|err| ModelError::transient(format!("response decode failed: {err}")))?;
        let (text, usage) = extract_text(decoded)?;

        Ok(ModelResponse {
            text,
            provider: self.name().to_string(),
            model: request.model.clone(),
            usage,
        })
    }
}
