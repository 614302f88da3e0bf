use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Image bytes returned by a generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    pub data: Vec<u8>,
    pub mime_type: String,
    /// Identifier of the model version that produced the image.
    pub model: String,
}

/// External capability that turns a prompt plus an input image into a new image.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// `image_png` is the PNG-encoded input image.
    async fn generate(&self, prompt: &str, image_png: &[u8])
        -> Result<GeneratedImage, GenerationError>;
}

/// Client for the Gemini `generateContent` endpoint with an image-capable model.
pub struct GeminiClient {
    http: Client,
    api_key: String,
    model: String,
    base_url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    model_version: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: Option<String>,
    data: String,
}

impl GeminiClient {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            http: Client::new(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: GEMINI_BASE_URL.to_string(),
        }
    }

    /// Point the client at a different API root (proxies, local stubs).
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl GenerationService for GeminiClient {
    async fn generate(
        &self,
        prompt: &str,
        image_png: &[u8],
    ) -> Result<GeneratedImage, GenerationError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);

        let request_body = serde_json::json!({
            "contents": [{
                "parts": [
                    { "text": prompt },
                    {
                        "inline_data": {
                            "mime_type": "image/png",
                            "data": base64::engine::general_purpose::STANDARD.encode(image_png)
                        }
                    }
                ]
            }]
        });

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request_body)
            .send()
            .await
            .map_err(GenerationError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Api {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        let parsed: GenerateContentResponse = response.json().await.map_err(GenerationError::Http)?;
        interpret_response(parsed, &self.model)
    }
}

/// Pull the first image out of a `generateContent` response.
///
/// An unexpected finish reason is only a warning; a candidate with no image
/// part (for example a text-only refusal) is a failure.
fn interpret_response(
    response: GenerateContentResponse,
    configured_model: &str,
) -> Result<GeneratedImage, GenerationError> {
    let model = response
        .model_version
        .unwrap_or_else(|| configured_model.to_string());

    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or(GenerationError::NoCandidates)?;

    if let Some(reason) = candidate.finish_reason.as_deref() {
        if !reason.eq_ignore_ascii_case("STOP") {
            tracing::warn!(finish_reason = reason, "Unexpected finish reason from generation model");
        }
    }

    let mut text_reply: Option<String> = None;
    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if let Some(inline) = part.inline_data {
            let data = base64::engine::general_purpose::STANDARD
                .decode(inline.data.as_bytes())
                .map_err(GenerationError::Decode)?;
            if data.is_empty() {
                continue;
            }
            return Ok(GeneratedImage {
                data,
                mime_type: inline.mime_type.unwrap_or_else(|| "image/png".to_string()),
                model,
            });
        }
        if let Some(text) = part.text {
            text_reply.get_or_insert(text);
        }
    }

    if let Some(text) = &text_reply {
        let preview: String = text.chars().take(200).collect();
        tracing::warn!(reply = %preview, "Generation model answered with text only");
    }
    Err(GenerationError::NoImage)
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("generation API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("image generation failed: no candidates in response")]
    NoCandidates,

    #[error("image generation failed: no image data in response")]
    NoImage,

    #[error("generated image payload is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("image generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("generation service unavailable: {0}")]
    Unavailable(String),
}

impl GenerationError {
    /// Whether retrying the same request later could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            GenerationError::Http(_)
            | GenerationError::Timeout(_)
            | GenerationError::Unavailable(_) => true,
            GenerationError::Api { status, .. } => *status == 429 || *status >= 500,
            GenerationError::NoCandidates | GenerationError::NoImage | GenerationError::Decode(_) => {
                false
            }
        }
    }
}
