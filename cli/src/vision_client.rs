use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use tracing::debug;

use platescan_core::vision::{
    ImageInput, STUB_RESPONSE, VisionConfig, VisionError, VisionInference, detection_prompt,
    detection_response_schema, sniff_mime_type,
};

/// Largest image accepted, inline or fetched from a URL.
pub const MAX_IMAGE_BYTES: usize = 20 * 1024 * 1024;

/// Vision-language client speaking the Gemini `generateContent` API.
///
/// Without a credential every call returns the fixed stub response and no
/// network request is made.
pub struct VisionClient {
    client: reqwest::Client,
    config: VisionConfig,
    max_image_bytes: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: String,
    response_schema: serde_json::Value,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

impl VisionClient {
    pub fn new(config: VisionConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!(
                "platescan/{} (meal photo scanner)",
                env!("CARGO_PKG_VERSION")
            ))
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            config,
            max_image_bytes: MAX_IMAGE_BYTES,
        })
    }

    #[cfg(test)]
    fn with_max_image_bytes(mut self, limit: usize) -> Self {
        self.max_image_bytes = limit;
        self
    }

    #[must_use]
    pub fn is_stub(&self) -> bool {
        self.config.is_stub()
    }

    /// Download an image, refusing non-image content and anything over the cap.
    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>, VisionError> {
        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| VisionError::Transport(format!("failed to fetch {url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(VisionError::InvalidImage(format!(
                "fetching {url} returned {}",
                resp.status()
            )));
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if !content_type.starts_with("image/") {
            return Err(VisionError::InvalidImage(format!(
                "{url} is not an image (content type {content_type:?})"
            )));
        }

        let limit = self.max_image_bytes;
        let too_large = || {
            VisionError::InvalidImage(format!("{url} is larger than {limit} bytes"))
        };
        if resp
            .content_length()
            .is_some_and(|len| len > u64::try_from(limit).unwrap_or(u64::MAX))
        {
            return Err(too_large());
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| VisionError::Transport(format!("failed to read {url}: {e}")))?
        {
            if bytes.len() + chunk.len() > limit {
                return Err(too_large());
            }
            bytes.extend_from_slice(&chunk);
        }
        if bytes.is_empty() {
            return Err(VisionError::InvalidImage(format!("{url} returned no data")));
        }
        Ok(bytes)
    }

    fn build_request(bytes: &[u8], locale: &str) -> GenerateRequest {
        GenerateRequest {
            contents: vec![Content {
                parts: vec![
                    Part::Text {
                        text: detection_prompt(locale),
                    },
                    Part::InlineData {
                        inline_data: InlineData {
                            mime_type: sniff_mime_type(bytes).to_string(),
                            data: STANDARD.encode(bytes),
                        },
                    },
                ],
            }],
            generation_config: GenerationConfig {
                response_mime_type: "application/json".to_string(),
                response_schema: detection_response_schema(),
                temperature: 0.2,
            },
        }
    }
}

fn first_text(response: GenerateResponse) -> Option<String> {
    response
        .candidates
        .into_iter()
        .filter_map(|c| c.content)
        .flat_map(|c| c.parts)
        .find_map(|p| match p {
            Part::Text { text } => Some(text),
            Part::InlineData { .. } => None,
        })
}

impl VisionInference for VisionClient {
    async fn infer(&self, image: &ImageInput, locale: &str) -> Result<String, VisionError> {
        if matches!(image, ImageInput::Bytes(bytes) if bytes.is_empty()) {
            return Err(VisionError::InvalidImage("image is empty".to_string()));
        }

        let Some(api_key) = self.config.api_key.as_deref().filter(|k| !k.trim().is_empty()) else {
            debug!("no vision credential configured, returning stub response");
            return Ok(STUB_RESPONSE.to_string());
        };

        let bytes = match image {
            ImageInput::Bytes(bytes) if bytes.len() > self.max_image_bytes => {
                return Err(VisionError::InvalidImage(format!(
                    "image is larger than {} bytes",
                    self.max_image_bytes
                )));
            }
            ImageInput::Bytes(bytes) => bytes.clone(),
            ImageInput::Url(url) => self.fetch_image(url).await?,
        };

        let url = format!(
            "{}/models/{}:generateContent",
            self.config.endpoint, self.config.model
        );
        debug!(model = %self.config.model, bytes = bytes.len(), "calling vision service");

        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&Self::build_request(&bytes, locale))
            .send()
            .await
            .map_err(|e| VisionError::Transport(e.without_url().to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(VisionError::Service {
                status: status.as_u16(),
                body,
            });
        }

        let data: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| VisionError::MalformedResponse(e.without_url().to_string()))?;

        first_text(data)
            .ok_or_else(|| VisionError::MalformedResponse("response contained no text".to_string()))
    }
}
