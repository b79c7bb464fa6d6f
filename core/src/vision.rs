use std::future::Future;

use serde_json::json;
use thiserror::Error;

use crate::models::is_english_locale;

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_LOCALE: &str = "vi";

/// Fixed response returned in stub mode (no service credential configured).
///
/// Two detections: a 350 g bowl of beef phở and a 60 g side of quẩy.
pub const STUB_RESPONSE: &str = r#"[{"name":"Phở bò","servingGrams":350,"confidence":0.9},{"name":"Quẩy","servingGrams":60,"confidence":0.7}]"#;

/// Image payload sent to the vision service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageInput {
    Bytes(Vec<u8>),
    Url(String),
}

/// Guess an image mime type from its leading bytes, defaulting to JPEG.
#[must_use]
pub fn sniff_mime_type(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        "image/png"
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        "image/gif"
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "image/jpeg"
    }
}

/// Settings for the vision inference client, resolved once at startup.
///
/// `api_key: None` switches the client into stub mode.
#[derive(Debug, Clone)]
pub struct VisionConfig {
    pub model: String,
    pub endpoint: String,
    pub api_key: Option<String>,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
        }
    }
}

impl VisionConfig {
    #[must_use]
    pub fn is_stub(&self) -> bool {
        self.api_key.as_deref().is_none_or(|k| k.trim().is_empty())
    }
}

#[derive(Debug, Error)]
pub enum VisionError {
    /// The service answered with a non-success status.
    #[error("vision service returned {status}: {body}")]
    Service { status: u16, body: String },
    #[error("vision service unreachable: {0}")]
    Transport(String),
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("malformed vision service response: {0}")]
    MalformedResponse(String),
}

/// Black-box vision-language inference.
///
/// One call per scan, no retries; callers impose any deadline.
pub trait VisionInference: Send + Sync {
    /// Ask the service which foods are in `image`, returning its raw text.
    fn infer(
        &self,
        image: &ImageInput,
        locale: &str,
    ) -> impl Future<Output = Result<String, VisionError>> + Send;
}

/// Locale-specific instruction asking the model to enumerate foods.
#[must_use]
pub fn detection_prompt(locale: &str) -> String {
    if is_english_locale(locale) {
        "List every distinct food or dish visible in this photo, at most 6. \
         Answer with a JSON array only, one object per food: \
         {\"name\": string, \"servingGrams\": number, \"confidence\": number between 0 and 1}. \
         Use common English dish names. Estimate the portion weight in grams."
            .to_string()
    } else {
        "Liệt kê tất cả các món ăn khác nhau có trong ảnh, tối đa 6 món. \
         Chỉ trả lời bằng một mảng JSON, mỗi món là một đối tượng: \
         {\"name\": chuỗi, \"servingGrams\": số, \"confidence\": số từ 0 đến 1}. \
         Dùng tên món tiếng Việt thông dụng. Ước lượng khối lượng khẩu phần theo gam."
            .to_string()
    }
}

/// JSON schema constraining the model to the detection array shape.
#[must_use]
pub fn detection_response_schema() -> serde_json::Value {
    json!({
        "type": "array",
        "items": {
            "type": "object",
            "properties": {
                "name": { "type": "string" },
                "servingGrams": { "type": "number" },
                "confidence": { "type": "number" }
            },
            "required": ["name"]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{DetectionParser, HeuristicParser};

    #[test]
    fn test_sniff_mime_type() {
        assert_eq!(sniff_mime_type(b"\x89PNG\r\n\x1a\n...."), "image/png");
        assert_eq!(sniff_mime_type(b"GIF89a..."), "image/gif");
        assert_eq!(sniff_mime_type(b"RIFF\x00\x00\x00\x00WEBPVP8 "), "image/webp");
        assert_eq!(sniff_mime_type(b"\xff\xd8\xff\xe0"), "image/jpeg");
        assert_eq!(sniff_mime_type(b""), "image/jpeg");
    }

    #[test]
    fn test_stub_mode_follows_credential() {
        assert!(VisionConfig::default().is_stub());
        let blank = VisionConfig {
            api_key: Some("  ".to_string()),
            ..VisionConfig::default()
        };
        assert!(blank.is_stub());
        let keyed = VisionConfig {
            api_key: Some("abc".to_string()),
            ..VisionConfig::default()
        };
        assert!(!keyed.is_stub());
    }

    #[test]
    fn test_stub_response_parses_as_documented() {
        let detections = HeuristicParser.parse(STUB_RESPONSE, "vi");
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].name, "Phở bò");
        assert_eq!(detections[0].estimated_serving_g, Some(350.0));
        assert_eq!(detections[1].name, "Quẩy");
        assert_eq!(detections[1].estimated_serving_g, Some(60.0));
    }

    #[test]
    fn test_prompt_follows_locale() {
        assert!(detection_prompt("en-GB").contains("JSON array"));
        assert!(detection_prompt("vi").contains("mảng JSON"));
        assert_eq!(detection_prompt("EN"), detection_prompt("en-US"));
    }
}
