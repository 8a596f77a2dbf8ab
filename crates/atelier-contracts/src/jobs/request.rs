use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const PARAM_ASPECT_RATIO: &str = "aspect_ratio";
pub const PARAM_IMAGE_SIZE: &str = "image_size";
pub const PARAM_DURATION: &str = "duration";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationKind {
    Image,
    ImageEdit,
    Video,
}

impl GenerationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::ImageEdit => "image_edit",
            Self::Video => "video",
        }
    }

    /// Edits and videos are always derived from at least one reference.
    pub fn requires_reference(self) -> bool {
        matches!(self, Self::ImageEdit | Self::Video)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceMedia {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl ReferenceMedia {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        let mime_type = mime_type.into();
        let mime_type = if mime_type.trim().is_empty() {
            "image/png".to_string()
        } else {
            mime_type.trim().to_string()
        };
        Self { bytes, mime_type }
    }

    pub fn file_extension(&self) -> &'static str {
        let lowered = self.mime_type.to_ascii_lowercase();
        if lowered.contains("jpeg") || lowered.contains("jpg") {
            return "jpg";
        }
        if lowered.contains("webp") {
            return "webp";
        }
        if lowered.contains("gif") {
            return "gif";
        }
        "png"
    }
}

/// One user action. Built once by the caller and only read afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub kind: GenerationKind,
    pub prompt: String,
    pub reference_media: Vec<ReferenceMedia>,
    pub parameters: Map<String, Value>,
}

impl GenerationRequest {
    pub fn new(kind: GenerationKind, prompt: impl Into<String>) -> Self {
        Self {
            kind,
            prompt: prompt.into(),
            reference_media: Vec::new(),
            parameters: Map::new(),
        }
    }

    pub fn with_reference(mut self, media: ReferenceMedia) -> Self {
        self.reference_media.push(media);
        self
    }

    pub fn with_parameter(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    /// Non-empty string form of a parameter; numbers are rendered as text.
    pub fn parameter_text(&self, key: &str) -> Option<String> {
        match self.parameters.get(key)? {
            Value::String(raw) => Some(raw.trim().to_string()).filter(|value| !value.is_empty()),
            Value::Number(raw) => Some(raw.to_string()),
            _ => None,
        }
    }

    pub fn parameter_u32(&self, key: &str) -> Option<u32> {
        let parsed = match self.parameters.get(key)? {
            Value::Number(raw) => raw.as_f64(),
            Value::String(raw) => raw.trim().trim_end_matches('s').parse::<f64>().ok(),
            _ => None,
        }?;
        if parsed.is_finite() && parsed >= 0.0 {
            Some(parsed.round() as u32)
        } else {
            None
        }
    }

    pub fn summary(&self) -> Map<String, Value> {
        let mut out = Map::new();
        out.insert("kind".to_string(), Value::String(self.kind.as_str().to_string()));
        out.insert("prompt".to_string(), Value::String(self.prompt.clone()));
        out.insert(
            "reference_media".to_string(),
            Value::Array(
                self.reference_media
                    .iter()
                    .map(|media| {
                        serde_json::json!({
                            "mime_type": media.mime_type,
                            "bytes": media.bytes.len(),
                        })
                    })
                    .collect(),
            ),
        );
        out.insert(
            "parameters".to_string(),
            Value::Object(self.parameters.clone()),
        );
        out
    }
}
