//! Maps a `GenerationRequest` onto each provider family's wire shape.

use atelier_contracts::jobs::{
    GenerationRequest, ReferenceMedia, PARAM_ASPECT_RATIO, PARAM_DURATION, PARAM_IMAGE_SIZE,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Map, Value};

use crate::transport::FormValue;

const STREAMED_VIDEO_FAMILY: &str = "sora_video2";
const LONG_CLIP_THRESHOLD_S: u32 = 13;

pub fn generate_content_endpoint(api_base: &str, model: &str) -> String {
    let trimmed = model.trim();
    let model_path = if trimmed.starts_with("models/") {
        trimmed.to_string()
    } else {
        format!("models/{trimmed}")
    };
    format!("{}/{}:generateContent", api_base.trim_end_matches('/'), model_path)
}

pub fn image_payload(request: &GenerationRequest) -> Value {
    let mut parts = vec![json!({ "text": request.prompt })];
    for media in &request.reference_media {
        parts.push(json!({
            "inlineData": {
                "mimeType": media.mime_type,
                "data": BASE64.encode(&media.bytes),
            }
        }));
    }

    let mut generation_config = Map::new();
    generation_config.insert("responseModalities".to_string(), json!(["IMAGE"]));
    let mut image_config = Map::new();
    if let Some(aspect_ratio) = request.parameter_text(PARAM_ASPECT_RATIO) {
        image_config.insert("aspectRatio".to_string(), Value::String(aspect_ratio));
    }
    if let Some(image_size) = request.parameter_text(PARAM_IMAGE_SIZE) {
        image_config.insert(
            "imageSize".to_string(),
            Value::String(normalize_image_size(&image_size)),
        );
    }
    if !image_config.is_empty() {
        generation_config.insert("imageConfig".to_string(), Value::Object(image_config));
    }

    json!({
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": generation_config,
    })
}

fn normalize_image_size(raw: &str) -> String {
    let trimmed = raw.trim();
    if matches!(trimmed.to_ascii_lowercase().as_str(), "1k" | "2k" | "4k") {
        return trimmed.to_ascii_uppercase();
    }
    trimmed.to_string()
}

/// Picks the landscape / 15s variant of the streamed video family from the
/// requested ratio and duration. Other models pass through untouched.
pub fn resolve_streamed_model(model: &str, request: &GenerationRequest) -> String {
    let trimmed = model.trim();
    if trimmed != STREAMED_VIDEO_FAMILY {
        return trimmed.to_string();
    }
    let landscape = request.parameter_text(PARAM_ASPECT_RATIO).as_deref() == Some("16:9");
    let long_clip = request
        .parameter_u32(PARAM_DURATION)
        .map(|seconds| seconds >= LONG_CLIP_THRESHOLD_S)
        .unwrap_or(false);
    match (landscape, long_clip) {
        (true, true) => format!("{STREAMED_VIDEO_FAMILY}-landscape-15s"),
        (true, false) => format!("{STREAMED_VIDEO_FAMILY}-landscape"),
        (false, true) => format!("{STREAMED_VIDEO_FAMILY}-15s"),
        (false, false) => STREAMED_VIDEO_FAMILY.to_string(),
    }
}

pub fn data_url(media: &ReferenceMedia) -> String {
    format!(
        "data:{};base64,{}",
        media.mime_type,
        BASE64.encode(&media.bytes)
    )
}

pub fn streamed_video_payload(request: &GenerationRequest, model: &str) -> Value {
    let mut content = vec![json!({ "type": "text", "text": request.prompt })];
    for media in &request.reference_media {
        content.push(json!({
            "type": "image_url",
            "image_url": { "url": data_url(media) },
        }));
    }
    json!({
        "model": model,
        "stream": true,
        "messages": [{ "role": "user", "content": content }],
    })
}

pub fn video_size_for_ratio(ratio: &str) -> Option<&'static str> {
    match ratio.trim() {
        "16:9" => Some("1280x720"),
        "9:16" => Some("720x1280"),
        "1:1" => Some("1024x1024"),
        _ => None,
    }
}

/// Multipart fields for a polled job creation, plus any mapping warnings.
pub fn polled_video_form(
    request: &GenerationRequest,
    model: &str,
) -> (Vec<(String, FormValue)>, Vec<String>) {
    let mut warnings = Vec::new();
    let mut fields = vec![
        ("prompt".to_string(), FormValue::Text(request.prompt.clone())),
        ("model".to_string(), FormValue::Text(model.to_string())),
    ];
    if let Some(seconds) = request.parameter_u32(PARAM_DURATION) {
        fields.push(("seconds".to_string(), FormValue::Text(seconds.to_string())));
    }
    if let Some(ratio) = request.parameter_text(PARAM_ASPECT_RATIO) {
        match video_size_for_ratio(&ratio) {
            Some(size) => fields.push(("size".to_string(), FormValue::Text(size.to_string()))),
            None => warnings.push(format!(
                "Aspect ratio {ratio} has no polled video size; provider default used."
            )),
        }
    }
    if let Some(media) = request.reference_media.first() {
        fields.push((
            "input_reference".to_string(),
            FormValue::File {
                file_name: format!("reference.{}", media.file_extension()),
                mime_type: media.mime_type.clone(),
                bytes: media.bytes.clone(),
            },
        ));
    }
    (fields, warnings)
}
