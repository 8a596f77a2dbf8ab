//! Pulls artifacts out of the three provider response shapes.

use atelier_contracts::jobs::{Failure, FailureKind, ImageBytes};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;

use crate::retry::truncate_text;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InlineExtraction {
    pub images: Vec<ImageBytes>,
    pub text: Option<String>,
}

/// Scans `candidates[].content.parts[]` for text and inline base64 image data.
/// Zero images is a valid outcome, not an error.
pub fn extract_inline_images(payload: &Value) -> Result<InlineExtraction, Failure> {
    let candidates = payload
        .get("candidates")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let mut images = Vec::new();
    let mut texts: Vec<&str> = Vec::new();

    for candidate in candidates {
        let parts = candidate
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                texts.push(text);
                continue;
            }
            let Some(inline) = part
                .get("inlineData")
                .or_else(|| part.get("inline_data"))
                .and_then(Value::as_object)
            else {
                continue;
            };
            let data = inline
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            let bytes = BASE64.decode(data.trim().as_bytes()).map_err(|err| {
                Failure::new(
                    FailureKind::InvalidResponse,
                    format!("inline image base64 decode failed: {err}"),
                )
            })?;
            let mime_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .map(str::to_string);
            images.push(ImageBytes { bytes, mime_type });
        }
    }

    let text = texts.join("\n").trim().to_string();
    Ok(InlineExtraction {
        images,
        text: Some(text).filter(|value| !value.is_empty()),
    })
}

/// First whitespace-separated token that starts with `http` and ends with `.mp4`.
/// URLs with query strings or glued to punctuation are not found.
pub fn find_video_locator(text: &str) -> Option<&str> {
    text.split_whitespace()
        .find(|token| token.starts_with("http") && token.ends_with(".mp4"))
}

pub fn extract_video_locator(text: &str) -> Result<String, Failure> {
    find_video_locator(text)
        .map(str::to_string)
        .ok_or_else(|| {
            Failure::new(
                FailureKind::NoLocatorFound,
                "no video URL found in provider output",
            )
            .with_raw_body(truncate_text(text, 4096))
        })
}

/// Reads `url` from a terminal job document, falling back to the token
/// heuristic over the document's string values.
pub fn extract_polled_locator(document: &Value) -> Result<String, Failure> {
    if let Some(url) = document
        .get("url")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return Ok(url.to_string());
    }
    let mut strings = Vec::new();
    collect_strings(document, &mut strings);
    let flattened = strings.join(" ");
    find_video_locator(&flattened)
        .map(str::to_string)
        .ok_or_else(|| {
            Failure::new(
                FailureKind::NoLocatorFound,
                "video job finished without a downloadable URL",
            )
            .with_raw_body(truncate_text(&document.to_string(), 4096))
        })
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(text) => out.push(text.as_str()),
        Value::Array(rows) => rows.iter().for_each(|row| collect_strings(row, out)),
        Value::Object(map) => map.values().for_each(|row| collect_strings(row, out)),
        _ => {}
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRecord {
    Delta(String),
    Done,
    Skip,
}

/// Classifies one line of a `data: {...}` event stream.
pub fn parse_stream_line(line: &str) -> StreamRecord {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return StreamRecord::Skip;
    }
    let record = trimmed
        .strip_prefix("data:")
        .map(str::trim_start)
        .unwrap_or(trimmed);
    if record == "[DONE]" {
        return StreamRecord::Done;
    }
    let Ok(parsed) = serde_json::from_str::<Value>(record) else {
        return StreamRecord::Skip;
    };
    match parsed
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("delta"))
        .and_then(|delta| delta.get("content"))
        .and_then(Value::as_str)
    {
        Some(content) if !content.is_empty() => StreamRecord::Delta(content.to_string()),
        _ => StreamRecord::Skip,
    }
}
