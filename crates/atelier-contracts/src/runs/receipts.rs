use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::jobs::{GenerationRequest, JobResult};
use crate::providers::ProviderTarget;

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

/// JSON record of one submitted job. Media bytes and credentials never land in it.
pub fn build_receipt(
    job_label: &str,
    request: &GenerationRequest,
    target: &ProviderTarget,
    outcome: &JobResult,
    artifacts: &[PathBuf],
) -> Value {
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(RECEIPT_SCHEMA_VERSION.into()),
    );
    root.insert("job".to_string(), Value::String(job_label.to_string()));
    root.insert(
        "request".to_string(),
        sanitize_payload(&Value::Object(request.summary())),
    );
    root.insert(
        "target".to_string(),
        sanitize_payload(&serde_json::to_value(target).unwrap_or(Value::Null)),
    );

    let mut result = Map::new();
    match outcome {
        Ok(output) => {
            result.insert("status".to_string(), Value::String("success".to_string()));
            result.insert("images".to_string(), Value::from(output.images.len()));
            result.insert(
                "text".to_string(),
                output.text.clone().map(Value::String).unwrap_or(Value::Null),
            );
            result.insert(
                "video_locator".to_string(),
                output
                    .video
                    .as_ref()
                    .and_then(|video| video.locator.clone())
                    .map(Value::String)
                    .unwrap_or(Value::Null),
            );
            result.insert(
                "provider_job_id".to_string(),
                output
                    .provider_job_id
                    .clone()
                    .map(Value::String)
                    .unwrap_or(Value::Null),
            );
            result.insert(
                "provider_request".to_string(),
                sanitize_payload(&Value::Object(output.provider_request.clone())),
            );
            result.insert(
                "provider_response".to_string(),
                sanitize_payload(&Value::Object(output.provider_response.clone())),
            );
            result.insert(
                "warnings".to_string(),
                Value::Array(output.warnings.iter().cloned().map(Value::String).collect()),
            );
        }
        Err(failure) => {
            result.insert("status".to_string(), Value::String("failure".to_string()));
            result.insert(
                "failure".to_string(),
                serde_json::to_value(failure).unwrap_or(Value::Null),
            );
        }
    }
    root.insert("result".to_string(), Value::Object(result));
    root.insert(
        "artifacts".to_string(),
        Value::Array(
            artifacts
                .iter()
                .map(|path| Value::String(path.to_string_lossy().to_string()))
                .collect(),
        ),
    );
    Value::Object(root)
}

pub fn write_receipt(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}

fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(
                    lowered.as_str(),
                    "data" | "b64_json" | "image_bytes" | "api_key" | "authorization"
                ) {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}
