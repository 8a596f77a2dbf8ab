use std::sync::Arc;

use atelier_contracts::events::{EventPayload, PROVIDER_REQUEST};
use atelier_contracts::jobs::{Failure, GenerationOutput, GenerationRequest};
use atelier_contracts::providers::{CompletionMode, ProviderTarget};
use serde_json::{Map, Value};

use super::{parse_json_body, require_api_key, CompletionStrategy};
use crate::extract::extract_inline_images;
use crate::payload::{generate_content_endpoint, image_payload};
use crate::retry::RetryPolicy;
use crate::state::JobState;
use crate::transport::{HttpRequest, Transport};

pub(crate) const NO_IMAGE_WARNING: &str = "no image returned";

/// One request, one response carrying inline base64 images. The job never
/// enters `InProgress`.
pub struct ImmediateStrategy {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl ImmediateStrategy {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }
}

impl CompletionStrategy for ImmediateStrategy {
    fn mode(&self) -> CompletionMode {
        CompletionMode::Immediate
    }

    fn run(
        &self,
        request: &GenerationRequest,
        target: &ProviderTarget,
        state: &mut JobState,
    ) -> Result<GenerationOutput, Failure> {
        let api_key = require_api_key(target)?;
        let endpoint = generate_content_endpoint(target.api_base(), &target.model);
        let payload = image_payload(request);
        let http_request =
            HttpRequest::post_json(&endpoint, payload.clone(), target.request_timeout())
                .with_bearer(api_key);

        let mut logged = EventPayload::new();
        logged.insert("endpoint".to_string(), Value::String(endpoint.clone()));
        logged.insert("model".to_string(), Value::String(target.model.clone()));
        logged.insert(
            "references".to_string(),
            Value::from(request.reference_media.len()),
        );
        state.emit(PROVIDER_REQUEST, logged);

        let transport = self.transport.as_ref();
        let response = self
            .retry
            .execute(state, "image generation", || transport.send(&http_request))?;
        let document = parse_json_body("image generation", &response)?;
        let extracted = extract_inline_images(&document)?;

        let mut output = GenerationOutput {
            images: extracted.images,
            text: extracted.text,
            provider_request: request_summary(&endpoint, &target.model, &payload),
            provider_response: response_summary(&document),
            ..GenerationOutput::default()
        };
        if output.is_empty() {
            output.push_warning(NO_IMAGE_WARNING);
        }
        Ok(output)
    }
}

fn request_summary(endpoint: &str, model: &str, payload: &Value) -> Map<String, Value> {
    let mut summary = Map::new();
    summary.insert("endpoint".to_string(), Value::String(endpoint.to_string()));
    summary.insert("model".to_string(), Value::String(model.to_string()));
    if let Some(config) = payload.get("generationConfig") {
        summary.insert("generationConfig".to_string(), config.clone());
    }
    summary
}

/// Everything but the candidates, whose inline data is already in `images`.
fn response_summary(document: &Value) -> Map<String, Value> {
    let Some(object) = document.as_object() else {
        return Map::new();
    };
    let mut summary: Map<String, Value> = object
        .iter()
        .filter(|(key, _)| key.as_str() != "candidates")
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    let finish_reasons = object
        .get("candidates")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|row| row.get("finishReason").cloned())
                .collect::<Vec<Value>>()
        })
        .unwrap_or_default();
    if !finish_reasons.is_empty() {
        summary.insert("finishReasons".to_string(), Value::Array(finish_reasons));
    }
    summary
}

#[cfg(test)]
mod tests {
    use atelier_contracts::jobs::{FailureKind, GenerationKind, PARAM_ASPECT_RATIO};
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use serde_json::json;

    use super::super::testing::{quiet_retry, target, Scripted, StubTransport};
    use super::*;
    use crate::transport::{RawResponse, RequestBody};

    fn reply(status: u16, body: Value) -> Scripted {
        Scripted::Reply(RawResponse::new(status, body.to_string()))
    }

    #[test]
    fn posts_payload_and_decodes_inline_images() -> anyhow::Result<()> {
        let image = vec![137, 80, 78, 71, 1, 2, 3];
        let transport = StubTransport::new(vec![reply(
            200,
            json!({
                "candidates": [{
                    "content": {"parts": [
                        {"inlineData": {"mimeType": "image/png", "data": BASE64.encode(&image)}},
                        {"text": "done"}
                    ]},
                    "finishReason": "STOP"
                }],
                "modelVersion": "gemini-3-pro-image-preview"
            }),
        )]);
        let (retry, _) = quiet_retry();
        let strategy = ImmediateStrategy::new(transport.clone(), retry);
        let request = GenerationRequest::new(GenerationKind::Image, "a red cube")
            .with_parameter(PARAM_ASPECT_RATIO, "1:1");
        let mut state = JobState::new("job", None);

        let output = strategy
            .run(&request, &target(CompletionMode::Immediate), &mut state)
            .map_err(anyhow::Error::new)?;

        assert_eq!(output.images.len(), 1);
        assert_eq!(output.images[0].bytes, image);
        assert_eq!(output.text.as_deref(), Some("done"));
        assert!(output.warnings.is_empty());
        assert_eq!(output.provider_response["finishReasons"], json!(["STOP"]));
        assert_eq!(state.phase(), crate::state::JobPhase::Submitted);

        let sent = transport.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].url,
            "https://api.example.com/v1/models/stub-model:generateContent"
        );
        assert!(sent[0]
            .headers
            .contains(&("Authorization".to_string(), "Bearer sk-test".to_string())));
        let RequestBody::Json(body) = &sent[0].body else {
            anyhow::bail!("expected a JSON body");
        };
        assert_eq!(
            body["generationConfig"]["imageConfig"]["aspectRatio"],
            json!("1:1")
        );
        Ok(())
    }

    #[test]
    fn text_only_answer_is_success_with_warning() -> anyhow::Result<()> {
        let transport = StubTransport::new(vec![reply(
            200,
            json!({"candidates": [{"content": {"parts": [{"text": "cannot comply"}]}}]}),
        )]);
        let (retry, _) = quiet_retry();
        let strategy = ImmediateStrategy::new(transport, retry);
        let request = GenerationRequest::new(GenerationKind::Image, "cube");
        let mut state = JobState::new("job", None);

        let output = strategy
            .run(&request, &target(CompletionMode::Immediate), &mut state)
            .map_err(anyhow::Error::new)?;

        assert!(output.images.is_empty());
        assert_eq!(output.text.as_deref(), Some("cannot comply"));
        assert_eq!(output.warnings, vec![NO_IMAGE_WARNING.to_string()]);
        Ok(())
    }

    #[test]
    fn non_json_success_body_is_invalid_response() {
        let transport = StubTransport::new(vec![Scripted::Reply(RawResponse::new(
            200,
            "<html>gateway</html>",
        ))]);
        let (retry, _) = quiet_retry();
        let strategy = ImmediateStrategy::new(transport, retry);
        let request = GenerationRequest::new(GenerationKind::Image, "cube");
        let mut state = JobState::new("job", None);

        let failure = strategy
            .run(&request, &target(CompletionMode::Immediate), &mut state)
            .err();

        let failure = failure.unwrap_or_else(|| Failure::new(FailureKind::Network, "missing"));
        assert_eq!(failure.kind, FailureKind::InvalidResponse);
        assert_eq!(failure.raw_body.as_deref(), Some("<html>gateway</html>"));
    }
}
