use std::sync::Arc;
use std::time::Duration;

use atelier_contracts::config::PollSettings;
use atelier_contracts::events::{EventPayload, POLL_STATUS, PROVIDER_REQUEST};
use atelier_contracts::jobs::{
    Failure, FailureKind, GenerationOutput, GenerationRequest, VideoArtifact,
};
use atelier_contracts::providers::{CompletionMode, ProviderTarget};
use serde_json::{Map, Value};

use super::{fetch_artifact, parse_json_body, require_api_key, CompletionStrategy};
use crate::extract::extract_polled_locator;
use crate::payload::polled_video_form;
use crate::retry::{truncate_text, RetryPolicy};
use crate::state::{JobPhase, JobState};
use crate::transport::{HttpRequest, RawResponse, ResponseHead, Transport};

const SUCCESS_STATUSES: [&str; 2] = ["completed", "succeeded"];
const FAILURE_STATUSES: [&str; 4] = ["failed", "cancelled", "canceled", "error"];

/// Create-then-poll job: submit a multipart form, poll the job document at a
/// fixed interval, then fetch its content.
pub struct PolledStrategy {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    polling: PollSettings,
    download_timeout: Duration,
}

impl PolledStrategy {
    pub fn new(
        transport: Arc<dyn Transport>,
        retry: RetryPolicy,
        polling: PollSettings,
        download_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            retry,
            polling,
            download_timeout,
        }
    }

    fn submit(
        &self,
        request: &GenerationRequest,
        target: &ProviderTarget,
        api_key: &str,
        state: &mut JobState,
    ) -> Result<String, Failure> {
        let endpoint = format!("{}/videos", target.api_base());
        let (fields, warnings) = polled_video_form(request, &target.model);
        for warning in warnings {
            state.warn(warning);
        }
        let http_request = HttpRequest::post_multipart(&endpoint, fields, target.request_timeout())
            .with_bearer(api_key);

        let mut logged = EventPayload::new();
        logged.insert("endpoint".to_string(), Value::String(endpoint));
        logged.insert("model".to_string(), Value::String(target.model.clone()));
        state.emit(PROVIDER_REQUEST, logged);

        let transport = self.transport.as_ref();
        let response = self
            .retry
            .execute(state, "video job submit", || transport.send(&http_request))?;
        let document = parse_json_body("video job submit", &response)?;
        document
            .get("id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                Failure::new(
                    FailureKind::InvalidResponse,
                    "video job submit response missing id",
                )
                .with_status(response.status())
                .with_raw_body(truncate_text(&document.to_string(), 4096))
            })
    }

    /// Polls until a terminal status or `max_polls` status reads. No sleep
    /// follows the final read.
    fn await_completion(
        &self,
        target: &ProviderTarget,
        api_key: &str,
        job_id: &str,
        state: &mut JobState,
    ) -> Result<Value, Failure> {
        let status_url = format!("{}/videos/{job_id}", target.api_base());
        let http_request =
            HttpRequest::get(&status_url, target.request_timeout()).with_bearer(api_key);
        let transport = self.transport.as_ref();
        let max_polls = self.polling.max_polls.max(1);
        let mut last_document = Value::Null;
        let mut last_status = String::new();

        for poll in 1..=max_polls {
            let response = self
                .retry
                .execute(state, "video job status", || transport.send(&http_request))?;
            let document = parse_json_body("video job status", &response)?;
            let status = document
                .get("status")
                .and_then(Value::as_str)
                .map(str::to_ascii_lowercase)
                .unwrap_or_default();

            let mut logged = EventPayload::new();
            logged.insert("poll".to_string(), Value::from(poll));
            logged.insert("status".to_string(), Value::String(status.clone()));
            if let Some(progress) = document.get("progress") {
                logged.insert("progress".to_string(), progress.clone());
            }
            state.emit(POLL_STATUS, logged);

            if SUCCESS_STATUSES.contains(&status.as_str()) {
                return Ok(document);
            }
            if FAILURE_STATUSES.contains(&status.as_str()) {
                let detail = document
                    .get("error")
                    .and_then(|error| error.get("message").or(Some(error)))
                    .and_then(Value::as_str)
                    .unwrap_or(status.as_str())
                    .to_string();
                return Err(Failure::new(
                    FailureKind::Provider,
                    format!("video job {job_id} ended as {status}: {detail}"),
                )
                .with_raw_body(truncate_text(&document.to_string(), 4096)));
            }

            last_status = status;
            last_document = document;
            if poll < max_polls {
                self.retry.sleeper().sleep(self.polling.interval());
            }
        }

        let last_status = if last_status.is_empty() {
            "unknown".to_string()
        } else {
            last_status
        };
        Err(Failure::new(
            FailureKind::TimedOut,
            format!("video job {job_id} still {last_status} after {max_polls} polls"),
        )
        .with_raw_body(truncate_text(&last_document.to_string(), 4096)))
    }

    fn fetch_content(
        &self,
        target: &ProviderTarget,
        api_key: &str,
        job_id: &str,
        state: &mut JobState,
    ) -> Result<VideoArtifact, Failure> {
        let content_url = format!("{}/videos/{job_id}/content", target.api_base());
        let http_request =
            HttpRequest::get(&content_url, self.download_timeout).with_bearer(api_key);
        let transport = self.transport.as_ref();
        let response = self
            .retry
            .execute(state, "video content", || transport.send(&http_request))?;

        if let Some(document) = locator_document(&response) {
            let locator = extract_polled_locator(&document)?;
            return fetch_artifact(
                transport,
                &self.retry,
                state,
                &locator,
                self.download_timeout,
            );
        }
        if response.body.is_empty() {
            return Err(Failure::new(
                FailureKind::NoContentReturned,
                format!("video job {job_id} content was empty"),
            )
            .with_status(response.status));
        }
        let mime_type = response.header("content-type").map(str::to_string);
        Ok(VideoArtifact {
            bytes: response.body,
            locator: Some(content_url),
            mime_type,
        })
    }
}

/// The content endpoint answers either with the video itself or with a JSON
/// document pointing at it.
fn locator_document(response: &RawResponse) -> Option<Value> {
    let declared_json = response
        .header("content-type")
        .map(|value| value.to_ascii_lowercase().contains("json"))
        .unwrap_or(false);
    let looks_json = response
        .body
        .iter()
        .find(|byte| !byte.is_ascii_whitespace())
        .map(|byte| *byte == b'{')
        .unwrap_or(false);
    if !declared_json && !looks_json {
        return None;
    }
    response.json().ok().filter(Value::is_object)
}

impl CompletionStrategy for PolledStrategy {
    fn mode(&self) -> CompletionMode {
        CompletionMode::Polled
    }

    fn run(
        &self,
        request: &GenerationRequest,
        target: &ProviderTarget,
        state: &mut JobState,
    ) -> Result<GenerationOutput, Failure> {
        let api_key = require_api_key(target)?;
        let job_id = self.submit(request, target, api_key, state)?;
        state.provider_job_id = Some(job_id.clone());
        state.advance(JobPhase::InProgress);

        let document = self.await_completion(target, api_key, &job_id, state)?;
        let video = self.fetch_content(target, api_key, &job_id, state)?;

        let mut provider_request = Map::new();
        provider_request.insert(
            "endpoint".to_string(),
            Value::String(format!("{}/videos", target.api_base())),
        );
        provider_request.insert("model".to_string(), Value::String(target.model.clone()));
        let provider_response = document.as_object().cloned().unwrap_or_default();

        Ok(GenerationOutput {
            video: Some(video),
            provider_job_id: Some(job_id),
            provider_request,
            provider_response,
            ..GenerationOutput::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use atelier_contracts::jobs::{GenerationKind, ReferenceMedia, PARAM_DURATION};
    use serde_json::json;

    use super::super::testing::{quiet_retry, target, Scripted, StubTransport};
    use super::*;
    use crate::transport::{FormValue, HttpMethod, RequestBody};

    fn reply(body: Value) -> Scripted {
        Scripted::Reply(RawResponse::new(200, body.to_string()))
    }

    fn video_request() -> GenerationRequest {
        GenerationRequest::new(GenerationKind::Video, "turntable")
            .with_reference(ReferenceMedia::new(vec![5; 3], "image/jpeg"))
            .with_parameter(PARAM_DURATION, "8s")
    }

    fn polling(max_polls: u32) -> PollSettings {
        PollSettings {
            interval_s: 5.0,
            max_polls,
        }
    }

    #[test]
    fn polls_until_completed_then_fetches_content() -> anyhow::Result<()> {
        let transport = StubTransport::new(vec![
            reply(json!({"id": "vid_1", "status": "queued"})),
            reply(json!({"id": "vid_1", "status": "queued"})),
            reply(json!({"id": "vid_1", "status": "in_progress", "progress": 50})),
            reply(json!({"id": "vid_1", "status": "completed"})),
            Scripted::Reply(
                RawResponse::new(200, vec![0, 0, 0, 32]).with_header("Content-Type", "video/mp4"),
            ),
        ]);
        let (retry, sleeper) = quiet_retry();
        let strategy =
            PolledStrategy::new(transport.clone(), retry, polling(120), Duration::from_secs(60));
        let mut state = JobState::new("job", None);

        let output = strategy
            .run(&video_request(), &target(CompletionMode::Polled), &mut state)
            .map_err(anyhow::Error::new)?;

        assert_eq!(output.video_bytes(), Some(&[0u8, 0, 0, 32][..]));
        assert_eq!(output.provider_job_id.as_deref(), Some("vid_1"));
        assert_eq!(state.provider_job_id.as_deref(), Some("vid_1"));

        let urls = transport.urls();
        let status_url = "https://api.example.com/v1/videos/vid_1".to_string();
        assert_eq!(
            urls,
            vec![
                (HttpMethod::Post, "https://api.example.com/v1/videos".to_string()),
                (HttpMethod::Get, status_url.clone()),
                (HttpMethod::Get, status_url.clone()),
                (HttpMethod::Get, status_url),
                (HttpMethod::Get, "https://api.example.com/v1/videos/vid_1/content".to_string()),
            ]
        );
        assert_eq!(
            sleeper.recorded(),
            vec![Duration::from_secs(5), Duration::from_secs(5)]
        );

        let sent = transport.requests();
        let RequestBody::Multipart(fields) = &sent[0].body else {
            anyhow::bail!("expected a multipart body");
        };
        assert!(fields.contains(&("seconds".to_string(), FormValue::Text("8".to_string()))));
        assert!(fields.iter().any(|(name, _)| name == "input_reference"));
        Ok(())
    }

    #[test]
    fn never_completing_job_times_out_after_max_polls() {
        let mut script = vec![reply(json!({"id": "vid_2", "status": "queued"}))];
        for _ in 0..10 {
            script.push(reply(json!({"id": "vid_2", "status": "in_progress"})));
        }
        let transport = StubTransport::new(script);
        let (retry, sleeper) = quiet_retry();
        let strategy =
            PolledStrategy::new(transport.clone(), retry, polling(3), Duration::from_secs(60));
        let mut state = JobState::new("job", None);

        let failure = strategy
            .run(&video_request(), &target(CompletionMode::Polled), &mut state)
            .err()
            .unwrap_or_else(|| Failure::new(FailureKind::Network, "missing"));

        assert_eq!(failure.kind, FailureKind::TimedOut);
        assert!(failure.message.contains("in_progress"));
        assert_eq!(transport.calls(), 4);
        let slept: Duration = sleeper.recorded().iter().sum();
        assert!(slept <= Duration::from_secs(3 * 5));
        assert_eq!(sleeper.recorded().len(), 2);
    }

    #[test]
    fn failed_job_surfaces_provider_error() {
        let transport = StubTransport::new(vec![
            reply(json!({"id": "vid_3", "status": "queued"})),
            reply(json!({"id": "vid_3", "status": "failed", "error": {"message": "moderation blocked"}})),
        ]);
        let (retry, _) = quiet_retry();
        let strategy = PolledStrategy::new(transport, retry, polling(5), Duration::from_secs(60));
        let mut state = JobState::new("job", None);

        let failure = strategy
            .run(&video_request(), &target(CompletionMode::Polled), &mut state)
            .err()
            .unwrap_or_else(|| Failure::new(FailureKind::Network, "missing"));

        assert_eq!(failure.kind, FailureKind::Provider);
        assert!(failure.message.contains("moderation blocked"));
        assert!(failure
            .raw_body
            .as_deref()
            .unwrap_or_default()
            .contains("moderation blocked"));
    }

    #[test]
    fn submit_without_id_is_invalid_response() {
        let transport = StubTransport::new(vec![reply(json!({"status": "queued"}))]);
        let (retry, _) = quiet_retry();
        let strategy = PolledStrategy::new(transport, retry, polling(5), Duration::from_secs(60));
        let mut state = JobState::new("job", None);

        let failure = strategy
            .run(&video_request(), &target(CompletionMode::Polled), &mut state)
            .err()
            .unwrap_or_else(|| Failure::new(FailureKind::Network, "missing"));

        assert_eq!(failure.kind, FailureKind::InvalidResponse);
        assert_eq!(state.phase(), JobPhase::Submitted);
    }

    #[test]
    fn json_content_is_followed_to_its_url() -> anyhow::Result<()> {
        let transport = StubTransport::new(vec![
            reply(json!({"id": "vid_4", "status": "queued"})),
            reply(json!({"id": "vid_4", "status": "succeeded"})),
            reply(json!({"url": "https://files.example.com/vid_4.mp4"})),
            Scripted::Reply(RawResponse::new(200, vec![7; 16])),
        ]);
        let (retry, _) = quiet_retry();
        let strategy =
            PolledStrategy::new(transport.clone(), retry, polling(5), Duration::from_secs(60));
        let mut state = JobState::new("job", None);

        let output = strategy
            .run(&video_request(), &target(CompletionMode::Polled), &mut state)
            .map_err(anyhow::Error::new)?;

        let locator = output.video.as_ref().and_then(|video| video.locator.clone());
        assert_eq!(locator.as_deref(), Some("https://files.example.com/vid_4.mp4"));
        let last = transport.requests().pop().map(|request| request.headers);
        assert_eq!(last, Some(Vec::new()));
        Ok(())
    }
}
