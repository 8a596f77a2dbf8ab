use std::sync::Arc;

use atelier_contracts::config::StudioConfig;
use atelier_contracts::events::{
    EventPayload, EventWriter, JOB_COMPLETED, JOB_FAILED, JOB_SUBMITTED, JOB_TIMED_OUT,
};
use atelier_contracts::jobs::{Failure, FailureKind, GenerationRequest, JobResult};
use atelier_contracts::providers::ProviderTarget;
use serde_json::Value;
use uuid::Uuid;

use crate::retry::{truncate_text, RetryPolicy, Sleeper, ThreadSleeper};
use crate::state::{JobPhase, JobState};
use crate::strategies::{
    require_api_key, CompletionStrategy, ImmediateStrategy, PolledStrategy, StrategyRegistry,
    StreamedStrategy,
};
use crate::transport::Transport;

const EVENT_RAW_BODY_MAX_CHARS: usize = 512;

/// Single entry point for every generation job.
///
/// Validates the request against the chosen target, hands it to the
/// strategy for the target's completion mode, and turns whatever comes back
/// into one terminal `JobResult`. Each call owns its own `JobState`, so one
/// orchestrator can serve concurrent jobs.
pub struct Orchestrator {
    strategies: StrategyRegistry,
    events: Option<EventWriter>,
}

impl Orchestrator {
    pub fn new(config: &StudioConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_sleeper(config, transport, Arc::new(ThreadSleeper))
    }

    pub fn with_sleeper(
        config: &StudioConfig,
        transport: Arc<dyn Transport>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let retry = RetryPolicy::new(config.retry.clone()).with_sleeper(sleeper);
        let download_timeout = config.download_timeout();
        let mut strategies = StrategyRegistry::new();
        strategies.register(ImmediateStrategy::new(transport.clone(), retry.clone()));
        strategies.register(StreamedStrategy::new(
            transport.clone(),
            retry.clone(),
            download_timeout,
        ));
        strategies.register(PolledStrategy::new(
            transport,
            retry,
            config.polling.clone(),
            download_timeout,
        ));
        Self::from_strategies(strategies)
    }

    pub fn from_strategies(strategies: StrategyRegistry) -> Self {
        Self {
            strategies,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn submit(&self, request: &GenerationRequest, target: &ProviderTarget) -> JobResult {
        let mut state = JobState::new(Uuid::new_v4().to_string(), self.events.clone());
        let mut submitted = EventPayload::new();
        submitted.insert("target".to_string(), Value::String(target.name.clone()));
        submitted.insert("mode".to_string(), Value::String(target.mode.as_str().to_string()));
        submitted.insert("model".to_string(), Value::String(target.model.clone()));
        submitted.insert("request".to_string(), Value::Object(request.summary()));
        state.emit(JOB_SUBMITTED, submitted);

        let outcome = self
            .strategy_for(request, target)
            .and_then(|strategy| strategy.run(request, target, &mut state));
        finish(state, target, outcome)
    }

    /// Rejects requests that cannot succeed before any network call is made.
    fn strategy_for(
        &self,
        request: &GenerationRequest,
        target: &ProviderTarget,
    ) -> Result<&dyn CompletionStrategy, Failure> {
        if request.kind.requires_reference() && request.reference_media.is_empty() {
            return Err(Failure::new(
                FailureKind::MissingReference,
                format!("{} requests need at least one reference image", request.kind.as_str()),
            ));
        }
        if request.prompt.trim().is_empty() {
            return Err(Failure::new(FailureKind::InvalidRequest, "prompt is empty"));
        }
        if !target.mode.supports(request.kind) {
            return Err(Failure::new(
                FailureKind::Unsupported,
                format!(
                    "target '{}' ({}) cannot produce {} output",
                    target.name,
                    target.mode.as_str(),
                    request.kind.as_str()
                ),
            ));
        }
        require_api_key(target)?;
        self.strategies.get(target.mode).ok_or_else(|| {
            Failure::new(
                FailureKind::Unsupported,
                format!("no strategy registered for {} targets", target.mode.as_str()),
            )
        })
    }
}

fn finish(mut state: JobState, target: &ProviderTarget, outcome: JobResult) -> JobResult {
    let mut payload = EventPayload::new();
    payload.insert("target".to_string(), Value::String(target.name.clone()));
    payload.insert("retries".to_string(), Value::from(state.attempt));
    payload.insert(
        "elapsed_s".to_string(),
        Value::from(state.elapsed().as_secs_f64()),
    );
    if let Some(provider_job_id) = state.provider_job_id.clone() {
        payload.insert("provider_job_id".to_string(), Value::String(provider_job_id));
    }

    match outcome {
        Ok(mut output) => {
            state.advance(JobPhase::Completed);
            payload.insert("images".to_string(), Value::from(output.images.len()));
            payload.insert("video".to_string(), Value::Bool(output.video.is_some()));
            state.emit(JOB_COMPLETED, payload);
            for warning in state.take_warnings() {
                output.push_warning(warning);
            }
            if output.provider_job_id.is_none() {
                output.provider_job_id = state.provider_job_id.take();
            }
            Ok(output)
        }
        Err(failure) => {
            let (phase, event_type) = if failure.kind == FailureKind::TimedOut {
                (JobPhase::TimedOut, JOB_TIMED_OUT)
            } else {
                (JobPhase::Failed, JOB_FAILED)
            };
            state.advance(phase);
            payload.insert("kind".to_string(), Value::String(failure.kind.as_str().to_string()));
            payload.insert("message".to_string(), Value::String(failure.message.clone()));
            if let Some(status) = failure.status {
                payload.insert("status".to_string(), Value::from(status));
            }
            if let Some(raw_body) = failure.raw_body.as_deref() {
                payload.insert(
                    "raw_body".to_string(),
                    Value::String(truncate_text(raw_body, EVENT_RAW_BODY_MAX_CHARS)),
                );
            }
            state.emit(event_type, payload);
            Err(failure)
        }
    }
}

#[cfg(test)]
mod tests {
    use atelier_contracts::config::PollSettings;
    use atelier_contracts::jobs::{GenerationKind, ReferenceMedia, PARAM_ASPECT_RATIO};
    use atelier_contracts::providers::CompletionMode;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use serde_json::json;

    use super::*;
    use crate::retry::testing::RecordingSleeper;
    use crate::strategies::testing::{target, Scripted, StubTransport};
    use crate::transport::{RawResponse, RequestBody};

    fn orchestrator(
        config: &StudioConfig,
        transport: &Arc<StubTransport>,
    ) -> (Orchestrator, Arc<RecordingSleeper>) {
        let sleeper = Arc::new(RecordingSleeper::default());
        let orchestrator = Orchestrator::with_sleeper(config, transport.clone(), sleeper.clone());
        (orchestrator, sleeper)
    }

    fn gemini_reply(image: &[u8]) -> Scripted {
        let body = json!({
            "candidates": [{"content": {"parts": [
                {"inlineData": {"mimeType": "image/png", "data": BASE64.encode(image)}},
                {"text": "done"}
            ]}}]
        });
        Scripted::Reply(RawResponse::new(200, body.to_string()))
    }

    fn expect_failure(result: JobResult) -> Failure {
        result
            .err()
            .unwrap_or_else(|| Failure::new(FailureKind::Network, "expected a failure"))
    }

    #[test]
    fn image_job_end_to_end() -> anyhow::Result<()> {
        let image = b"\x89PNG fake bytes".to_vec();
        let transport = StubTransport::new(vec![gemini_reply(&image)]);
        let (orchestrator, _) = orchestrator(&StudioConfig::default(), &transport);
        let request = GenerationRequest::new(GenerationKind::Image, "a red cube on white background")
            .with_parameter(PARAM_ASPECT_RATIO, "1:1");

        let output = orchestrator
            .submit(&request, &target(CompletionMode::Immediate))
            .map_err(anyhow::Error::new)?;

        assert_eq!(output.images.len(), 1);
        assert_eq!(output.images[0].bytes, image);
        assert_eq!(output.text.as_deref(), Some("done"));
        let sent = transport.requests();
        let RequestBody::Json(body) = &sent[0].body else {
            anyhow::bail!("expected a JSON body");
        };
        assert_eq!(
            body["contents"][0]["parts"][0]["text"],
            json!("a red cube on white background")
        );
        assert_eq!(
            body["generationConfig"]["imageConfig"]["aspectRatio"],
            json!("1:1")
        );
        Ok(())
    }

    #[test]
    fn missing_reference_fails_before_any_network_call() {
        let transport = StubTransport::new(Vec::new());
        let (orchestrator, _) = orchestrator(&StudioConfig::default(), &transport);

        for (kind, mode) in [
            (GenerationKind::ImageEdit, CompletionMode::Immediate),
            (GenerationKind::Video, CompletionMode::Streamed),
            (GenerationKind::Video, CompletionMode::Polled),
        ] {
            let request = GenerationRequest::new(kind, "make it blue");
            let failure = expect_failure(orchestrator.submit(&request, &target(mode)));
            assert_eq!(failure.kind, FailureKind::MissingReference);
            assert!(!failure.retriable);
        }
        assert_eq!(transport.calls(), 0);
    }

    #[test]
    fn transient_errors_are_absorbed() -> anyhow::Result<()> {
        let busy = || Scripted::Reply(RawResponse::new(503, "{\"error\":\"busy\"}"));
        let transport = StubTransport::new(vec![busy(), busy(), busy(), gemini_reply(b"img")]);
        let (orchestrator, sleeper) = orchestrator(&StudioConfig::default(), &transport);
        let request = GenerationRequest::new(GenerationKind::Image, "cube");

        let output = orchestrator
            .submit(&request, &target(CompletionMode::Immediate))
            .map_err(anyhow::Error::new)?;

        assert_eq!(output.images.len(), 1);
        assert_eq!(transport.calls(), 4);
        assert_eq!(sleeper.recorded().len(), 3);
        Ok(())
    }

    #[test]
    fn persistent_503_surfaces_raw_body_after_four_attempts() {
        let transport = StubTransport::new(
            (0..6)
                .map(|_| Scripted::Reply(RawResponse::new(503, "{\"error\":\"still busy\"}")))
                .collect(),
        );
        let (orchestrator, _) = orchestrator(&StudioConfig::default(), &transport);
        let request = GenerationRequest::new(GenerationKind::Image, "cube");

        let failure = expect_failure(orchestrator.submit(&request, &target(CompletionMode::Immediate)));

        assert_eq!(transport.calls(), 4);
        assert_eq!(failure.kind, FailureKind::Provider);
        assert!(!failure.retriable);
        assert!(failure.resubmittable());
        assert_eq!(failure.raw_body.as_deref(), Some("{\"error\":\"still busy\"}"));
    }

    #[test]
    fn mismatched_mode_and_missing_key_are_rejected_locally() {
        let transport = StubTransport::new(Vec::new());
        let (orchestrator, _) = orchestrator(&StudioConfig::default(), &transport);
        let image = GenerationRequest::new(GenerationKind::Image, "cube");

        let unsupported = expect_failure(orchestrator.submit(&image, &target(CompletionMode::Polled)));
        assert_eq!(unsupported.kind, FailureKind::Unsupported);

        let mut keyless = target(CompletionMode::Immediate);
        keyless.api_key = None;
        let unconfigured = expect_failure(orchestrator.submit(&image, &keyless));
        assert_eq!(unconfigured.kind, FailureKind::Configuration);

        let blank = GenerationRequest::new(GenerationKind::Image, "   ");
        let invalid = expect_failure(orchestrator.submit(&blank, &target(CompletionMode::Immediate)));
        assert_eq!(invalid.kind, FailureKind::InvalidRequest);

        assert_eq!(transport.calls(), 0);
    }

    #[test]
    fn lifecycle_events_are_logged() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events = EventWriter::new(temp.path().join("events.jsonl"), "session-1");
        let transport = StubTransport::new(vec![
            Scripted::Reply(RawResponse::new(429, "").with_header("Retry-After", "2")),
            gemini_reply(b"img"),
        ]);
        let (orchestrator, sleeper) = orchestrator(&StudioConfig::default(), &transport);
        let orchestrator = orchestrator.with_events(events.clone());
        let request = GenerationRequest::new(GenerationKind::Image, "cube");

        orchestrator
            .submit(&request, &target(CompletionMode::Immediate))
            .map_err(anyhow::Error::new)?;

        assert_eq!(sleeper.recorded(), vec![std::time::Duration::from_secs(2)]);
        let submitted = events.read_events(JOB_SUBMITTED)?;
        let completed = events.read_events(JOB_COMPLETED)?;
        assert_eq!(submitted.len(), 1);
        assert_eq!(completed.len(), 1);
        assert_eq!(submitted[0]["job_id"], completed[0]["job_id"]);
        assert_eq!(completed[0]["retries"], json!(1));
        assert_eq!(completed[0]["images"], json!(1));
        assert_eq!(events.read_events("retry_scheduled")?.len(), 1);
        Ok(())
    }

    #[test]
    fn polling_past_the_bound_is_a_timed_out_job() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events = EventWriter::new(temp.path().join("events.jsonl"), "session-2");
        let mut script = vec![Scripted::Reply(RawResponse::new(
            200,
            json!({"id": "vid_9", "status": "queued"}).to_string(),
        ))];
        for _ in 0..4 {
            script.push(Scripted::Reply(RawResponse::new(
                200,
                json!({"id": "vid_9", "status": "queued"}).to_string(),
            )));
        }
        let transport = StubTransport::new(script);
        let config = StudioConfig {
            polling: PollSettings {
                interval_s: 5.0,
                max_polls: 4,
            },
            ..StudioConfig::default()
        };
        let (orchestrator, sleeper) = orchestrator(&config, &transport);
        let orchestrator = orchestrator.with_events(events.clone());
        let request = GenerationRequest::new(GenerationKind::Video, "orbit")
            .with_reference(ReferenceMedia::new(vec![1], "image/png"));

        let failure = expect_failure(orchestrator.submit(&request, &target(CompletionMode::Polled)));

        assert_eq!(failure.kind, FailureKind::TimedOut);
        assert!(failure.resubmittable());
        assert_eq!(transport.calls(), 5);
        assert_eq!(sleeper.recorded().len(), 3);
        let timed_out = events.read_events(JOB_TIMED_OUT)?;
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0]["provider_job_id"], json!("vid_9"));
        assert_eq!(events.read_events("poll_status")?.len(), 4);
        Ok(())
    }
}
