use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use atelier_contracts::events::{EventPayload, PROVIDER_REQUEST, STREAM_FINISHED};
use atelier_contracts::jobs::{Failure, FailureKind, GenerationOutput, GenerationRequest};
use atelier_contracts::providers::{CompletionMode, ProviderTarget};
use serde_json::{Map, Value};

use super::{fetch_artifact, require_api_key, CompletionStrategy};
use crate::extract::{extract_video_locator, parse_stream_line, StreamRecord};
use crate::payload::{resolve_streamed_model, streamed_video_payload};
use crate::retry::{truncate_text, RetryPolicy};
use crate::state::{JobPhase, JobState};
use crate::transport::{HttpRequest, Transport};

pub(crate) const MISSING_DONE_WARNING: &str =
    "video stream closed without a [DONE] marker; used the text received so far";

/// Chat-completions style job: progress arrives as SSE deltas and the final
/// text carries the video URL.
pub struct StreamedStrategy {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    download_timeout: Duration,
}

impl StreamedStrategy {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy, download_timeout: Duration) -> Self {
        Self {
            transport,
            retry,
            download_timeout,
        }
    }
}

impl CompletionStrategy for StreamedStrategy {
    fn mode(&self) -> CompletionMode {
        CompletionMode::Streamed
    }

    fn run(
        &self,
        request: &GenerationRequest,
        target: &ProviderTarget,
        state: &mut JobState,
    ) -> Result<GenerationOutput, Failure> {
        let api_key = require_api_key(target)?;
        let model = resolve_streamed_model(&target.model, request);
        let endpoint = format!("{}/chat/completions", target.api_base());
        let http_request = HttpRequest::post_json(
            &endpoint,
            streamed_video_payload(request, &model),
            target.request_timeout(),
        )
        .with_bearer(api_key)
        .with_header("Accept", "text/event-stream");

        let mut logged = EventPayload::new();
        logged.insert("endpoint".to_string(), Value::String(endpoint.clone()));
        logged.insert("model".to_string(), Value::String(model.clone()));
        state.emit(PROVIDER_REQUEST, logged);

        let transport = self.transport.as_ref();
        let mut stream = self
            .retry
            .execute(state, "video stream", || transport.open_stream(&http_request))?;
        state.advance(JobPhase::InProgress);

        let mut saw_done = false;
        let mut line = Vec::new();
        loop {
            line.clear();
            match stream.body.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => match parse_stream_line(&String::from_utf8_lossy(&line)) {
                    StreamRecord::Delta(content) => state.raw_accumulator.push_str(&content),
                    StreamRecord::Done => {
                        saw_done = true;
                        break;
                    }
                    StreamRecord::Skip => {}
                },
                Err(err) => {
                    return Err(Failure::new(
                        FailureKind::StreamInterrupted,
                        format!("video stream interrupted: {err}"),
                    )
                    .with_raw_body(truncate_text(&state.raw_accumulator, 4096)));
                }
            }
        }
        drop(stream);
        if !saw_done {
            state.warn(MISSING_DONE_WARNING);
        }

        let mut finished = EventPayload::new();
        finished.insert("done_marker".to_string(), Value::Bool(saw_done));
        finished.insert("bytes".to_string(), Value::from(state.raw_accumulator.len()));
        state.emit(STREAM_FINISHED, finished);

        let locator = extract_video_locator(&state.raw_accumulator)?;
        let video = fetch_artifact(
            transport,
            &self.retry,
            state,
            &locator,
            self.download_timeout,
        )?;

        let mut provider_request = Map::new();
        provider_request.insert("endpoint".to_string(), Value::String(endpoint));
        provider_request.insert("model".to_string(), Value::String(model));
        let mut provider_response = Map::new();
        provider_response.insert("locator".to_string(), Value::String(locator));
        provider_response.insert("done_marker".to_string(), Value::Bool(saw_done));

        Ok(GenerationOutput {
            text: Some(state.raw_accumulator.trim().to_string()).filter(|text| !text.is_empty()),
            video: Some(video),
            provider_request,
            provider_response,
            ..GenerationOutput::default()
        })
    }
}
