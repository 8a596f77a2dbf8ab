mod immediate;
mod polled;
mod streamed;

use std::collections::BTreeMap;
use std::time::Duration;

use atelier_contracts::jobs::{
    Failure, FailureKind, GenerationOutput, GenerationRequest, VideoArtifact,
};
use atelier_contracts::providers::{CompletionMode, ProviderTarget};
use serde_json::Value;

use crate::retry::{truncate_text, RetryPolicy};
use crate::state::JobState;
use crate::transport::{HttpRequest, RawResponse, ResponseHead, Transport};

pub use immediate::ImmediateStrategy;
pub use polled::PolledStrategy;
pub use streamed::StreamedStrategy;

/// Drives one provider family from submission to a terminal outcome.
pub trait CompletionStrategy: Send + Sync {
    fn mode(&self) -> CompletionMode;

    fn run(
        &self,
        request: &GenerationRequest,
        target: &ProviderTarget,
        state: &mut JobState,
    ) -> Result<GenerationOutput, Failure>;
}

#[derive(Default)]
pub struct StrategyRegistry {
    strategies: BTreeMap<&'static str, Box<dyn CompletionStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S: CompletionStrategy + 'static>(&mut self, strategy: S) {
        self.strategies
            .insert(strategy.mode().as_str(), Box::new(strategy));
    }

    pub fn get(&self, mode: CompletionMode) -> Option<&dyn CompletionStrategy> {
        self.strategies
            .get(mode.as_str())
            .map(|strategy| strategy.as_ref())
    }
}

pub(crate) fn require_api_key(target: &ProviderTarget) -> Result<&str, Failure> {
    target
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            Failure::new(
                FailureKind::Configuration,
                format!("no API key configured for target '{}'", target.name),
            )
        })
}

pub(crate) fn parse_json_body(label: &str, response: &RawResponse) -> Result<Value, Failure> {
    response.json().map_err(|err| {
        Failure::new(
            FailureKind::InvalidResponse,
            format!("{label} returned invalid JSON: {err}"),
        )
        .with_status(response.status())
        .with_raw_body(truncate_text(&response.text(), 4096))
    })
}

/// Plain retry-wrapped GET of a generated artifact.
pub(crate) fn fetch_artifact(
    transport: &dyn Transport,
    retry: &RetryPolicy,
    state: &mut JobState,
    url: &str,
    timeout: Duration,
) -> Result<VideoArtifact, Failure> {
    let request = HttpRequest::get(url, timeout);
    let response = retry.execute(state, "video download", || transport.send(&request))?;
    if response.body.is_empty() {
        return Err(Failure::new(
            FailureKind::NoContentReturned,
            format!("video download from {url} returned an empty body"),
        )
        .with_status(response.status));
    }
    let mime_type = response.header("content-type").map(str::to_string);
    Ok(VideoArtifact {
        bytes: response.body,
        locator: Some(url.to_string()),
        mime_type,
    })
}
