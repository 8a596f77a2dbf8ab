use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub type JobResult = Result<GenerationOutput, Failure>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBytes {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoArtifact {
    pub bytes: Vec<u8>,
    pub locator: Option<String>,
    pub mime_type: Option<String>,
}

/// Normalized success value shared by every completion mode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOutput {
    pub images: Vec<ImageBytes>,
    pub text: Option<String>,
    pub video: Option<VideoArtifact>,
    pub provider_job_id: Option<String>,
    pub provider_request: Map<String, Value>,
    pub provider_response: Map<String, Value>,
    pub warnings: Vec<String>,
}

impl GenerationOutput {
    /// A well-formed response that carried neither images nor a video.
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.video.is_none()
    }

    pub fn video_bytes(&self) -> Option<&[u8]> {
        self.video.as_ref().map(|video| video.bytes.as_slice())
    }

    pub fn push_warning(&mut self, message: impl Into<String>) {
        let message = message.into();
        if message.trim().is_empty() || self.warnings.iter().any(|row| row == &message) {
            return;
        }
        self.warnings.push(message);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    Provider,
    NoContentReturned,
    NoLocatorFound,
    MissingReference,
    TimedOut,
    InvalidRequest,
    InvalidResponse,
    StreamInterrupted,
    Configuration,
    Unsupported,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Provider => "provider",
            Self::NoContentReturned => "no_content_returned",
            Self::NoLocatorFound => "no_locator_found",
            Self::MissingReference => "missing_reference",
            Self::TimedOut => "timed_out",
            Self::InvalidRequest => "invalid_request",
            Self::InvalidResponse => "invalid_response",
            Self::StreamInterrupted => "stream_interrupted",
            Self::Configuration => "configuration",
            Self::Unsupported => "unsupported",
        }
    }
}

/// Classified terminal failure of one job.
///
/// `raw_body` holds the provider's own error text whenever one was received;
/// callers decide how much of it to show.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{message}")]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    pub retriable: bool,
    pub status: Option<u16>,
    pub raw_body: Option<String>,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retriable: false,
            status: None,
            raw_body: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_raw_body(mut self, body: impl Into<String>) -> Self {
        let body = body.into();
        if !body.trim().is_empty() {
            self.raw_body = Some(body);
        }
        self
    }

    /// Whether submitting the same request again is a sensible next step.
    /// Timeouts and exhausted transient failures are, even though the
    /// orchestrator itself never retried them further.
    pub fn resubmittable(&self) -> bool {
        self.retriable
            || matches!(self.kind, FailureKind::TimedOut | FailureKind::Network)
            || matches!(self.status, Some(429 | 500 | 503 | 504))
    }
}
