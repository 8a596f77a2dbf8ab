use std::fmt;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::jobs::GenerationKind;

pub const DEFAULT_IMAGE_MODEL: &str = "gemini-3-pro-image-preview";
pub const DEFAULT_STREAMED_VIDEO_MODEL: &str = "sora_video2";
pub const DEFAULT_POLLED_VIDEO_MODEL: &str = "sora-2";

/// How a provider family signals that a job is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionMode {
    Immediate,
    Streamed,
    Polled,
}

impl CompletionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Streamed => "streamed",
            Self::Polled => "polled",
        }
    }

    pub fn supports(self, kind: GenerationKind) -> bool {
        match self {
            Self::Immediate => matches!(kind, GenerationKind::Image | GenerationKind::ImageEdit),
            Self::Streamed | Self::Polled => kind == GenerationKind::Video,
        }
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderTarget {
    pub name: String,
    pub mode: CompletionMode,
    pub api_base: String,
    pub model: String,
    #[serde(default = "default_request_timeout_s")]
    pub request_timeout_s: f64,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

impl ProviderTarget {
    pub fn new(
        name: impl Into<String>,
        mode: CompletionMode,
        api_base: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            mode,
            api_base: api_base.into().trim().trim_end_matches('/').to_string(),
            model: model.into(),
            request_timeout_s: default_request_timeout_s(),
            api_key: None,
        }
    }

    pub fn with_timeout_s(mut self, seconds: f64) -> Self {
        self.request_timeout_s = seconds;
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        let key = api_key.into();
        self.api_key = Some(key.trim().to_string()).filter(|value| !value.is_empty());
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_s.clamp(1.0, 3600.0))
    }

    pub fn api_base(&self) -> &str {
        self.api_base.trim_end_matches('/')
    }
}

impl fmt::Debug for ProviderTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderTarget")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("api_base", &self.api_base)
            .field("model", &self.model)
            .field("request_timeout_s", &self.request_timeout_s)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetSelection {
    pub target: ProviderTarget,
    pub fallback_reason: Option<String>,
}

/// Insertion-ordered set of configured targets. The first target that
/// supports a kind is the default for it.
#[derive(Debug, Clone)]
pub struct TargetRegistry {
    targets: IndexMap<String, ProviderTarget>,
}

impl TargetRegistry {
    pub fn new(targets: Vec<ProviderTarget>) -> Self {
        let mut map = IndexMap::new();
        for target in targets {
            map.insert(target.name.clone(), target);
        }
        Self { targets: map }
    }

    pub fn with_defaults(api_base: &str, api_key: Option<&str>) -> Self {
        Self::new(default_targets(api_base, api_key))
    }

    pub fn get(&self, name: &str) -> Option<&ProviderTarget> {
        self.targets.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ProviderTarget> {
        self.targets.values()
    }

    pub fn for_kind(&self, kind: GenerationKind) -> Vec<&ProviderTarget> {
        self.targets
            .values()
            .filter(|target| target.mode.supports(kind))
            .collect()
    }

    pub fn select(
        &self,
        requested: Option<&str>,
        kind: GenerationKind,
    ) -> Result<TargetSelection, String> {
        let fallback_reason = match requested {
            Some(requested_value) => match self.get(requested_value) {
                Some(target) if target.mode.supports(kind) => {
                    return Ok(TargetSelection {
                        target: target.clone(),
                        fallback_reason: None,
                    });
                }
                _ => Some(format!(
                    "Requested target '{requested_value}' unavailable for '{}'.",
                    kind.as_str()
                )),
            },
            None => None,
        };

        let Some(target) = self.for_kind(kind).first().map(|target| (*target).clone()) else {
            return Err(format!("No targets configured for '{}'.", kind.as_str()));
        };
        Ok(TargetSelection {
            target,
            fallback_reason,
        })
    }
}

fn default_targets(api_base: &str, api_key: Option<&str>) -> Vec<ProviderTarget> {
    let base = api_base.trim().trim_end_matches('/');
    let targets = vec![
        ProviderTarget::new(
            "gemini-image",
            CompletionMode::Immediate,
            format!("{base}/v1beta"),
            DEFAULT_IMAGE_MODEL,
        )
        .with_timeout_s(360.0),
        ProviderTarget::new(
            "sora-stream",
            CompletionMode::Streamed,
            format!("{base}/v1"),
            DEFAULT_STREAMED_VIDEO_MODEL,
        )
        .with_timeout_s(600.0),
        ProviderTarget::new(
            "sora-jobs",
            CompletionMode::Polled,
            format!("{base}/v1"),
            DEFAULT_POLLED_VIDEO_MODEL,
        )
        .with_timeout_s(120.0),
    ];
    match api_key {
        Some(key) => targets
            .into_iter()
            .map(|target| target.with_api_key(key))
            .collect(),
        None => targets,
    }
}

fn default_request_timeout_s() -> f64 {
    300.0
}
