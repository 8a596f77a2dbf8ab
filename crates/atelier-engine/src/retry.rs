use std::sync::Arc;
use std::thread;
use std::time::Duration;

use atelier_contracts::config::{seconds_or, RetrySettings};
use atelier_contracts::jobs::{Failure, FailureKind};
use rand::Rng;

use crate::state::JobState;
use crate::transport::{NetworkError, ResponseHead};

pub const TRANSIENT_STATUSES: [u16; 4] = [429, 500, 503, 504];

const OVERLOAD_HINTS: [&str; 2] = ["heavy load", "overloaded"];
const RAW_BODY_MAX_CHARS: usize = 4096;

/// Suspends the calling job. Swapped out in tests so nothing sleeps for real.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, delay: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, delay: Duration) {
        thread::sleep(delay);
    }
}

/// Provider-agnostic retry loop shared by every completion strategy.
#[derive(Clone)]
pub struct RetryPolicy {
    settings: RetrySettings,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryPolicy {
    pub fn new(settings: RetrySettings) -> Self {
        Self {
            settings,
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn sleeper(&self) -> &dyn Sleeper {
        self.sleeper.as_ref()
    }

    /// `min(max_delay, base_delay * 2^retry_index + jitter)`, jitter uniform in `[0, jitter_s)`.
    pub fn backoff_delay(&self, retry_index: u32) -> Duration {
        let exponent = retry_index.min(30) as i32;
        let base = self.settings.base_delay_s.max(0.0) * 2f64.powi(exponent);
        let jitter_s = self.settings.jitter_s;
        let jitter = if jitter_s > 0.0 && jitter_s.is_finite() {
            rand::thread_rng().gen_range(0.0..jitter_s)
        } else {
            0.0
        };
        let ceiling = self.max_delay();
        seconds_or(base + jitter, ceiling.as_secs_f64()).min(ceiling)
    }

    fn max_delay(&self) -> Duration {
        seconds_or(self.settings.max_delay_s, RetrySettings::default().max_delay_s)
    }

    /// Runs `attempt_fn` until it yields a non-error status, a permanent
    /// failure, or the attempt budget is spent.
    pub fn execute<R, F>(
        &self,
        state: &mut JobState,
        label: &str,
        mut attempt_fn: F,
    ) -> Result<R, Failure>
    where
        R: ResponseHead,
        F: FnMut() -> Result<R, NetworkError>,
    {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let has_budget = attempt < max_attempts;
            let (delay, reason) = match attempt_fn() {
                Ok(response) => {
                    let status = response.status();
                    if status < 400 {
                        return Ok(response);
                    }
                    let retry_after = response.header("retry-after").and_then(parse_retry_after);
                    let body = response.into_text();
                    let transient = is_transient(status, &body);
                    if !transient || !has_budget {
                        let message = if transient {
                            format!("{label} failed ({status}) after {attempt} attempts")
                        } else {
                            format!("{label} failed ({status}): {}", truncate_text(&body, 512))
                        };
                        return Err(Failure::new(FailureKind::Provider, message)
                            .with_status(status)
                            .with_raw_body(truncate_text(&body, RAW_BODY_MAX_CHARS)));
                    }
                    let delay = match retry_after {
                        Some(hinted) => {
                            if hinted > self.max_delay() {
                                state.warn(format!(
                                    "{label}: provider asked to wait {}s before retrying",
                                    hinted.as_secs()
                                ));
                            }
                            hinted
                        }
                        None => self.backoff_delay(attempt - 1),
                    };
                    (delay, format!("HTTP {status}"))
                }
                Err(err) => {
                    if !has_budget {
                        return Err(Failure::new(
                            FailureKind::Network,
                            format!("{label} failed after {attempt} attempts: {err}"),
                        ));
                    }
                    (self.backoff_delay(attempt - 1), err.to_string())
                }
            };
            state.record_retry(label, attempt, delay, &reason);
            self.sleeper.sleep(delay);
        }
    }
}

pub fn is_transient(status: u16, body: &str) -> bool {
    if TRANSIENT_STATUSES.contains(&status) {
        return true;
    }
    let lowered = body.to_ascii_lowercase();
    OVERLOAD_HINTS.iter().any(|hint| lowered.contains(hint))
}

/// Only a plain integer count of seconds is honored.
pub fn parse_retry_after(raw: &str) -> Option<Duration> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    trimmed.parse::<u64>().ok().map(Duration::from_secs)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}


#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::sync::Arc;

    use super::testing::RecordingSleeper;
    use super::*;
    use crate::transport::{NetworkErrorKind, RawResponse};

    fn policy(sleeper: &Arc<RecordingSleeper>) -> RetryPolicy {
        RetryPolicy::new(RetrySettings::default()).with_sleeper(sleeper.clone())
    }

    #[test]
    fn transient_statuses_are_retried_until_success() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let mut state = JobState::new("job", None);
        let calls = Cell::new(0u32);

        let response = policy(&sleeper).execute(&mut state, "image generation", || {
            calls.set(calls.get() + 1);
            if calls.get() <= 3 {
                Ok(RawResponse::new(503, "busy"))
            } else {
                Ok(RawResponse::new(200, "{}"))
            }
        });

        assert_eq!(response.map(|row| row.status).ok(), Some(200));
        assert_eq!(calls.get(), 4);
        assert_eq!(state.attempt, 3);
        let delays = sleeper.recorded();
        assert_eq!(delays.len(), 3);
        for (idx, delay) in delays.iter().enumerate() {
            let floor = 1.5 * 2f64.powi(idx as i32);
            assert!(delay.as_secs_f64() >= floor, "delay {idx} too short: {delay:?}");
            assert!(delay.as_secs_f64() < floor + 0.7, "delay {idx} too long: {delay:?}");
        }
    }

    #[test]
    fn persistent_503_stops_after_four_attempts() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let mut state = JobState::new("job", None);
        let calls = Cell::new(0u32);

        let failure = policy(&sleeper)
            .execute(&mut state, "video stream", || {
                calls.set(calls.get() + 1);
                Ok(RawResponse::new(503, "{\"error\":\"unavailable\"}"))
            })
            .err();

        assert_eq!(calls.get(), 4);
        assert_eq!(sleeper.recorded().len(), 3);
        let failure = failure.unwrap_or_else(|| Failure::new(FailureKind::Network, "missing"));
        assert_eq!(failure.kind, FailureKind::Provider);
        assert!(!failure.retriable);
        assert_eq!(failure.status, Some(503));
        assert_eq!(failure.raw_body.as_deref(), Some("{\"error\":\"unavailable\"}"));
    }

    #[test]
    fn client_errors_fail_without_retry() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let mut state = JobState::new("job", None);
        let calls = Cell::new(0u32);

        let failure = policy(&sleeper)
            .execute(&mut state, "image generation", || {
                calls.set(calls.get() + 1);
                Ok(RawResponse::new(400, "{\"error\":{\"message\":\"bad size\"}}"))
            })
            .err();

        assert_eq!(calls.get(), 1);
        assert!(sleeper.recorded().is_empty());
        let message = failure.map(|row| row.message).unwrap_or_default();
        assert!(message.contains("(400)"));
        assert!(message.contains("bad size"));
    }

    #[test]
    fn retry_after_seconds_are_used_verbatim() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let mut state = JobState::new("job", None);
        let calls = Cell::new(0u32);

        let response = policy(&sleeper).execute(&mut state, "poll", || {
            calls.set(calls.get() + 1);
            if calls.get() == 1 {
                Ok(RawResponse::new(429, "").with_header("Retry-After", "20"))
            } else {
                Ok(RawResponse::new(200, "{}"))
            }
        });

        assert!(response.is_ok());
        assert_eq!(sleeper.recorded(), vec![Duration::from_secs(20)]);
        assert_eq!(
            state.warnings(),
            &["poll: provider asked to wait 20s before retrying".to_string()]
        );
    }

    #[test]
    fn short_retry_after_adds_no_warning() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let mut state = JobState::new("job", None);
        let calls = Cell::new(0u32);

        let response = policy(&sleeper).execute(&mut state, "poll", || {
            calls.set(calls.get() + 1);
            if calls.get() == 1 {
                Ok(RawResponse::new(503, "").with_header("Retry-After", "2"))
            } else {
                Ok(RawResponse::new(200, "{}"))
            }
        });

        assert!(response.is_ok());
        assert_eq!(sleeper.recorded(), vec![Duration::from_secs(2)]);
        assert!(state.warnings().is_empty());
    }

    #[test]
    fn network_errors_are_retried_then_classified() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let mut state = JobState::new("job", None);
        let calls = Cell::new(0u32);

        let failure = policy(&sleeper)
            .execute::<RawResponse, _>(&mut state, "download", || {
                calls.set(calls.get() + 1);
                Err(NetworkError::new(NetworkErrorKind::Connect, "connection refused"))
            })
            .err();

        assert_eq!(calls.get(), 4);
        let failure = failure.unwrap_or_else(|| Failure::new(FailureKind::Provider, "missing"));
        assert_eq!(failure.kind, FailureKind::Network);
        assert!(!failure.retriable);
        assert!(failure.message.contains("connection refused"));
    }

    #[test]
    fn overload_text_counts_as_transient() {
        assert!(is_transient(502, "upstream under heavy load, try later"));
        assert!(is_transient(400, "Model is OVERLOADED"));
        assert!(!is_transient(400, "invalid prompt"));
        assert!(is_transient(504, ""));
    }

    #[test]
    fn retry_after_accepts_only_digit_counts() {
        assert_eq!(parse_retry_after(" 7 "), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after("1.5"), None);
        assert_eq!(parse_retry_after("Wed, 21 Oct 2026 07:28:00 GMT"), None);
        assert_eq!(parse_retry_after(""), None);
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::new(RetrySettings::default());
        for _ in 0..20 {
            assert!(policy.backoff_delay(5) <= Duration::from_secs(12));
        }
        let no_jitter = RetryPolicy::new(RetrySettings {
            jitter_s: 0.0,
            ..RetrySettings::default()
        });
        assert_eq!(no_jitter.backoff_delay(1), Duration::from_secs(3));
    }

    #[test]
    fn non_finite_settings_do_not_break_backoff() {
        let policy = RetryPolicy::new(RetrySettings {
            base_delay_s: f64::INFINITY,
            max_delay_s: f64::INFINITY,
            jitter_s: f64::NAN,
            ..RetrySettings::default()
        });
        assert_eq!(policy.backoff_delay(0), Duration::from_secs(12));

        let huge_jitter = RetryPolicy::new(RetrySettings {
            jitter_s: f64::INFINITY,
            ..RetrySettings::default()
        });
        assert_eq!(huge_jitter.backoff_delay(0), Duration::from_secs_f64(1.5));
    }
}
