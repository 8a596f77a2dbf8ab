use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

pub const JOB_SUBMITTED: &str = "job_submitted";
pub const PROVIDER_REQUEST: &str = "provider_request";
pub const RETRY_SCHEDULED: &str = "retry_scheduled";
pub const STREAM_FINISHED: &str = "stream_finished";
pub const POLL_STATUS: &str = "poll_status";
pub const JOB_COMPLETED: &str = "job_completed";
pub const JOB_FAILED: &str = "job_failed";
pub const JOB_TIMED_OUT: &str = "job_timed_out";

/// Keys every record owns; payload entries with these names are dropped.
const RESERVED_KEYS: [&str; 4] = ["type", "session_id", "job_id", "ts"];

/// Job log for one session: `events.jsonl`, one compact JSON object per line.
///
/// Every record carries `type`, `session_id`, `job_id` and `ts` next to the
/// event payload. Clones share one append handle, so jobs running on several
/// threads interleave whole lines.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<JobLog>,
}

#[derive(Debug)]
struct JobLog {
    path: PathBuf,
    session_id: String,
    file: Mutex<Option<File>>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(JobLog {
                path: path.into(),
                session_id: session_id.into(),
                file: Mutex::new(None),
            }),
        }
    }

    /// Appends one record for `job_id` and returns it.
    pub fn emit(&self, job_id: &str, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut record = Map::new();
        record.insert("type".to_string(), Value::String(event_type.to_string()));
        record.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        record.insert("job_id".to_string(), Value::String(job_id.to_string()));
        record.insert("ts".to_string(), Value::String(now_utc_iso()));
        record.extend(
            payload
                .into_iter()
                .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str())),
        );

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut file = self
            .inner
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("job log lock poisoned"))?;
        if file.is_none() {
            *file = Some(self.open_log()?);
        }
        if let Some(handle) = file.as_mut() {
            handle
                .write_all(&line)
                .with_context(|| format!("failed appending to {}", self.inner.path.display()))?;
        }
        Ok(Value::Object(record))
    }

    fn open_log(&self) -> anyhow::Result<File> {
        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)
            .with_context(|| format!("failed opening {}", self.inner.path.display()))
    }

    /// Reads back every event of the given type, in write order.
    pub fn read_events(&self, event_type: &str) -> anyhow::Result<Vec<Value>> {
        self.read_matching("type", event_type)
    }

    /// Every event recorded for one job, in write order.
    pub fn job_history(&self, job_id: &str) -> anyhow::Result<Vec<Value>> {
        self.read_matching("job_id", job_id)
    }

    fn read_matching(&self, key: &str, wanted: &str) -> anyhow::Result<Vec<Value>> {
        let raw = match std::fs::read_to_string(&self.inner.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        Ok(raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter(|row| row.get(key).and_then(Value::as_str) == Some(wanted))
            .collect())
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
