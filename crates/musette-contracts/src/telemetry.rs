use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type TelemetryPayload = Map<String, Value>;

/// Append-only JSONL trace of gateway activity.
///
/// Each line is one compact JSON object with `event`, `session_id`, and `ts`
/// defaults; the caller payload is merged last and may override them.
#[derive(Debug, Clone)]
pub struct TelemetryWriter {
    inner: Arc<TelemetryInner>,
}

#[derive(Debug)]
struct TelemetryInner {
    path: PathBuf,
    session_id: String,
    lock: Mutex<()>,
}

impl TelemetryWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TelemetryInner {
                path: path.into(),
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn record(&self, event: &str, payload: TelemetryPayload) -> anyhow::Result<Value> {
        let mut row = Map::new();
        row.insert("event".to_string(), Value::String(event.to_string()));
        row.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        row.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            row.insert(key, value);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&row)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("telemetry writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(row))
    }

    pub fn request_started(
        &self,
        endpoint_id: &str,
        group: Option<&str>,
    ) -> anyhow::Result<Value> {
        let mut payload = TelemetryPayload::new();
        payload.insert(
            "endpoint_id".to_string(),
            Value::String(endpoint_id.to_string()),
        );
        payload.insert(
            "group".to_string(),
            group
                .map(|value| Value::String(value.to_string()))
                .unwrap_or(Value::Null),
        );
        self.record("request_started", payload)
    }

    pub fn request_finished(
        &self,
        endpoint_id: &str,
        succeeded: bool,
        elapsed_seconds: f64,
    ) -> anyhow::Result<Value> {
        let mut payload = TelemetryPayload::new();
        payload.insert(
            "endpoint_id".to_string(),
            Value::String(endpoint_id.to_string()),
        );
        payload.insert(
            "elapsed_seconds".to_string(),
            serde_json::Number::from_f64(elapsed_seconds)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        );
        let event = if succeeded {
            "request_succeeded"
        } else {
            "request_failed"
        };
        self.record(event, payload)
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
