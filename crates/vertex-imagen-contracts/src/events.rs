use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::messages::ToolMessage;

pub type EventPayload = Map<String, Value>;

const OMITTED: &str = "<omitted>";

/// Append-only writer for an invocation's `events.jsonl`.
///
/// - default fields are `type`, `invocation_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    invocation_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, invocation_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                invocation_id: invocation_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn invocation_id(&self) -> &str {
        &self.inner.invocation_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "invocation_id".to_string(),
            Value::String(self.inner.invocation_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, sanitize_payload(&value));
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }
}

/// Event payload describing one emitted message without its binary content.
pub fn message_payload(index: usize, message: &ToolMessage) -> EventPayload {
    let mut payload = EventPayload::new();
    payload.insert("index".to_string(), Value::Number(index.into()));
    payload.insert(
        "kind".to_string(),
        Value::String(message.kind().to_string()),
    );
    match message {
        ToolMessage::Text { text } => {
            payload.insert("text".to_string(), Value::String(text.clone()));
        }
        ToolMessage::Blob { blob, meta } => {
            payload.insert("bytes".to_string(), Value::Number(blob.len().into()));
            payload.insert(
                "mime_type".to_string(),
                Value::String(meta.mime_type.clone()),
            );
            payload.insert(
                "filename".to_string(),
                Value::String(meta.filename.clone()),
            );
        }
    }
    payload
}

/// Replaces image data and secrets in a JSON payload so it can be logged.
pub fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(
                    lowered.as_str(),
                    "blob"
                        | "data"
                        | "bytesbase64encoded"
                        | "bytes_base64_encoded"
                        | "imagebytes"
                        | "image_bytes"
                        | "private_key"
                        | "access_token"
                        | "assertion"
                        | "service_account_key"
                        | "vertex_service_account_key"
                ) {
                    out.insert(key.clone(), Value::String(OMITTED.to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
