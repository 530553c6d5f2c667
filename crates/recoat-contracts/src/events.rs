use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::colors::ColorChoice;

/// The lifecycle moments of one repaint session, in the order the workflow
/// can produce them.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    ImageLoaded {
        path: String,
        media_type: String,
        bytes: usize,
    },
    ColorSelected {
        #[serde(flatten)]
        color: ColorChoice,
    },
    RepaintStarted {
        request_id: String,
        painter: String,
        media_type: String,
    },
    RepaintSucceeded {
        bytes: usize,
        media_type: String,
    },
    RepaintFailed {
        message: String,
    },
    ArtifactSaved {
        path: String,
    },
    SessionReset,
}

impl SessionEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SessionEvent::ImageLoaded { .. } => "image_loaded",
            SessionEvent::ColorSelected { .. } => "color_selected",
            SessionEvent::RepaintStarted { .. } => "repaint_started",
            SessionEvent::RepaintSucceeded { .. } => "repaint_succeeded",
            SessionEvent::RepaintFailed { .. } => "repaint_failed",
            SessionEvent::ArtifactSaved { .. } => "artifact_saved",
            SessionEvent::SessionReset => "session_reset",
        }
    }
}

/// Append-only JSONL sink for session lifecycle events.
///
/// Each event lands as one compact JSON object tagged with its `type`,
/// stamped with the writer's `session_id` and an RFC3339 `ts`.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    session_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
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

    pub fn emit(&self, event: &SessionEvent) -> anyhow::Result<Value> {
        let Value::Object(mut record) = serde_json::to_value(event)? else {
            anyhow::bail!("session event did not serialize to an object");
        };
        record.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        record.insert("ts".to_string(), Value::String(now_utc_iso()));

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&record)?;
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

        Ok(Value::Object(record))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
