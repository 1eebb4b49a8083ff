use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::history::VersionHistory;
use super::state::{ChatEntry, SessionState};

pub const SESSION_SCHEMA_VERSION: u64 = 1;

/// `session.json`: everything needed to resume a chat session from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionManifest {
    pub path: PathBuf,
    pub schema_version: u64,
    pub session_id: String,
    pub created_at: String,
    pub state: SessionState,
}

impl SessionManifest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            schema_version: SESSION_SCHEMA_VERSION,
            session_id: Uuid::new_v4().simple().to_string(),
            created_at: now_utc_iso(),
            state: SessionState::new(),
        }
    }

    /// Loads a manifest, keeping whatever parses. A missing or corrupt file
    /// yields a fresh session bound to the same path.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut manifest = Self::new(path.clone());
        let payload = read_json(&path).unwrap_or(Value::Object(Map::new()));
        let Some(obj) = payload.as_object() else {
            return manifest;
        };

        manifest.schema_version = obj
            .get("schema_version")
            .and_then(Value::as_u64)
            .unwrap_or(manifest.schema_version);
        manifest.session_id = obj
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(manifest.session_id);
        manifest.created_at = obj
            .get("created_at")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(manifest.created_at);

        if let Some(history) = obj.get("history") {
            if let Ok(parsed) = serde_json::from_value::<VersionHistory>(history.clone()) {
                manifest.state.history = parsed;
            }
        }
        manifest.state.current_preview = obj
            .get("current_preview")
            .and_then(Value::as_str)
            .map(PathBuf::from);
        manifest.state.displayed_model = obj
            .get("displayed_model")
            .and_then(Value::as_str)
            .map(PathBuf::from);
        if let Some(rows) = obj.get("transcript").and_then(Value::as_array) {
            for row in rows {
                if let Ok(entry) = serde_json::from_value::<ChatEntry>(row.clone()) {
                    manifest.state.transcript.push(entry);
                }
            }
        }
        manifest
    }

    pub fn load_or_new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if path.exists() {
            Self::load(path)
        } else {
            Self::new(path)
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let mut payload = Map::new();
        payload.insert(
            "schema_version".to_string(),
            Value::Number(self.schema_version.into()),
        );
        payload.insert(
            "session_id".to_string(),
            Value::String(self.session_id.clone()),
        );
        payload.insert(
            "created_at".to_string(),
            Value::String(self.created_at.clone()),
        );
        payload.insert("updated_at".to_string(), Value::String(now_utc_iso()));
        payload.insert(
            "history".to_string(),
            serde_json::to_value(&self.state.history)?,
        );
        payload.insert(
            "version_labels".to_string(),
            serde_json::to_value(self.state.version_labels())?,
        );
        payload.insert(
            "current_preview".to_string(),
            path_value(self.state.current_preview.as_deref()),
        );
        payload.insert(
            "displayed_model".to_string(),
            path_value(self.state.displayed_model.as_deref()),
        );
        payload.insert(
            "transcript".to_string(),
            serde_json::to_value(&self.state.transcript)?,
        );

        write_json(&self.path, Value::Object(payload))
    }
}

fn path_value(path: Option<&Path>) -> Value {
    path.map(|value| Value::String(value.to_string_lossy().to_string()))
        .unwrap_or(Value::Null)
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_json(path: &Path, payload: Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&payload)?)?;
    Ok(())
}
