use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TurnRequest {
    pub prompt: String,
    #[serde(default)]
    pub reference_images: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Ok,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: String,
    pub status: StageStatus,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl StageRecord {
    pub fn ok(stage: &str, elapsed_ms: u64) -> Self {
        Self {
            stage: stage.to_string(),
            status: StageStatus::Ok,
            error: None,
            elapsed_ms,
        }
    }

    pub fn failed(stage: &str, error: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            stage: stage.to_string(),
            status: StageStatus::Failed,
            error: Some(error.into()),
            elapsed_ms,
        }
    }

    pub fn skipped(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            status: StageStatus::Skipped,
            error: None,
            elapsed_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TurnArtifacts {
    pub working_dir: String,
    #[serde(default)]
    pub extracted_images: Vec<String>,
    pub model_path: Option<String>,
    pub preview_path: Option<String>,
    pub remote_asset_id: Option<String>,
}

pub fn build_receipt(
    request: &TurnRequest,
    edit_request: &Map<String, Value>,
    stages: &[StageRecord],
    artifacts: &TurnArtifacts,
    warnings: &[String],
) -> Value {
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(RECEIPT_SCHEMA_VERSION.into()),
    );
    root.insert(
        "request".to_string(),
        serde_json::to_value(request).unwrap_or(Value::Null),
    );
    root.insert(
        "edit_request".to_string(),
        sanitize_payload(&Value::Object(edit_request.clone())),
    );
    root.insert(
        "stages".to_string(),
        serde_json::to_value(stages).unwrap_or(Value::Null),
    );
    root.insert(
        "artifacts".to_string(),
        serde_json::to_value(artifacts).unwrap_or(Value::Null),
    );
    root.insert(
        "warnings".to_string(),
        Value::Array(warnings.iter().cloned().map(Value::String).collect()),
    );
    Value::Object(root)
}

pub fn write_receipt(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}

/// Strips inlined image bytes: base64 fields and `data:` URIs.
fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => value.clone(),
        Value::String(text) => {
            if text.starts_with("data:") {
                Value::String("<omitted>".to_string())
            } else {
                value.clone()
            }
        }
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(lowered.as_str(), "b64_json" | "image_base64" | "image_bytes") {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}
