use std::path::PathBuf;

use thiserror::Error;

/// Failures of a single pipeline stage. None of these escape the
/// orchestrator; they are recorded and the turn yields fewer artifacts.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("{service} request failed: {detail}")]
    RemoteService { service: &'static str, detail: String },

    #[error("embedded image {index} could not be decoded: {detail}")]
    ExtractionDecode { index: usize, detail: String },

    #[error("expected artifact missing: {}", .0.display())]
    MissingArtifact(PathBuf),
}

impl StageError {
    pub fn remote(service: &'static str, detail: impl Into<String>) -> Self {
        Self::RemoteService {
            service,
            detail: detail.into(),
        }
    }

    /// Wraps an `anyhow` chain (transport error plus context) into a single
    /// remote-service failure.
    pub fn remote_chain(service: &'static str, err: &anyhow::Error) -> Self {
        Self::remote(service, error_chain_text(err, 512))
    }
}

pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
