use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use similar::TextDiff;

/// One successfully generated 3D model, numbered by its position in history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub sequence_index: usize,
    pub path: PathBuf,
    pub prompt: String,
    pub prompt_diff: Option<Vec<String>>,
    pub preview_path: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub created_at: String,
}

impl ModelArtifact {
    pub fn label(&self) -> String {
        version_label(self.sequence_index)
    }
}

/// Append-only, ordered model history of a session.
///
/// Entries are never removed or reordered; the only growth path is
/// [`VersionHistory::push`], called once per successful shape generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionHistory {
    versions: Vec<ModelArtifact>,
}

impl VersionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ModelArtifact> {
        self.versions.get(index)
    }

    pub fn last(&self) -> Option<&ModelArtifact> {
        self.versions.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelArtifact> {
        self.versions.iter()
    }

    pub fn push(
        &mut self,
        path: impl Into<PathBuf>,
        prompt: &str,
        working_dir: Option<&Path>,
    ) -> &ModelArtifact {
        let prompt_diff = prompt_diff(self.last().map(|entry| entry.prompt.as_str()), prompt);
        let sequence_index = self.versions.len();
        self.versions.push(ModelArtifact {
            sequence_index,
            path: path.into(),
            prompt: prompt.to_string(),
            prompt_diff,
            preview_path: None,
            working_dir: working_dir.map(Path::to_path_buf),
            created_at: now_utc_iso(),
        });
        &self.versions[sequence_index]
    }

    /// Records the rendered preview of an existing version. Unknown indices
    /// are ignored.
    pub fn set_preview(&mut self, sequence_index: usize, preview: impl Into<PathBuf>) {
        if let Some(entry) = self.versions.get_mut(sequence_index) {
            entry.preview_path = Some(preview.into());
        }
    }

    /// Selector labels, `Version 1` through `Version N`.
    pub fn labels(&self) -> Vec<String> {
        (0..self.versions.len()).map(version_label).collect()
    }

    pub fn model_paths(&self) -> Vec<PathBuf> {
        self.versions.iter().map(|entry| entry.path.clone()).collect()
    }
}

pub fn version_label(sequence_index: usize) -> String {
    format!("Version {}", sequence_index + 1)
}

/// Maps a selector index onto a historical model. Pure bounds check: the
/// history is not touched and neither is any preview pointer.
pub fn resolve_version(index: i64, history: &VersionHistory) -> Option<&ModelArtifact> {
    let index = usize::try_from(index).ok()?;
    history.get(index)
}

/// Accepts `3`, `v3` or `Version 3` and returns the 0-based index.
pub fn parse_version_label(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    let lowered = trimmed.to_ascii_lowercase();
    let digits = lowered
        .strip_prefix("version")
        .or_else(|| lowered.strip_prefix('v'))
        .unwrap_or(&lowered)
        .trim();
    let number: i64 = digits.parse().ok()?;
    Some(number - 1)
}

fn prompt_diff(prev: Option<&str>, curr: &str) -> Option<Vec<String>> {
    let prev = prev?;
    let diff = TextDiff::from_lines(prev, curr);
    let rendered = diff.unified_diff().header("prev", "curr").to_string();
    let lines = rendered
        .lines()
        .map(str::to_string)
        .collect::<Vec<String>>();
    Some(lines)
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::{parse_version_label, resolve_version, VersionHistory};

    fn history_of(n: usize) -> VersionHistory {
        let mut history = VersionHistory::new();
        for idx in 0..n {
            history.push(format!("/tmp/t{idx}/output.glb"), &format!("turn {idx}"), None);
        }
        history
    }

    #[test]
    fn labels_follow_history_order() {
        let history = history_of(3);
        assert_eq!(
            history.labels(),
            vec!["Version 1", "Version 2", "Version 3"]
        );
        assert!(VersionHistory::new().labels().is_empty());
    }

    #[test]
    fn push_records_sequence_and_prompt_diff() {
        let mut history = VersionHistory::new();
        let first = history.push("/a.glb", "a red chair", None).clone();
        let second = history.push("/b.glb", "a blue chair", None).clone();

        assert_eq!(first.sequence_index, 0);
        assert!(first.prompt_diff.is_none());
        assert_eq!(second.sequence_index, 1);
        let diff = second.prompt_diff.unwrap_or_default();
        assert!(diff.iter().any(|line| line == "+a blue chair"));
        assert!(diff.iter().any(|line| line == "-a red chair"));
    }

    #[test]
    fn resolve_in_range_returns_entry_without_mutation() {
        let history = history_of(3);
        let before = history.clone();
        for idx in 0..3 {
            let found = resolve_version(idx, &history).map(|entry| entry.path.clone());
            assert_eq!(found, Some(PathBuf::from(format!("/tmp/t{idx}/output.glb"))));
        }
        assert_eq!(history, before);
    }

    #[test]
    fn resolve_out_of_range_returns_none() {
        let history = history_of(2);
        assert!(resolve_version(-1, &history).is_none());
        assert!(resolve_version(2, &history).is_none());
        assert!(resolve_version(i64::MAX, &history).is_none());
        assert!(resolve_version(0, &VersionHistory::new()).is_none());
    }

    #[test]
    fn set_preview_ignores_unknown_index() {
        let mut history = history_of(1);
        history.set_preview(0, "/tmp/t0/render_image.png");
        history.set_preview(5, "/nope.png");
        assert_eq!(
            history.get(0).and_then(|entry| entry.preview_path.clone()),
            Some(PathBuf::from("/tmp/t0/render_image.png"))
        );
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn version_labels_parse_to_zero_based_index() {
        assert_eq!(parse_version_label("2"), Some(1));
        assert_eq!(parse_version_label("v3"), Some(2));
        assert_eq!(parse_version_label("Version 1"), Some(0));
        assert_eq!(parse_version_label("0"), Some(-1));
        assert_eq!(parse_version_label("latest"), None);
    }
}
