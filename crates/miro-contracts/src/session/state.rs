use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::history::VersionHistory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ChatContent {
    Text(String),
    Image(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub role: ChatRole,
    pub content: ChatContent,
}

/// Raw user input of one turn, carried unchanged from the immediate phase to
/// the processing phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserInput {
    pub text: String,
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

impl UserInput {
    pub fn new(text: impl Into<String>, files: Vec<PathBuf>) -> Self {
        Self {
            text: text.into(),
            files,
        }
    }
}

/// Per-session state. Mutated only by the submission controller and the
/// orchestrator it drives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub history: VersionHistory,
    pub current_preview: Option<PathBuf>,
    #[serde(skip)]
    pub pending: Option<UserInput>,
    pub displayed_model: Option<PathBuf>,
    pub transcript: Vec<ChatEntry>,
    #[serde(skip, default = "enabled")]
    pub input_enabled: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            history: VersionHistory::new(),
            current_preview: None,
            pending: None,
            displayed_model: None,
            transcript: Vec::new(),
            input_enabled: true,
        }
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version_labels(&self) -> Vec<String> {
        self.history.labels()
    }

    pub fn push_text(&mut self, role: ChatRole, text: impl Into<String>) {
        self.transcript.push(ChatEntry {
            role,
            content: ChatContent::Text(text.into()),
        });
    }

    pub fn push_image(&mut self, role: ChatRole, path: impl Into<PathBuf>) {
        self.transcript.push(ChatEntry {
            role,
            content: ChatContent::Image(path.into()),
        });
    }

    pub fn is_processing(&self) -> bool {
        !self.input_enabled
    }
}

fn enabled() -> bool {
    true
}
