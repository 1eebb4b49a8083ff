mod history;
mod manifest;
mod state;

pub use history::{
    parse_version_label, resolve_version, version_label, ModelArtifact, VersionHistory,
};
pub use manifest::{SessionManifest, SESSION_SCHEMA_VERSION};
pub use state::{ChatContent, ChatEntry, ChatRole, SessionState, UserInput};
