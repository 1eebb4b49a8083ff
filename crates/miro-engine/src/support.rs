use std::path::Path;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

pub(crate) fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())?;
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

pub(crate) fn color_from_prompt(prompt: &str, seed: u64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

pub(crate) fn short_id(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    let digest = hasher.finalize();
    hex::encode(&digest[..6])
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

pub(crate) fn path_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{color_from_prompt, mime_for_path, short_id};

    #[test]
    fn mime_follows_extension_case_insensitively() {
        assert_eq!(mime_for_path(Path::new("a.PNG")), Some("image/png"));
        assert_eq!(mime_for_path(Path::new("a.jpg")), Some("image/jpeg"));
        assert_eq!(mime_for_path(Path::new("a.glb")), None);
        assert_eq!(mime_for_path(Path::new("noext")), None);
    }

    #[test]
    fn prompt_color_is_deterministic() {
        assert_eq!(color_from_prompt("tiger", 0), color_from_prompt("tiger", 0));
        assert_ne!(color_from_prompt("tiger", 0), color_from_prompt("tiger", 1));
        assert_eq!(short_id(b"abc").len(), 12);
    }
}
