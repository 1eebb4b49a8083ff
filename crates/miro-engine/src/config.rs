use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_IMAGE_URL: &str = "http://localhost:8081";
pub const DEFAULT_SHAPE_URL: &str = "http://localhost:8080";
pub const DEFAULT_IMAGE_MODEL: &str = "Qwen-Image-Edit-2511";
pub const DEFAULT_OUTPUT_DIR: &str = "output/gradio";
pub const DEFAULT_PLACEHOLDER_IMAGE: &str = "examples/background.png";

/// Directive prepended to every user prompt sent to the edit service.
pub const SYSTEM_PROMPT: &str = "You are a 3D modeler. \n\
Please generate a 3D modeling render based on user requirements. \n\
Always provide a 3D rendering image with a grayish-white background to convey a professional texture. \n\
Use only ambient lighting to showcase the model's structure and material, \n\
avoid high-contrast lighting or dramatic shadows. \n\
Do not use stylized effect images with post-processing.";

/// Where the services live and where turn artifacts go.
///
/// Built from `MIRO_*` environment variables; CLI flags override individual
/// fields afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct MiroConfig {
    pub image_url: String,
    pub shape_url: String,
    pub image_model: String,
    pub output_dir: PathBuf,
    pub placeholder_image: PathBuf,
    pub render_command: Option<Vec<String>>,
    pub http_timeout: Option<Duration>,
    pub dryrun: bool,
}

impl Default for MiroConfig {
    fn default() -> Self {
        Self {
            image_url: DEFAULT_IMAGE_URL.to_string(),
            shape_url: DEFAULT_SHAPE_URL.to_string(),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            placeholder_image: PathBuf::from(DEFAULT_PLACEHOLDER_IMAGE),
            render_command: None,
            http_timeout: None,
            dryrun: false,
        }
    }
}

impl MiroConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`MiroConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();
        Self {
            image_url: get("MIRO_IMAGE_URL")
                .map(|value| normalize_base_url(&value))
                .unwrap_or(defaults.image_url),
            shape_url: get("MIRO_SHAPE_URL")
                .map(|value| normalize_base_url(&value))
                .unwrap_or(defaults.shape_url),
            image_model: get("MIRO_IMAGE_MODEL").unwrap_or(defaults.image_model),
            output_dir: get("MIRO_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            placeholder_image: get("MIRO_DEFAULT_IMAGE")
                .map(PathBuf::from)
                .unwrap_or(defaults.placeholder_image),
            render_command: get("MIRO_RENDER_CMD").and_then(|value| parse_command(&value)),
            http_timeout: get("MIRO_HTTP_TIMEOUT_SECS")
                .and_then(|value| value.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            dryrun: get("MIRO_DRYRUN")
                .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(defaults.dryrun),
        }
    }
}

pub fn normalize_base_url(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_string()
}

/// Splits a renderer command line with shell quoting rules.
pub fn parse_command(raw: &str) -> Option<Vec<String>> {
    let parts = shell_words::split(raw).ok()?;
    if parts.is_empty() {
        None
    } else {
        Some(parts)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    use super::{MiroConfig, DEFAULT_IMAGE_MODEL, DEFAULT_SHAPE_URL};

    fn config_from(vars: &[(&str, &str)]) -> MiroConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        MiroConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_uses_defaults() {
        assert_eq!(config_from(&[]), MiroConfig::default());
    }

    #[test]
    fn environment_overrides_are_trimmed() {
        let config = config_from(&[
            ("MIRO_IMAGE_URL", " http://gpu-box:9000/ "),
            ("MIRO_SHAPE_URL", "   "),
            ("MIRO_OUTPUT_DIR", "/var/miro"),
            ("MIRO_RENDER_CMD", "python3 \"utils/render image.py\""),
            ("MIRO_HTTP_TIMEOUT_SECS", "90"),
            ("MIRO_DRYRUN", "TRUE"),
        ]);
        assert_eq!(config.image_url, "http://gpu-box:9000");
        assert_eq!(config.shape_url, DEFAULT_SHAPE_URL);
        assert_eq!(config.image_model, DEFAULT_IMAGE_MODEL);
        assert_eq!(config.output_dir, PathBuf::from("/var/miro"));
        assert_eq!(
            config.render_command,
            Some(vec!["python3".to_string(), "utils/render image.py".to_string()])
        );
        assert_eq!(config.http_timeout, Some(Duration::from_secs(90)));
        assert!(config.dryrun);
    }

    #[test]
    fn invalid_timeout_is_ignored() {
        assert_eq!(
            config_from(&[("MIRO_HTTP_TIMEOUT_SECS", "soon")]).http_timeout,
            None
        );
        assert_eq!(
            config_from(&[("MIRO_HTTP_TIMEOUT_SECS", "0")]).http_timeout,
            None
        );
    }
}
