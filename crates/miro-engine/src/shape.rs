use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_DISPOSITION;
use serde_json::{json, Value};

use crate::error::{truncate_text, StageError};
use crate::support::{mime_for_path, short_id};

const SERVICE: &str = "shape";

/// How the reference image travels to `/generate3d`. The endpoint honors
/// exactly one, preferring `file`, then `image_base64`, then `image_url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeInput {
    File(PathBuf),
    Base64(PathBuf),
    Url(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    Multipart,
    Base64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeResult {
    pub path: PathBuf,
    pub remote_filename: Option<String>,
    pub bytes: u64,
}

/// The 3D generation service: one reference image in, one binary GLB
/// persisted on disk out.
pub trait ShapeGenerator: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, image: &Path, target: Option<&Path>) -> Result<ShapeResult, StageError>;
}

/// `output_<stem>.glb` next to the reference image.
pub fn default_model_path(image: &Path) -> PathBuf {
    let stem = image
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or("model");
    image.with_file_name(format!("output_{stem}.glb"))
}

/// Filename from `Content-Disposition: attachment; filename=<id>.glb`.
pub fn attachment_filename(header: &str) -> Option<String> {
    header
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))
        .map(|value| value.trim().trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

/// Writes `bytes` to `target` and confirms the file is there afterwards.
fn persist_model(bytes: &[u8], target: &Path) -> Result<u64, StageError> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            StageError::remote(SERVICE, format!("failed to create {}: {err}", parent.display()))
        })?;
    }
    fs::write(target, bytes).map_err(|err| {
        StageError::remote(SERVICE, format!("failed to write {}: {err}", target.display()))
    })?;
    if !target.exists() {
        return Err(StageError::MissingArtifact(target.to_path_buf()));
    }
    Ok(bytes.len() as u64)
}

pub struct HttpShapeGenerator {
    api_base: String,
    upload_mode: UploadMode,
    http: HttpClient,
}

impl HttpShapeGenerator {
    pub fn new(api_base: impl Into<String>, timeout: Option<Duration>) -> anyhow::Result<Self> {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .context("failed to build shape service HTTP client")?;
        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            upload_mode: UploadMode::Base64,
            http,
        })
    }

    pub fn with_upload_mode(mut self, mode: UploadMode) -> Self {
        self.upload_mode = mode;
        self
    }

    /// `GET /`, the service banner (`service`, `version`, `docs`).
    pub fn service_info(&self) -> Result<Value, StageError> {
        let endpoint = format!("{}/", self.api_base);
        let response = self
            .http
            .get(&endpoint)
            .send()
            .with_context(|| format!("GET {endpoint}"))
            .map_err(|err| StageError::remote_chain(SERVICE, &err))?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|err| StageError::remote(SERVICE, format!("response body read failed: {err}")))?;
        if !status.is_success() {
            return Err(StageError::remote(
                SERVICE,
                format!("status {}: {}", status.as_u16(), truncate_text(&body, 512)),
            ));
        }
        serde_json::from_str(&body)
            .map_err(|err| StageError::remote(SERVICE, format!("invalid JSON payload: {err}")))
    }

    /// Sends one `/generate3d` request and returns the body plus the
    /// attachment filename the service reported.
    pub fn submit(&self, input: &ShapeInput) -> Result<(Vec<u8>, Option<String>), StageError> {
        let endpoint = format!("{}/generate3d", self.api_base);
        let request = self.http.post(&endpoint);
        let request = match input {
            ShapeInput::File(path) => {
                let bytes = read_image(path)?;
                let file_name = path
                    .file_name()
                    .and_then(|value| value.to_str())
                    .unwrap_or("image.png")
                    .to_string();
                let part = MultipartPart::bytes(bytes)
                    .file_name(file_name)
                    .mime_str(mime_for_path(path).unwrap_or("image/png"))
                    .map_err(|err| StageError::remote(SERVICE, err.to_string()))?;
                request.multipart(MultipartForm::new().part("file", part))
            }
            ShapeInput::Base64(path) => {
                let encoded = BASE64.encode(read_image(path)?);
                request.form(&[("image_base64", encoded)])
            }
            ShapeInput::Url(url) => request.form(&[("image_url", url.clone())]),
        };

        let response = request
            .send()
            .with_context(|| format!("POST {endpoint}"))
            .map_err(|err| StageError::remote_chain(SERVICE, &err))?;
        let status = response.status();
        let remote_filename = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(attachment_filename);
        let body = response
            .bytes()
            .map_err(|err| StageError::remote(SERVICE, format!("response body read failed: {err}")))?;
        if !status.is_success() {
            let text = String::from_utf8_lossy(&body);
            return Err(StageError::remote(
                SERVICE,
                format!("status {}: {}", status.as_u16(), truncate_text(&text, 512)),
            ));
        }
        if body.is_empty() {
            return Err(StageError::remote(SERVICE, "empty model body"));
        }
        Ok((body.to_vec(), remote_filename))
    }
}

impl ShapeGenerator for HttpShapeGenerator {
    fn name(&self) -> &str {
        "http"
    }

    fn generate(&self, image: &Path, target: Option<&Path>) -> Result<ShapeResult, StageError> {
        let input = match self.upload_mode {
            UploadMode::Multipart => ShapeInput::File(image.to_path_buf()),
            UploadMode::Base64 => ShapeInput::Base64(image.to_path_buf()),
        };
        let (bytes, remote_filename) = self.submit(&input)?;
        let path = target
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_model_path(image));
        let written = persist_model(&bytes, &path)?;
        Ok(ShapeResult {
            path,
            remote_filename,
            bytes: written,
        })
    }
}

fn read_image(path: &Path) -> Result<Vec<u8>, StageError> {
    fs::read(path).map_err(|err| {
        StageError::remote(SERVICE, format!("failed reading {}: {err}", path.display()))
    })
}

/// Minimal glTF 2.0 binary: 12-byte header plus one JSON chunk with an empty
/// scene, padded to 4 bytes with spaces as the container requires.
pub fn placeholder_glb(generator: &str) -> Vec<u8> {
    let document = json!({
        "asset": {"version": "2.0", "generator": generator},
        "scene": 0,
        "scenes": [{"nodes": []}],
    });
    let mut chunk = document.to_string().into_bytes();
    while chunk.len() % 4 != 0 {
        chunk.push(b' ');
    }
    let total = 12 + 8 + chunk.len();

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(b"glTF");
    out.extend_from_slice(&2u32.to_le_bytes());
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
    out.extend_from_slice(b"JSON");
    out.extend_from_slice(&chunk);
    out
}

/// Offline shape generator: writes a placeholder GLB tagged with a hash of
/// the reference image.
#[derive(Debug, Default)]
pub struct DryrunShapeGenerator;

impl ShapeGenerator for DryrunShapeGenerator {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, image: &Path, target: Option<&Path>) -> Result<ShapeResult, StageError> {
        let source = read_image(image)?;
        let id = short_id(&source);
        let bytes = placeholder_glb(&format!("miro-dryrun {id}"));
        let path = target
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_model_path(image));
        let written = persist_model(&bytes, &path)?;
        Ok(ShapeResult {
            path,
            remote_filename: Some(format!("{id}.glb")),
            bytes: written,
        })
    }
}
