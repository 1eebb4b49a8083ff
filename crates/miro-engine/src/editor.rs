use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};

use crate::config::SYSTEM_PROMPT;
use crate::error::{truncate_text, StageError};
use crate::support::{color_from_prompt, map_object, mime_for_path};

const SERVICE: &str = "image edit";

/// Request/response pair of one edit call. The request is kept for the turn
/// receipt.
#[derive(Debug, Clone)]
pub struct EditExchange {
    pub request: Map<String, Value>,
    pub response: Value,
}

/// The image-editing service: prompt plus reference images in, a
/// chat-completion payload out. One attempt, no retry.
pub trait ImageEditor: Send + Sync {
    fn name(&self) -> &str;
    fn edit(&self, prompt: &str, images: &[PathBuf]) -> Result<EditExchange, StageError>;
}

/// `data:` URI for one reference image, typed by file extension.
pub fn image_data_uri(path: &Path) -> anyhow::Result<String> {
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    let mime = mime_for_path(path).unwrap_or("image/png");
    Ok(format!("data:{mime};base64,{}", BASE64.encode(bytes)))
}

/// Chat-completion request body: the fixed directive and the prompt as one
/// text part, then every reference image as an `image_url` part.
pub fn build_edit_payload(
    model: &str,
    prompt: &str,
    images: &[PathBuf],
) -> anyhow::Result<Map<String, Value>> {
    let mut content = vec![json!({
        "type": "text",
        "text": format!("{SYSTEM_PROMPT}{prompt}"),
    })];
    for image in images {
        content.push(json!({
            "type": "image_url",
            "image_url": {"url": image_data_uri(image)?},
        }));
    }
    Ok(map_object(json!({
        "model": model,
        "messages": [{"role": "user", "content": content}],
    })))
}

pub struct HttpImageEditor {
    api_base: String,
    model: String,
    http: HttpClient,
}

impl HttpImageEditor {
    pub fn new(
        api_base: impl Into<String>,
        model: impl Into<String>,
        timeout: Option<Duration>,
    ) -> anyhow::Result<Self> {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .context("failed to build edit service HTTP client")?;
        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            model: model.into(),
            http,
        })
    }

    /// `GET /v1/models`, returning the advertised model ids.
    pub fn list_models(&self) -> Result<Vec<String>, StageError> {
        let endpoint = format!("{}/v1/models", self.api_base);
        let response = self
            .http
            .get(&endpoint)
            .send()
            .with_context(|| format!("GET {endpoint}"))
            .map_err(|err| StageError::remote_chain(SERVICE, &err))?;
        let payload = response_json_or_error(response)?;
        Ok(payload
            .get("data")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.get("id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }
}

impl ImageEditor for HttpImageEditor {
    fn name(&self) -> &str {
        "http"
    }

    fn edit(&self, prompt: &str, images: &[PathBuf]) -> Result<EditExchange, StageError> {
        let endpoint = format!("{}/v1/chat/completions", self.api_base);
        let payload = build_edit_payload(&self.model, prompt, images)
            .map_err(|err| StageError::remote_chain(SERVICE, &err))?;
        let response = self
            .http
            .post(&endpoint)
            .json(&Value::Object(payload.clone()))
            .send()
            .with_context(|| format!("POST {endpoint}"))
            .map_err(|err| StageError::remote_chain(SERVICE, &err))?;
        let parsed = response_json_or_error(response)?;
        Ok(EditExchange {
            request: payload,
            response: parsed,
        })
    }
}

fn response_json_or_error(response: HttpResponse) -> Result<Value, StageError> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .map_err(|err| StageError::remote(SERVICE, format!("response body read failed: {err}")))?;
    if !status.is_success() {
        return Err(StageError::remote(
            SERVICE,
            format!("status {code}: {}", truncate_text(&body, 512)),
        ));
    }
    serde_json::from_str(&body)
        .map_err(|err| StageError::remote(SERVICE, format!("invalid JSON payload: {err}")))
}

/// Offline editor: answers with one solid-color PNG whose color is derived
/// from the prompt and the reference bytes, embedded the same way the real
/// service embeds its output.
pub struct DryrunImageEditor {
    size: u32,
}

impl DryrunImageEditor {
    pub fn new() -> Self {
        Self { size: 256 }
    }

    pub fn with_size(size: u32) -> Self {
        Self { size: size.max(1) }
    }
}

impl Default for DryrunImageEditor {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageEditor for DryrunImageEditor {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn edit(&self, prompt: &str, images: &[PathBuf]) -> Result<EditExchange, StageError> {
        let mut seed = 0u64;
        let mut references = Vec::new();
        for image in images {
            let bytes = fs::read(image).map_err(|err| {
                StageError::remote(SERVICE, format!("failed reading {}: {err}", image.display()))
            })?;
            seed = bytes
                .iter()
                .fold(seed, |acc, byte| acc.wrapping_mul(31).wrapping_add(u64::from(*byte)));
            references.push(Value::String(image.to_string_lossy().to_string()));
        }

        let (r, g, b) = color_from_prompt(prompt, seed);
        let mut canvas = RgbImage::new(self.size, self.size);
        for pixel in canvas.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut encoded = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(canvas)
            .write_to(&mut encoded, ImageFormat::Png)
            .map_err(|err| StageError::remote(SERVICE, format!("dryrun encode failed: {err}")))?;
        let content = format!(
            "![image](data:image/png;base64,{})",
            BASE64.encode(encoded.into_inner())
        );

        Ok(EditExchange {
            request: map_object(json!({
                "model": "dryrun",
                "prompt": prompt,
                "images": references,
            })),
            response: json!({
                "id": "chatcmpl-dryrun",
                "object": "chat.completion",
                "created": 0,
                "model": "dryrun",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": content},
                    "finish_reason": "stop",
                }],
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use serde_json::{json, Value};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::{build_edit_payload, DryrunImageEditor, HttpImageEditor, ImageEditor};
    use crate::config::SYSTEM_PROMPT;
    use crate::error::StageError;
    use crate::extract::extract_images;

    #[test]
    fn payload_puts_directive_before_prompt_and_inlines_images() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let png = temp.path().join("ref.png");
        let jpg = temp.path().join("ref.JPG");
        fs::write(&png, b"png-bytes")?;
        fs::write(&jpg, b"jpg-bytes")?;

        let payload = build_edit_payload("edit-model", "add a hat", &[png, jpg])?;
        let content = &payload["messages"][0]["content"];
        assert_eq!(payload["model"], json!("edit-model"));
        assert_eq!(payload["messages"][0]["role"], json!("user"));
        assert_eq!(
            content[0]["text"],
            json!(format!("{SYSTEM_PROMPT}add a hat"))
        );
        assert_eq!(
            content[1]["image_url"]["url"],
            json!("data:image/png;base64,cG5nLWJ5dGVz")
        );
        assert_eq!(
            content[2]["image_url"]["url"],
            json!("data:image/jpeg;base64,anBnLWJ5dGVz")
        );
        Ok(())
    }

    #[test]
    fn missing_reference_image_fails_payload_build() {
        let missing = PathBuf::from("/definitely/not/here.png");
        assert!(build_edit_payload("m", "p", &[missing]).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn http_editor_posts_chat_completion_and_returns_body() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        let body = json!({"id": "chatcmpl-1", "choices": []});
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let temp = tempfile::tempdir()?;
        let reference = temp.path().join("ref.png");
        fs::write(&reference, b"png")?;
        let base_url = format!("{}/", server.uri());
        let exchange = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
            let editor = HttpImageEditor::new(base_url, "edit-model", None)?;
            Ok(editor.edit("a rabbit", &[reference])?)
        })
        .await??;

        assert_eq!(exchange.response, body);
        let requests = server.received_requests().await.unwrap_or_default();
        assert_eq!(requests.len(), 1);
        let sent: Value = requests[0].body_json()?;
        assert_eq!(sent["model"], json!("edit-model"));
        assert_eq!(sent["messages"][0]["content"].as_array().map(Vec::len), Some(2));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn http_editor_maps_non_2xx_to_remote_error() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(503).set_body_json(json!({"detail": "Model not yet loaded"})),
            )
            .mount(&server)
            .await;

        let base_url = server.uri();
        let result = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
            let editor = HttpImageEditor::new(base_url, "edit-model", None)?;
            Ok(editor.edit("a rabbit", &[]))
        })
        .await??;

        match result {
            Err(StageError::RemoteService { detail, .. }) => {
                assert!(detail.contains("503"));
                assert!(detail.contains("Model not yet loaded"));
            }
            other => panic!("expected remote error, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn list_models_reads_ids() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"object": "list", "data": [{"id": "Qwen-Image-Edit-2511"}]}),
            ))
            .expect(1)
            .mount(&server)
            .await;

        let base_url = server.uri();
        let models = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
            let editor = HttpImageEditor::new(base_url, "edit-model", None)?;
            Ok(editor.list_models()?)
        })
        .await??;

        assert_eq!(models, vec!["Qwen-Image-Edit-2511".to_string()]);
        Ok(())
    }

    #[test]
    fn dryrun_output_is_extractable_png() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let exchange = DryrunImageEditor::with_size(8)
            .edit("a tiger", &[])
            .map_err(|err| anyhow::anyhow!(err.to_string()))?;

        let extraction = extract_images(&exchange.response, temp.path())?;
        assert_eq!(extraction.images.len(), 1);
        let decoded = image::open(&extraction.images[0].path)?;
        assert_eq!((decoded.width(), decoded.height()), (8, 8));
        Ok(())
    }
}
