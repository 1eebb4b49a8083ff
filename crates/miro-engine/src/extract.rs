//! Recovers images that the edit service inlines into its chat-completion
//! text as `![image](data:image/<format>;base64,<payload>)`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;

use crate::error::StageError;

const MARKER: &str = "![image](data:image/";
const ENCODING: &str = ";base64,";

/// One grammatical match inside the response text, borrowed from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddedImage<'a> {
    pub format: &'a str,
    pub payload: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedImage {
    pub index: usize,
    pub format: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub images: Vec<ExtractedImage>,
    pub warnings: Vec<String>,
}

impl Extraction {
    pub fn paths(&self) -> Vec<PathBuf> {
        self.images.iter().map(|image| image.path.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// Scans `text` for embedded images in order of appearance.
///
/// Single forward pass: a failed candidate resumes one byte past its marker,
/// a match resumes after its closing `)`, and a marker with no `)` anywhere
/// after it ends the scan since nothing later can close either.
pub fn scan_embedded_images(text: &str) -> Vec<EmbeddedImage<'_>> {
    let mut found = Vec::new();
    let mut cursor = 0;

    while let Some(offset) = text[cursor..].find(MARKER) {
        let start = cursor + offset;
        let after_marker = start + MARKER.len();
        let rest = &text[after_marker..];

        let format_len = rest
            .bytes()
            .take_while(|byte| byte.is_ascii_alphanumeric() || *byte == b'_')
            .count();
        if format_len == 0 || !rest[format_len..].starts_with(ENCODING) {
            cursor = start + 1;
            continue;
        }

        let payload_start = after_marker + format_len + ENCODING.len();
        let Some(close) = text[payload_start..].find(')') else {
            break;
        };
        if close == 0 {
            cursor = start + 1;
            continue;
        }

        found.push(EmbeddedImage {
            format: &rest[..format_len],
            payload: &text[payload_start..payload_start + close],
        });
        cursor = payload_start + close + 1;
    }

    found
}

/// First choice's message text, or `None` when the payload has no choices.
pub fn response_content(response: &Value) -> Option<&str> {
    let first = response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())?;
    Some(
        first
            .get("message")
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .unwrap_or(""),
    )
}

/// Decodes every embedded image of `response` into `output_dir` as
/// `output_<ordinal>.<format>`.
///
/// Best effort per image: one bad payload is reported in
/// [`Extraction::warnings`] and its ordinal is skipped. Only creating the
/// output directory can fail the whole call.
pub fn extract_images(response: &Value, output_dir: &Path) -> Result<Extraction> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;

    let mut extraction = Extraction::default();
    let Some(content) = response_content(response) else {
        extraction
            .warnings
            .push("edit response has no choices; no images extracted".to_string());
        return Ok(extraction);
    };

    for (index, embedded) in scan_embedded_images(content).into_iter().enumerate() {
        match persist_embedded(index, &embedded, output_dir) {
            Ok(image) => extraction.images.push(image),
            Err(err) => extraction.warnings.push(err.to_string()),
        }
    }
    Ok(extraction)
}

fn persist_embedded(
    index: usize,
    embedded: &EmbeddedImage<'_>,
    output_dir: &Path,
) -> Result<ExtractedImage, StageError> {
    let compact: String = embedded
        .payload
        .chars()
        .filter(|ch| !ch.is_ascii_whitespace())
        .collect();
    let bytes = BASE64
        .decode(compact.as_bytes())
        .map_err(|err| StageError::ExtractionDecode {
            index,
            detail: err.to_string(),
        })?;

    let format = embedded.format.to_ascii_lowercase();
    let path = output_dir.join(format!("output_{index}.{format}"));
    fs::write(&path, bytes).map_err(|err| StageError::ExtractionDecode {
        index,
        detail: format!("failed to write {}: {err}", path.display()),
    })?;

    Ok(ExtractedImage {
        index,
        format,
        path,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use base64::Engine as _;
    use serde_json::json;

    use super::{extract_images, scan_embedded_images, BASE64};

    fn embed(format: &str, bytes: &[u8]) -> String {
        format!("![image](data:image/{format};base64,{})", BASE64.encode(bytes))
    }

    fn response_with(content: &str) -> serde_json::Value {
        json!({
            "id": "chatcmpl-1",
            "created": 1,
            "model": "Qwen-Image-Edit-2511",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": content}}],
        })
    }

    #[test]
    fn empty_choices_yield_nothing_and_write_nothing() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let out = temp.path().join("turn");

        let extraction = extract_images(&json!({"choices": []}), &out)?;
        assert!(extraction.is_empty());
        assert_eq!(extraction.warnings.len(), 1);
        assert_eq!(fs::read_dir(&out)?.count(), 0);

        let missing = extract_images(&json!({"id": "x"}), &out)?;
        assert!(missing.is_empty());
        Ok(())
    }

    #[test]
    fn two_images_persist_in_order_with_exact_bytes() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let png = b"\x89PNG fake png bytes".to_vec();
        let jpeg = b"\xff\xd8\xff fake jpeg".to_vec();
        let content = format!("{}\n{}", embed("png", &png), embed("jpeg", &jpeg));

        let extraction = extract_images(&response_with(&content), temp.path())?;
        let names: Vec<String> = extraction
            .images
            .iter()
            .filter_map(|image| image.path.file_name())
            .map(|name| name.to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["output_0.png", "output_1.jpeg"]);
        assert_eq!(fs::read(temp.path().join("output_0.png"))?, png);
        assert_eq!(fs::read(temp.path().join("output_1.jpeg"))?, jpeg);
        assert!(extraction.warnings.is_empty());
        Ok(())
    }

    #[test]
    fn bad_payload_is_skipped_and_siblings_survive() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let content = format!(
            "{} ![image](data:image/png;base64,@@not-base64@@) {}",
            embed("png", b"first"),
            embed("WEBP", b"third"),
        );

        let extraction = extract_images(&response_with(&content), temp.path())?;
        let indices: Vec<usize> = extraction.images.iter().map(|image| image.index).collect();
        assert_eq!(indices, vec![0, 2]);
        assert!(temp.path().join("output_2.webp").exists());
        assert!(!temp.path().join("output_1.png").exists());
        assert_eq!(extraction.warnings.len(), 1);
        assert!(extraction.warnings[0].contains("embedded image 1"));
        Ok(())
    }

    #[test]
    fn whitespace_inside_payload_is_ignored() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let encoded = BASE64.encode(b"wrapped payload bytes");
        let (head, tail) = encoded.split_at(8);
        let content = format!("![image](data:image/png;base64,{head}\n  {tail})");

        let extraction = extract_images(&response_with(&content), temp.path())?;
        assert_eq!(extraction.images.len(), 1);
        assert_eq!(
            fs::read(&extraction.images[0].path)?,
            b"wrapped payload bytes".to_vec()
        );
        Ok(())
    }

    #[test]
    fn scanner_rejects_malformed_candidates() {
        assert!(scan_embedded_images("no images here").is_empty());
        assert!(scan_embedded_images("![image](data:image/;base64,AAAA)").is_empty());
        assert!(scan_embedded_images("![image](data:image/png;utf8,AAAA)").is_empty());
        assert!(scan_embedded_images("![image](data:image/png;base64,)").is_empty());
        assert!(scan_embedded_images("![image](data:image/png;base64,AAAA").is_empty());
    }

    #[test]
    fn scanner_recovers_after_a_broken_marker() {
        let text = "![image](data:image/png;utf8,xx) then ![image](data:image/gif;base64,R0lG)";
        let found = scan_embedded_images(text);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].format, "gif");
        assert_eq!(found[0].payload, "R0lG");
    }

    #[test]
    fn scanner_handles_long_unterminated_input_quickly() {
        let text = format!("{}{}", "![image](data:image/png;base64,".repeat(20_000), "A");
        assert!(scan_embedded_images(&text).is_empty());
    }
}
