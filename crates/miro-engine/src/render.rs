use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use image::{ImageFormat, Rgb, RgbImage};

use crate::support::color_from_prompt;

/// Viewport the preview is framed for, width by height.
pub const PREVIEW_VIEWPORT: (u32, u32) = (1248, 832);

/// Turns a model file into a still image. Callers look only at whether
/// `output` exists afterwards; the returned error is for logging.
pub trait PreviewRenderer: Send + Sync {
    fn name(&self) -> &str;
    fn render(&self, model: &Path, output: &Path) -> Result<()>;
}

/// Outcome of one render attempt as seen by the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderOutcome {
    pub preview: Option<PathBuf>,
    pub warning: Option<String>,
}

/// Runs `renderer` and reports a preview only if the output file exists.
pub fn render_preview(renderer: &dyn PreviewRenderer, model: &Path, output: &Path) -> RenderOutcome {
    let warning = renderer
        .render(model, output)
        .err()
        .map(|err| format!("{} renderer: {err:#}", renderer.name()));
    RenderOutcome {
        preview: output.exists().then(|| output.to_path_buf()),
        warning,
    }
}

/// External renderer invoked as `<program> [args…] <model> <output>`.
pub struct CommandRenderer {
    program: String,
    args: Vec<String>,
}

impl CommandRenderer {
    /// `None` for an empty command line.
    pub fn from_parts(parts: &[String]) -> Option<Self> {
        let (program, args) = parts.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl PreviewRenderer for CommandRenderer {
    fn name(&self) -> &str {
        "command"
    }

    fn render(&self, model: &Path, output: &Path) -> Result<()> {
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(model)
            .arg(output)
            .status()
            .with_context(|| format!("failed to spawn {}", self.program))?;
        if !status.success() {
            bail!("{} exited with {status}", self.command_line());
        }
        Ok(())
    }
}

/// Writes a solid placeholder PNG tinted by the model bytes.
pub struct DryrunRenderer {
    width: u32,
    height: u32,
}

impl DryrunRenderer {
    pub fn new() -> Self {
        let (width, height) = PREVIEW_VIEWPORT;
        Self::with_size(width / 8, height / 8)
    }

    pub fn with_size(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
        }
    }
}

impl Default for DryrunRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl PreviewRenderer for DryrunRenderer {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn render(&self, model: &Path, output: &Path) -> Result<()> {
        let bytes = fs::read(model).with_context(|| format!("failed reading {}", model.display()))?;
        let (r, g, b) = color_from_prompt("preview", bytes.len() as u64);
        let mut canvas = RgbImage::new(self.width, self.height);
        for pixel in canvas.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        canvas
            .save_with_format(output, ImageFormat::Png)
            .with_context(|| format!("failed to write {}", output.display()))?;
        Ok(())
    }
}

/// Renderer used when nothing is configured: never produces a preview.
#[derive(Debug, Default)]
pub struct NoopRenderer;

impl PreviewRenderer for NoopRenderer {
    fn name(&self) -> &str {
        "none"
    }

    fn render(&self, _model: &Path, _output: &Path) -> Result<()> {
        Ok(())
    }
}
