use std::sync::Arc;

use anyhow::Result;
use miro_contracts::events::{EventPayload, EventWriter};
use serde_json::{json, Value};

use crate::config::MiroConfig;
use crate::editor::{DryrunImageEditor, HttpImageEditor, ImageEditor};
use crate::render::{CommandRenderer, DryrunRenderer, NoopRenderer, PreviewRenderer};
use crate::shape::{DryrunShapeGenerator, HttpShapeGenerator, ShapeGenerator};
use crate::support::map_object;

/// Process-wide service handles, built once at startup and shared by every
/// session. Cloning shares the underlying clients.
#[derive(Clone)]
pub struct ServiceHandles {
    pub editor: Arc<dyn ImageEditor>,
    pub shape: Arc<dyn ShapeGenerator>,
    pub renderer: Arc<dyn PreviewRenderer>,
}

impl ServiceHandles {
    pub fn new(
        editor: Arc<dyn ImageEditor>,
        shape: Arc<dyn ShapeGenerator>,
        renderer: Arc<dyn PreviewRenderer>,
    ) -> Self {
        Self {
            editor,
            shape,
            renderer,
        }
    }

    pub fn from_config(config: &MiroConfig) -> Result<Self> {
        if config.dryrun {
            return Ok(Self::dryrun());
        }
        let editor = HttpImageEditor::new(
            config.image_url.clone(),
            config.image_model.clone(),
            config.http_timeout,
        )?;
        let shape = HttpShapeGenerator::new(config.shape_url.clone(), config.http_timeout)?;
        let renderer: Arc<dyn PreviewRenderer> = match config
            .render_command
            .as_deref()
            .and_then(CommandRenderer::from_parts)
        {
            Some(renderer) => Arc::new(renderer),
            None => Arc::new(NoopRenderer),
        };
        Ok(Self::new(Arc::new(editor), Arc::new(shape), renderer))
    }

    pub fn dryrun() -> Self {
        Self::new(
            Arc::new(DryrunImageEditor::new()),
            Arc::new(DryrunShapeGenerator),
            Arc::new(DryrunRenderer::new()),
        )
    }

    pub fn names(&self) -> EventPayload {
        map_object(json!({
            "editor": self.editor.name(),
            "shape": self.shape.name(),
            "renderer": self.renderer.name(),
        }))
    }

    /// Releases this holder's references and records the release.
    pub fn shutdown(self, events: &EventWriter) {
        let mut payload = self.names();
        payload.insert(
            "shared_refs".to_string(),
            Value::from(Arc::strong_count(&self.editor).saturating_sub(1) as u64),
        );
        drop(self);
        events.try_emit("services_released", payload);
    }
}
