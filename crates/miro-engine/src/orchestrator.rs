use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use miro_contracts::events::EventWriter;
use miro_contracts::session::VersionHistory;
use miro_contracts::turns::receipts::{
    build_receipt, write_receipt, StageRecord, StageStatus, TurnArtifacts, TurnRequest,
};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::StageError;
use crate::extract::extract_images;
use crate::render::render_preview;
use crate::services::ServiceHandles;
use crate::support::{map_object, path_string};

const STAGES: &[&str] = &["workspace", "edit", "extract", "reference", "shape", "render"];

/// Everything one turn produced. `model_path` is `None` whenever a stage
/// before the history append failed; earlier artifacts stay on disk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOutcome {
    pub model_path: Option<PathBuf>,
    pub preview_path: Option<PathBuf>,
    pub extracted: Vec<PathBuf>,
    pub working_dir: PathBuf,
    pub remote_asset_id: Option<String>,
    pub warnings: Vec<String>,
    pub failure: Option<String>,
    pub stages: Vec<StageRecord>,
}

impl GenerationOutcome {
    pub fn succeeded(&self) -> bool {
        self.model_path.is_some()
    }
}

/// Drives edit, extraction, shape generation and preview rendering for one
/// prompt. Stateless between turns apart from the shared service handles,
/// so one instance can serve concurrent turns of different sessions.
pub struct Orchestrator {
    services: ServiceHandles,
    output_root: PathBuf,
    events: EventWriter,
}

impl Orchestrator {
    pub fn new(services: ServiceHandles, output_root: impl Into<PathBuf>, events: EventWriter) -> Self {
        Self {
            services,
            output_root: output_root.into(),
            events,
        }
    }

    pub fn events(&self) -> &EventWriter {
        &self.events
    }

    /// Creates `<output_root>/<random hex>`. `create_dir` fails on an
    /// existing path, so two turns can never end up sharing a directory.
    pub fn allocate_working_dir(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.output_root)
            .with_context(|| format!("failed to create {}", self.output_root.display()))?;
        for _ in 0..4 {
            let candidate = self.output_root.join(Uuid::new_v4().simple().to_string());
            match fs::create_dir(&candidate) {
                Ok(()) => return Ok(candidate),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to create {}", candidate.display()))
                }
            }
        }
        bail!(
            "could not allocate a fresh working directory under {}",
            self.output_root.display()
        )
    }

    /// Runs one turn. Never fails: every stage error is recorded on the
    /// outcome and `history` is only touched once a model exists on disk.
    pub fn generate(
        &self,
        prompt: &str,
        images: &[PathBuf],
        history: &mut VersionHistory,
    ) -> GenerationOutcome {
        let started = Instant::now();
        let mut turn = TurnLog::new(prompt, images);

        let working_dir = match self.allocate_working_dir() {
            Ok(dir) => {
                turn.stage_ok("workspace", started);
                dir
            }
            Err(err) => {
                let text = format!("{err:#}");
                self.events.warn("workspace", &text);
                turn.stage_failed("workspace", text, started);
                return turn.into_outcome(self.output_root.clone());
            }
        };
        self.events.try_emit(
            "turn_started",
            map_object(json!({
                "prompt": prompt,
                "working_dir": path_string(&working_dir),
                "reference_images": turn.request.reference_images,
                "services": Value::Object(self.services.names()),
            })),
        );

        let stage_started = Instant::now();
        let exchange = match self.services.editor.edit(prompt, images) {
            Ok(exchange) => {
                turn.stage_ok("edit", stage_started);
                exchange
            }
            Err(err) => {
                self.events.try_emit(
                    "edit_failed",
                    map_object(json!({"error": err.to_string()})),
                );
                turn.stage_failed("edit", err.to_string(), stage_started);
                return self.finish(turn, working_dir, started);
            }
        };
        turn.edit_request = exchange.request;

        let stage_started = Instant::now();
        let extraction = match extract_images(&exchange.response, &working_dir) {
            Ok(extraction) => extraction,
            Err(err) => {
                turn.stage_failed("extract", format!("{err:#}"), stage_started);
                return self.finish(turn, working_dir, started);
            }
        };
        for warning in &extraction.warnings {
            self.events.try_emit(
                "extraction_warning",
                map_object(json!({"message": warning})),
            );
            turn.warnings.push(warning.clone());
        }
        if extraction.is_empty() {
            turn.stage_failed("extract", "edit response carried no images", stage_started);
            return self.finish(turn, working_dir, started);
        }
        turn.extracted = extraction.paths();
        turn.stage_ok("extract", stage_started);
        self.events.try_emit(
            "images_extracted",
            map_object(json!({
                "count": turn.extracted.len(),
                "paths": turn.extracted.iter().map(|path| path_string(path)).collect::<Vec<_>>(),
            })),
        );

        let reference = turn.extracted[0].clone();
        if !reference.exists() {
            let err = StageError::MissingArtifact(reference.clone());
            self.events.try_emit(
                "reference_missing",
                map_object(json!({"path": path_string(&reference)})),
            );
            turn.stage_failed("reference", err.to_string(), Instant::now());
            return self.finish(turn, working_dir, started);
        }
        turn.stage_ok("reference", Instant::now());

        let stage_started = Instant::now();
        let target = working_dir.join("output.glb");
        let shape = match self.services.shape.generate(&reference, Some(target.as_path())) {
            Ok(shape) => {
                turn.stage_ok("shape", stage_started);
                shape
            }
            Err(err) => {
                self.events.try_emit(
                    "shape_failed",
                    map_object(json!({
                        "reference": path_string(&reference),
                        "error": err.to_string(),
                    })),
                );
                turn.stage_failed("shape", err.to_string(), stage_started);
                return self.finish(turn, working_dir, started);
            }
        };

        let version = history.push(&shape.path, prompt, Some(working_dir.as_path()));
        let sequence_index = version.sequence_index;
        self.events.try_emit(
            "version_created",
            map_object(json!({
                "version": version.label(),
                "sequence_index": sequence_index,
                "model_path": path_string(&shape.path),
                "remote_asset_id": shape.remote_filename,
                "bytes": shape.bytes,
                "prompt_diff": version.prompt_diff,
            })),
        );
        turn.model_path = Some(shape.path.clone());
        turn.remote_asset_id = shape.remote_filename;

        let stage_started = Instant::now();
        let preview_target = working_dir.join("render_image.png");
        let rendered = render_preview(self.services.renderer.as_ref(), &shape.path, &preview_target);
        if let Some(warning) = rendered.warning {
            turn.warnings.push(warning);
        }
        match rendered.preview {
            Some(preview) => {
                history.set_preview(sequence_index, &preview);
                self.events.try_emit(
                    "preview_rendered",
                    map_object(json!({"path": path_string(&preview)})),
                );
                turn.stage_ok("render", stage_started);
                turn.preview_path = Some(preview);
            }
            None => {
                self.events.try_emit(
                    "preview_missing",
                    map_object(json!({
                        "renderer": self.services.renderer.name(),
                        "expected": path_string(&preview_target),
                    })),
                );
                // A missing preview never fails the turn.
                turn.stages.push(StageRecord::failed(
                    "render",
                    "no preview produced",
                    elapsed_ms(stage_started),
                ));
            }
        }

        self.finish(turn, working_dir, started)
    }

    fn finish(&self, mut turn: TurnLog, working_dir: PathBuf, started: Instant) -> GenerationOutcome {
        turn.fill_skipped();
        let artifacts = TurnArtifacts {
            working_dir: path_string(&working_dir),
            extracted_images: turn.extracted.iter().map(|path| path_string(path)).collect(),
            model_path: turn.model_path.as_deref().map(path_string),
            preview_path: turn.preview_path.as_deref().map(path_string),
            remote_asset_id: turn.remote_asset_id.clone(),
        };
        let receipt = build_receipt(
            &turn.request,
            &turn.edit_request,
            &turn.stages,
            &artifacts,
            &turn.warnings,
        );
        let receipt_path = working_dir.join("receipt.json");
        if let Err(err) = write_receipt(&receipt_path, &receipt) {
            let text = format!("failed to write {}: {err:#}", receipt_path.display());
            self.events.warn("receipt", &text);
            turn.warnings.push(text);
        }

        self.events.try_emit(
            "turn_finished",
            map_object(json!({
                "ok": turn.model_path.is_some(),
                "working_dir": artifacts.working_dir,
                "model_path": artifacts.model_path,
                "preview_path": artifacts.preview_path,
                "failure": turn.failure,
                "elapsed_ms": elapsed_ms(started),
            })),
        );
        turn.into_outcome(working_dir)
    }
}

/// Mutable record of a turn in flight.
struct TurnLog {
    request: TurnRequest,
    edit_request: Map<String, Value>,
    stages: Vec<StageRecord>,
    extracted: Vec<PathBuf>,
    model_path: Option<PathBuf>,
    preview_path: Option<PathBuf>,
    remote_asset_id: Option<String>,
    warnings: Vec<String>,
    failure: Option<String>,
}

impl TurnLog {
    fn new(prompt: &str, images: &[PathBuf]) -> Self {
        Self {
            request: TurnRequest {
                prompt: prompt.to_string(),
                reference_images: images.iter().map(|path| path_string(path)).collect(),
            },
            edit_request: Map::new(),
            stages: Vec::new(),
            extracted: Vec::new(),
            model_path: None,
            preview_path: None,
            remote_asset_id: None,
            warnings: Vec::new(),
            failure: None,
        }
    }

    fn stage_ok(&mut self, stage: &str, started: Instant) {
        self.stages.push(StageRecord::ok(stage, elapsed_ms(started)));
    }

    fn stage_failed(&mut self, stage: &str, error: impl Into<String>, started: Instant) {
        let error = error.into();
        self.failure = Some(format!("{stage}: {error}"));
        self.stages
            .push(StageRecord::failed(stage, error, elapsed_ms(started)));
    }

    fn fill_skipped(&mut self) {
        for stage in STAGES {
            if !self.stages.iter().any(|record| record.stage == *stage) {
                self.stages.push(StageRecord::skipped(stage));
            }
        }
    }

    fn into_outcome(mut self, working_dir: PathBuf) -> GenerationOutcome {
        self.fill_skipped();
        GenerationOutcome {
            model_path: self.model_path,
            preview_path: self.preview_path,
            extracted: self.extracted,
            working_dir,
            remote_asset_id: self.remote_asset_id,
            warnings: self.warnings,
            failure: self.failure,
            stages: self.stages,
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Stage records for display, e.g. `edit=ok shape=failed render=skipped`.
pub fn stage_line(stages: &[StageRecord]) -> String {
    stages
        .iter()
        .map(|record| {
            let status = match record.status {
                StageStatus::Ok => "ok",
                StageStatus::Failed => "failed",
                StageStatus::Skipped => "skipped",
            };
            format!("{}={status}", record.stage)
        })
        .collect::<Vec<_>>()
        .join(" ")
}
