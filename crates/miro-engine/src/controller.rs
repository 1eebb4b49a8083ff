use std::io;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use miro_contracts::events::EventWriter;
use miro_contracts::session::{
    resolve_version, version_label, ChatRole, SessionManifest, SessionState, UserInput,
};
use serde_json::json;
use thiserror::Error;

use crate::orchestrator::{GenerationOutcome, Orchestrator};
use crate::support::{map_object, path_string};

#[derive(Debug, Error)]
pub enum ControllerError {
    /// Input is disabled while a turn is processing; nothing is queued.
    #[error("session busy: a turn is still processing")]
    SessionBusy,

    #[error("failed to start turn worker: {0}")]
    WorkerSpawn(#[from] io::Error),
}

/// What Phase 2 hands back to the interaction layer.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub input: UserInput,
    pub references: Vec<PathBuf>,
    pub outcome: GenerationOutcome,
    pub version_labels: Vec<String>,
}

/// Two-phase turn handling for one session.
///
/// Phase 1 ([`SubmissionController::submit_immediate`]) only touches the
/// transcript and closes the input gate. Phase 2
/// ([`SubmissionController::process`]) runs the pipeline without holding the
/// session lock and reopens the gate. The gate is the only thing keeping two
/// Phase 2 runs of the same session apart.
#[derive(Clone)]
pub struct SubmissionController {
    state: Arc<Mutex<SessionState>>,
    orchestrator: Arc<Orchestrator>,
    placeholder_image: PathBuf,
    manifest: Option<SessionManifest>,
}

impl SubmissionController {
    pub fn new(orchestrator: Arc<Orchestrator>, placeholder_image: impl Into<PathBuf>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SessionState::new())),
            orchestrator,
            placeholder_image: placeholder_image.into(),
            manifest: None,
        }
    }

    /// Resumes the manifest's session and saves back to it after every turn
    /// and revert.
    pub fn with_manifest(
        orchestrator: Arc<Orchestrator>,
        placeholder_image: impl Into<PathBuf>,
        manifest: SessionManifest,
    ) -> Self {
        let mut state = manifest.state.clone();
        state.input_enabled = true;
        state.pending = None;
        Self {
            state: Arc::new(Mutex::new(state)),
            orchestrator,
            placeholder_image: placeholder_image.into(),
            manifest: Some(SessionManifest {
                state: SessionState::new(),
                ..manifest
            }),
        }
    }

    pub fn events(&self) -> &EventWriter {
        self.orchestrator.events()
    }

    pub fn snapshot(&self) -> SessionState {
        self.lock().clone()
    }

    pub fn is_processing(&self) -> bool {
        self.lock().is_processing()
    }

    /// Phase 1. Records the attachments then the text as user entries and
    /// disables input. Returns the input unchanged for Phase 2.
    pub fn submit_immediate(&self, input: UserInput) -> Result<UserInput, ControllerError> {
        let mut state = self.lock();
        if !state.input_enabled {
            return Err(ControllerError::SessionBusy);
        }
        for file in &input.files {
            state.push_image(ChatRole::User, file);
        }
        state.push_text(ChatRole::User, input.text.clone());
        state.input_enabled = false;
        state.pending = Some(input.clone());
        Ok(input)
    }

    /// Phase 2. Blocking; call it from a worker thread or via
    /// [`SubmissionController::dispatch`].
    pub fn process(&self, input: UserInput) -> TurnReport {
        let (references, mut history) = {
            let state = self.lock();
            let mut references: Vec<PathBuf> = state.current_preview.iter().cloned().collect();
            references.extend(input.files.iter().cloned());
            if references.is_empty() {
                references.push(self.placeholder_image.clone());
            }
            (references, state.history.clone())
        };

        let outcome = self
            .orchestrator
            .generate(&input.text, &references, &mut history);

        let snapshot = {
            let mut state = self.lock();
            state.history = history;
            for image in &outcome.extracted {
                state.push_image(ChatRole::Assistant, image);
            }
            if let Some(preview) = &outcome.preview_path {
                state.push_image(ChatRole::Assistant, preview);
                state.current_preview = Some(preview.clone());
            }
            if let Some(model) = &outcome.model_path {
                state.displayed_model = Some(model.clone());
            }
            if let Some(failure) = &outcome.failure {
                state.push_text(ChatRole::Assistant, format!("Generation failed at {failure}"));
            }
            state.pending = None;
            state.input_enabled = true;
            state.clone()
        };
        self.persist(&snapshot);

        TurnReport {
            input,
            references,
            outcome,
            version_labels: snapshot.version_labels(),
        }
    }

    /// Runs Phase 2 of an already accepted input on a worker thread and
    /// hands the report to `on_done` there.
    pub fn dispatch_with<F>(&self, input: UserInput, on_done: F) -> Result<(), ControllerError>
    where
        F: FnOnce(TurnReport) + Send + 'static,
    {
        let worker = self.clone();
        let spawned = thread::Builder::new()
            .name("miro-turn".to_string())
            .spawn(move || on_done(worker.process(input)));
        if let Err(err) = spawned {
            let mut state = self.lock();
            state.pending = None;
            state.input_enabled = true;
            return Err(err.into());
        }
        Ok(())
    }

    /// [`SubmissionController::dispatch_with`] delivering over a channel.
    pub fn dispatch(&self, input: UserInput) -> Result<Receiver<TurnReport>, ControllerError> {
        let (tx, rx) = mpsc::channel();
        self.dispatch_with(input, move |report| {
            let _ = tx.send(report);
        })?;
        Ok(rx)
    }

    /// Both phases back to back, on the calling thread.
    pub fn run_turn(&self, input: UserInput) -> Result<TurnReport, ControllerError> {
        let accepted = self.submit_immediate(input)?;
        Ok(self.process(accepted))
    }

    /// Shows a past version. Only the displayed model changes; the history
    /// and the next turn's reference image stay as they are.
    pub fn revert(&self, index: i64) -> Result<Option<PathBuf>, ControllerError> {
        let snapshot = {
            let mut state = self.lock();
            if !state.input_enabled {
                return Err(ControllerError::SessionBusy);
            }
            let Some(model) = resolve_version(index, &state.history).map(|entry| entry.path.clone())
            else {
                return Ok(None);
            };
            state.displayed_model = Some(model);
            state.clone()
        };

        let model = snapshot.displayed_model.clone();
        self.events().try_emit(
            "version_reverted",
            map_object(json!({
                "index": index,
                "version": usize::try_from(index).ok().map(version_label),
                "model_path": model.as_deref().map(path_string),
            })),
        );
        self.persist(&snapshot);
        Ok(model)
    }

    fn persist(&self, snapshot: &SessionState) {
        let Some(template) = &self.manifest else {
            return;
        };
        let manifest = SessionManifest {
            state: snapshot.clone(),
            ..template.clone()
        };
        if let Err(err) = manifest.save() {
            self.events().warn(
                "session",
                &format!("failed to save {}: {err:#}", manifest.path.display()),
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
