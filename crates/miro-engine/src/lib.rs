//! Turn pipeline for conversational 3D generation: image edit, embedded
//! image extraction, shape generation and preview rendering, plus the
//! per-session controller that drives it.

pub mod config;
pub mod controller;
pub mod editor;
pub mod error;
pub mod extract;
pub mod orchestrator;
pub mod render;
pub mod services;
pub mod shape;
mod support;

pub use config::MiroConfig;
pub use controller::{ControllerError, SubmissionController, TurnReport};
pub use error::StageError;
pub use orchestrator::{GenerationOutcome, Orchestrator};
pub use services::ServiceHandles;
