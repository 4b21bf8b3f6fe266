//! Grantflow: Progressive Multi-Section Generation
//!
//! Drives the generation of a fixed, ordered catalog of document sections
//! against a remote backend, tracking per-section state, overall progress and
//! time remaining, and surfacing each section's result as soon as it exists.

pub mod autosave;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod orchestrator;
pub mod progress;
pub mod session;
pub mod transport;

pub use catalog::{SectionCatalog, SectionSpec};
pub use error::{OrchestratorError, SectionGenerationError, SequencingViolation, TransportError};
pub use orchestrator::GenerationOrchestrator;
pub use session::{GenerationSession, OverallStatus, ResultMap, SectionContent, SectionStatus};
