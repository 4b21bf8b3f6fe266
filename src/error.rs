//! Error types for the generation orchestrator.
//!
//! Four families mirror how failures are handled: transport errors are absorbed by
//! failover, section errors wait for an explicit retry, sequencing violations are
//! rejected synchronously, and late results after cancellation are dropped.

use thiserror::Error;

/// Progress channel failures (stream or poll). Recoverable through failover.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Request failed with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Progress stream closed unexpectedly")]
    StreamClosed,

    #[error("Progress stream silent for {0} ms")]
    Stalled(u64),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Failed to decode progress payload: {0}")]
    Decode(String),
}

/// A remote generation step failed. Recoverable only through `retry_section`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SectionGenerationError {
    #[error("{0}")]
    Remote(String),

    #[error("rate limited")]
    RateLimited,

    #[error("Section '{key}' timed out after {seconds} s")]
    Timeout { key: String, seconds: u64 },

    #[error("Invalid section payload: {0}")]
    InvalidPayload(String),

    #[error("Generation backend unreachable: {0}")]
    Unreachable(String),
}

/// Programmer errors against the orchestrator's public operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SequencingViolation {
    #[error("A generation session is already running")]
    AlreadyRunning,

    #[error("Section '{requested}' cannot be retried before '{first_failed}'")]
    OutOfOrderRetry {
        requested: String,
        first_failed: String,
    },

    #[error("Section '{0}' is not in a failed state")]
    NotFailed(String),

    #[error("Unknown section: {0}")]
    UnknownSection(String),

    #[error("Session was cancelled")]
    Cancelled,

    #[error("Session already completed")]
    AlreadyCompleted,

    #[error("No generation session is active")]
    NoActiveSession,

    #[error("Section '{key}' cannot start before '{blocking}' is completed")]
    PredecessorIncomplete { key: String, blocking: String },

    #[error("Section '{running}' is already in progress")]
    SingleFlight { running: String },

    #[error("Progress events are only accepted for server-managed sessions")]
    EventsNotAccepted,
}

/// Catalog construction errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Section catalog is empty")]
    Empty,

    #[error("Duplicate section key: {0}")]
    DuplicateKey(String),

    #[error("Section key cannot be empty (ordinal {0})")]
    EmptyKey(usize),

    #[error("Section '{key}' has ordinal {found}, expected {expected}")]
    NonContiguousOrdinal {
        key: String,
        expected: usize,
        found: usize,
    },

    #[error("Section '{0}' must expect at least one unit of output")]
    ZeroUnits(String),
}

/// Auto-save failures. Logged, never block generation.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Persistence I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode results: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{0}")]
    Rejected(String),
}

/// Errors surfaced by the orchestrator's public operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Sequencing(#[from] SequencingViolation),

    #[error("Failed to open generation session: {0}")]
    SessionStart(#[from] TransportError),

    #[error("Backend rejected retry of section '{key}': {error}")]
    RetryRequest { key: String, error: TransportError },

    #[error("Invalid catalog: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Configuration loading and logging setup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Configuration validation failed:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),

    #[error("{0}")]
    Logging(String),
}

/// Errors surfaced by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid context file {path}: {source}")]
    InvalidContext {
        path: String,
        source: serde_json::Error,
    },

    #[error("Failed to render output: {0}")]
    Render(String),

    #[error("Generation did not complete: {0}")]
    Incomplete(String),
}

impl From<TransportError> for SectionGenerationError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Status { status: 429, .. } => SectionGenerationError::RateLimited,
            TransportError::Connect(msg) => SectionGenerationError::Unreachable(msg),
            TransportError::Decode(msg) => SectionGenerationError::InvalidPayload(msg),
            other => SectionGenerationError::Remote(other.to_string()),
        }
    }
}
