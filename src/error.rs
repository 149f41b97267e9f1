//! Error kinds surfaced by the ingestion core.
//!
//! Each pipeline stage has its own `thiserror` enum so callers can react to
//! the stage that failed. Glue code (config, migrations, the binary) uses
//! `anyhow` instead.

use std::time::Duration;
use thiserror::Error;

/// Prompt template loading and assembly errors.
#[derive(Error, Debug)]
pub enum PromptError {
    /// Filename contained a path separator or `..`, or resolved outside the
    /// template directory. Raised before any filesystem read.
    #[error("invalid template filename: {0}")]
    InvalidFilename(String),

    #[error("prompt template missing: {name}")]
    TemplateMissing {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures of a single round-trip to the reasoning endpoint.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model transport error: {0}")]
    Transport(String),

    #[error("model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("model call cancelled")]
    Cancelled,

    #[error("model returned status {status}: {snippet}")]
    Status { status: u16, snippet: String },

    #[error("model envelope could not be decoded: {0}")]
    Decode(String),

    #[error("model response contained no text")]
    EmptyText,

    #[error("model client misconfigured: {0}")]
    Config(String),
}

impl ModelError {
    /// Network-level failures: transport, timeout, cancellation.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ModelError::Transport(_) | ModelError::Timeout(_) | ModelError::Cancelled
        )
    }
}

/// Errors recovering a JSON payload from model text.
#[derive(Error, Debug, PartialEq)]
pub enum ParseError {
    #[error("no JSON {expected} found in model output")]
    NoJson { expected: &'static str },

    #[error("malformed JSON in model output: {0}")]
    Malformed(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("schema violation: {0}")]
    Schema(String),
}

/// Database error classes the core distinguishes.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("row not found")]
    NotFound,

    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("transient database connection error: {0}")]
    TransientConnection(String),

    #[error("database error: {0}")]
    Other(String),

    #[error("database operation cancelled")]
    Cancelled,
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                StoreError::UniqueViolation(db.message().to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::TransientConnection(err.to_string())
            }
            other => StoreError::Other(other.to_string()),
        }
    }
}

/// Per-item persistence failures. Logged and skipped by the orchestrator.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("raw submission insert failed: {0}")]
    Raw(#[source] StoreError),

    #[error("parsed item upsert failed: {0}")]
    Parsed(#[source] StoreError),

    #[error("mapping insert failed: {0}")]
    Mapping(#[source] StoreError),

    #[error("raw text is {0} chars, limit is 255")]
    NameTooLong(usize),
}

impl PersistError {
    /// The write was aborted by cancellation rather than rejected.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            PersistError::Raw(StoreError::Cancelled) | PersistError::Parsed(StoreError::Cancelled)
        )
    }
}

/// Errors that abort one ingestion call.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("nothing to ingest: input text is empty")]
    EmptyInput,

    #[error(transparent)]
    Prompt(#[from] PromptError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error("ingestion cancelled after {persisted} item(s) were persisted")]
    Cancelled { persisted: usize },
}

/// Errors from the translation cache.
#[derive(Error, Debug)]
pub enum TranslateError {
    #[error(transparent)]
    Prompt(#[from] PromptError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("translation returned {got} item(s) for {expected} input(s)")]
    CountMismatch { expected: usize, got: usize },
}

/// A notifier rejected a delivery. Logged only.
#[derive(Error, Debug)]
#[error("fanout to {user_id} failed: {reason}")]
pub struct FanoutError {
    pub user_id: uuid::Uuid,
    pub reason: String,
}

/// Errors from voice and receipt intake adapters.
#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("speech transcription failed: {0}")]
    Speech(String),

    #[error("transcript is empty")]
    EmptyTranscript,

    #[error("unsupported receipt content type: {0}")]
    UnsupportedMedia(String),

    #[error("receipt upload failed: {0}")]
    Storage(String),

    #[error("receipt analysis failed: {0}")]
    Ocr(String),

    #[error("intake cancelled")]
    Cancelled,

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Translate(#[from] TranslateError),
}
