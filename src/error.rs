use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::orchestrator::{DownloadAttempt, describe_attempts};

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("invalid run accession: {0}")]
    InvalidRunAccession(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("{provider}: run {accession} not found")]
    ResolutionNotFound { provider: String, accession: String },

    #[error("{provider}: location lookup failed: {message}")]
    ResolutionUnavailable { provider: String, message: String },

    #[error("download failed: {message}")]
    Download { message: String, transient: bool },

    #[error("download attempt timed out after {0}s")]
    AttemptTimedOut(u64),

    #[error("all download methods failed: {}", describe_attempts(.attempts))]
    #[diagnostic(help("every configured method was tried in order; see the per-method outcomes"))]
    OrchestratorExhausted { attempts: Vec<DownloadAttempt> },

    #[error("paid-tier access not allowed: {0}")]
    #[diagnostic(help("pass --allow-paid, --allow-paid-from-aws or --allow-paid-from-gcp"))]
    Policy(String),

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("unsupported output format combination: {0}")]
    Format(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl KiraError {
    pub fn download(message: impl Into<String>, transient: bool) -> Self {
        KiraError::Download {
            message: message.into(),
            transient,
        }
    }

    /// Whether retrying the same method may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            KiraError::ResolutionUnavailable { .. } => true,
            KiraError::Download { transient, .. } => *transient,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for KiraError {
    fn from(err: reqwest::Error) -> Self {
        let transient = err.is_timeout() || err.is_connect() || err.is_request() || err.is_body();
        KiraError::Download {
            message: err.to_string(),
            transient,
        }
    }
}
