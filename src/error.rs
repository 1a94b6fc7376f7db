//! Error taxonomy shared by the manifest parser, verifier, ledger and controller.
//!
//! Library code returns [`CasketError`]; the CLI maps it to a process exit code
//! with [`CasketError::exit_code`].

use std::fmt;
use thiserror::Error;

/// Lifecycle stage an operation was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Fetching,
    Verifying,
    Staging,
    Installing,
    Uninstalling,
    Repairing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Fetching => "fetching",
            Stage::Verifying => "verifying",
            Stage::Staging => "staging",
            Stage::Installing => "installing",
            Stage::Uninstalling => "uninstalling",
            Stage::Repairing => "repairing",
        };
        f.write_str(name)
    }
}

/// A manifest failed to parse or validate. Each variant names the field at fault.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("malformed URI in field: {0}")]
    MalformedUri(String),

    #[error("malformed hash in field: {0} (expected 64 hex characters)")]
    MalformedHash(String),

    #[error("unknown field: {0}")]
    UnknownField(String),

    #[error("field given more than once: {0}")]
    DuplicateField(String),

    #[error("invalid {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("line {line}: {reason}")]
    Syntax { line: usize, reason: String },

    #[error("invalid manifest JSON: {0}")]
    Json(String),
}

/// Integrity check failures, kept apart so callers can match on them directly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("artifact is empty")]
    EmptyArtifact,

    #[error("checksum mismatch\n  expected: {expected}\n  actual:   {actual}")]
    HashMismatch { expected: String, actual: String },
}

#[derive(Error, Debug)]
pub enum CasketError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("download failed: {cause}")]
    Transport { cause: String },

    #[error("checksum mismatch\n  expected: {expected}\n  actual:   {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("artifact is empty")]
    EmptyArtifact,

    #[error("staging failed: {cause}")]
    Staging { cause: String },

    #[error("ledger write failed: {cause}")]
    Ledger { cause: String },

    #[error("{0} is not installed")]
    NotInstalled(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed while {stage}: {source}")]
    Failed {
        stage: Stage,
        #[source]
        source: Box<CasketError>,
    },
}

impl From<IntegrityError> for CasketError {
    fn from(err: IntegrityError) -> Self {
        match err {
            IntegrityError::EmptyArtifact => CasketError::EmptyArtifact,
            IntegrityError::HashMismatch { expected, actual } => {
                CasketError::HashMismatch { expected, actual }
            }
        }
    }
}

impl CasketError {
    /// Attach the stage an error happened in. Already-staged errors are left alone.
    pub fn at(self, stage: Stage) -> Self {
        match self {
            err @ CasketError::Failed { .. } => err,
            err => CasketError::Failed {
                stage,
                source: Box::new(err),
            },
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            CasketError::Failed { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// The error with any stage wrapper removed.
    pub fn root(&self) -> &CasketError {
        match self {
            CasketError::Failed { source, .. } => source.root(),
            err => err,
        }
    }

    /// Process exit code: 1 validation, 2 integrity, 3 I/O or transport, 4 ledger.
    pub fn exit_code(&self) -> i32 {
        match self.root() {
            CasketError::Validation(_) | CasketError::NotInstalled(_) => 1,
            CasketError::HashMismatch { .. } | CasketError::EmptyArtifact => 2,
            CasketError::Transport { .. }
            | CasketError::Staging { .. }
            | CasketError::Io(_)
            | CasketError::Cancelled => 3,
            CasketError::Ledger { .. } => 4,
            CasketError::Failed { source, .. } => source.exit_code(),
        }
    }

    pub(crate) fn transport(err: impl fmt::Display) -> Self {
        CasketError::Transport {
            cause: format!("{:#}", err),
        }
    }

    pub(crate) fn staging(err: impl fmt::Display) -> Self {
        CasketError::Staging {
            cause: format!("{:#}", err),
        }
    }

    pub(crate) fn ledger(err: impl fmt::Display) -> Self {
        CasketError::Ledger {
            cause: format!("{:#}", err),
        }
    }
}

pub type Result<T> = std::result::Result<T, CasketError>;
