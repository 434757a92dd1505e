use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Kind of record an identifier refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Project,
    Session,
    Message,
    Part,
}

impl EntityKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Session => "session",
            Self::Message => "message",
            Self::Part => "part",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by storage backends and the algorithms built on them.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record matches the identifier.
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },
    /// A prefix matched more than one record.
    #[error("ambiguous {kind} id '{id}' matches: {}", candidate_list(.candidates, .truncated))]
    Ambiguous {
        kind: EntityKind,
        id: String,
        /// At most three matching ids, in load order.
        candidates: Vec<String>,
        /// More matches exist than are listed.
        truncated: bool,
    },
    /// Invalid or missing backend parameters.
    #[error("configuration error: {0}")]
    Config(String),
    /// A file system operation failed.
    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// A stored document is not valid JSON or does not match its shape.
    #[error("JSON parse error at {locator}: {source}")]
    Json {
        locator: String,
        #[source]
        source: serde_json::Error,
    },
    /// A stored document parsed but violates a structural requirement.
    #[error("malformed {kind} at {locator}: {message}")]
    Malformed {
        kind: EntityKind,
        locator: String,
        message: String,
    },
    /// The target of a write already exists.
    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: EntityKind, id: String },
    /// An error from a backend-specific engine.
    #[error("backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error describes unreadable stored data rather than an
    /// environment failure.
    #[must_use]
    pub const fn is_malformed_data(&self) -> bool {
        matches!(self, Self::Json { .. } | Self::Malformed { .. })
    }
}

fn candidate_list(candidates: &[String], truncated: &bool) -> String {
    let mut list = candidates.join(", ");
    if *truncated {
        list.push_str(", …");
    }
    list
}
