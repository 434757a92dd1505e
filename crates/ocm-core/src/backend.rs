//! The storage contract both backends implement.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::model::{ChatMessage, ChatPart, DeleteResult, ProjectRecord, SessionRecord};
use crate::search::{self, ChatSearchResult};
use crate::tokens::{self, TokenSummary, UnknownReason};

/// Physical storage engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum BackendKind {
    /// One JSON document per entity in a directory tree.
    #[default]
    Jsonl,
    /// A single `SQLite` database file.
    Sqlite,
}

impl BackendKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Jsonl => "jsonl",
            Self::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jsonl" => Ok(Self::Jsonl),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(StoreError::Config(format!(
                "invalid backend '{other}' (expected 'jsonl' or 'sqlite')"
            ))),
        }
    }
}

impl TryFrom<String> for BackendKind {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Callback receiving non-fatal anomalies, e.g. a skipped malformed document.
pub type WarningSink = Arc<dyn Fn(&str) + Send + Sync>;

/// How read paths treat malformed stored data.
///
/// Lenient policies skip the offending document, emit a `tracing` warning and
/// notify the sink; strict policies return the error.
#[derive(Clone, Default)]
pub struct ReadPolicy {
    strict: bool,
    sink: Option<WarningSink>,
}

impl fmt::Debug for ReadPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadPolicy")
            .field("strict", &self.strict)
            .field("sink", &self.sink.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

impl ReadPolicy {
    pub fn lenient() -> Self {
        Self::default()
    }

    pub fn strict() -> Self {
        Self {
            strict: true,
            sink: None,
        }
    }

    #[must_use]
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Option<WarningSink>) -> Self {
        self.sink = sink;
        self
    }

    pub const fn is_strict(&self) -> bool {
        self.strict
    }

    /// Report an anomaly that never aborts the operation.
    pub fn warn(&self, message: &str) {
        tracing::warn!("{message}");
        if let Some(sink) = &self.sink {
            sink(message);
        }
    }

    /// Skip a bad document under the lenient policy, raise it under strict.
    pub fn tolerate(&self, err: StoreError) -> Result<(), StoreError> {
        if self.strict {
            return Err(err);
        }
        tracing::warn!(error = %err, "skipping unreadable document");
        if let Some(sink) = &self.sink {
            sink(&err.to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    pub project_id: Option<String>,
}

impl SessionFilter {
    pub fn project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: Some(project_id.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Report what would be removed without touching storage.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchOptions {
    pub max_results: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            max_results: search::DEFAULT_MAX_RESULTS,
        }
    }
}

/// Operations every storage engine provides.
///
/// Default methods express the in-memory algorithms in terms of the loading
/// operations; an engine that can answer more directly overrides them and
/// must return identical results for equivalent data.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn load_project_records(&self) -> Result<Vec<ProjectRecord>, StoreError>;

    async fn load_session_records(
        &self,
        filter: &SessionFilter,
    ) -> Result<Vec<SessionRecord>, StoreError>;

    /// Message metadata for a session, oldest first, without parts.
    async fn load_session_chat_index(
        &self,
        session_id: &str,
    ) -> Result<Vec<ChatMessage>, StoreError>;

    /// Parts of a message in stored order.
    async fn load_message_parts(&self, message_id: &str) -> Result<Vec<ChatPart>, StoreError>;

    async fn hydrate_chat_message_parts(
        &self,
        message: ChatMessage,
    ) -> Result<ChatMessage, StoreError> {
        let parts = self.load_message_parts(&message.message_id).await?;
        Ok(message.with_parts(parts))
    }

    async fn delete_project_metadata(
        &self,
        records: &[ProjectRecord],
        options: DeleteOptions,
    ) -> DeleteResult;

    async fn delete_session_metadata(
        &self,
        records: &[SessionRecord],
        options: DeleteOptions,
    ) -> DeleteResult;

    async fn update_session_title(
        &self,
        session: &SessionRecord,
        title: &str,
    ) -> Result<(), StoreError>;

    async fn move_session(
        &self,
        session: &SessionRecord,
        target_project_id: &str,
    ) -> Result<SessionRecord, StoreError>;

    async fn copy_session(
        &self,
        session: &SessionRecord,
        target_project_id: &str,
    ) -> Result<SessionRecord, StoreError>;

    async fn compute_session_token_summary(&self, session: &SessionRecord) -> TokenSummary {
        match self.load_session_chat_index(&session.session_id).await {
            Ok(messages) => tokens::summarize_messages(&messages),
            Err(err) => {
                tracing::warn!(session_id = %session.session_id, error = %err, "cannot read session messages");
                TokenSummary::unknown(UnknownReason::ParseError)
            }
        }
    }

    async fn search_sessions_chat(
        &self,
        sessions: &[SessionRecord],
        query: &str,
        options: SearchOptions,
    ) -> Result<Vec<ChatSearchResult>, StoreError> {
        search::scan_sessions(self, sessions, query, options).await
    }
}
