//! Backend-agnostic access to `OpenCode` metadata.
//!
//! [`Provider`] is the single entry point external tools use. It is built
//! from a [`ProviderConfig`] by [`Provider::open`], which is the only place
//! that chooses between the JSON file-tree and `SQLite` backends; every
//! other operation goes through the [`StorageBackend`] contract.

pub mod config;

use ocm_core::resolve::{self, ResolveOptions, Resolved};
use ocm_core::tokens::{self, AggregateTokenSummary, TokenSummary};
use ocm_core::{
    BackendKind, ChatMessage, ChatPart, ChatSearchResult, DeleteOptions, DeleteResult,
    JsonlBackend, ProjectRecord, ReadPolicy, SearchOptions, SessionFilter, SessionRecord,
    StorageBackend, StoreError, WarningSink,
};
use ocm_db::SqliteBackend;

pub use config::ProviderConfig;

/// Uniform access to projects, sessions, messages and parts.
pub struct Provider {
    backend: Box<dyn StorageBackend>,
}

impl Provider {
    /// Open the backend named by `config`.
    ///
    /// `sink` receives warnings about skipped malformed data in addition to
    /// the `tracing` events.
    pub fn open(config: &ProviderConfig, sink: Option<WarningSink>) -> Result<Self, StoreError> {
        let policy = ReadPolicy::lenient()
            .with_strict(config.strict)
            .with_sink(sink);
        let backend: Box<dyn StorageBackend> = match config.backend {
            BackendKind::Jsonl => Box::new(JsonlBackend::new(&config.root, policy)),
            BackendKind::Sqlite => Box::new(SqliteBackend::open(
                &config.database_path,
                policy,
                config.force_write,
            )?),
        };
        tracing::debug!(backend = %config.backend, strict = config.strict, "opened metadata provider");
        Ok(Self { backend })
    }

    /// Wrap an already constructed backend.
    pub fn from_backend(backend: impl StorageBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub async fn load_project_records(&self) -> Result<Vec<ProjectRecord>, StoreError> {
        self.backend.load_project_records().await
    }

    pub async fn load_session_records(
        &self,
        filter: &SessionFilter,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        self.backend.load_session_records(filter).await
    }

    pub async fn load_session_chat_index(
        &self,
        session_id: &str,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        self.backend.load_session_chat_index(session_id).await
    }

    pub async fn load_message_parts(&self, message_id: &str) -> Result<Vec<ChatPart>, StoreError> {
        self.backend.load_message_parts(message_id).await
    }

    pub async fn hydrate_chat_message_parts(
        &self,
        message: ChatMessage,
    ) -> Result<ChatMessage, StoreError> {
        self.backend.hydrate_chat_message_parts(message).await
    }

    pub async fn delete_project_metadata(
        &self,
        records: &[ProjectRecord],
        options: DeleteOptions,
    ) -> DeleteResult {
        self.backend.delete_project_metadata(records, options).await
    }

    pub async fn delete_session_metadata(
        &self,
        records: &[SessionRecord],
        options: DeleteOptions,
    ) -> DeleteResult {
        self.backend.delete_session_metadata(records, options).await
    }

    pub async fn update_session_title(
        &self,
        session: &SessionRecord,
        title: &str,
    ) -> Result<(), StoreError> {
        self.backend.update_session_title(session, title).await
    }

    pub async fn move_session(
        &self,
        session: &SessionRecord,
        target_project_id: &str,
    ) -> Result<SessionRecord, StoreError> {
        self.backend.move_session(session, target_project_id).await
    }

    pub async fn copy_session(
        &self,
        session: &SessionRecord,
        target_project_id: &str,
    ) -> Result<SessionRecord, StoreError> {
        self.backend.copy_session(session, target_project_id).await
    }

    pub async fn compute_session_token_summary(&self, session: &SessionRecord) -> TokenSummary {
        self.backend.compute_session_token_summary(session).await
    }

    /// Aggregate over the sessions belonging to `project_id`; others are ignored.
    pub async fn compute_project_token_summary(
        &self,
        project_id: &str,
        sessions: &[SessionRecord],
    ) -> AggregateTokenSummary {
        let mut summaries = Vec::new();
        for session in sessions.iter().filter(|s| s.project_id == project_id) {
            summaries.push(self.backend.compute_session_token_summary(session).await);
        }
        tokens::aggregate_summaries(summaries)
    }

    pub async fn compute_global_token_summary(
        &self,
        sessions: &[SessionRecord],
    ) -> AggregateTokenSummary {
        let mut summaries = Vec::with_capacity(sessions.len());
        for session in sessions {
            summaries.push(self.backend.compute_session_token_summary(session).await);
        }
        tokens::aggregate_summaries(summaries)
    }

    pub async fn search_sessions_chat(
        &self,
        sessions: &[SessionRecord],
        query: &str,
        options: SearchOptions,
    ) -> Result<Vec<ChatSearchResult>, StoreError> {
        self.backend
            .search_sessions_chat(sessions, query, options)
            .await
    }

    /// Load projects and resolve `input` against them.
    pub async fn resolve_project(
        &self,
        input: &str,
        options: ResolveOptions,
    ) -> Result<Resolved<ProjectRecord>, StoreError> {
        let projects = self.load_project_records().await?;
        resolve::resolve_owned(&projects, input, options)
    }

    /// Load sessions matching `filter` and resolve `input` against them.
    pub async fn resolve_session(
        &self,
        input: &str,
        filter: &SessionFilter,
        options: ResolveOptions,
    ) -> Result<Resolved<SessionRecord>, StoreError> {
        let sessions = self.load_session_records(filter).await?;
        resolve::resolve_owned(&sessions, input, options)
    }
}
