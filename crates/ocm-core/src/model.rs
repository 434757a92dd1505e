//! Records shared by every storage backend.

use std::cmp::Reverse;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tokens::TokenBreakdown;

/// Maximum number of characters kept in a message preview.
pub const PREVIEW_MAX_CHARS: usize = 200;

/// Preview shown for a hydrated message without any text.
pub const EMPTY_PREVIEW: &str = "[no content]";

/// Prefix of virtual locators produced by the `SQLite` backend.
pub const SQLITE_LOCATOR_PREFIX: &str = "sqlite:";

pub(crate) fn unix_ms_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Current time as Unix milliseconds, the unit every stored document uses.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Build the virtual locator used in place of a file path, e.g. `sqlite:session:ses_1`.
pub fn sqlite_locator(kind: crate::EntityKind, id: &str) -> String {
    format!("{SQLITE_LOCATOR_PREFIX}{kind}:{id}")
}

/// Whether a `file_path` names a real file that can be backed up or moved.
pub fn is_physical_locator(file_path: &str) -> bool {
    !file_path.starts_with(SQLITE_LOCATOR_PREFIX)
}

/// Generates ordered identifiers for records created in one batch.
///
/// Ids share a random batch token and end in a zero-padded counter, so
/// lexicographic order matches creation order.
#[derive(Debug)]
pub struct IdSequence {
    prefix: &'static str,
    batch: String,
    next: u32,
}

impl IdSequence {
    pub fn new(prefix: &'static str) -> Self {
        let mut batch = Uuid::new_v4().simple().to_string();
        batch.truncate(20);
        Self {
            prefix,
            batch,
            next: 0,
        }
    }

    pub fn next_id(&mut self) -> String {
        let id = format!("{}_{}{:06}", self.prefix, self.batch, self.next);
        self.next = self.next.saturating_add(1);
        id
    }
}

/// Existence state of a project's worktree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectState {
    Present,
    Missing,
    Unknown,
}

impl ProjectState {
    /// Check the worktree on disk. Never cached; call on every load.
    pub async fn of_worktree(worktree: &str) -> Self {
        if worktree.is_empty() {
            return Self::Unknown;
        }
        match tokio::fs::try_exists(worktree).await {
            Ok(true) => Self::Present,
            Ok(false) => Self::Missing,
            Err(err) => {
                tracing::debug!(worktree, error = %err, "worktree existence check failed");
                Self::Unknown
            }
        }
    }
}

/// On-disk namespace a JSONL project record was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectBucket {
    /// `storage/project/`
    Project,
    /// `storage/sessions/`, written by older releases.
    Sessions,
}

impl ProjectBucket {
    #[must_use]
    pub const fn dir_name(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Sessions => "sessions",
        }
    }
}

/// One managed project/worktree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRecord {
    /// 1-based position in load order.
    pub index: usize,
    pub project_id: String,
    pub worktree: String,
    pub vcs: Option<String>,
    pub state: ProjectState,
    pub created_at: Option<DateTime<Utc>>,
    /// Only set by the JSONL backend.
    pub bucket: Option<ProjectBucket>,
    pub file_path: String,
}

/// One chat session, owned by a project that may no longer exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub index: usize,
    pub session_id: String,
    pub project_id: String,
    pub parent_id: Option<String>,
    pub title: Option<String>,
    pub directory: String,
    pub created_at: Option<DateTime<Utc>>,
    /// Falls back to `created_at` when the document has no update time.
    pub updated_at: Option<DateTime<Utc>>,
    pub file_path: String,
    pub version: Option<String>,
}

/// Chat message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    #[default]
    #[serde(other)]
    Unknown,
}

impl MessageRole {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Unknown => "unknown",
        }
    }
}

/// One turn in a session.
///
/// Loaded in two stages: the index load fills metadata only (`parts` is
/// `None`, preview empty), hydration loads the parts and derives the preview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub message_id: String,
    pub session_id: String,
    pub parent_id: Option<String>,
    pub role: MessageRole,
    pub created_at: Option<DateTime<Utc>>,
    /// Only populated for assistant messages.
    pub tokens: Option<TokenBreakdown>,
    pub preview_text: String,
    pub total_chars: usize,
    pub parts: Option<Vec<ChatPart>>,
}

impl ChatMessage {
    /// Attach loaded parts and recompute the derived text fields.
    #[must_use]
    pub fn with_parts(mut self, parts: Vec<ChatPart>) -> Self {
        let text = join_part_text(&parts);
        self.total_chars = text.chars().count();
        self.preview_text = preview_text(&text);
        self.parts = Some(parts);
        self
    }

    pub const fn is_hydrated(&self) -> bool {
        self.parts.is_some()
    }
}

/// Message part variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PartType {
    Text,
    Tool,
    Subtask,
    #[default]
    #[serde(other)]
    Unknown,
}

impl PartType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Tool => "tool",
            Self::Subtask => "subtask",
            Self::Unknown => "unknown",
        }
    }
}

/// One content fragment of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPart {
    pub part_id: String,
    pub message_id: String,
    #[serde(rename = "type")]
    pub part_type: PartType,
    /// Literal text used for previews and search.
    pub text: String,
    pub tool_name: Option<String>,
}

/// A record a bulk delete could not remove.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteFailure {
    pub path: String,
    pub error: String,
}

/// Outcome of a bulk delete. One failure never stops the batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResult {
    pub removed: Vec<String>,
    pub failed: Vec<DeleteFailure>,
}

impl DeleteResult {
    pub fn record_failure(&mut self, path: impl Into<String>, error: impl ToString) {
        self.failed.push(DeleteFailure {
            path: path.into(),
            error: error.to_string(),
        });
    }

    pub const fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Concatenate part text in part order, skipping empty fragments.
pub fn join_part_text(parts: &[ChatPart]) -> String {
    parts
        .iter()
        .map(|p| p.text.as_str())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Single-line preview bounded to [`PREVIEW_MAX_CHARS`].
pub fn preview_text(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return EMPTY_PREVIEW.to_string();
    }
    if collapsed.chars().count() <= PREVIEW_MAX_CHARS {
        return collapsed;
    }
    let mut preview: String = collapsed.chars().take(PREVIEW_MAX_CHARS).collect();
    preview.push('…');
    preview
}

/// Order projects newest first and assign 1-based indexes.
pub fn finalize_projects(projects: &mut [ProjectRecord]) {
    projects.sort_by(|a, b| {
        Reverse(a.created_at)
            .cmp(&Reverse(b.created_at))
            .then_with(|| a.project_id.cmp(&b.project_id))
    });
    for (i, project) in projects.iter_mut().enumerate() {
        project.index = i + 1;
    }
}

/// Order sessions by most recent update and assign 1-based indexes.
pub fn finalize_sessions(sessions: &mut [SessionRecord]) {
    sessions.sort_by(|a, b| {
        Reverse(a.updated_at)
            .cmp(&Reverse(b.updated_at))
            .then_with(|| a.session_id.cmp(&b.session_id))
    });
    for (i, session) in sessions.iter_mut().enumerate() {
        session.index = i + 1;
    }
}

/// Order messages chronologically; undated messages sort first.
pub fn sort_messages(messages: &mut [ChatMessage]) {
    messages.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.message_id.cmp(&b.message_id))
    });
}

pub(crate) fn file_stem(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(ToString::to_string)
}
