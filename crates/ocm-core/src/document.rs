//! Stored JSON payloads.
//!
//! The JSONL backend keeps one of these per file; the `SQLite` backend keeps
//! the same payload in each table's `data` column. Both map documents into
//! records through the functions here so derived fields agree.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{EntityKind, StoreError};
use crate::model::{
    ChatMessage, ChatPart, MessageRole, PartType, ProjectBucket, ProjectRecord, ProjectState,
    SessionRecord, expand_home, unix_ms_to_datetime,
};
use crate::tokens::TokenBreakdown;

/// A stored document keyed by a textual id.
pub trait Document: DeserializeOwned {
    const KIND: EntityKind;

    fn id(&self) -> &str;
}

/// Parse a payload and reject documents without an id.
pub fn parse_document<T: Document>(data: &str, locator: &str) -> Result<T, StoreError> {
    let doc: T = serde_json::from_str(data).map_err(|source| StoreError::Json {
        locator: locator.to_string(),
        source,
    })?;
    if doc.id().is_empty() {
        return Err(StoreError::Malformed {
            kind: T::KIND,
            locator: locator.to_string(),
            message: "empty id".to_string(),
        });
    }
    Ok(doc)
}

#[derive(Debug, Default, Deserialize)]
pub struct DocumentTime {
    pub created: Option<i64>,
    pub updated: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ProjectDocument {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub worktree: String,
    pub vcs: Option<String>,
    #[serde(default)]
    pub time: DocumentTime,
}

impl Document for ProjectDocument {
    const KIND: EntityKind = EntityKind::Project;

    fn id(&self) -> &str {
        &self.id
    }
}

impl ProjectDocument {
    /// Map into a record. `index` is assigned later by
    /// [`finalize_projects`](crate::model::finalize_projects).
    pub async fn into_record(
        self,
        bucket: Option<ProjectBucket>,
        file_path: String,
    ) -> ProjectRecord {
        let worktree = if self.worktree.is_empty() {
            String::new()
        } else {
            expand_home(&self.worktree).to_string_lossy().into_owned()
        };
        let state = ProjectState::of_worktree(&worktree).await;
        ProjectRecord {
            index: 0,
            project_id: self.id,
            worktree,
            vcs: self.vcs,
            state,
            created_at: self.time.created.and_then(unix_ms_to_datetime),
            bucket,
            file_path,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SessionDocument {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "projectID")]
    pub project_id: Option<String>,
    #[serde(rename = "parentID")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub directory: String,
    pub title: Option<String>,
    pub version: Option<String>,
    #[serde(default)]
    pub time: DocumentTime,
}

impl Document for SessionDocument {
    const KIND: EntityKind = EntityKind::Session;

    fn id(&self) -> &str {
        &self.id
    }
}

impl SessionDocument {
    /// Map into a record, using `fallback_project_id` when the document does
    /// not name its project.
    pub fn into_record(self, fallback_project_id: &str, file_path: String) -> SessionRecord {
        let created_at = self.time.created.and_then(unix_ms_to_datetime);
        let updated_at = self
            .time
            .updated
            .and_then(unix_ms_to_datetime)
            .or(created_at);
        SessionRecord {
            index: 0,
            session_id: self.id,
            project_id: self
                .project_id
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| fallback_project_id.to_string()),
            parent_id: self.parent_id,
            title: self.title,
            directory: self.directory,
            created_at,
            updated_at,
            file_path,
            version: self.version,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CacheDocument {
    #[serde(default)]
    pub read: u64,
    #[serde(default)]
    pub write: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenDocument {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default)]
    pub reasoning: u64,
    #[serde(default)]
    pub cache: CacheDocument,
}

impl TokenDocument {
    pub const fn breakdown(&self) -> TokenBreakdown {
        TokenBreakdown::new(
            self.input,
            self.output,
            self.reasoning,
            self.cache.read,
            self.cache.write,
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct MessageDocument {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: Option<String>,
    #[serde(rename = "parentID")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub role: MessageRole,
    #[serde(default)]
    pub time: DocumentTime,
    pub tokens: Option<TokenDocument>,
}

impl Document for MessageDocument {
    const KIND: EntityKind = EntityKind::Message;

    fn id(&self) -> &str {
        &self.id
    }
}

impl MessageDocument {
    /// Index-stage message: metadata only, no parts.
    pub fn into_message(self, fallback_session_id: &str) -> ChatMessage {
        let tokens = match self.role {
            MessageRole::Assistant => self.tokens.as_ref().map(TokenDocument::breakdown),
            MessageRole::User | MessageRole::Unknown => None,
        };
        ChatMessage {
            message_id: self.id,
            session_id: self
                .session_id
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| fallback_session_id.to_string()),
            parent_id: self.parent_id,
            role: self.role,
            created_at: self.time.created.and_then(unix_ms_to_datetime),
            tokens,
            preview_text: String::new(),
            total_chars: 0,
            parts: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ToolStateDocument {
    pub output: Option<Value>,
    pub title: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartDocument {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "messageID")]
    pub message_id: Option<String>,
    #[serde(rename = "type", default)]
    pub part_type: PartType,
    pub text: Option<String>,
    pub tool: Option<String>,
    pub state: Option<ToolStateDocument>,
    pub prompt: Option<String>,
    pub description: Option<String>,
}

impl Document for PartDocument {
    const KIND: EntityKind = EntityKind::Part;

    fn id(&self) -> &str {
        &self.id
    }
}

impl PartDocument {
    pub fn into_part(self, fallback_message_id: &str) -> ChatPart {
        let text = match self.part_type {
            PartType::Text | PartType::Unknown => self.text.unwrap_or_default(),
            PartType::Tool => self
                .state
                .as_ref()
                .and_then(|s| match &s.output {
                    Some(Value::String(out)) => Some(out.clone()),
                    _ => None,
                })
                .or_else(|| self.state.as_ref().and_then(|s| s.title.clone()))
                .unwrap_or_default(),
            PartType::Subtask => self.prompt.or(self.description).unwrap_or_default(),
        };
        ChatPart {
            part_id: self.id,
            message_id: self
                .message_id
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| fallback_message_id.to_string()),
            part_type: self.part_type,
            text,
            tool_name: self.tool,
        }
    }
}

/// Set a top-level field on an object payload.
pub(crate) fn set_field(doc: &mut Value, key: &str, value: Value) {
    if let Value::Object(map) = doc {
        map.insert(key.to_string(), value);
    }
}

/// Set `time.<key>` on an object payload, creating `time` when absent.
pub(crate) fn set_time_field(doc: &mut Value, key: &str, ms: i64) {
    if let Value::Object(map) = doc {
        let time = map
            .entry("time")
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if !time.is_object() {
            *time = Value::Object(serde_json::Map::new());
        }
        set_field(time, key, Value::from(ms));
    }
}

/// Payload edits shared by both backends' session mutations.
pub mod edit {
    use serde_json::Value;

    use super::{set_field, set_time_field};

    pub fn retitle(doc: &mut Value, title: &str, now_ms: i64) {
        set_field(doc, "title", Value::from(title));
        set_time_field(doc, "updated", now_ms);
    }

    pub fn reassign_project(doc: &mut Value, project_id: &str) {
        set_field(doc, "projectID", Value::from(project_id));
    }

    pub fn rekey_session(doc: &mut Value, session_id: &str, project_id: &str, now_ms: i64) {
        set_field(doc, "id", Value::from(session_id));
        reassign_project(doc, project_id);
        set_time_field(doc, "created", now_ms);
        set_time_field(doc, "updated", now_ms);
    }

    pub fn rekey_message(doc: &mut Value, message_id: &str, session_id: &str) {
        set_field(doc, "id", Value::from(message_id));
        set_field(doc, "sessionID", Value::from(session_id));
    }

    pub fn rekey_part(doc: &mut Value, part_id: &str, message_id: &str, session_id: &str) {
        set_field(doc, "id", Value::from(part_id));
        set_field(doc, "messageID", Value::from(message_id));
        set_field(doc, "sessionID", Value::from(session_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_rejects_empty_id() {
        let result = parse_document::<SessionDocument>(r#"{"title":"x"}"#, "ses.json");
        assert!(matches!(
            result,
            Err(StoreError::Malformed {
                kind: EntityKind::Session,
                ..
            })
        ));
    }

    #[test]
    fn parse_reports_invalid_json() {
        let result = parse_document::<ProjectDocument>("not json", "p.json");
        assert!(matches!(result, Err(StoreError::Json { .. })));
    }

    #[test]
    fn session_updated_falls_back_to_created() {
        let doc: SessionDocument = serde_json::from_value(json!({
            "id": "ses_1",
            "directory": "/repo",
            "time": { "created": 1_700_000_000_000i64 }
        }))
        .unwrap();
        let record = doc.into_record("proj_dir", "f".to_string());
        assert_eq!(record.project_id, "proj_dir");
        assert_eq!(record.updated_at, record.created_at);
        assert!(record.created_at.is_some());
    }

    #[test]
    fn tokens_only_kept_for_assistant_messages() {
        let doc: MessageDocument = serde_json::from_value(json!({
            "id": "msg_1",
            "sessionID": "ses_1",
            "role": "user",
            "time": { "created": 1 },
            "tokens": { "input": 5, "output": 5, "reasoning": 0, "cache": { "read": 0, "write": 0 } }
        }))
        .unwrap();
        assert!(doc.into_message("ses_1").tokens.is_none());

        let doc: MessageDocument = serde_json::from_value(json!({
            "id": "msg_2",
            "role": "assistant",
            "tokens": { "input": 150, "output": 75, "reasoning": 10, "cache": { "read": 50, "write": 25 } }
        }))
        .unwrap();
        let message = doc.into_message("ses_1");
        assert_eq!(message.session_id, "ses_1");
        assert_eq!(message.tokens.map(|t| t.total), Some(310));
    }

    #[test]
    fn unknown_role_deserializes() {
        let doc: MessageDocument =
            serde_json::from_value(json!({ "id": "msg_1", "role": "system" })).unwrap();
        assert_eq!(doc.role, MessageRole::Unknown);
    }

    #[test]
    fn part_text_per_variant() {
        let tool: PartDocument = serde_json::from_value(json!({
            "id": "prt_1",
            "type": "tool",
            "tool": "bash",
            "state": { "status": "completed", "output": "cargo test passed", "title": "run" }
        }))
        .unwrap();
        let part = tool.into_part("msg_1");
        assert_eq!(part.text, "cargo test passed");
        assert_eq!(part.tool_name.as_deref(), Some("bash"));

        let pending: PartDocument = serde_json::from_value(json!({
            "id": "prt_2",
            "type": "tool",
            "tool": "read",
            "state": { "status": "running", "title": "reading lib.rs" }
        }))
        .unwrap();
        assert_eq!(pending.into_part("msg_1").text, "reading lib.rs");

        let subtask: PartDocument = serde_json::from_value(json!({
            "id": "prt_3",
            "type": "subtask",
            "description": "explore the parser"
        }))
        .unwrap();
        assert_eq!(subtask.into_part("msg_1").text, "explore the parser");

        let other: PartDocument =
            serde_json::from_value(json!({ "id": "prt_4", "type": "step-start" })).unwrap();
        let part = other.into_part("msg_1");
        assert_eq!(part.part_type, PartType::Unknown);
        assert!(part.text.is_empty());
    }

    #[test]
    fn retitle_preserves_unknown_fields() {
        let mut doc = json!({ "id": "ses_1", "extra": [1, 2], "time": { "created": 5 } });
        edit::retitle(&mut doc, "New title", 10);
        assert_eq!(doc["title"], "New title");
        assert_eq!(doc["time"]["created"], 5);
        assert_eq!(doc["time"]["updated"], 10);
        assert_eq!(doc["extra"], json!([1, 2]));
    }
}
