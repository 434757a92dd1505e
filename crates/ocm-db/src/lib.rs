//! `SQLite` storage backend for `OpenCode` metadata.
//!
//! # Thread Safety
//!
//! `rusqlite::Connection` is `Send` but not `Sync`. [`SqliteBackend`] keeps
//! its connection behind a `Mutex` so a single backend can sit behind the
//! provider façade and be shared freely. Every query runs synchronously
//! while the lock is held; the lock is never held across an `.await`.
//!
//! # Schema
//!
//! Each table keeps the full document in a `data` column (the same JSON the
//! file-tree backend stores per file) and promotes the fields used for
//! filtering and ordering into their own columns:
//!
//! - `project(id, data)`
//! - `session(id, project_id, parent_id, created_at, updated_at, data)`
//! - `message(id, session_id, created_at, data)`
//! - `part(id, message_id, session_id, data)`
//!
//! Timestamps are Unix milliseconds, as in the documents.
//!
//! Records loaded from this backend carry a virtual `file_path` of the form
//! `sqlite:<entity>:<id>` since there is no per-record file.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use ocm_core::backend::{
    BackendKind, DeleteOptions, ReadPolicy, SearchOptions, SessionFilter, StorageBackend,
};
use ocm_core::document::{
    Document, MessageDocument, PartDocument, ProjectDocument, SessionDocument, edit,
};
use ocm_core::model::{
    ChatMessage, ChatPart, DeleteResult, IdSequence, ProjectRecord, SessionRecord, expand_home,
    finalize_projects, finalize_sessions, now_ms, sort_messages, sqlite_locator,
};
use ocm_core::search::{self, ChatSearchResult, MessageContext};
use ocm_core::{EntityKind, StoreError};
use rusqlite::{Connection, OpenFlags, OptionalExtension, TransactionBehavior, params};
use serde_json::Value;
use thiserror::Error;

/// Busy timeout applied when writes should wait for another process's lock.
pub const FORCE_WRITE_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// The database file does not exist.
    #[error("database not found: {}", .0.display())]
    MissingDatabase(PathBuf),
    /// The file exists but cannot be opened as a database.
    #[error("cannot open database {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    /// A payload being written lacks a field that is promoted to a column.
    #[error("{entity} payload is missing required field '{field}'")]
    MissingField {
        entity: EntityKind,
        field: &'static str,
    },
    /// Another thread panicked while holding the connection.
    #[error("database connection lock poisoned")]
    LockPoisoned,
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::MissingDatabase(_) | DbError::Unreadable { .. } => {
                Self::Config(err.to_string())
            }
            other => Self::Backend(Box::new(other)),
        }
    }
}

/// Backend over an `OpenCode` `SQLite` database.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
    policy: ReadPolicy,
}

/// A stored row: its id, JSON payload and owning id (project, session or
/// message, depending on the table).
#[derive(Debug)]
struct StoredRow {
    id: String,
    data: String,
    owner: Option<String>,
}

/// Message/part pairs for one message, in part order.
#[derive(Debug)]
struct MessageRows {
    message: StoredRow,
    parts: Vec<StoredRow>,
}

impl SqliteBackend {
    /// Opens an existing database.
    ///
    /// A missing or unreadable file fails with [`DbError::MissingDatabase`]
    /// or [`DbError::Unreadable`]. With `force_write`, statements wait up to
    /// [`FORCE_WRITE_BUSY_TIMEOUT`] for another process's lock instead of
    /// failing immediately.
    pub fn open(
        path: impl AsRef<Path>,
        policy: ReadPolicy,
        force_write: bool,
    ) -> Result<Self, DbError> {
        let path = expand_home(&path.as_ref().to_string_lossy());
        if !path.is_file() {
            return Err(DbError::MissingDatabase(path));
        }
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|source| DbError::Unreadable {
            path: path.clone(),
            source,
        })?;
        set_busy_timeout(&conn, force_write)?;
        // Opening is lazy; the first read is what rejects non-database files.
        conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| {
            row.get::<_, i64>(0)
        })
        .map_err(|source| {
            if is_lock_contention(&source) {
                DbError::Sqlite(source)
            } else {
                DbError::Unreadable {
                    path: path.clone(),
                    source,
                }
            }
        })?;
        tracing::debug!(path = ?path, force_write, "opened sqlite database");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
            policy,
        })
    }

    /// Creates (or opens) a database file and initializes the schema.
    pub fn create(
        path: impl AsRef<Path>,
        policy: ReadPolicy,
        force_write: bool,
    ) -> Result<Self, DbError> {
        let path = expand_home(&path.as_ref().to_string_lossy());
        let conn = Connection::open(&path)?;
        set_busy_timeout(&conn, force_write)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
            policy,
        })
    }

    /// Opens an in-memory database with the schema applied.
    ///
    /// Useful for testing. The database is destroyed when the backend drops.
    pub fn open_in_memory(policy: ReadPolicy) -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
            policy,
        })
    }

    /// Database file path; `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Inserts or replaces a project document.
    pub fn put_project(&self, doc: &Value) -> Result<(), DbError> {
        let conn = self.lock()?;
        insert_project(&conn, doc)
    }

    /// Inserts or replaces a session document.
    pub fn put_session(&self, doc: &Value) -> Result<(), DbError> {
        let conn = self.lock()?;
        insert_session(&conn, doc)
    }

    /// Inserts or replaces a message document.
    pub fn put_message(&self, doc: &Value) -> Result<(), DbError> {
        let conn = self.lock()?;
        insert_message(&conn, doc)
    }

    /// Inserts or replaces a part document. `session_id` is taken from the
    /// payload's `sessionID`, else from the owning message row.
    pub fn put_part(&self, doc: &Value) -> Result<(), DbError> {
        let conn = self.lock()?;
        let message_id = required_str(doc, EntityKind::Part, "messageID")?;
        let session_id = match doc.get("sessionID").and_then(Value::as_str) {
            Some(session_id) => session_id.to_string(),
            None => conn
                .query_row(
                    "SELECT session_id FROM message WHERE id = ?1",
                    [message_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or(DbError::MissingField {
                    entity: EntityKind::Part,
                    field: "sessionID",
                })?,
        };
        insert_part(&conn, doc, &session_id)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    fn fetch(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<StoredRow>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, |row| {
                Ok(StoredRow {
                    id: row.get(0)?,
                    data: row.get(1)?,
                    owner: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Parse rows, skipping or raising on malformed payloads per the policy.
    fn decode<T: Document>(&self, rows: Vec<StoredRow>) -> Result<Vec<(T, StoredRow)>, StoreError> {
        let mut docs = Vec::with_capacity(rows.len());
        for row in rows {
            match parse_row::<T>(&row.id, &row.data) {
                Ok(doc) => docs.push((doc, row)),
                Err(err) => self.policy.tolerate(err)?,
            }
        }
        Ok(docs)
    }

    fn session_row(&self, session_id: &str) -> Result<Option<StoredRow>, DbError> {
        Ok(self
            .fetch(
                "SELECT id, data, project_id FROM session WHERE id = ?1",
                [session_id],
            )?
            .into_iter()
            .next())
    }

    fn load_session_payload(&self, session_id: &str) -> Result<Value, StoreError> {
        let row = self.session_row(session_id)?.ok_or_else(|| StoreError::NotFound {
            kind: EntityKind::Session,
            id: session_id.to_string(),
        })?;
        parse_value(EntityKind::Session, &row.id, &row.data)
    }

    fn delete_session_cascade(&self, session_id: &str) -> Result<usize, DbError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM part WHERE session_id = ?1
                OR message_id IN (SELECT id FROM message WHERE session_id = ?1)",
            [session_id],
        )?;
        tx.execute("DELETE FROM message WHERE session_id = ?1", [session_id])?;
        let removed = tx.execute("DELETE FROM session WHERE id = ?1", [session_id])?;
        if removed == 0 {
            // Nothing to cascade from; leave any stray children alone.
            tx.rollback()?;
        } else {
            tx.commit()?;
        }
        Ok(removed)
    }

    fn copy_session_rows(
        &self,
        mut doc: Value,
        source_session_id: &str,
        target_project_id: &str,
    ) -> Result<Value, StoreError> {
        let session_id = IdSequence::new("ses").next_id();
        edit::rekey_session(&mut doc, &session_id, target_project_id, now_ms());

        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DbError::from)?;
        let messages = query_rows(
            &tx,
            "SELECT id, data, session_id FROM message WHERE session_id = ?1 ORDER BY id",
            [source_session_id],
        )?;

        let mut message_ids = IdSequence::new("msg");
        for row in messages {
            let mut message = match parse_value(EntityKind::Message, &row.id, &row.data) {
                Ok(message) => message,
                Err(err) => {
                    self.policy.tolerate(err)?;
                    continue;
                }
            };
            let message_id = message_ids.next_id();
            edit::rekey_message(&mut message, &message_id, &session_id);
            insert_message(&tx, &message)?;

            let parts = query_rows(
                &tx,
                "SELECT id, data, message_id FROM part WHERE message_id = ?1 ORDER BY id",
                [&row.id],
            )?;
            let mut part_ids = IdSequence::new("prt");
            for part_row in parts {
                let mut part = match parse_value(EntityKind::Part, &part_row.id, &part_row.data) {
                    Ok(part) => part,
                    Err(err) => {
                        self.policy.tolerate(err)?;
                        continue;
                    }
                };
                let part_id = part_ids.next_id();
                edit::rekey_part(&mut part, &part_id, &message_id, &session_id);
                insert_part(&tx, &part, &session_id)?;
            }
        }

        insert_session(&tx, &doc)?;
        tx.commit().map_err(DbError::from)?;
        Ok(doc)
    }

    /// Message/part rows of a session in search order.
    fn search_rows(&self, session_id: &str) -> Result<Vec<MessageRows>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "
            SELECT m.id, m.data, p.id, p.data
            FROM message m
            JOIN part p ON p.message_id = m.id
            WHERE m.session_id = ?1
            ORDER BY m.created_at ASC, m.id ASC, p.id ASC
            ",
        )?;
        let mut rows = stmt.query([session_id])?;
        let mut grouped: Vec<MessageRows> = Vec::new();
        while let Some(row) = rows.next()? {
            let message_id: String = row.get(0)?;
            let part = StoredRow {
                id: row.get(2)?,
                data: row.get(3)?,
                owner: Some(message_id.clone()),
            };
            match grouped.last_mut() {
                Some(group) if group.message.id == message_id => group.parts.push(part),
                _ => grouped.push(MessageRows {
                    message: StoredRow {
                        id: message_id,
                        data: row.get(1)?,
                        owner: Some(session_id.to_string()),
                    },
                    parts: vec![part],
                }),
            }
        }
        Ok(grouped)
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn load_project_records(&self) -> Result<Vec<ProjectRecord>, StoreError> {
        let rows = self.fetch("SELECT id, data, NULL FROM project", [])?;
        let docs = self.decode::<ProjectDocument>(rows)?;
        let mut records = Vec::with_capacity(docs.len());
        for (doc, row) in docs {
            records.push(
                doc.into_record(None, sqlite_locator(EntityKind::Project, &row.id))
                    .await,
            );
        }
        finalize_projects(&mut records);
        tracing::debug!(count = records.len(), "loaded project records");
        Ok(records)
    }

    async fn load_session_records(
        &self,
        filter: &SessionFilter,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        let rows = match &filter.project_id {
            Some(project_id) => self.fetch(
                "SELECT id, data, project_id FROM session WHERE project_id = ?1",
                [project_id],
            )?,
            None => self.fetch("SELECT id, data, project_id FROM session", [])?,
        };
        let mut records: Vec<SessionRecord> = self
            .decode::<SessionDocument>(rows)?
            .into_iter()
            .map(|(doc, row)| {
                doc.into_record(
                    row.owner.as_deref().unwrap_or_default(),
                    sqlite_locator(EntityKind::Session, &row.id),
                )
            })
            .collect();
        finalize_sessions(&mut records);
        tracing::debug!(count = records.len(), filter = ?filter.project_id, "loaded session records");
        Ok(records)
    }

    async fn load_session_chat_index(
        &self,
        session_id: &str,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let rows = self.fetch(
            "SELECT id, data, session_id FROM message WHERE session_id = ?1
             ORDER BY created_at ASC, id ASC",
            [session_id],
        )?;
        let mut messages: Vec<ChatMessage> = self
            .decode::<MessageDocument>(rows)?
            .into_iter()
            .map(|(doc, _)| doc.into_message(session_id))
            .collect();
        sort_messages(&mut messages);
        Ok(messages)
    }

    async fn load_message_parts(&self, message_id: &str) -> Result<Vec<ChatPart>, StoreError> {
        let rows = self.fetch(
            "SELECT id, data, message_id FROM part WHERE message_id = ?1 ORDER BY id ASC",
            [message_id],
        )?;
        Ok(self
            .decode::<PartDocument>(rows)?
            .into_iter()
            .map(|(doc, _)| doc.into_part(message_id))
            .collect())
    }

    async fn delete_project_metadata(
        &self,
        records: &[ProjectRecord],
        options: DeleteOptions,
    ) -> DeleteResult {
        let mut result = DeleteResult::default();
        for record in records {
            if options.dry_run {
                result.removed.push(record.file_path.clone());
                continue;
            }
            let outcome = self.lock().and_then(|conn| {
                conn.execute("DELETE FROM project WHERE id = ?1", [&record.project_id])
                    .map_err(DbError::from)
            });
            match outcome {
                Ok(0) => result.record_failure(
                    &record.file_path,
                    format!("project not found: {}", record.project_id),
                ),
                Ok(_) => {
                    tracing::debug!(project_id = %record.project_id, "deleted project");
                    result.removed.push(record.file_path.clone());
                }
                Err(err) => {
                    tracing::warn!(project_id = %record.project_id, error = %err, "failed to delete project");
                    result.record_failure(&record.file_path, err);
                }
            }
        }
        result
    }

    async fn delete_session_metadata(
        &self,
        records: &[SessionRecord],
        options: DeleteOptions,
    ) -> DeleteResult {
        let mut result = DeleteResult::default();
        for record in records {
            if options.dry_run {
                result.removed.push(record.file_path.clone());
                continue;
            }
            match self.delete_session_cascade(&record.session_id) {
                Ok(0) => result.record_failure(
                    &record.file_path,
                    format!("session not found: {}", record.session_id),
                ),
                Ok(_) => {
                    tracing::debug!(session_id = %record.session_id, "deleted session");
                    result.removed.push(record.file_path.clone());
                }
                Err(err) => {
                    tracing::warn!(session_id = %record.session_id, error = %err, "failed to delete session");
                    result.record_failure(&record.file_path, err);
                }
            }
        }
        result
    }

    async fn update_session_title(
        &self,
        session: &SessionRecord,
        title: &str,
    ) -> Result<(), StoreError> {
        let mut doc = self.load_session_payload(&session.session_id)?;
        let now = now_ms();
        edit::retitle(&mut doc, title, now);
        self.lock()?
            .execute(
                "UPDATE session SET data = ?1, updated_at = ?2 WHERE id = ?3",
                params![doc.to_string(), now, session.session_id],
            )
            .map_err(DbError::from)?;
        tracing::debug!(session_id = %session.session_id, "updated session title");
        Ok(())
    }

    async fn move_session(
        &self,
        session: &SessionRecord,
        target_project_id: &str,
    ) -> Result<SessionRecord, StoreError> {
        if session.project_id == target_project_id {
            return Ok(session.clone());
        }
        let mut doc = self.load_session_payload(&session.session_id)?;
        edit::reassign_project(&mut doc, target_project_id);
        self.lock()?
            .execute(
                "UPDATE session SET project_id = ?1, data = ?2 WHERE id = ?3",
                params![target_project_id, doc.to_string(), session.session_id],
            )
            .map_err(DbError::from)?;

        let mut record = session_record(doc, target_project_id)?;
        record.index = session.index;
        tracing::debug!(session_id = %session.session_id, from = %session.project_id, to = %target_project_id, "moved session");
        Ok(record)
    }

    async fn copy_session(
        &self,
        session: &SessionRecord,
        target_project_id: &str,
    ) -> Result<SessionRecord, StoreError> {
        let doc = self.load_session_payload(&session.session_id)?;
        let copy = self.copy_session_rows(doc, &session.session_id, target_project_id)?;
        let record = session_record(copy, target_project_id)?;
        tracing::debug!(source = %session.session_id, copy = %record.session_id, "copied session");
        Ok(record)
    }

    async fn search_sessions_chat(
        &self,
        sessions: &[SessionRecord],
        query: &str,
        options: SearchOptions,
    ) -> Result<Vec<ChatSearchResult>, StoreError> {
        let mut results = Vec::new();
        let Some(needle) = search::normalize_query(query) else {
            return Ok(results);
        };
        if options.max_results == 0 {
            return Ok(results);
        }

        for session in sessions {
            for group in self.search_rows(&session.session_id)? {
                let message = match parse_row::<MessageDocument>(&group.message.id, &group.message.data)
                {
                    Ok(doc) => doc.into_message(&session.session_id),
                    Err(err) => {
                        self.policy.tolerate(err)?;
                        continue;
                    }
                };
                let parts: Vec<ChatPart> = self
                    .decode::<PartDocument>(group.parts)?
                    .into_iter()
                    .map(|(doc, _)| doc.into_part(&message.message_id))
                    .collect();
                let context = MessageContext {
                    message_id: &message.message_id,
                    role: message.role,
                    created_at: message.created_at,
                };
                if let Some(hit) = parts
                    .iter()
                    .find_map(|part| search::match_part(session, context, part, &needle))
                {
                    results.push(hit);
                    if results.len() >= options.max_results {
                        return Ok(results);
                    }
                }
            }
        }
        tracing::debug!(query = %needle, hits = results.len(), "chat search finished");
        Ok(results)
    }
}

/// Initializes the database schema.
///
/// This is idempotent - safe to call on an already-initialized database.
fn init_schema(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS project (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL
        );

        -- created_at/updated_at: Unix milliseconds copied from data.time
        CREATE TABLE IF NOT EXISTS session (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            parent_id TEXT,
            created_at INTEGER,
            updated_at INTEGER,
            data TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_session_project ON session(project_id);
        CREATE INDEX IF NOT EXISTS idx_session_parent ON session(parent_id);
        CREATE INDEX IF NOT EXISTS idx_session_updated ON session(updated_at);

        CREATE TABLE IF NOT EXISTS message (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            created_at INTEGER,
            data TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_message_session ON message(session_id, created_at);

        CREATE TABLE IF NOT EXISTS part (
            id TEXT PRIMARY KEY,
            message_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            data TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_part_message ON part(message_id);
        CREATE INDEX IF NOT EXISTS idx_part_session ON part(session_id);
        ",
    )?;
    Ok(())
}

fn set_busy_timeout(conn: &Connection, force_write: bool) -> Result<(), DbError> {
    let timeout = if force_write {
        FORCE_WRITE_BUSY_TIMEOUT
    } else {
        Duration::ZERO
    };
    conn.busy_timeout(timeout)?;
    Ok(())
}

/// Another connection holds a conflicting lock.
fn is_lock_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

fn query_rows(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<StoredRow>, DbError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok(StoredRow {
                id: row.get(0)?,
                data: row.get(1)?,
                owner: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn insert_project(conn: &Connection, doc: &Value) -> Result<(), DbError> {
    let id = required_str(doc, EntityKind::Project, "id")?;
    conn.execute(
        "INSERT OR REPLACE INTO project (id, data) VALUES (?1, ?2)",
        params![id, doc.to_string()],
    )?;
    Ok(())
}

fn insert_session(conn: &Connection, doc: &Value) -> Result<(), DbError> {
    let id = required_str(doc, EntityKind::Session, "id")?;
    let project_id = required_str(doc, EntityKind::Session, "projectID")?;
    let created = time_field(doc, "created");
    conn.execute(
        "INSERT OR REPLACE INTO session (id, project_id, parent_id, created_at, updated_at, data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id,
            project_id,
            doc.get("parentID").and_then(Value::as_str),
            created,
            time_field(doc, "updated").or(created),
            doc.to_string()
        ],
    )?;
    Ok(())
}

fn insert_message(conn: &Connection, doc: &Value) -> Result<(), DbError> {
    let id = required_str(doc, EntityKind::Message, "id")?;
    let session_id = required_str(doc, EntityKind::Message, "sessionID")?;
    conn.execute(
        "INSERT OR REPLACE INTO message (id, session_id, created_at, data) VALUES (?1, ?2, ?3, ?4)",
        params![id, session_id, time_field(doc, "created"), doc.to_string()],
    )?;
    Ok(())
}

fn insert_part(conn: &Connection, doc: &Value, session_id: &str) -> Result<(), DbError> {
    let id = required_str(doc, EntityKind::Part, "id")?;
    let message_id = required_str(doc, EntityKind::Part, "messageID")?;
    conn.execute(
        "INSERT OR REPLACE INTO part (id, message_id, session_id, data) VALUES (?1, ?2, ?3, ?4)",
        params![id, message_id, session_id, doc.to_string()],
    )?;
    Ok(())
}

fn required_str<'a>(
    doc: &'a Value,
    entity: EntityKind,
    field: &'static str,
) -> Result<&'a str, DbError> {
    doc.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(DbError::MissingField { entity, field })
}

fn time_field(doc: &Value, key: &str) -> Option<i64> {
    doc.get("time")?.get(key)?.as_i64()
}

/// Parse a payload into a JSON object; the row id fills in a missing `id`.
fn parse_value(kind: EntityKind, id: &str, data: &str) -> Result<Value, StoreError> {
    let locator = sqlite_locator(kind, id);
    let mut value: Value = serde_json::from_str(data).map_err(|source| StoreError::Json {
        locator: locator.clone(),
        source,
    })?;
    let Value::Object(map) = &mut value else {
        return Err(StoreError::Malformed {
            kind,
            locator,
            message: "payload is not a JSON object".to_string(),
        });
    };
    map.entry("id").or_insert_with(|| Value::from(id));
    Ok(value)
}

fn parse_row<T: Document>(id: &str, data: &str) -> Result<T, StoreError> {
    let value = parse_value(T::KIND, id, data)?;
    serde_json::from_value(value).map_err(|source| StoreError::Json {
        locator: sqlite_locator(T::KIND, id),
        source,
    })
}

fn session_record(doc: Value, project_id: &str) -> Result<SessionRecord, StoreError> {
    let id = doc
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let locator = sqlite_locator(EntityKind::Session, &id);
    let parsed: SessionDocument =
        serde_json::from_value(doc).map_err(|source| StoreError::Json {
            locator: locator.clone(),
            source,
        })?;
    Ok(parsed.into_record(project_id, locator))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocm_core::tokens::{TokenBreakdown, TokenSummary, UnknownReason};
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Instant;
    use tempfile::TempDir;

    fn backend() -> SqliteBackend {
        SqliteBackend::open_in_memory(ReadPolicy::lenient()).expect("open in-memory db")
    }

    fn tokens(input: u64, output: u64, reasoning: u64, read: u64, write: u64) -> Value {
        json!({
            "input": input,
            "output": output,
            "reasoning": reasoning,
            "cache": { "read": read, "write": write }
        })
    }

    fn seed(db: &SqliteBackend) {
        db.put_project(&json!({
            "id": "proj_main",
            "worktree": "/nonexistent/main",
            "vcs": "git",
            "time": { "created": 1_000 }
        }))
        .unwrap();
        db.put_session(&json!({
            "id": "session_add_tests",
            "projectID": "proj_main",
            "directory": "/nonexistent/main",
            "title": "Add tests",
            "version": "0.15.0",
            "time": { "created": 2_000, "updated": 5_000 }
        }))
        .unwrap();
        db.put_session(&json!({
            "id": "session_parser_fix",
            "projectID": "proj_main",
            "directory": "/nonexistent/main",
            "title": "Fix parser",
            "version": "0.15.0",
            "time": { "created": 3_000 }
        }))
        .unwrap();
        for (id, role, created, usage) in [
            ("msg_1", "user", 2_100, None),
            ("msg_2", "assistant", 2_200, Some(tokens(100, 50, 10, 30, 20))),
            ("msg_3", "assistant", 2_300, Some(tokens(50, 25, 0, 20, 5))),
        ] {
            let mut doc = json!({
                "id": id,
                "sessionID": "session_add_tests",
                "role": role,
                "time": { "created": created }
            });
            if let Some(usage) = usage {
                doc["tokens"] = usage;
            }
            db.put_message(&doc).unwrap();
        }
        db.put_part(&json!({
            "id": "prt_1",
            "messageID": "msg_1",
            "type": "text",
            "text": "please add tests"
        }))
        .unwrap();
        db.put_part(&json!({
            "id": "prt_2",
            "messageID": "msg_2",
            "sessionID": "session_add_tests",
            "type": "text",
            "text": "Added tests for the tokenizer"
        }))
        .unwrap();
    }

    fn count(db: &SqliteBackend, table: &str) -> i64 {
        db.lock()
            .unwrap()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }

    fn table_columns(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({table})"))
            .expect("prepare table_info");
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .expect("query table_info");
        rows.map(|row| row.expect("table_info row")).collect()
    }

    fn index_names(conn: &Connection, table: &str) -> HashSet<String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA index_list({table})"))
            .expect("prepare index_list");
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .expect("query index_list");
        rows.map(|row| row.expect("index_list row")).collect()
    }

    #[test]
    fn schema_matches_data_model() {
        let db = backend();
        let conn = db.lock().unwrap();

        assert_eq!(table_columns(&conn, "project"), vec!["id", "data"]);
        assert_eq!(
            table_columns(&conn, "session"),
            vec!["id", "project_id", "parent_id", "created_at", "updated_at", "data"]
        );
        assert_eq!(
            table_columns(&conn, "message"),
            vec!["id", "session_id", "created_at", "data"]
        );
        assert_eq!(
            table_columns(&conn, "part"),
            vec!["id", "message_id", "session_id", "data"]
        );

        let session_indexes = index_names(&conn, "session");
        for name in ["idx_session_project", "idx_session_parent", "idx_session_updated"] {
            assert!(session_indexes.contains(name), "missing {name}");
        }
        assert!(index_names(&conn, "message").contains("idx_message_session"));
        assert!(index_names(&conn, "part").contains("idx_part_message"));
    }

    #[test]
    fn open_missing_file_is_config_error() {
        let temp = TempDir::new().unwrap();
        let Err(err) = SqliteBackend::open(temp.path().join("nope.db"), ReadPolicy::lenient(), false)
        else {
            panic!("expected missing database error");
        };
        assert!(matches!(err, DbError::MissingDatabase(_)));
        assert!(matches!(StoreError::from(err), StoreError::Config(_)));
    }

    #[test]
    fn open_non_database_file_is_config_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("garbage.db");
        std::fs::write(&path, "this is not a sqlite database\n".repeat(200)).unwrap();
        let Err(err) = SqliteBackend::open(&path, ReadPolicy::lenient(), false) else {
            panic!("expected unreadable database error");
        };
        assert!(matches!(err, DbError::Unreadable { .. }));
        assert!(matches!(StoreError::from(err), StoreError::Config(_)));
    }

    #[tokio::test]
    async fn create_then_open_round_trips() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("opencode.db");
        {
            let db = SqliteBackend::create(&path, ReadPolicy::lenient(), false).unwrap();
            seed(&db);
        }
        let db = SqliteBackend::open(&path, ReadPolicy::lenient(), true).unwrap();
        assert_eq!(db.path(), Some(path.as_path()));
        let projects = db.load_project_records().await.unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].file_path, "sqlite:project:proj_main");
        assert_eq!(projects[0].bucket, None);
    }

    fn seeded_file(temp: &TempDir) -> PathBuf {
        let path = temp.path().join("opencode.db");
        let db = SqliteBackend::create(&path, ReadPolicy::lenient(), false).unwrap();
        seed(&db);
        path
    }

    #[test]
    fn open_under_exclusive_lock_fails_fast_as_backend_error() {
        let temp = TempDir::new().unwrap();
        let path = seeded_file(&temp);
        let blocker = Connection::open(&path).unwrap();
        blocker.execute_batch("BEGIN EXCLUSIVE").unwrap();

        let started = Instant::now();
        let Err(err) = SqliteBackend::open(&path, ReadPolicy::lenient(), false) else {
            panic!("expected lock contention");
        };
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(err, DbError::Sqlite(_)));
        assert!(matches!(StoreError::from(err), StoreError::Backend(_)));

        blocker.execute_batch("ROLLBACK").unwrap();
        assert!(SqliteBackend::open(&path, ReadPolicy::lenient(), false).is_ok());
    }

    #[tokio::test]
    async fn locked_write_waits_only_with_force_write() {
        let temp = TempDir::new().unwrap();
        let path = seeded_file(&temp);
        let plain = SqliteBackend::open(&path, ReadPolicy::lenient(), false).unwrap();
        let forced = SqliteBackend::open(&path, ReadPolicy::lenient(), true).unwrap();
        let session = plain
            .load_session_records(&SessionFilter::default())
            .await
            .unwrap()
            .remove(0);

        let blocker = Connection::open(&path).unwrap();
        blocker.execute_batch("BEGIN IMMEDIATE").unwrap();

        let started = Instant::now();
        let err = plain.update_session_title(&session, "x").await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(err, StoreError::Backend(_)));

        let started = Instant::now();
        let err = forced.update_session_title(&session, "x").await.unwrap_err();
        assert!(started.elapsed() >= FORCE_WRITE_BUSY_TIMEOUT - Duration::from_millis(500));
        assert!(matches!(err, StoreError::Backend(_)));

        blocker.execute_batch("ROLLBACK").unwrap();
        forced.update_session_title(&session, "Renamed").await.unwrap();
        let renamed = plain
            .load_session_records(&SessionFilter::default())
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.session_id == session.session_id)
            .unwrap();
        assert_eq!(renamed.title.as_deref(), Some("Renamed"));
    }

    #[tokio::test]
    async fn schema_invalid_message_is_skipped_or_parse_error() {
        let bad = json!({
            "id": "msg_bad",
            "sessionID": "session_add_tests",
            "role": "assistant",
            "time": "bad",
            "tokens": tokens(7, 0, 0, 0, 0)
        });
        let lenient = backend();
        let strict = SqliteBackend::open_in_memory(ReadPolicy::strict()).unwrap();
        for db in [&lenient, &strict] {
            seed(db);
            db.put_message(&bad).unwrap();
        }
        let session = lenient
            .load_session_records(&SessionFilter::default())
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.session_id == "session_add_tests")
            .unwrap();

        assert_eq!(lenient.load_session_chat_index("session_add_tests").await.unwrap().len(), 3);
        assert_eq!(
            lenient.compute_session_token_summary(&session).await,
            TokenSummary::known(TokenBreakdown::new(150, 75, 10, 50, 25))
        );
        assert_eq!(
            strict.compute_session_token_summary(&session).await,
            TokenSummary::unknown(UnknownReason::ParseError)
        );
    }

    #[tokio::test]
    async fn sessions_ordered_and_filtered() {
        let db = backend();
        seed(&db);
        db.put_session(&json!({
            "id": "ses_other",
            "projectID": "proj_other",
            "parentID": "session_add_tests",
            "directory": "/x",
            "time": { "created": 9_000 }
        }))
        .unwrap();

        let all = db.load_session_records(&SessionFilter::default()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["ses_other", "session_add_tests", "session_parser_fix"]);
        assert_eq!(all[0].parent_id.as_deref(), Some("session_add_tests"));
        assert_eq!(all[2].file_path, "sqlite:session:session_parser_fix");

        let main = db
            .load_session_records(&SessionFilter::project("proj_main"))
            .await
            .unwrap();
        assert_eq!(main.len(), 2);
        assert_eq!(main[0].index, 1);
    }

    #[tokio::test]
    async fn malformed_rows_skipped_unless_strict() {
        let warnings = Arc::new(StdMutex::new(Vec::<String>::new()));
        let captured = Arc::clone(&warnings);
        let sink: ocm_core::WarningSink =
            Arc::new(move |msg: &str| captured.lock().unwrap().push(msg.to_string()));
        let lenient = SqliteBackend::open_in_memory(ReadPolicy::lenient().with_sink(Some(sink)))
            .unwrap();
        let strict = SqliteBackend::open_in_memory(ReadPolicy::strict()).unwrap();
        for db in [&lenient, &strict] {
            seed(db);
            db.lock()
                .unwrap()
                .execute(
                    "INSERT INTO session (id, project_id, data) VALUES ('ses_bad', 'proj_main', '{oops')",
                    [],
                )
                .unwrap();
        }

        let sessions = lenient
            .load_session_records(&SessionFilter::default())
            .await
            .unwrap();
        assert_eq!(sessions.len(), 2);
        let warnings = warnings.lock().unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("sqlite:session:ses_bad"));

        let err = strict
            .load_session_records(&SessionFilter::default())
            .await
            .unwrap_err();
        assert!(err.is_malformed_data());
    }

    #[tokio::test]
    async fn chat_index_and_hydration() {
        let db = backend();
        seed(&db);
        let messages = db.load_session_chat_index("session_add_tests").await.unwrap();
        let ids: Vec<_> = messages.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec!["msg_1", "msg_2", "msg_3"]);
        assert!(messages[0].preview_text.is_empty());

        let hydrated = db.hydrate_chat_message_parts(messages[1].clone()).await.unwrap();
        assert_eq!(hydrated.preview_text, "Added tests for the tokenizer");
        let empty = db.hydrate_chat_message_parts(messages[2].clone()).await.unwrap();
        assert_eq!(empty.preview_text, "[no content]");
    }

    #[tokio::test]
    async fn session_delete_cascades_and_reports_missing() {
        let db = backend();
        seed(&db);
        let mut sessions = db.load_session_records(&SessionFilter::default()).await.unwrap();
        let mut ghost = sessions[0].clone();
        ghost.session_id = "ses_ghost".to_string();
        ghost.file_path = "sqlite:session:ses_ghost".to_string();
        sessions.push(ghost);

        let dry = db
            .delete_session_metadata(&sessions, DeleteOptions { dry_run: true })
            .await;
        assert_eq!(dry.removed.len(), 3);
        assert_eq!(count(&db, "session"), 2);

        let result = db
            .delete_session_metadata(&sessions, DeleteOptions::default())
            .await;
        assert_eq!(result.removed.len(), 2);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].path, "sqlite:session:ses_ghost");
        assert_eq!(count(&db, "session"), 0);
        assert_eq!(count(&db, "message"), 0);
        assert_eq!(count(&db, "part"), 0);
    }

    #[tokio::test]
    async fn project_delete_leaves_sessions() {
        let db = backend();
        seed(&db);
        let projects = db.load_project_records().await.unwrap();
        let result = db
            .delete_project_metadata(&projects, DeleteOptions::default())
            .await;
        assert!(result.is_complete());
        assert!(db.load_project_records().await.unwrap().is_empty());
        assert_eq!(count(&db, "session"), 2);
    }

    #[tokio::test]
    async fn rename_move_and_copy() {
        let db = backend();
        seed(&db);
        let session = db
            .load_session_records(&SessionFilter::default())
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.session_id == "session_add_tests")
            .unwrap();

        db.update_session_title(&session, "Renamed").await.unwrap();
        let moved = db.move_session(&session, "proj_other").await.unwrap();
        assert_eq!(moved.title.as_deref(), Some("Renamed"));
        assert_eq!(moved.project_id, "proj_other");
        assert_eq!(
            db.load_session_records(&SessionFilter::project("proj_other"))
                .await
                .unwrap()
                .len(),
            1
        );

        let copy = db.copy_session(&moved, "proj_main").await.unwrap();
        assert_ne!(copy.session_id, moved.session_id);
        assert!(copy.session_id.starts_with("ses_"));
        assert_eq!(copy.project_id, "proj_main");
        assert_eq!(count(&db, "message"), 6);
        assert_eq!(count(&db, "part"), 4);
        assert_eq!(
            db.compute_session_token_summary(&copy).await,
            db.compute_session_token_summary(&moved).await
        );
        let copied = db.load_session_chat_index(&copy.session_id).await.unwrap();
        assert_eq!(
            copied.iter().map(|m| m.role).collect::<Vec<_>>(),
            db.load_session_chat_index(&moved.session_id)
                .await
                .unwrap()
                .iter()
                .map(|m| m.role)
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn rename_missing_session_is_not_found() {
        let db = backend();
        seed(&db);
        let mut session = db
            .load_session_records(&SessionFilter::default())
            .await
            .unwrap()
            .remove(0);
        session.session_id = "ses_missing".to_string();
        let err = db.update_session_title(&session, "x").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: EntityKind::Session, .. }));
    }

    #[tokio::test]
    async fn token_summary_from_rows() {
        let db = backend();
        seed(&db);
        let sessions = db.load_session_records(&SessionFilter::default()).await.unwrap();
        let add_tests = sessions.iter().find(|s| s.session_id == "session_add_tests").unwrap();
        let parser_fix = sessions.iter().find(|s| s.session_id == "session_parser_fix").unwrap();

        assert_eq!(
            db.compute_session_token_summary(add_tests).await,
            TokenSummary::known(TokenBreakdown::new(150, 75, 10, 50, 25))
        );
        assert_eq!(
            db.compute_session_token_summary(parser_fix).await,
            TokenSummary::unknown(UnknownReason::NoMessages)
        );

        db.put_message(&json!({
            "id": "msg_4",
            "sessionID": "session_add_tests",
            "role": "assistant",
            "time": { "created": 2_400 }
        }))
        .unwrap();
        assert_eq!(
            db.compute_session_token_summary(add_tests).await,
            TokenSummary::unknown(UnknownReason::Missing)
        );
    }

    #[tokio::test]
    async fn strict_token_summary_flags_invalid_rows() {
        let db = SqliteBackend::open_in_memory(ReadPolicy::strict()).unwrap();
        seed(&db);
        db.lock()
            .unwrap()
            .execute(
                "INSERT INTO message (id, session_id, data) VALUES ('msg_bad', 'session_add_tests', 'nope')",
                [],
            )
            .unwrap();
        let session = db
            .load_session_records(&SessionFilter::project("proj_main"))
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.session_id == "session_add_tests")
            .unwrap();
        assert_eq!(
            db.compute_session_token_summary(&session).await,
            TokenSummary::unknown(UnknownReason::ParseError)
        );
    }

    #[tokio::test]
    async fn search_joins_messages_and_parts() {
        let db = backend();
        seed(&db);
        db.put_part(&json!({
            "id": "prt_3a",
            "messageID": "msg_3",
            "type": "text",
            "text": "The PARSER handles tokens"
        }))
        .unwrap();
        db.put_part(&json!({
            "id": "prt_3b",
            "messageID": "msg_3",
            "type": "text",
            "text": "parser again"
        }))
        .unwrap();
        let sessions = db.load_session_records(&SessionFilter::default()).await.unwrap();

        let hits = db
            .search_sessions_chat(&sessions, "parser", SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].message_id, "msg_3");
        assert_eq!(hits[0].session_title.as_deref(), Some("Add tests"));
        assert_eq!(hits[0].snippet, "The PARSER handles tokens");

        let capped = db
            .search_sessions_chat(&sessions, "test", SearchOptions { max_results: 1 })
            .await
            .unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].message_id, "msg_1");
    }
}
