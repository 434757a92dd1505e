//! JSON file-tree backend.
//!
//! One JSON document per entity under `<root>/storage`:
//!
//! ```text
//! storage/
//! ├── project/<projectId>.json
//! ├── session/<projectId>/<sessionId>.json
//! ├── message/<sessionId>/<messageId>.json
//! └── part/<messageId>/<partId>.json
//! ```
//!
//! Older releases wrote projects to `storage/sessions/`, messages to
//! `storage/session/message/<sessionId>/` and parts to
//! `storage/session/part/<sessionId>/<messageId>/`. Those locations are read
//! as fallbacks after the canonical ones and never written.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;

use crate::backend::{BackendKind, DeleteOptions, ReadPolicy, SessionFilter, StorageBackend};
use crate::document::{
    Document, MessageDocument, PartDocument, ProjectDocument, SessionDocument, edit,
    parse_document,
};
use crate::error::{EntityKind, StoreError};
use crate::model::{
    ChatMessage, ChatPart, DeleteResult, IdSequence, ProjectBucket, ProjectRecord, SessionRecord,
    expand_home, file_stem, finalize_projects, finalize_sessions, now_ms, sort_messages,
};

/// Sub-namespaces of `storage/session/` that hold legacy children, not projects.
const LEGACY_SESSION_SUBDIRS: &[&str] = &["message", "part"];

/// Backend over an `OpenCode` storage directory tree.
#[derive(Debug, Clone)]
pub struct JsonlBackend {
    storage_dir: PathBuf,
    policy: ReadPolicy,
}

impl JsonlBackend {
    /// Create a backend for the metadata root (the directory containing `storage/`).
    ///
    /// A root that does not exist yet behaves as empty storage.
    pub fn new(root: impl AsRef<Path>, policy: ReadPolicy) -> Self {
        let root = expand_home(&root.as_ref().to_string_lossy());
        Self {
            storage_dir: root.join("storage"),
            policy,
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Project namespaces in lookup order; the first one to supply an id wins.
    fn project_namespaces(&self) -> [(ProjectBucket, PathBuf); 2] {
        [ProjectBucket::Project, ProjectBucket::Sessions]
            .map(|bucket| (bucket, self.storage_dir.join(bucket.dir_name())))
    }

    fn session_namespace(&self) -> PathBuf {
        self.storage_dir.join("session")
    }

    fn session_path(&self, project_id: &str, session_id: &str) -> PathBuf {
        self.session_namespace()
            .join(project_id)
            .join(format!("{session_id}.json"))
    }

    fn canonical_message_dir(&self, session_id: &str) -> PathBuf {
        self.storage_dir.join("message").join(session_id)
    }

    fn canonical_part_dir(&self, message_id: &str) -> PathBuf {
        self.storage_dir.join("part").join(message_id)
    }

    fn legacy_part_root(&self) -> PathBuf {
        self.session_namespace().join("part")
    }

    /// Message directory templates, canonical first.
    fn message_dir_candidates(&self, session_id: &str) -> [PathBuf; 2] {
        [
            self.canonical_message_dir(session_id),
            self.session_namespace().join("message").join(session_id),
        ]
    }

    /// Part directory for a message, canonical first, then any legacy
    /// `session/part/<sessionId>/<messageId>` directory.
    async fn resolve_part_dir(&self, message_id: &str) -> Result<Option<PathBuf>, StoreError> {
        let canonical = self.canonical_part_dir(message_id);
        if is_dir(&canonical).await {
            return Ok(Some(canonical));
        }
        for session_dir in list_dirs(&self.legacy_part_root()).await? {
            let candidate = session_dir.join(message_id);
            if is_dir(&candidate).await {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Read every `*.json` document in `dir`, in file-name order.
    async fn read_documents<T: Document>(
        &self,
        dir: &Path,
    ) -> Result<Vec<(PathBuf, T)>, StoreError> {
        let mut docs = Vec::new();
        for path in list_json_files(dir).await? {
            let locator = path.display().to_string();
            let parsed = match fs::read_to_string(&path).await {
                Ok(data) => parse_document::<T>(&data, &locator),
                Err(err) => Err(StoreError::io(&path, err)),
            };
            match parsed {
                Ok(doc) => docs.push((path, doc)),
                Err(err) => self.policy.tolerate(err)?,
            }
        }
        Ok(docs)
    }

    /// Remove a directory tree, reporting anything but absence as a warning.
    async fn remove_tree(&self, dir: &Path) {
        match fs::remove_dir_all(dir).await {
            Ok(()) => tracing::debug!(path = ?dir, "removed directory"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => self
                .policy
                .warn(&format!("failed to remove {}: {err}", dir.display())),
        }
    }

    /// Best-effort cleanup of a deleted session's messages and parts.
    async fn remove_session_children(&self, session_id: &str) {
        for dir in self.message_dir_candidates(session_id) {
            match list_json_files(&dir).await {
                Ok(files) => {
                    for path in files {
                        if let Some(message_id) = file_stem(&path) {
                            self.remove_tree(&self.canonical_part_dir(&message_id))
                                .await;
                        }
                    }
                }
                Err(err) => self.policy.warn(&err.to_string()),
            }
            self.remove_tree(&dir).await;
        }
        self.remove_tree(&self.legacy_part_root().join(session_id))
            .await;
    }

    async fn copy_parts(
        &self,
        source_message_id: &str,
        message_id: &str,
        session_id: &str,
    ) -> Result<(), StoreError> {
        let Some(dir) = self.resolve_part_dir(source_message_id).await? else {
            return Ok(());
        };
        let mut part_ids = IdSequence::new("prt");
        let target_dir = self.canonical_part_dir(message_id);
        for path in list_json_files(&dir).await? {
            let mut part = match read_json_value(&path).await {
                Ok(part) => part,
                Err(err) => {
                    self.policy.tolerate(err)?;
                    continue;
                }
            };
            let part_id = part_ids.next_id();
            edit::rekey_part(&mut part, &part_id, message_id, session_id);
            write_json_value(&target_dir.join(format!("{part_id}.json")), &part).await?;
        }
        Ok(())
    }

    /// Undo the write half of a failed move, warning if the copy stays behind.
    async fn discard_moved_copy(&self, session_id: &str, dest: &Path) {
        if let Err(err) = fs::remove_file(dest).await {
            self.policy.warn(&format!(
                "session {session_id} left duplicated at {}: {err}",
                dest.display()
            ));
        }
    }
}

#[async_trait]
impl StorageBackend for JsonlBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Jsonl
    }

    async fn load_project_records(&self) -> Result<Vec<ProjectRecord>, StoreError> {
        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for (bucket, dir) in self.project_namespaces() {
            for (path, doc) in self.read_documents::<ProjectDocument>(&dir).await? {
                if !seen.insert(doc.id.clone()) {
                    tracing::debug!(project_id = %doc.id, path = ?path, "project already loaded from another bucket");
                    continue;
                }
                records.push(
                    doc.into_record(Some(bucket), path.display().to_string())
                        .await,
                );
            }
        }
        finalize_projects(&mut records);
        tracing::debug!(count = records.len(), "loaded project records");
        Ok(records)
    }

    async fn load_session_records(
        &self,
        filter: &SessionFilter,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        // The payload's projectID is authoritative, so a filtered listing
        // still walks every project directory.
        let project_dirs: Vec<PathBuf> = list_dirs(&self.session_namespace())
            .await?
            .into_iter()
            .filter(|dir| {
                dir.file_name()
                    .and_then(|n| n.to_str())
                    .is_none_or(|n| !LEGACY_SESSION_SUBDIRS.contains(&n))
            })
            .collect();

        let mut records = Vec::new();
        for dir in project_dirs {
            let dir_project = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            for (path, doc) in self.read_documents::<SessionDocument>(&dir).await? {
                let record = doc.into_record(&dir_project, path.display().to_string());
                if filter
                    .project_id
                    .as_ref()
                    .is_some_and(|p| *p != record.project_id)
                {
                    continue;
                }
                records.push(record);
            }
        }
        finalize_sessions(&mut records);
        tracing::debug!(count = records.len(), filter = ?filter.project_id, "loaded session records");
        Ok(records)
    }

    async fn load_session_chat_index(
        &self,
        session_id: &str,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let Some(dir) = first_existing_dir(self.message_dir_candidates(session_id)).await else {
            return Ok(Vec::new());
        };
        let mut messages: Vec<ChatMessage> = self
            .read_documents::<MessageDocument>(&dir)
            .await?
            .into_iter()
            .map(|(_, doc)| doc.into_message(session_id))
            .collect();
        sort_messages(&mut messages);
        Ok(messages)
    }

    async fn load_message_parts(&self, message_id: &str) -> Result<Vec<ChatPart>, StoreError> {
        let Some(dir) = self.resolve_part_dir(message_id).await? else {
            return Ok(Vec::new());
        };
        Ok(self
            .read_documents::<PartDocument>(&dir)
            .await?
            .into_iter()
            .map(|(_, doc)| doc.into_part(message_id))
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
            match fs::remove_file(&record.file_path).await {
                Ok(()) => {
                    tracing::debug!(project_id = %record.project_id, "deleted project");
                    result.removed.push(record.file_path.clone());
                }
                Err(err) => {
                    tracing::warn!(path = %record.file_path, error = %err, "failed to delete project");
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
            match fs::remove_file(&record.file_path).await {
                Ok(()) => {
                    self.remove_session_children(&record.session_id).await;
                    tracing::debug!(session_id = %record.session_id, "deleted session");
                    result.removed.push(record.file_path.clone());
                }
                Err(err) => {
                    tracing::warn!(path = %record.file_path, error = %err, "failed to delete session");
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
        let path = Path::new(&session.file_path);
        let mut doc = read_record_value(path, EntityKind::Session, &session.session_id).await?;
        edit::retitle(&mut doc, title, now_ms());
        write_json_value(path, &doc).await?;
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
        let source = PathBuf::from(&session.file_path);
        let mut doc = read_record_value(&source, EntityKind::Session, &session.session_id).await?;
        edit::reassign_project(&mut doc, target_project_id);

        let dest = self.session_path(target_project_id, &session.session_id);
        if is_file(&dest).await {
            return Err(StoreError::AlreadyExists {
                kind: EntityKind::Session,
                id: session.session_id.clone(),
            });
        }
        write_json_value(&dest, &doc).await?;
        if let Err(err) = fs::remove_file(&source).await {
            // Leave the session where it was rather than duplicated.
            self.discard_moved_copy(&session.session_id, &dest).await;
            return Err(StoreError::io(&source, err));
        }

        let mut record = session_record_from_value(doc, target_project_id, &dest)?;
        record.index = session.index;
        tracing::debug!(session_id = %session.session_id, from = %session.project_id, to = %target_project_id, "moved session");
        Ok(record)
    }

    async fn copy_session(
        &self,
        session: &SessionRecord,
        target_project_id: &str,
    ) -> Result<SessionRecord, StoreError> {
        let source = Path::new(&session.file_path);
        let mut doc = read_record_value(source, EntityKind::Session, &session.session_id).await?;
        let session_id = IdSequence::new("ses").next_id();
        edit::rekey_session(&mut doc, &session_id, target_project_id, now_ms());

        // Children first: an interrupted copy never surfaces as a session.
        let mut message_ids = IdSequence::new("msg");
        if let Some(dir) =
            first_existing_dir(self.message_dir_candidates(&session.session_id)).await
        {
            for path in list_json_files(&dir).await? {
                let mut message = match read_json_value(&path).await {
                    Ok(message) => message,
                    Err(err) => {
                        self.policy.tolerate(err)?;
                        continue;
                    }
                };
                let source_message_id = message
                    .get("id")
                    .and_then(Value::as_str)
                    .map(ToString::to_string)
                    .or_else(|| file_stem(&path))
                    .unwrap_or_default();
                let message_id = message_ids.next_id();
                edit::rekey_message(&mut message, &message_id, &session_id);
                let target = self
                    .canonical_message_dir(&session_id)
                    .join(format!("{message_id}.json"));
                write_json_value(&target, &message).await?;
                self.copy_parts(&source_message_id, &message_id, &session_id)
                    .await?;
            }
        }

        let dest = self.session_path(target_project_id, &session_id);
        write_json_value(&dest, &doc).await?;
        tracing::debug!(source = %session.session_id, copy = %session_id, "copied session");
        session_record_from_value(doc, target_project_id, &dest)
    }
}

fn session_record_from_value(
    doc: Value,
    fallback_project_id: &str,
    path: &Path,
) -> Result<SessionRecord, StoreError> {
    let locator = path.display().to_string();
    let parsed: SessionDocument =
        serde_json::from_value(doc).map_err(|source| StoreError::Json {
            locator: locator.clone(),
            source,
        })?;
    Ok(parsed.into_record(fallback_project_id, locator))
}

async fn is_dir(path: &Path) -> bool {
    fs::metadata(path).await.is_ok_and(|m| m.is_dir())
}

async fn is_file(path: &Path) -> bool {
    fs::metadata(path).await.is_ok_and(|m| m.is_file())
}

async fn first_existing_dir<I>(candidates: I) -> Option<PathBuf>
where
    I: IntoIterator<Item = PathBuf>,
{
    for candidate in candidates {
        if is_dir(&candidate).await {
            return Some(candidate);
        }
    }
    None
}

/// `*.json` files directly inside `dir`, sorted by name. Missing dirs are empty.
async fn list_json_files(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StoreError::io(dir, err)),
    };
    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| StoreError::io(dir, err))?
    {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Subdirectories of `dir`, sorted by name. Missing dirs are empty.
async fn list_dirs(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StoreError::io(dir, err)),
    };
    let mut dirs = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| StoreError::io(dir, err))?
    {
        let is_dir = entry
            .file_type()
            .await
            .map_err(|err| StoreError::io(entry.path(), err))?
            .is_dir();
        if is_dir {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

async fn read_json_value(path: &Path) -> Result<Value, StoreError> {
    let data = fs::read_to_string(path)
        .await
        .map_err(|err| StoreError::io(path, err))?;
    serde_json::from_str(&data).map_err(|source| StoreError::Json {
        locator: path.display().to_string(),
        source,
    })
}

/// Read a record's own document; a missing file means the record is gone.
async fn read_record_value(path: &Path, kind: EntityKind, id: &str) -> Result<Value, StoreError> {
    match read_json_value(path).await {
        Err(StoreError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
            Err(StoreError::NotFound {
                kind,
                id: id.to_string(),
            })
        }
        other => other,
    }
}

async fn write_json_value(path: &Path, value: &Value) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|err| StoreError::io(parent, err))?;
    }
    let data = serde_json::to_string_pretty(value).map_err(|source| StoreError::Json {
        locator: path.display().to_string(),
        source,
    })?;
    fs::write(path, data)
        .await
        .map_err(|err| StoreError::io(path, err))
}
