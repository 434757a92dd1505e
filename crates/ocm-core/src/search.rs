//! Case-insensitive substring search over chat content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::{SearchOptions, StorageBackend};
use crate::error::StoreError;
use crate::model::{ChatPart, MessageRole, PartType, SessionRecord};

/// Characters of context kept on each side of a match.
pub const SNIPPET_CONTEXT_CHARS: usize = 40;

/// Result cap used when the caller does not set one.
pub const DEFAULT_MAX_RESULTS: usize = 100;

/// One match. At most one is reported per message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSearchResult {
    pub session_id: String,
    pub session_title: Option<String>,
    pub project_id: String,
    pub message_id: String,
    pub role: MessageRole,
    pub snippet: String,
    /// Full text of the matching part.
    pub matched_text: String,
    pub part_type: PartType,
    pub created_at: Option<DateTime<Utc>>,
}

/// Message fields carried into a search result.
#[derive(Debug, Clone, Copy)]
pub struct MessageContext<'a> {
    pub message_id: &'a str,
    pub role: MessageRole,
    pub created_at: Option<DateTime<Utc>>,
}

/// Fold a raw query; `None` when there is nothing to search for.
pub fn normalize_query(query: &str) -> Option<String> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

/// Byte range of the first case-insensitive occurrence of `needle`.
///
/// `needle` must already be lowercase.
pub fn find_case_insensitive(haystack: &str, needle: &str) -> Option<(usize, usize)> {
    let needle: Vec<char> = needle.chars().collect();
    if needle.is_empty() {
        return None;
    }
    'start: for (start, _) in haystack.char_indices() {
        let mut remaining = needle.as_slice();
        for (offset, ch) in haystack[start..].char_indices() {
            for lower in ch.to_lowercase() {
                match remaining.split_first() {
                    Some((first, rest)) if *first == lower => remaining = rest,
                    _ => continue 'start,
                }
            }
            if remaining.is_empty() {
                return Some((start, start + offset + ch.len_utf8()));
            }
        }
        return None;
    }
    None
}

/// Single-line window around `text[start..end]` with `…` where cut.
pub fn build_snippet(text: &str, start: usize, end: usize) -> String {
    let window_start = text[..start]
        .char_indices()
        .rev()
        .nth(SNIPPET_CONTEXT_CHARS - 1)
        .map_or(0, |(i, _)| i);
    let window_end = text[end..]
        .char_indices()
        .nth(SNIPPET_CONTEXT_CHARS)
        .map_or(text.len(), |(i, _)| end + i);

    let mut snippet = String::new();
    if window_start > 0 {
        snippet.push('…');
    }
    snippet.push_str(&text[window_start..window_end].replace(['\n', '\r'], " "));
    if window_end < text.len() {
        snippet.push('…');
    }
    snippet
}

/// Match a single part; `needle` must come from [`normalize_query`].
pub fn match_part(
    session: &SessionRecord,
    message: MessageContext<'_>,
    part: &ChatPart,
    needle: &str,
) -> Option<ChatSearchResult> {
    let (start, end) = find_case_insensitive(&part.text, needle)?;
    Some(ChatSearchResult {
        session_id: session.session_id.clone(),
        session_title: session.title.clone(),
        project_id: session.project_id.clone(),
        message_id: message.message_id.to_string(),
        role: message.role,
        snippet: build_snippet(&part.text, start, end),
        matched_text: part.text.clone(),
        part_type: part.part_type,
        created_at: message.created_at,
    })
}

/// Scan sessions in input order through the loading operations of a backend.
pub async fn scan_sessions<B>(
    backend: &B,
    sessions: &[SessionRecord],
    query: &str,
    options: SearchOptions,
) -> Result<Vec<ChatSearchResult>, StoreError>
where
    B: StorageBackend + ?Sized,
{
    let mut results = Vec::new();
    let Some(needle) = normalize_query(query) else {
        return Ok(results);
    };
    if options.max_results == 0 {
        return Ok(results);
    }

    for session in sessions {
        let messages = backend.load_session_chat_index(&session.session_id).await?;
        for message in &messages {
            let parts = backend.load_message_parts(&message.message_id).await?;
            let context = MessageContext {
                message_id: &message.message_id,
                role: message.role,
                created_at: message.created_at,
            };
            if let Some(hit) = parts
                .iter()
                .find_map(|part| match_part(session, context, part, &needle))
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
