//! Exact and prefix identifier resolution.

use serde::{Deserialize, Serialize};

use crate::error::{EntityKind, StoreError};
use crate::model::{ChatMessage, ProjectRecord, SessionRecord};

/// Candidates listed in an ambiguity error.
pub const MAX_AMBIGUOUS_CANDIDATES: usize = 3;

/// A record addressable by a textual id.
pub trait Identified {
    const KIND: EntityKind;

    fn id(&self) -> &str;
}

impl Identified for ProjectRecord {
    const KIND: EntityKind = EntityKind::Project;

    fn id(&self) -> &str {
        &self.project_id
    }
}

impl Identified for SessionRecord {
    const KIND: EntityKind = EntityKind::Session;

    fn id(&self) -> &str {
        &self.session_id
    }
}

impl Identified for ChatMessage {
    const KIND: EntityKind = EntityKind::Message;

    fn id(&self) -> &str {
        &self.message_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Prefix,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    pub allow_prefix: bool,
}

impl ResolveOptions {
    pub const fn with_prefix() -> Self {
        Self { allow_prefix: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved<T> {
    pub record: T,
    pub match_kind: MatchKind,
}

/// Find the record named by `input`.
///
/// An exact id match always wins, even when the input also prefixes other
/// ids. Otherwise, with prefix matching enabled, a single prefix match is
/// returned; several are ambiguous.
pub fn resolve<'a, T: Identified>(
    records: &'a [T],
    input: &str,
    options: ResolveOptions,
) -> Result<Resolved<&'a T>, StoreError> {
    let not_found = || StoreError::NotFound {
        kind: T::KIND,
        id: input.to_string(),
    };
    if input.is_empty() {
        return Err(not_found());
    }

    if let Some(record) = records.iter().find(|r| r.id() == input) {
        return Ok(Resolved {
            record,
            match_kind: MatchKind::Exact,
        });
    }
    if !options.allow_prefix {
        return Err(not_found());
    }

    let matches: Vec<&T> = records.iter().filter(|r| r.id().starts_with(input)).collect();
    match matches.as_slice() {
        [] => Err(not_found()),
        [record] => Ok(Resolved {
            record: *record,
            match_kind: MatchKind::Prefix,
        }),
        many => Err(StoreError::Ambiguous {
            kind: T::KIND,
            id: input.to_string(),
            candidates: many
                .iter()
                .take(MAX_AMBIGUOUS_CANDIDATES)
                .map(|r| r.id().to_string())
                .collect(),
            truncated: many.len() > MAX_AMBIGUOUS_CANDIDATES,
        }),
    }
}

/// Like [`resolve`], returning an owned copy of the record.
pub fn resolve_owned<T: Identified + Clone>(
    records: &[T],
    input: &str,
    options: ResolveOptions,
) -> Result<Resolved<T>, StoreError> {
    resolve(records, input, options).map(|r| Resolved {
        record: r.record.clone(),
        match_kind: r.match_kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Rec(&'static str);

    impl Identified for Rec {
        const KIND: EntityKind = EntityKind::Session;

        fn id(&self) -> &str {
            self.0
        }
    }

    fn recs(ids: &[&'static str]) -> Vec<Rec> {
        ids.iter().copied().map(Rec).collect()
    }

    #[test]
    fn exact_match_wins_over_prefix_matches() {
        let records = recs(&["ses_a", "ses_ab", "ses_abc"]);
        let resolved = resolve(&records, "ses_a", ResolveOptions::with_prefix()).unwrap();
        assert_eq!(resolved.record, &Rec("ses_a"));
        assert_eq!(resolved.match_kind, MatchKind::Exact);
    }

    #[test]
    fn unique_prefix_is_tagged_prefix() {
        let records = recs(&["ses_abc", "ses_xyz"]);
        let resolved = resolve(&records, "ses_x", ResolveOptions::with_prefix()).unwrap();
        assert_eq!(resolved.record, &Rec("ses_xyz"));
        assert_eq!(resolved.match_kind, MatchKind::Prefix);
    }

    #[test]
    fn prefix_ignored_when_disabled() {
        let records = recs(&["ses_abc"]);
        let err = resolve(&records, "ses_a", ResolveOptions::default()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn zero_matches_is_not_found() {
        let records = recs(&["ses_abc"]);
        let err = resolve(&records, "prj", ResolveOptions::with_prefix()).unwrap_err();
        assert!(matches!(
            err,
            StoreError::NotFound { kind: EntityKind::Session, ref id } if id == "prj"
        ));
    }

    #[test]
    fn two_matches_are_ambiguous_without_marker() {
        let records = recs(&["ses_a1", "ses_a2", "ses_b"]);
        let err = resolve(&records, "ses_a", ResolveOptions::with_prefix()).unwrap_err();
        match err {
            StoreError::Ambiguous {
                candidates,
                truncated,
                ..
            } => {
                assert_eq!(candidates, vec!["ses_a1", "ses_a2"]);
                assert!(!truncated);
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn many_matches_list_three_and_truncate() {
        let records = recs(&["ses_a1", "ses_a2", "ses_a3", "ses_a4", "ses_a5"]);
        let err = resolve(&records, "ses_a", ResolveOptions::with_prefix()).unwrap_err();
        match &err {
            StoreError::Ambiguous {
                candidates,
                truncated,
                ..
            } => {
                assert_eq!(candidates.len(), MAX_AMBIGUOUS_CANDIDATES);
                assert!(*truncated);
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
        assert!(err.to_string().ends_with(", …"));
    }

    #[test]
    fn blank_input_is_not_found() {
        let records = recs(&["ses_a"]);
        assert!(matches!(
            resolve(&records, "", ResolveOptions::with_prefix()),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn padded_input_is_not_an_exact_match() {
        let records = recs(&["ses_a"]);
        let err = resolve(&records, " ses_a", ResolveOptions::with_prefix()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { ref id, .. } if id == " ses_a"));
    }

    #[test]
    fn resolve_owned_clones_record() {
        let records = recs(&["ses_a", "ses_b"]);
        let resolved = resolve_owned(&records, "ses_b", ResolveOptions::default()).unwrap();
        assert_eq!(resolved.record, Rec("ses_b"));
    }
}
