//! Core data model and storage contract for `OpenCode` metadata.
//!
//! This crate contains:
//! - Records: projects, sessions, chat messages and parts shared by every backend
//! - The [`StorageBackend`] contract plus the JSON file-tree backend
//! - Backend-agnostic algorithms: ID resolution, token aggregation, chat search

pub mod backend;
pub mod document;
mod error;
pub mod jsonl;
pub mod model;
pub mod resolve;
pub mod search;
pub mod tokens;

pub use backend::{
    BackendKind, DeleteOptions, ReadPolicy, SearchOptions, SessionFilter, StorageBackend,
    WarningSink,
};
pub use error::{EntityKind, StoreError};
pub use jsonl::JsonlBackend;
pub use model::{
    ChatMessage, ChatPart, DeleteFailure, DeleteResult, MessageRole, PartType, ProjectBucket,
    ProjectRecord, ProjectState, SessionRecord,
};
pub use resolve::{MatchKind, ResolveOptions, Resolved};
pub use search::ChatSearchResult;
pub use tokens::{AggregateTokenSummary, TokenBreakdown, TokenSummary, UnknownReason};
