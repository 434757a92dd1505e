//! Token usage rollups at session, project and global level.
//!
//! "Not measured" and "zero" are different answers: a session whose assistant
//! messages carry no token metadata is [`TokenSummary::Unknown`], never a
//! breakdown of zeros.

use serde::{Deserialize, Serialize};

use crate::model::{ChatMessage, MessageRole};

/// Token counts by category. `total` is always the sum of the other five.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBreakdown {
    pub input: u64,
    pub output: u64,
    pub reasoning: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    pub total: u64,
}

impl TokenBreakdown {
    #[must_use]
    pub const fn new(
        input: u64,
        output: u64,
        reasoning: u64,
        cache_read: u64,
        cache_write: u64,
    ) -> Self {
        let mut breakdown = Self {
            input,
            output,
            reasoning,
            cache_read,
            cache_write,
            total: 0,
        };
        breakdown.total = breakdown.category_sum();
        breakdown
    }

    const fn category_sum(&self) -> u64 {
        self.input
            .saturating_add(self.output)
            .saturating_add(self.reasoning)
            .saturating_add(self.cache_read)
            .saturating_add(self.cache_write)
    }

    /// Add another breakdown category by category. Stored totals are ignored.
    pub const fn accumulate(&mut self, other: &Self) {
        self.input = self.input.saturating_add(other.input);
        self.output = self.output.saturating_add(other.output);
        self.reasoning = self.reasoning.saturating_add(other.reasoning);
        self.cache_read = self.cache_read.saturating_add(other.cache_read);
        self.cache_write = self.cache_write.saturating_add(other.cache_write);
        self.total = self.category_sum();
    }
}

/// Why a token summary could not be computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownReason {
    /// At least one assistant message has no token metadata.
    Missing,
    /// The session's messages could not be read.
    ParseError,
    /// The session has no assistant messages.
    NoMessages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TokenSummary {
    Known { tokens: TokenBreakdown },
    Unknown { reason: UnknownReason },
}

impl TokenSummary {
    pub const fn known(tokens: TokenBreakdown) -> Self {
        Self::Known { tokens }
    }

    pub const fn unknown(reason: UnknownReason) -> Self {
        Self::Unknown { reason }
    }

    pub const fn tokens(&self) -> Option<&TokenBreakdown> {
        match self {
            Self::Known { tokens } => Some(tokens),
            Self::Unknown { .. } => None,
        }
    }
}

/// Rollup across many sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateTokenSummary {
    /// Unknown only when every constituent session is unknown.
    pub total: TokenSummary,
    /// Sum over sessions with known usage.
    pub known_only: TokenBreakdown,
    pub unknown_sessions: usize,
}

/// Sum token usage over a session's assistant messages.
pub fn summarize_messages(messages: &[ChatMessage]) -> TokenSummary {
    let mut sum = TokenBreakdown::default();
    let mut assistant_messages = 0usize;

    for message in messages {
        if message.role != MessageRole::Assistant {
            continue;
        }
        assistant_messages += 1;
        match &message.tokens {
            Some(tokens) => sum.accumulate(tokens),
            None => return TokenSummary::unknown(UnknownReason::Missing),
        }
    }

    if assistant_messages == 0 {
        TokenSummary::unknown(UnknownReason::NoMessages)
    } else {
        TokenSummary::known(sum)
    }
}

/// Combine per-session summaries. Unknown sessions are excluded from the
/// sum, not treated as zero.
pub fn aggregate_summaries<I>(summaries: I) -> AggregateTokenSummary
where
    I: IntoIterator<Item = TokenSummary>,
{
    let mut known_only = TokenBreakdown::default();
    let mut known_sessions = 0usize;
    let mut unknown_sessions = 0usize;

    for summary in summaries {
        match summary {
            TokenSummary::Known { tokens } => {
                known_only.accumulate(&tokens);
                known_sessions += 1;
            }
            TokenSummary::Unknown { .. } => unknown_sessions += 1,
        }
    }

    let total = if known_sessions == 0 {
        TokenSummary::unknown(UnknownReason::Missing)
    } else {
        TokenSummary::known(known_only)
    };

    AggregateTokenSummary {
        total,
        known_only,
        unknown_sessions,
    }
}
