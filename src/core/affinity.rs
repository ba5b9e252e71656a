//! Affinity ladder and per-query affinity filters.

use std::collections::HashSet;

use crate::core::SchedulerError;

/// Longest affinity token accepted by queue servers.
pub const MAX_AFFINITY_LEN: usize = 255;

/// Token servers reserve for "no affinity".
const RESERVED_AFFINITY: &str = "-";

/// Priority-ordered affinity tokens; index is rank, rank 0 most important.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AffinityLadder {
    tokens: Vec<String>,
}

impl AffinityLadder {
    /// Build a ladder, rejecting malformed or duplicate tokens.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::InvalidConfig` naming the first bad token.
    pub fn new<I, S>(tokens: I) -> Result<Self, SchedulerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tokens: Vec<String> = tokens.into_iter().map(Into::into).collect();
        let mut seen = HashSet::with_capacity(tokens.len());
        for token in &tokens {
            check_token(token)?;
            if !seen.insert(token.as_str()) {
                return Err(SchedulerError::InvalidConfig(format!(
                    "affinity `{token}` appears twice in the ladder"
                )));
            }
        }
        Ok(Self { tokens })
    }

    /// Number of ranks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the ladder has no ranks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Token at `rank`.
    #[must_use]
    pub fn token(&self, rank: usize) -> Option<&str> {
        self.tokens.get(rank).map(String::as_str)
    }

    /// Rank of `affinity` among the first `limit` ranks, searching from the
    /// least important of them toward rank 0.
    #[must_use]
    pub fn rank_below(&self, affinity: &str, limit: usize) -> Option<usize> {
        let limit = limit.min(self.tokens.len());
        (0..limit).rev().find(|&rank| self.tokens[rank] == affinity)
    }

    /// Filter covering every rank.
    #[must_use]
    pub fn full_filter(&self) -> AffinityFilter {
        self.filter_above(self.tokens.len())
    }

    /// Filter covering the ranks strictly more important than `rank`.
    #[must_use]
    pub fn filter_above(&self, rank: usize) -> AffinityFilter {
        let end = rank.min(self.tokens.len());
        AffinityFilter {
            tokens: self.tokens[..end].to_vec(),
        }
    }
}

/// Validate a single affinity token.
///
/// # Errors
///
/// Returns `SchedulerError::InvalidConfig` describing the problem.
pub fn check_token(token: &str) -> Result<(), SchedulerError> {
    if token.is_empty() {
        return Err(SchedulerError::InvalidConfig("empty affinity token".into()));
    }
    if token == RESERVED_AFFINITY {
        return Err(SchedulerError::InvalidConfig(
            "affinity `-` cannot be used as a preferred one".into(),
        ));
    }
    if token.len() > MAX_AFFINITY_LEN {
        return Err(SchedulerError::InvalidConfig(format!(
            "affinity token longer than {MAX_AFFINITY_LEN} bytes"
        )));
    }
    if let Some(bad) = token
        .chars()
        .find(|c| c.is_whitespace() || matches!(c, ',' | '"' | '\''))
    {
        return Err(SchedulerError::InvalidConfig(format!(
            "affinity `{token}` contains forbidden character {bad:?}"
        )));
    }
    Ok(())
}

/// Affinities requested from one server, most important first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AffinityFilter {
    tokens: Vec<String>,
}

impl AffinityFilter {
    /// Filter that requests no particular affinity.
    #[must_use]
    pub const fn empty() -> Self {
        Self { tokens: Vec::new() }
    }

    /// Requested tokens in priority order.
    #[must_use]
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Whether no affinity is requested.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Whether `affinity` is requested.
    #[must_use]
    pub fn contains(&self, affinity: &str) -> bool {
        self.tokens.iter().any(|t| t == affinity)
    }

    /// Comma-separated form used on the wire.
    #[must_use]
    pub fn to_list(&self) -> String {
        self.tokens.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ladder_rejects_bad_tokens() {
        assert!(AffinityLadder::new(["x", "y"]).is_ok());
        assert!(AffinityLadder::new([""]).is_err());
        assert!(AffinityLadder::new(["-"]).is_err());
        assert!(AffinityLadder::new(["a,b"]).is_err());
        assert!(AffinityLadder::new(["a b"]).is_err());
        assert!(AffinityLadder::new(["x", "x"]).is_err());
        assert!(AffinityLadder::new(["z".repeat(MAX_AFFINITY_LEN + 1)]).is_err());
    }

    #[test]
    fn test_filters() {
        let ladder = AffinityLadder::new(["x", "y", "z"]).unwrap();
        assert_eq!(ladder.full_filter().to_list(), "x,y,z");
        assert_eq!(ladder.filter_above(2).to_list(), "x,y");
        assert!(ladder.filter_above(0).is_empty());
        assert_eq!(ladder.filter_above(10).tokens().len(), 3);
    }

    #[test]
    fn test_rank_below() {
        let ladder = AffinityLadder::new(["x", "y", "z"]).unwrap();
        assert_eq!(ladder.rank_below("y", 3), Some(1));
        assert_eq!(ladder.rank_below("y", 1), None);
        assert_eq!(ladder.rank_below("x", 1), Some(0));
        assert_eq!(ladder.rank_below("w", 3), None);
    }
}
