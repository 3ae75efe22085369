//! Thread identifier parsing: `<platform>:<owner>/<repo>#<kind>:<number>`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TidError {
    #[error("thread id '{0}' is missing the '#' separating repo from thread kind")]
    MissingThreadSeparator(String),
    #[error("thread id '{0}' is missing the ':' separating platform from owner/repo")]
    MissingPlatformSeparator(String),
    #[error("thread id '{0}' is missing the '/' separating owner from repo")]
    MissingOwnerSeparator(String),
    #[error("unknown thread kind '{0}', expected 'issue' or 'pr'")]
    UnknownKind(String),
    #[error("thread id '{0}' has a non-numeric thread number")]
    InvalidNumber(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadKind {
    Issue,
    Pr,
}

impl ThreadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::Pr => "pr",
        }
    }
}

impl fmt::Display for ThreadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An opaque, canonical thread identifier.
///
/// The repo-prefix (`platform:owner/repo`) is the serialization key
/// used by the dispatch queue — every TID sharing a prefix is
/// mutually exclusive for container scheduling purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tid {
    pub platform: String,
    pub owner: String,
    pub repo: String,
    pub kind: ThreadKind,
    pub number: u64,
}

impl Tid {
    pub fn new(
        platform: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
        kind: ThreadKind,
        number: u64,
    ) -> Self {
        Self {
            platform: platform.into(),
            owner: owner.into(),
            repo: repo.into(),
            kind,
            number,
        }
    }

    /// The serialization key: `<platform>:<owner>/<repo>`.
    pub fn repo_prefix(&self) -> String {
        format!("{}:{}/{}", self.platform, self.owner, self.repo)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}#{}:{}",
            self.platform, self.owner, self.repo, self.kind, self.number
        )
    }
}

impl FromStr for Tid {
    type Err = TidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, rest) = s
            .split_once('#')
            .ok_or_else(|| TidError::MissingThreadSeparator(s.to_string()))?;
        let (platform, owner_repo) = prefix
            .split_once(':')
            .ok_or_else(|| TidError::MissingPlatformSeparator(s.to_string()))?;
        let (owner, repo) = owner_repo
            .split_once('/')
            .ok_or_else(|| TidError::MissingOwnerSeparator(s.to_string()))?;
        let (kind_str, number_str) = rest
            .split_once(':')
            .ok_or_else(|| TidError::MissingThreadSeparator(s.to_string()))?;
        let kind = match kind_str {
            "issue" => ThreadKind::Issue,
            "pr" => ThreadKind::Pr,
            other => return Err(TidError::UnknownKind(other.to_string())),
        };
        let number: u64 = number_str
            .parse()
            .map_err(|_| TidError::InvalidNumber(s.to_string()))?;

        Ok(Self {
            platform: platform.to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            kind,
            number,
        })
    }
}

impl TryFrom<String> for Tid {
    type Error = TidError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Tid> for String {
    fn from(tid: Tid) -> Self {
        tid.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_issue_tid() {
        let tid: Tid = "github:acme/widgets#issue:42".parse().unwrap();
        assert_eq!(tid.platform, "github");
        assert_eq!(tid.owner, "acme");
        assert_eq!(tid.repo, "widgets");
        assert_eq!(tid.kind, ThreadKind::Issue);
        assert_eq!(tid.number, 42);
    }

    #[test]
    fn parses_pr_tid() {
        let tid: Tid = "github:acme/widgets#pr:7".parse().unwrap();
        assert_eq!(tid.kind, ThreadKind::Pr);
    }

    #[test]
    fn repo_prefix_is_the_serialization_key() {
        let tid: Tid = "github:acme/widgets#issue:1".parse().unwrap();
        assert_eq!(tid.repo_prefix(), "github:acme/widgets");
    }

    #[test]
    fn two_tids_on_same_repo_share_a_prefix() {
        let a: Tid = "github:acme/widgets#issue:1".parse().unwrap();
        let b: Tid = "github:acme/widgets#pr:2".parse().unwrap();
        assert_eq!(a.repo_prefix(), b.repo_prefix());
    }

    #[test]
    fn round_trips_through_display() {
        let original = "github:acme/widgets#pr:99";
        let tid: Tid = original.parse().unwrap();
        assert_eq!(tid.to_string(), original);
    }

    #[test]
    fn rejects_missing_hash() {
        let err = "github:acme/widgets".parse::<Tid>().unwrap_err();
        assert!(matches!(err, TidError::MissingThreadSeparator(_)));
    }

    #[test]
    fn rejects_unknown_kind() {
        let err = "github:acme/widgets#discussion:1".parse::<Tid>().unwrap_err();
        assert!(matches!(err, TidError::UnknownKind(_)));
    }

    #[test]
    fn rejects_non_numeric_number() {
        let err = "github:acme/widgets#issue:abc".parse::<Tid>().unwrap_err();
        assert!(matches!(err, TidError::InvalidNumber(_)));
    }
}
