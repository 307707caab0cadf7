//! Push events and the branch allow-list that decides whether a run starts.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const BRANCH_REF_PREFIX: &str = "refs/heads/";

/// A version-control push: which branch moved, and to which commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub branch: String,
    pub commit: String,
}

impl TriggerEvent {
    pub fn new(branch: impl Into<String>, commit: impl Into<String>) -> Self {
        let branch = branch.into();
        let branch = branch
            .strip_prefix(BRANCH_REF_PREFIX)
            .map(str::to_string)
            .unwrap_or(branch);
        Self {
            branch,
            commit: commit.into(),
        }
    }

    /// Parse a push webhook payload (`ref` + `after`).
    ///
    /// Returns `Ok(None)` for pushes that are not branch updates: tag pushes
    /// and branch deletions.
    pub fn from_push_payload(payload: &str) -> Result<Option<Self>, TriggerError> {
        let push: PushPayload = serde_json::from_str(payload)?;
        let Some(branch) = push.git_ref.strip_prefix(BRANCH_REF_PREFIX) else {
            info!(git_ref = %push.git_ref, "Push is not a branch update");
            return Ok(None);
        };
        if push.deleted || push.after.chars().all(|c| c == '0') {
            info!(branch, "Push deletes the branch");
            return Ok(None);
        }
        Ok(Some(Self::new(branch, push.after)))
    }
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    after: String,
    #[serde(default)]
    deleted: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("trigger branch allow-list is empty")]
    EmptyAllowList,
    #[error("invalid branch pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("failed to parse push payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Branch allow-list. Entries are branch names or globs: `*` matches within
/// one path segment, `**` matches across segments, `?` matches one character.
#[derive(Debug, Clone)]
pub struct BranchFilter {
    patterns: Vec<(String, Regex)>,
}

impl BranchFilter {
    pub fn new<I, S>(branches: I) -> Result<Self, TriggerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = branches
            .into_iter()
            .map(|b| -> Result<(String, Regex), TriggerError> {
                let pattern = b.as_ref().to_string();
                let regex = Regex::new(&glob_to_regex(&pattern)).map_err(|source| {
                    TriggerError::InvalidPattern {
                        pattern: pattern.clone(),
                        source,
                    }
                })?;
                Ok((pattern, regex))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if patterns.is_empty() {
            return Err(TriggerError::EmptyAllowList);
        }
        Ok(Self { patterns })
    }

    pub fn matches(&self, branch: &str) -> bool {
        let hit = self
            .patterns
            .iter()
            .find(|(_, regex)| regex.is_match(branch))
            .map(|(pattern, _)| pattern.as_str());
        debug!(branch, matched = ?hit, "Evaluated branch allow-list");
        hit.is_some()
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|(p, _)| p.as_str())
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::from("^");
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                out.push_str(".*");
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_branch_matches_only_itself() {
        let filter = BranchFilter::new(["main"]).unwrap();
        assert!(filter.matches("main"));
        assert!(!filter.matches("mainline"));
        assert!(!filter.matches("feature/x"));
    }

    #[test]
    fn single_star_stays_within_segment() {
        let filter = BranchFilter::new(["release/*"]).unwrap();
        assert!(filter.matches("release/1.0"));
        assert!(!filter.matches("release/1.0/hotfix"));
    }

    #[test]
    fn double_star_crosses_segments() {
        let filter = BranchFilter::new(["release/**"]).unwrap();
        assert!(filter.matches("release/1.0/hotfix"));
    }

    #[test]
    fn dots_are_literal() {
        let filter = BranchFilter::new(["v1.0"]).unwrap();
        assert!(!filter.matches("v1x0"));
    }

    #[test]
    fn empty_allow_list_is_rejected() {
        let err = BranchFilter::new(Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, TriggerError::EmptyAllowList));
    }

    #[test]
    fn event_strips_full_ref_prefix() {
        let event = TriggerEvent::new("refs/heads/main", "abc123");
        assert_eq!(event.branch, "main");
    }

    #[test]
    fn payload_for_branch_push_yields_event() {
        let payload = r#"{"ref":"refs/heads/main","before":"000","after":"4f2c9e1","deleted":false}"#;
        let event = TriggerEvent::from_push_payload(payload).unwrap().unwrap();
        assert_eq!(event, TriggerEvent::new("main", "4f2c9e1"));
    }

    #[test]
    fn payload_for_tag_push_is_not_a_trigger() {
        let payload = r#"{"ref":"refs/tags/v1.0","after":"4f2c9e1"}"#;
        assert!(TriggerEvent::from_push_payload(payload).unwrap().is_none());
    }

    #[test]
    fn payload_for_branch_deletion_is_not_a_trigger() {
        let payload = r#"{"ref":"refs/heads/main","after":"0000000000000000000000000000000000000000","deleted":true}"#;
        assert!(TriggerEvent::from_push_payload(payload).unwrap().is_none());
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let err = TriggerEvent::from_push_payload("{\"after\": 1}").unwrap_err();
        assert!(matches!(err, TriggerError::Payload(_)));
    }
}
