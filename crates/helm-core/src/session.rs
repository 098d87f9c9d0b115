use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A top-level or nested conversation thread with an agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub slug: String,
    #[serde(rename = "projectID")]
    pub project_id: String,
    pub directory: String,
    #[serde(rename = "parentID", skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub title: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<SessionSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share: Option<ShareRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revert: Option<Revert>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission: Option<serde_json::Value>,
    pub time: SessionTime,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionTime {
    pub created: i64,
    pub updated: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compacting: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived: Option<i64>,
}

/// Cached file-change rollup for a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub additions: u64,
    pub deletions: u64,
    pub files: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diffs: Option<Vec<FileDiff>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileDiff {
    pub file: String,
    pub additions: u64,
    pub deletions: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShareRef {
    pub url: String,
}

/// Credentials for a shared session, returned by the sharing collaborator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShareInfo {
    pub secret: String,
    pub url: String,
}

/// Marker that the session has been rolled back to an earlier message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Revert {
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "partID", skip_serializing_if = "Option::is_none")]
    pub part_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

pub const PARENT_TITLE_PREFIX: &str = "New session - ";
pub const CHILD_TITLE_PREFIX: &str = "Child session - ";

/// Title assigned when the caller supplies none.
pub fn default_title(is_child: bool) -> String {
    let prefix = if is_child { CHILD_TITLE_PREFIX } else { PARENT_TITLE_PREFIX };
    format!("{}{}", prefix, Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"))
}

/// Whether a title still looks auto-generated (used to decide if a model
/// should be asked to produce a real one).
pub fn is_default_title(title: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(
            r"^(New session - |Child session - )\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d{3}Z$",
        )
        .expect("default title pattern")
    });
    pattern.is_match(title)
}
