//! Domain types for the tandas registry.
//!
//! Collections are never `null`: a missing or `null` collection in the
//! append-log decodes to an empty one, and is always written back as `[]`.
//! Timestamps are kept as the opaque strings the front-end wrote.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

/// Number of most recent runs considered by [`flakiness_score`].
pub const FLAKINESS_WINDOW: usize = 10;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed record identifier (`td-1a2b3c4d`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a record. Records are never deleted by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    #[default]
    Active,
    Flaky,
    Deprecated,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Active => "active",
            RecordStatus::Flaky => "flaky",
            RecordStatus::Deprecated => "deprecated",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "flaky" => Ok(Self::Flaky),
            "deprecated" => Ok(Self::Deprecated),
            other => Err(format!(
                "unknown status '{other}'; expected: active, flaky, deprecated"
            )),
        }
    }
}

/// Result of a single test run.
///
/// Unknown values are carried verbatim in [`RunOutcome::Other`] so they
/// survive an import/export cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RunOutcome {
    Pass,
    Fail,
    Skip,
    Error,
    Other(String),
}

impl RunOutcome {
    pub fn as_str(&self) -> &str {
        match self {
            RunOutcome::Pass => "pass",
            RunOutcome::Fail => "fail",
            RunOutcome::Skip => "skip",
            RunOutcome::Error => "error",
            RunOutcome::Other(other) => other,
        }
    }

    /// Only `fail` counts against the flakiness score.
    pub fn is_failure(&self) -> bool {
        matches!(self, RunOutcome::Fail)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for RunOutcome {
    fn from(s: String) -> Self {
        match s.as_str() {
            "pass" => Self::Pass,
            "fail" => Self::Fail,
            "skip" => Self::Skip,
            "error" => Self::Error,
            _ => Self::Other(s),
        }
    }
}

impl From<&str> for RunOutcome {
    fn from(s: &str) -> Self {
        Self::from(s.to_owned())
    }
}

impl From<RunOutcome> for String {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Other(other) => other,
            known => known.as_str().to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// A timestamped note attached to a record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Note {
    pub ts: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

/// One entry of a record's run history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    #[serde(default)]
    pub ts: String,
    pub result: RunOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    /// Path to the trace artifact captured for this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

/// A test-case record ("tanda"): one line of the append-log, one row of the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: RecordStatus,
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub file: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub covers: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub depends_on: Vec<RecordId>,
    #[serde(default, deserialize_with = "notes_or_legacy_text")]
    pub notes: Vec<Note>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub run_history: Vec<RunResult>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub created_at: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub updated_at: String,
}

/// Cache-only columns derived from a record's run history.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordStats {
    pub flakiness_score: f64,
    pub last_run_at: Option<String>,
    pub last_run_result: Option<RunOutcome>,
}

impl Record {
    /// A fresh `active` record with every collection empty.
    pub fn new(id: impl Into<RecordId>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            status: RecordStatus::default(),
            file: None,
            covers: Vec::new(),
            depends_on: Vec::new(),
            notes: Vec::new(),
            run_history: Vec::new(),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    /// The most recent run, if any.
    pub fn last_run(&self) -> Option<&RunResult> {
        self.run_history.last()
    }

    pub fn stats(&self) -> RecordStats {
        let last = self.last_run();
        RecordStats {
            flakiness_score: flakiness_score(&self.run_history),
            last_run_at: last.map(|run| run.ts.clone()),
            last_run_result: last.map(|run| run.result.clone()),
        }
    }
}

/// Fraction of failures over the last `min(FLAKINESS_WINDOW, len)` runs.
///
/// An empty history scores `0.0`.
pub fn flakiness_score(history: &[RunResult]) -> f64 {
    if history.is_empty() {
        return 0.0;
    }
    let window = &history[history.len().saturating_sub(FLAKINESS_WINDOW)..];
    let failures = window.iter().filter(|run| run.result.is_failure()).count();
    failures as f64 / window.len() as f64
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.filter(|value| !value.is_empty()))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NotesRepr {
    List(Vec<Note>),
    Text(String),
}

/// Older front-ends stored `notes` as one free-form string.
fn notes_or_legacy_text<'de, D>(deserializer: D) -> Result<Vec<Note>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<NotesRepr>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(NotesRepr::List(notes)) => notes,
        Some(NotesRepr::Text(text)) if text.is_empty() => Vec::new(),
        Some(NotesRepr::Text(text)) => vec![Note {
            ts: String::new(),
            kind: "note".to_string(),
            text,
        }],
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
