use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque reference to a stored photo. The blob store decides what it means
/// (a file name, an object key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobRef(pub String);

impl BlobRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlobRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One registered face. The identity is the primary key of the gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRecord {
    pub identity: String,
    pub embedding: Vec<f32>,
    pub blob_ref: BlobRef,
    #[serde(with = "chrono::serde::ts_microseconds")]
    pub registered_at: DateTime<Utc>,
}

impl FaceRecord {
    pub fn summary(&self) -> RecordSummary {
        RecordSummary {
            identity: self.identity.clone(),
            blob_ref: self.blob_ref.clone(),
            registered_at: self.registered_at,
        }
    }
}

/// Everything about a record except its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSummary {
    pub identity: String,
    pub blob_ref: BlobRef,
    pub registered_at: DateTime<Utc>,
}

/// Outcome of a nearest-match lookup.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MatchResult {
    /// Nearest record is strictly closer than the threshold.
    Match { identity: String, distance: f32 },
    /// Nearest record is at or beyond the threshold.
    Unknown { distance: f32 },
    /// The gallery holds no records.
    Empty,
}

impl MatchResult {
    pub fn identity(&self) -> Option<&str> {
        match self {
            MatchResult::Match { identity, .. } => Some(identity),
            _ => None,
        }
    }

    pub fn distance(&self) -> Option<f32> {
        match self {
            MatchResult::Match { distance, .. } | MatchResult::Unknown { distance } => {
                Some(*distance)
            }
            MatchResult::Empty => None,
        }
    }
}

/// Trims an identity and rejects it if nothing is left.
///
/// No further normalization: case and inner whitespace are kept as given.
pub fn normalize_identity(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
