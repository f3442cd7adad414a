use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::QueueError;

// namespaces under the store root
pub const PENDING: &str = "pending";
pub const CLAIMED: &str = "claimed";
pub const COMPLETED: &str = "completed";
pub const DEAD: &str = "dead";
pub const PAYLOADS: &str = "audio";
pub const RESULTS: &str = "texts";
pub const HEALTH: &str = "health";

/// What gets transcribed. Written once at enqueue time and never
/// rewritten; everything that changes during the job's life lives in
/// the entry name instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// store path of the media blob
    pub payload: String,
    /// media length when the producer knows it, drives claim selectors
    pub duration_secs: Option<f64>,
    pub language: Option<String>,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Decoded form of a queue blob name:
/// `{stamp_ms:013}-{attempts:02}-{id}.json`, claimed entries carrying
/// an extra `.{worker}` before the suffix. The zero-padded stamp makes
/// a plain lexicographic sort chronological.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryName {
    pub stamp: DateTime<Utc>,
    pub attempts: u32,
    pub id: String,
}

impl EntryName {
    pub fn encode(&self) -> String {
        format!(
            "{:013}-{:02}-{}.json",
            self.stamp.timestamp_millis(),
            self.attempts,
            self.id
        )
    }

    pub fn encode_claimed(&self, worker: &str) -> String {
        format!(
            "{:013}-{:02}-{}.{}.json",
            self.stamp.timestamp_millis(),
            self.attempts,
            self.id,
            worker
        )
    }

    pub fn decode(name: &str) -> Result<Self, QueueError> {
        let stem = name.strip_suffix(".json").ok_or_else(|| bad(name))?;
        // a dot in the stem means a claimed name leaked into the wrong
        // namespace
        if stem.contains('.') {
            return Err(bad(name));
        }
        Self::decode_stem(stem).ok_or_else(|| bad(name))
    }

    pub fn decode_claimed(name: &str) -> Result<(Self, String), QueueError> {
        let stem = name.strip_suffix(".json").ok_or_else(|| bad(name))?;
        let (core, worker) = stem.rsplit_once('.').ok_or_else(|| bad(name))?;
        if core.contains('.') || !is_safe(worker) {
            return Err(bad(name));
        }
        let entry = Self::decode_stem(core).ok_or_else(|| bad(name))?;
        Ok((entry, worker.to_string()))
    }

    fn decode_stem(stem: &str) -> Option<Self> {
        let mut parts = stem.splitn(3, '-');
        let stamp_ms: i64 = parts.next()?.parse().ok()?;
        let attempts: u32 = parts.next()?.parse().ok()?;
        let id = parts.next()?;
        if !is_safe(id) {
            return None;
        }
        let stamp = DateTime::from_timestamp_millis(stamp_ms)?;
        Some(Self {
            stamp,
            attempts,
            id: id.to_string(),
        })
    }
}

pub fn payload_path(id: &str, ext: &str) -> String {
    format!("{PAYLOADS}/{id}.{ext}")
}

pub fn result_path(id: &str) -> String {
    format!("{RESULTS}/{id}.txt")
}

// ids and worker names end up inside blob names, so the alphabet has
// to stay clear of the codec's separators
fn is_safe(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 128
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

pub fn validate_id(id: &str) -> Result<(), QueueError> {
    if is_safe(id) {
        Ok(())
    } else {
        Err(QueueError::InvalidId(id.to_string()))
    }
}

pub fn validate_worker(worker: &str) -> Result<(), QueueError> {
    if is_safe(worker) {
        Ok(())
    } else {
        Err(QueueError::InvalidId(worker.to_string()))
    }
}

pub fn validate_ext(ext: &str) -> Result<(), QueueError> {
    if !ext.is_empty() && ext.len() <= 16 && ext.bytes().all(|b| b.is_ascii_alphanumeric()) {
        Ok(())
    } else {
        Err(QueueError::InvalidId(ext.to_string()))
    }
}

fn bad(name: &str) -> QueueError {
    QueueError::BadEntryName(name.to_string())
}
