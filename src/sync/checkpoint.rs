use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;

const MARKER_FORMAT: &str = "%Y-%m-%dT%H:%M";

/// Lower bound of an incremental event scan, at minute granularity (UTC).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checkpoint(String);

impl Checkpoint {
    pub fn at(time: DateTime<Utc>) -> Self {
        Self(time.format(MARKER_FORMAT).to_string())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        NaiveDateTime::parse_from_str(trimmed, MARKER_FORMAT).ok()?;
        Some(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Start key for the minute-bucket event view, which is keyed `[minute]`.
    pub fn start_key(&self) -> Value {
        json!([self.0])
    }
}

impl TryFrom<String> for Checkpoint {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw).ok_or_else(|| format!("checkpoint {raw:?} is not YYYY-MM-DDTHH:MM"))
    }
}

impl From<Checkpoint> for String {
    fn from(checkpoint: Checkpoint) -> Self {
        checkpoint.0
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes scan markers with a fixed overlap and remembers the last committed
/// one.
///
/// The marker for the next scan is taken *before* the current scan runs, so an
/// event published while the scan is in flight is still covered next time. The
/// overlap re-delivers up to one window of events; reconciliation absorbs the
/// duplicates.
#[derive(Debug, Clone)]
pub struct CheckpointTracker {
    overlap: Duration,
    committed: Option<Checkpoint>,
}

impl CheckpointTracker {
    pub fn new(overlap_secs: u64, committed: Option<Checkpoint>) -> Self {
        let secs = i64::try_from(overlap_secs.min(86_400)).unwrap_or(86_400);
        Self {
            overlap: Duration::seconds(secs),
            committed,
        }
    }

    pub fn next_checkpoint(&self, now: DateTime<Utc>) -> Checkpoint {
        Checkpoint::at(now - self.overlap)
    }

    pub fn since(&self) -> Option<&Checkpoint> {
        self.committed.as_ref()
    }

    /// Only call once the scan that started at `marker`'s computation has
    /// finished writing.
    pub fn commit(&mut self, marker: Checkpoint) {
        self.committed = Some(marker);
    }
}
