use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use strum::Display;

use super::epoch_seconds_to_datetime;
use super::i64_to_sequence;

/// One block as stored in the sequence store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRecord {
    /// Sequence number. Unique in the canonical view.
    pub number: u64,
    /// Block timestamp reported upstream. Drives staleness checks.
    pub observed_at: DateTime<Utc>,
    /// Opaque block fields.
    pub payload: Value,
}

impl BlockRecord {
    pub fn new(number: u64, observed_at: DateTime<Utc>, payload: Value) -> Self {
        Self {
            number,
            observed_at,
            payload,
        }
    }

    pub(crate) fn try_from_row(row: &SqliteRow) -> Result<Self> {
        let payload: String = row.try_get("payload")?;
        Ok(Self {
            number: i64_to_sequence(row.try_get("number")?)?,
            observed_at: epoch_seconds_to_datetime(row.try_get("observed_at")?)?,
            payload: serde_json::from_str(payload.as_str())?,
        })
    }
}

/// Which ingestion path produced a physical write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum WriterKind {
    Backfill,
    Stream,
}
