use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::epoch_seconds_to_datetime;
use super::i64_to_sequence;

/// Persisted progress marker for one logical backfill job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub job_id: String,
    /// End boundary of the most recently committed chunk. `None` until the
    /// job's first chunk commits.
    pub last_completed_boundary: Option<u64>,
    /// Run that created or last advanced the checkpoint.
    pub run_id: String,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub(crate) fn try_from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            job_id: row.try_get("job_id")?,
            last_completed_boundary: row
                .try_get::<Option<i64>, _>("last_completed_boundary")?
                .map(i64_to_sequence)
                .transpose()?,
            run_id: row.try_get("run_id")?,
            updated_at: epoch_seconds_to_datetime(row.try_get("updated_at")?)?,
        })
    }
}
