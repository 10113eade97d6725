mod block;
mod checkpoint;
mod stats;

pub use block::BlockRecord;
pub use block::WriterKind;
pub use checkpoint::Checkpoint;
pub use stats::CanonicalStats;

use anyhow::Result;
use chrono::DateTime;
use chrono::Utc;

pub(crate) fn datetime_to_epoch_seconds(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

pub(crate) fn epoch_seconds_to_datetime(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| anyhow::anyhow!("invalid unix timestamp: {secs}"))
}

/// SQLite integers are signed; sequence numbers above `i64::MAX` cannot be stored.
pub(crate) fn sequence_to_i64(number: u64) -> Result<i64> {
    i64::try_from(number).map_err(|_| anyhow::anyhow!("sequence number out of range: {number}"))
}

pub(crate) fn i64_to_sequence(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow::anyhow!("negative sequence number in store: {value}"))
}
