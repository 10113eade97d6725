//! Storage seams used by the backfill, the streamer and the monitor.

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use gapless_state::BlockRecord;
use gapless_state::CanonicalStats;
use gapless_state::Checkpoint;
use gapless_state::StateRuntime;
use gapless_state::WriterKind;

use crate::error::GaplessErr;
use crate::error::Result;

/// Write and read access to the sequence store.
///
/// Implementations must give insert-or-replace semantics keyed by block
/// number and answer reads from the merged view.
#[async_trait]
pub trait SequenceStore: Send + Sync {
    /// Idempotently write `records`. Returns the number of physical writes.
    async fn upsert(&self, writer: WriterKind, records: &[BlockRecord]) -> Result<u64>;

    /// Sorted distinct block numbers in `[start, end]` greater than `after`.
    async fn scan_canonical(
        &self,
        start: u64,
        end: u64,
        after: Option<u64>,
        limit: u32,
    ) -> Result<Vec<u64>>;

    async fn max_observed_at(&self) -> Result<Option<DateTime<Utc>>>;

    async fn canonical_stats(&self) -> Result<CanonicalStats>;

    /// Drop physical copies that a newer write supersedes. Returns how many
    /// were removed. Never changes what reads return.
    async fn compact(&self) -> Result<u64>;
}

/// Durable backfill progress keyed by job id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Create the job's checkpoint with no committed boundary unless it
    /// exists, and return the stored row.
    async fn begin(&self, job_id: &str, run_id: &str) -> Result<Checkpoint>;

    async fn set(&self, job_id: &str, boundary: u64, run_id: &str) -> Result<()>;
}

#[async_trait]
impl SequenceStore for StateRuntime {
    async fn upsert(&self, writer: WriterKind, records: &[BlockRecord]) -> Result<u64> {
        self.upsert_blocks(writer, records)
            .await
            .map_err(|err| GaplessErr::store("upsert", err))
    }

    async fn scan_canonical(
        &self,
        start: u64,
        end: u64,
        after: Option<u64>,
        limit: u32,
    ) -> Result<Vec<u64>> {
        StateRuntime::scan_canonical(self, start, end, after, limit)
            .await
            .map_err(|err| GaplessErr::store("scan", err))
    }

    async fn max_observed_at(&self) -> Result<Option<DateTime<Utc>>> {
        StateRuntime::max_observed_at(self)
            .await
            .map_err(|err| GaplessErr::store("max_observed_at", err))
    }

    async fn canonical_stats(&self) -> Result<CanonicalStats> {
        StateRuntime::canonical_stats(self)
            .await
            .map_err(|err| GaplessErr::store("stats", err))
    }

    async fn compact(&self) -> Result<u64> {
        StateRuntime::compact(self)
            .await
            .map_err(|err| GaplessErr::store("compact", err))
    }
}

#[async_trait]
impl CheckpointStore for StateRuntime {
    async fn begin(&self, job_id: &str, run_id: &str) -> Result<Checkpoint> {
        self.begin_checkpoint(job_id, run_id)
            .await
            .map_err(|err| GaplessErr::store("begin_checkpoint", err))
    }

    async fn set(&self, job_id: &str, boundary: u64, run_id: &str) -> Result<()> {
        self.set_checkpoint(job_id, boundary, run_id)
            .await
            .map_err(|err| GaplessErr::store("set_checkpoint", err))
    }
}
