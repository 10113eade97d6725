//! Sequential, checkpointed bulk load of a historical range.

use gapless_state::BlockRecord;
use gapless_state::WriterKind;
use tracing::error;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::error::GaplessErr;
use crate::error::Result;
use crate::error::SequenceRange;
use crate::planner::Chunk;
use crate::planner::ChunkPlanner;
use crate::retry::RetryPolicy;
use crate::source::BlockSource;
use crate::store::CheckpointStore;
use crate::store::SequenceStore;

/// Outcome of one [`BackfillOrchestrator::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillSummary {
    pub job_id: String,
    pub run_id: String,
    /// Checkpoint found at start, if the run resumed an earlier one.
    pub resumed_from: Option<u64>,
    pub chunks_planned: usize,
    pub chunks_committed: usize,
    pub records_written: u64,
    /// Superseded physical copies removed after the last chunk committed.
    pub copies_compacted: u64,
    pub last_completed_boundary: Option<u64>,
}

/// Block numbers named in a short-chunk error.
const MISSING_SAMPLE_LIMIT: usize = 10;

pub struct BackfillOrchestrator {
    planner: ChunkPlanner,
    retry: RetryPolicy,
    job_id: Option<String>,
}

impl BackfillOrchestrator {
    pub fn new(planner: ChunkPlanner, retry: RetryPolicy) -> Self {
        Self {
            planner,
            retry,
            job_id: None,
        }
    }

    /// Use `job_id` for the checkpoint instead of one derived from the range.
    pub fn with_job_id(mut self, job_id: Option<String>) -> Self {
        self.job_id = job_id;
        self
    }

    pub fn default_job_id(range: SequenceRange) -> String {
        format!("backfill:{}-{}", range.start, range.end)
    }

    /// Load `range` from `source` into `sink`, one chunk at a time.
    ///
    /// Resumes after the stored checkpoint when there is one. The checkpoint
    /// only advances once every block of a chunk has been written, so an
    /// interrupted run repeats at most one chunk. A chunk the upstream cannot
    /// serve in full is retried and then fails the run.
    pub async fn run(
        &self,
        range: SequenceRange,
        source: &dyn BlockSource,
        sink: &dyn SequenceStore,
        checkpoints: &dyn CheckpointStore,
    ) -> Result<BackfillSummary> {
        let job_id = self
            .job_id
            .clone()
            .unwrap_or_else(|| Self::default_job_id(range));
        let run_id = Uuid::new_v4().to_string();

        let checkpoint = self
            .retry
            .run("read checkpoint", range, || checkpoints.begin(&job_id, &run_id))
            .await?;
        let resumed_from = checkpoint.last_completed_boundary;
        let mut summary = BackfillSummary {
            job_id: job_id.clone(),
            run_id: run_id.clone(),
            resumed_from,
            chunks_planned: 0,
            chunks_committed: 0,
            records_written: 0,
            copies_compacted: 0,
            last_completed_boundary: resumed_from,
        };

        let start = match resumed_from {
            Some(boundary) if boundary >= range.end => {
                info!("backfill {job_id} already complete through {boundary}");
                return Ok(summary);
            }
            Some(boundary) if boundary >= range.start => {
                info!("backfill {job_id} resuming after checkpoint {boundary}");
                boundary + 1
            }
            Some(boundary) => {
                warn!(
                    "backfill {job_id} checkpoint {boundary} is before range start {}; starting from the beginning",
                    range.start
                );
                range.start
            }
            None => range.start,
        };

        let remaining = SequenceRange {
            start,
            end: range.end,
        };
        let chunks = self.planner.plan(remaining)?;
        summary.chunks_planned = chunks.len();
        info!(
            "backfill {job_id} run {run_id}: {} chunks over {remaining}, ceiling {} bytes",
            chunks.len(),
            self.planner.memory_ceiling()
        );

        for (idx, chunk) in chunks.iter().enumerate() {
            info!(
                "backfill {job_id} chunk {}/{}: {} (~{} bytes)",
                idx + 1,
                chunks.len(),
                chunk.range(),
                chunk.estimated_bytes
            );
            match self
                .process_chunk(&job_id, &run_id, chunk, source, sink, checkpoints)
                .await
            {
                Ok(written) => {
                    summary.chunks_committed += 1;
                    summary.records_written = summary.records_written.saturating_add(written);
                    summary.last_completed_boundary = Some(chunk.range_end);
                }
                Err(err) => {
                    error!(
                        "backfill {job_id} aborted at chunk {}; checkpoint remains at {:?}: {err}",
                        chunk.range(),
                        summary.last_completed_boundary
                    );
                    return Err(err);
                }
            }
        }

        if summary.chunks_committed > 0 {
            match sink.compact().await {
                Ok(removed) => summary.copies_compacted = removed,
                Err(err) => warn!("backfill {job_id} left superseded copies in place: {err}"),
            }
        }

        info!(
            "backfill {job_id} finished: committed={}, written={}, compacted={}",
            summary.chunks_committed, summary.records_written, summary.copies_compacted
        );
        Ok(summary)
    }

    async fn process_chunk(
        &self,
        job_id: &str,
        run_id: &str,
        chunk: &Chunk,
        source: &dyn BlockSource,
        sink: &dyn SequenceStore,
        checkpoints: &dyn CheckpointStore,
    ) -> Result<u64> {
        let range = chunk.range();
        let records = self
            .retry
            .run("fetch", range, || async move {
                let records = prepare_chunk(range, source.fetch(range).await?);
                match describe_missing(range, &records) {
                    Some(message) => {
                        warn!("backfill {job_id} chunk {range}: {message}");
                        Err(GaplessErr::fetch(range, message))
                    }
                    None => Ok(records),
                }
            })
            .await?;

        let written = self
            .retry
            .run("upsert", range, || sink.upsert(WriterKind::Backfill, &records))
            .await?;
        drop(records);

        self.retry
            .run("write checkpoint", range, || {
                checkpoints.set(job_id, range.end, run_id)
            })
            .await?;
        Ok(written)
    }
}

/// Names the block numbers absent from a prepared chunk, or `None` when the
/// chunk is complete. `records` must come from [`prepare_chunk`].
fn describe_missing(range: SequenceRange, records: &[BlockRecord]) -> Option<String> {
    let missing = range.count().saturating_sub(records.len() as u64);
    if missing == 0 {
        return None;
    }
    let mut present = records.iter().map(|record| record.number).peekable();
    let mut sample = Vec::new();
    for number in range.start..=range.end {
        if present.next_if_eq(&number).is_some() {
            continue;
        }
        sample.push(number.to_string());
        if sample.len() == MISSING_SAMPLE_LIMIT {
            break;
        }
    }
    let more = if missing > sample.len() as u64 { ", ..." } else { "" };
    Some(format!(
        "upstream returned no data for {missing} blocks: {}{more}",
        sample.join(", ")
    ))
}

/// Order records by number, keep the last copy of any repeated number, and
/// drop anything outside the chunk.
fn prepare_chunk(range: SequenceRange, mut records: Vec<BlockRecord>) -> Vec<BlockRecord> {
    let before = records.len();
    records.retain(|record| range.contains(record.number));
    let outside = before - records.len();
    if outside > 0 {
        warn!("dropping {outside} records outside chunk {range}");
    }
    records.reverse();
    records.sort_by_key(|record| record.number);
    records.dedup_by_key(|record| record.number);
    records
}
