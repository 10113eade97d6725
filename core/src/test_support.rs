use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use gapless_state::BlockRecord;
use gapless_state::CanonicalStats;
use gapless_state::Checkpoint;
use gapless_state::WriterKind;
use serde_json::json;

use crate::error::GaplessErr;
use crate::error::Result;
use crate::error::SequenceRange;
use crate::source::BlockSource;
use crate::store::CheckpointStore;
use crate::store::SequenceStore;

pub(crate) fn block_at(number: u64, observed_secs: i64) -> BlockRecord {
    let observed_at = DateTime::<Utc>::from_timestamp(observed_secs, 0).expect("timestamp");
    BlockRecord::new(number, observed_at, json!({ "hash": format!("0x{number:x}") }))
}

pub(crate) fn block(number: u64) -> BlockRecord {
    block_at(
        number,
        1_700_000_000 + i64::try_from(number).expect("small number") * 12,
    )
}

/// Upstream that serves a fixed set of blocks, with injectable failures.
#[derive(Default)]
pub(crate) struct FakeSource {
    blocks: BTreeMap<u64, BlockRecord>,
    failures: Mutex<HashMap<u64, u32>>,
    fail_head: AtomicBool,
    fetched: Mutex<Vec<SequenceRange>>,
}

impl FakeSource {
    pub(crate) fn complete(numbers: impl IntoIterator<Item = u64>) -> Self {
        Self {
            blocks: numbers
                .into_iter()
                .map(|number| (number, block(number)))
                .collect(),
            ..Self::default()
        }
    }

    /// Fail the next `times` fetches whose range starts at `start`.
    pub(crate) fn fail_next(&self, start: u64, times: u32) {
        self.failures
            .lock()
            .expect("failures lock")
            .insert(start, times);
    }

    pub(crate) fn fail_head(&self, fail: bool) {
        self.fail_head.store(fail, Ordering::SeqCst);
    }

    /// Every fetch call, including failed ones.
    pub(crate) fn fetched(&self) -> Vec<SequenceRange> {
        self.fetched.lock().expect("fetched lock").clone()
    }
}

#[async_trait]
impl BlockSource for FakeSource {
    async fn fetch(&self, range: SequenceRange) -> Result<Vec<BlockRecord>> {
        self.fetched.lock().expect("fetched lock").push(range);
        if let Some(remaining) = self
            .failures
            .lock()
            .expect("failures lock")
            .get_mut(&range.start)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(GaplessErr::fetch(range, "injected failure"));
        }
        Ok(self
            .blocks
            .range(range.start..=range.end)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn head(&self) -> Result<u64> {
        if self.fail_head.load(Ordering::SeqCst) {
            let range = SequenceRange { start: 0, end: 0 };
            return Err(GaplessErr::fetch(range, "connection refused"));
        }
        Ok(self.blocks.keys().next_back().copied().unwrap_or(0))
    }
}

/// Canonical view only; physical copies are not modelled.
#[derive(Default)]
pub(crate) struct MemoryStore {
    blocks: Mutex<BTreeMap<u64, BlockRecord>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    scan_calls: AtomicU64,
    compactions: AtomicU64,
}

impl MemoryStore {
    pub(crate) fn insert(&self, record: BlockRecord) {
        self.blocks
            .lock()
            .expect("blocks lock")
            .insert(record.number, record);
    }

    pub(crate) fn numbers(&self) -> Vec<u64> {
        self.blocks.lock().expect("blocks lock").keys().copied().collect()
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn scan_calls(&self) -> u64 {
        self.scan_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn compactions(&self) -> u64 {
        self.compactions.load(Ordering::SeqCst)
    }

    fn check_reads(&self, operation: &'static str) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(GaplessErr::store(operation, anyhow::anyhow!("store unreachable")));
        }
        Ok(())
    }
}

#[async_trait]
impl SequenceStore for MemoryStore {
    async fn upsert(&self, _writer: WriterKind, records: &[BlockRecord]) -> Result<u64> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(GaplessErr::store("upsert", anyhow::anyhow!("disk full")));
        }
        let mut blocks = self.blocks.lock().expect("blocks lock");
        for record in records {
            blocks.insert(record.number, record.clone());
        }
        Ok(records.len() as u64)
    }

    async fn scan_canonical(
        &self,
        start: u64,
        end: u64,
        after: Option<u64>,
        limit: u32,
    ) -> Result<Vec<u64>> {
        self.check_reads("scan")?;
        self.scan_calls.fetch_add(1, Ordering::SeqCst);
        let lower = after.map_or(start, |after| start.max(after + 1));
        if lower > end {
            return Ok(Vec::new());
        }
        Ok(self
            .blocks
            .lock()
            .expect("blocks lock")
            .range(lower..=end)
            .map(|(number, _)| *number)
            .take(limit as usize)
            .collect())
    }

    async fn max_observed_at(&self) -> Result<Option<DateTime<Utc>>> {
        self.check_reads("max_observed_at")?;
        Ok(self
            .blocks
            .lock()
            .expect("blocks lock")
            .values()
            .map(|record| record.observed_at)
            .max())
    }

    async fn canonical_stats(&self) -> Result<CanonicalStats> {
        self.check_reads("stats")?;
        let blocks = self.blocks.lock().expect("blocks lock");
        Ok(CanonicalStats {
            total: blocks.len() as u64,
            min: blocks.keys().next().copied(),
            max: blocks.keys().next_back().copied(),
        })
    }

    async fn compact(&self) -> Result<u64> {
        self.compactions.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }
}

#[derive(Default)]
pub(crate) struct MemoryCheckpoints {
    rows: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpoints {
    pub(crate) fn seed(&self, job_id: &str, boundary: u64) {
        self.rows.lock().expect("rows lock").insert(
            job_id.to_string(),
            Checkpoint {
                job_id: job_id.to_string(),
                last_completed_boundary: Some(boundary),
                run_id: "seeded".to_string(),
                updated_at: Utc::now(),
            },
        );
    }

    pub(crate) fn boundary(&self, job_id: &str) -> Option<u64> {
        self.rows
            .lock()
            .expect("rows lock")
            .get(job_id)
            .and_then(|checkpoint| checkpoint.last_completed_boundary)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpoints {
    async fn begin(&self, job_id: &str, run_id: &str) -> Result<Checkpoint> {
        Ok(self
            .rows
            .lock()
            .expect("rows lock")
            .entry(job_id.to_string())
            .or_insert_with(|| Checkpoint {
                job_id: job_id.to_string(),
                last_completed_boundary: None,
                run_id: run_id.to_string(),
                updated_at: Utc::now(),
            })
            .clone())
    }

    async fn set(&self, job_id: &str, boundary: u64, run_id: &str) -> Result<()> {
        self.rows.lock().expect("rows lock").insert(
            job_id.to_string(),
            Checkpoint {
                job_id: job_id.to_string(),
                last_completed_boundary: Some(boundary),
                run_id: run_id.to_string(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }
}
