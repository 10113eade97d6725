//! Real-time write path that shares the store with the backfill.
//!
//! Both paths write with the same insert-or-replace key, so neither needs to
//! know the other exists. Overlapping writes show up as extra physical copies
//! until compaction and never as errors.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use gapless_state::BlockRecord;
use gapless_state::WriterKind;
use serde::Deserialize;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::error::Result;
use crate::error::SequenceRange;
use crate::heartbeat::LivenessPinger;
use crate::retry::RetryPolicy;
use crate::source::BlockSource;
use crate::store::SequenceStore;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(12);
pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u64 = 3;
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
/// Upper bound on blocks requested per poll when catching up.
const MAX_POLL_SPAN: u64 = 1_000;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub poll_interval: Duration,
    /// How long records may sit in the buffer. Zero writes every poll.
    pub batch_interval: Duration,
    /// Interval for the heartbeat log line, the liveness ping and compaction.
    pub heartbeat_interval: Duration,
    /// Liveness endpoint pinged on every heartbeat.
    pub heartbeat_url: Option<String>,
    /// Consecutive failed polls, or failed flushes, tolerated before giving up.
    pub max_reconnect_attempts: u64,
    /// First block to stream. Defaults to one past the newest stored block.
    pub start_from: Option<u64>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch_interval: DEFAULT_BATCH_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_url: None,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            start_from: None,
        }
    }
}

/// `[stream]` table in `config.toml`.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct StreamToml {
    pub poll_interval_secs: Option<u64>,
    pub batch_interval_secs: Option<u64>,
    pub heartbeat_interval_secs: Option<u64>,
    pub heartbeat_url: Option<String>,
    pub max_reconnect_attempts: Option<u64>,
    pub start_from: Option<u64>,
}

impl From<StreamToml> for StreamConfig {
    fn from(toml: StreamToml) -> Self {
        let defaults = StreamConfig::default();
        Self {
            poll_interval: toml
                .poll_interval_secs
                .map_or(defaults.poll_interval, Duration::from_secs),
            batch_interval: toml
                .batch_interval_secs
                .map_or(defaults.batch_interval, Duration::from_secs),
            heartbeat_interval: toml
                .heartbeat_interval_secs
                .map_or(defaults.heartbeat_interval, Duration::from_secs),
            heartbeat_url: toml.heartbeat_url,
            max_reconnect_attempts: toml
                .max_reconnect_attempts
                .unwrap_or(defaults.max_reconnect_attempts),
            start_from: toml.start_from,
        }
    }
}

/// Buffers streamed records and writes them in batches.
pub struct StreamWriter {
    store: Arc<dyn SequenceStore>,
    buffer: Vec<BlockRecord>,
    batch_interval: Duration,
    last_flush: Instant,
    written: u64,
}

impl StreamWriter {
    pub fn new(store: Arc<dyn SequenceStore>, batch_interval: Duration) -> Self {
        Self {
            store,
            buffer: Vec::new(),
            batch_interval,
            last_flush: Instant::now(),
            written: 0,
        }
    }

    pub fn push(&mut self, record: BlockRecord) {
        self.buffer.push(record);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Physical writes acknowledged so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn should_flush(&self) -> bool {
        !self.buffer.is_empty()
            && (self.batch_interval.is_zero() || self.last_flush.elapsed() >= self.batch_interval)
    }

    /// Write the buffer. On failure the records stay buffered for the next
    /// attempt.
    pub async fn flush(&mut self) -> Result<u64> {
        if self.buffer.is_empty() {
            return Ok(0);
        }
        let batch = std::mem::take(&mut self.buffer);
        match self.store.upsert(WriterKind::Stream, &batch).await {
            Ok(written) => {
                debug!("stream flushed {} records", batch.len());
                self.written = self.written.saturating_add(written);
                self.last_flush = Instant::now();
                Ok(written)
            }
            Err(err) => {
                warn!(
                    "stream flush of {} records failed, keeping them buffered: {err}",
                    batch.len()
                );
                let newer = std::mem::replace(&mut self.buffer, batch);
                self.buffer.extend(newer);
                Err(err)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamSummary {
    pub polls: u64,
    pub records_seen: u64,
    pub records_written: u64,
    pub next_number: Option<u64>,
}

/// Polls the upstream head and streams new blocks into the store.
pub struct Streamer {
    source: Arc<dyn BlockSource>,
    store: Arc<dyn SequenceStore>,
    writer: StreamWriter,
    config: StreamConfig,
    liveness: Option<LivenessPinger>,
    next: Option<u64>,
    summary: StreamSummary,
}

impl Streamer {
    pub fn new(
        source: Arc<dyn BlockSource>,
        store: Arc<dyn SequenceStore>,
        config: StreamConfig,
    ) -> Self {
        let writer = StreamWriter::new(Arc::clone(&store), config.batch_interval);
        Self {
            source,
            store,
            writer,
            next: config.start_from,
            config,
            liveness: None,
            summary: StreamSummary::default(),
        }
    }

    /// Ping `pinger` on every heartbeat while the stream makes progress.
    pub fn with_liveness(mut self, pinger: Option<LivenessPinger>) -> Self {
        self.liveness = pinger;
        self
    }

    /// Fetch everything between the last streamed block and the upstream head.
    ///
    /// Returns the number of records added to the buffer.
    pub async fn poll_once(&mut self) -> Result<u64> {
        let head = self.source.head().await?;
        let next = match self.next {
            Some(next) => next,
            None => {
                let stats = self.store.canonical_stats().await?;
                let next = stats.max.map_or(head, |max| max.saturating_add(1));
                info!("stream starting at block {next} (upstream head {head})");
                next
            }
        };
        self.next = Some(next);
        self.summary.polls += 1;
        if next > head {
            return Ok(0);
        }

        let range = SequenceRange::new(next, head.min(next.saturating_add(MAX_POLL_SPAN - 1)))?;
        let records = self.source.fetch(range).await?;
        let pushed = records.len() as u64;
        if pushed < range.count() {
            warn!(
                "stream fetch of {range} returned {pushed} blocks; the rest are left to the backfill"
            );
        }
        for record in records {
            self.writer.push(record);
        }
        self.summary.records_seen = self.summary.records_seen.saturating_add(pushed);
        self.next = Some(range.end.saturating_add(1));
        Ok(pushed)
    }

    /// Log progress, ping the liveness endpoint and compact the store.
    async fn heartbeat(&self) {
        let status = format!(
            "next={:?} buffered={} written={}",
            self.next,
            self.writer.buffered(),
            self.writer.written()
        );
        info!("stream heartbeat: {status}");
        if let Some(pinger) = &self.liveness {
            pinger.ping(status).await;
        }
        match self.store.compact().await {
            Ok(0) => {}
            Ok(removed) => debug!("stream compacted {removed} superseded copies"),
            Err(err) => warn!("stream compaction failed: {err}"),
        }
    }

    /// Stream until `shutdown` resolves, then write whatever is still buffered.
    ///
    /// Gives up with an error once polling or flushing has failed more than
    /// `max_reconnect_attempts` times in a row.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<StreamSummary>
    where
        F: Future<Output = ()>,
    {
        let reconnect = RetryPolicy {
            max_attempts: self.config.max_reconnect_attempts,
            base_delay: Duration::from_secs(1),
            max_delay: MAX_RECONNECT_DELAY,
        };
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_heartbeat: Option<Instant> = None;
        let mut failures = 0u64;
        let mut flush_failures = 0u64;
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("stream shutting down");
                    break Ok(());
                }
                _ = ticker.tick() => {}
            }

            match self.poll_once().await {
                Ok(_) => failures = 0,
                Err(err) if err.is_retryable() && failures < self.config.max_reconnect_attempts => {
                    failures += 1;
                    let delay = reconnect.backoff(failures);
                    warn!(
                        "stream poll failed: {err}; reconnecting ({failures}/{} in {delay:?})...",
                        self.config.max_reconnect_attempts
                    );
                    tokio::select! {
                        _ = &mut shutdown => break Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
                Err(err) => {
                    error!("stream giving up after {failures} reconnect attempts: {err}");
                    break Err(err);
                }
            }

            if self.writer.should_flush() {
                match self.writer.flush().await {
                    Ok(_) => flush_failures = 0,
                    Err(err)
                        if err.is_retryable()
                            && flush_failures < self.config.max_reconnect_attempts =>
                    {
                        flush_failures += 1;
                        debug!(
                            "deferring flush to next poll ({flush_failures}/{}): {err}",
                            self.config.max_reconnect_attempts
                        );
                    }
                    Err(err) => {
                        error!(
                            "stream giving up after {flush_failures} failed flushes with {} records buffered: {err}",
                            self.writer.buffered()
                        );
                        break Err(err);
                    }
                }
            }

            if last_heartbeat.is_none_or(|last| last.elapsed() >= self.config.heartbeat_interval) {
                self.heartbeat().await;
                last_heartbeat = Some(Instant::now());
            }
        };

        let final_flush = self.writer.flush().await;
        self.summary.records_written = self.writer.written();
        self.summary.next_number = self.next;
        match (result, final_flush) {
            (Err(err), _) => Err(err),
            (Ok(()), Err(err)) => {
                error!(
                    "final stream flush failed; {} records were not written",
                    self.writer.buffered()
                );
                Err(err)
            }
            (Ok(()), Ok(_)) => Ok(self.summary),
        }
    }
}
