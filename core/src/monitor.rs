//! Scheduled gap and staleness scan over the canonical view.
//!
//! The monitor keeps no state between runs: every report is derived from
//! the store at scan time.

use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use gapless_state::CanonicalStats;
use serde::Deserialize;
use strum::Display;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::error::GaplessErr;
use crate::error::Result;
use crate::error::SequenceRange;
use crate::store::SequenceStore;

pub const DEFAULT_STALENESS_THRESHOLD: Duration = Duration::from_secs(960);
pub const DEFAULT_SCAN_PAGE_SIZE: u32 = 10_000;
pub const DEFAULT_GAP_REPORT_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Maximum age of the newest block before the store counts as stale.
    pub staleness_threshold: Duration,
    /// Block numbers read per store query while scanning.
    pub scan_page_size: u32,
    /// Lower bound of the scan when no window is given. Defaults to the
    /// lowest stored block.
    pub start_sequence: Option<u64>,
    /// Gaps listed in diagnostics, largest first.
    pub gap_report_limit: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            staleness_threshold: DEFAULT_STALENESS_THRESHOLD,
            scan_page_size: DEFAULT_SCAN_PAGE_SIZE,
            start_sequence: None,
            gap_report_limit: DEFAULT_GAP_REPORT_LIMIT,
        }
    }
}

/// `[monitor]` table in `config.toml`.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct MonitorToml {
    pub staleness_threshold_secs: Option<u64>,
    pub scan_page_size: Option<u32>,
    pub start_sequence: Option<u64>,
    pub gap_report_limit: Option<usize>,
}

impl From<MonitorToml> for MonitorConfig {
    fn from(toml: MonitorToml) -> Self {
        let defaults = MonitorConfig::default();
        Self {
            staleness_threshold: toml
                .staleness_threshold_secs
                .map_or(defaults.staleness_threshold, Duration::from_secs),
            scan_page_size: toml.scan_page_size.unwrap_or(defaults.scan_page_size).max(1),
            start_sequence: toml.start_sequence,
            gap_report_limit: toml.gap_report_limit.unwrap_or(defaults.gap_report_limit),
        }
    }
}

/// Inclusive run of block numbers absent from the canonical view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub start: u64,
    pub end: u64,
}

impl Gap {
    pub fn size(&self) -> u64 {
        self.end.saturating_sub(self.start).saturating_add(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanStatus {
    Healthy,
    GapsFound,
    Stale,
    ScanFailed,
}

/// Single pass over sorted block numbers, comparing each with its predecessor.
#[derive(Debug)]
pub struct GapDetector {
    window: SequenceRange,
    last: Option<u64>,
    gaps: Vec<Gap>,
}

impl GapDetector {
    pub fn new(window: SequenceRange) -> Self {
        Self {
            window,
            last: None,
            gaps: Vec::new(),
        }
    }

    /// Feed the next number. Numbers must arrive strictly ascending.
    pub fn observe(&mut self, number: u64) {
        match self.last {
            None if number > self.window.start => self.gaps.push(Gap {
                start: self.window.start,
                end: number - 1,
            }),
            Some(prev) if number > prev.saturating_add(1) => self.gaps.push(Gap {
                start: prev + 1,
                end: number - 1,
            }),
            _ => {}
        }
        self.last = Some(number);
    }

    /// Close the scan. An empty window is one gap spanning the whole window.
    pub fn finish(mut self) -> Vec<Gap> {
        match self.last {
            None => self.gaps.push(Gap {
                start: self.window.start,
                end: self.window.end,
            }),
            Some(last) if last < self.window.end => self.gaps.push(Gap {
                start: last + 1,
                end: self.window.end,
            }),
            Some(_) => {}
        }
        self.gaps
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    pub window: SequenceRange,
    pub gaps: Vec<Gap>,
    /// `now - max(observed_at)`. `None` when the store holds no blocks.
    pub staleness: Option<Duration>,
    pub staleness_threshold: Duration,
    pub latest_observed_at: Option<DateTime<Utc>>,
    pub stats: CanonicalStats,
    pub status: ScanStatus,
}

impl ScanReport {
    pub fn is_stale(&self) -> bool {
        self.staleness
            .is_none_or(|staleness| staleness > self.staleness_threshold)
    }

    /// Total block positions covered by gaps.
    pub fn missing_in_gaps(&self) -> u64 {
        self.gaps
            .iter()
            .fold(0u64, |total, gap| total.saturating_add(gap.size()))
    }

    /// Up to `limit` gaps, largest first, ties broken by position.
    pub fn largest_gaps(&self, limit: usize) -> Vec<Gap> {
        let mut gaps = self.gaps.clone();
        gaps.sort_by(|a, b| b.size().cmp(&a.size()).then(a.start.cmp(&b.start)));
        gaps.truncate(limit);
        gaps
    }
}

/// Result of one scheduled run.
#[derive(Debug)]
pub enum ScanOutcome {
    Completed(ScanReport),
    Failed(GaplessErr),
}

impl ScanOutcome {
    pub fn status(&self) -> ScanStatus {
        match self {
            ScanOutcome::Completed(report) => report.status,
            ScanOutcome::Failed(_) => ScanStatus::ScanFailed,
        }
    }
}

pub struct ConsistencyMonitor {
    config: MonitorConfig,
}

impl ConsistencyMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Scan `window`, or the stored span when `None`.
    pub async fn scan(
        &self,
        store: &dyn SequenceStore,
        window: Option<SequenceRange>,
    ) -> ScanOutcome {
        self.scan_at(store, window, Utc::now()).await
    }

    pub async fn scan_at(
        &self,
        store: &dyn SequenceStore,
        window: Option<SequenceRange>,
        now: DateTime<Utc>,
    ) -> ScanOutcome {
        match self.build_report(store, window, now).await {
            Ok(report) => {
                match report.status {
                    ScanStatus::Healthy => info!(
                        "scan of {} healthy: {} blocks, staleness {:?}",
                        report.window, report.stats.total, report.staleness
                    ),
                    status => warn!(
                        "scan of {} finished {status}: {} gaps ({} blocks missing), staleness {:?} (threshold {:?})",
                        report.window,
                        report.gaps.len(),
                        report.missing_in_gaps(),
                        report.staleness,
                        report.staleness_threshold
                    ),
                }
                ScanOutcome::Completed(report)
            }
            Err(err) => {
                error!("scan failed: {err}");
                ScanOutcome::Failed(err)
            }
        }
    }

    async fn build_report(
        &self,
        store: &dyn SequenceStore,
        window: Option<SequenceRange>,
        now: DateTime<Utc>,
    ) -> Result<ScanReport> {
        let stats = store.canonical_stats().await?;
        let window = match window {
            Some(window) => window,
            None => self.default_window(&stats)?,
        };

        let page_size = self.config.scan_page_size.max(1);
        let mut detector = GapDetector::new(window);
        let mut after = None;
        loop {
            let page = store
                .scan_canonical(window.start, window.end, after, page_size)
                .await?;
            for number in &page {
                detector.observe(*number);
            }
            match page.last() {
                Some(last) if page.len() == page_size as usize && *last < window.end => {
                    after = Some(*last);
                }
                _ => break,
            }
        }
        let gaps = detector.finish();

        let latest_observed_at = store.max_observed_at().await?;
        let staleness =
            latest_observed_at.map(|latest| (now - latest).to_std().unwrap_or_default());

        let mut report = ScanReport {
            window,
            gaps,
            staleness,
            staleness_threshold: self.config.staleness_threshold,
            latest_observed_at,
            stats,
            status: ScanStatus::Healthy,
        };
        report.status = if report.is_stale() {
            ScanStatus::Stale
        } else if !report.gaps.is_empty() {
            ScanStatus::GapsFound
        } else {
            ScanStatus::Healthy
        };
        Ok(report)
    }

    fn default_window(&self, stats: &CanonicalStats) -> Result<SequenceRange> {
        let start = self.config.start_sequence.or(stats.min).unwrap_or(0);
        let end = stats.max.unwrap_or(start).max(start);
        SequenceRange::new(start, end)
    }
}
