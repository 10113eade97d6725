//! Splits a historical range into memory-bounded chunks.
//!
//! Chunks follow calendar units (one year by default) so that each chunk's
//! real footprint stays close to its estimate even though block density
//! changes across the chain's history. A unit whose estimate exceeds the
//! ceiling is halved until every piece fits.

use chrono::Months;
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::debug;

use crate::error::GaplessErr;
use crate::error::Result;
use crate::error::SequenceRange;

pub const DEFAULT_BYTES_PER_RECORD: u64 = 100;
pub const DEFAULT_COLUMNS: u64 = 11;
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 4 * 1024 * 1024 * 1024;
pub const DEFAULT_SAFETY_MARGIN: f64 = 0.8;
/// Roughly one year of 12-second blocks.
pub const DEFAULT_UNIT_RECORDS: u64 = 2_628_000;

/// First block of a calendar unit.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarAnchor {
    pub unit_start: NaiveDate,
    pub first_sequence: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannerConfig {
    /// Estimated bytes per field of one record.
    pub bytes_per_record: u64,
    /// Number of fields per record.
    pub columns: u64,
    /// Hard memory limit of the process running the backfill.
    pub memory_limit_bytes: u64,
    /// Fraction of `memory_limit_bytes` a single chunk may occupy.
    pub safety_margin: f64,
    /// Known unit boundaries, in any order.
    pub anchors: Vec<CalendarAnchor>,
    /// Unit length used after the last anchor, or everywhere when there are none.
    pub nominal_unit_records: u64,
    /// Explicit sub-chunking threshold. Clamped to what the ceiling allows.
    pub chunk_records: Option<u64>,
    /// When false, an oversized unit is a configuration error instead of
    /// being halved.
    pub subdivide: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            bytes_per_record: DEFAULT_BYTES_PER_RECORD,
            columns: DEFAULT_COLUMNS,
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            anchors: Vec::new(),
            nominal_unit_records: DEFAULT_UNIT_RECORDS,
            chunk_records: None,
            subdivide: true,
        }
    }
}

/// `[planner]` table in `config.toml`.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PlannerToml {
    pub bytes_per_record: Option<u64>,
    pub columns: Option<u64>,
    pub memory_limit_bytes: Option<u64>,
    pub safety_margin: Option<f64>,
    pub nominal_unit_records: Option<u64>,
    pub chunk_records: Option<u64>,
    pub subdivide: Option<bool>,
    #[serde(default)]
    pub calendar_units: Vec<CalendarAnchor>,
}

impl From<PlannerToml> for PlannerConfig {
    fn from(toml: PlannerToml) -> Self {
        let defaults = PlannerConfig::default();
        Self {
            bytes_per_record: toml.bytes_per_record.unwrap_or(defaults.bytes_per_record),
            columns: toml.columns.unwrap_or(defaults.columns),
            memory_limit_bytes: toml
                .memory_limit_bytes
                .unwrap_or(defaults.memory_limit_bytes),
            safety_margin: toml.safety_margin.unwrap_or(defaults.safety_margin),
            anchors: toml.calendar_units,
            nominal_unit_records: toml
                .nominal_unit_records
                .unwrap_or(defaults.nominal_unit_records),
            chunk_records: toml.chunk_records,
            subdivide: toml.subdivide.unwrap_or(defaults.subdivide),
        }
    }
}

/// Contiguous slice of the range processed as one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub range_start: u64,
    pub range_end: u64,
    pub estimated_bytes: u64,
}

impl Chunk {
    pub fn range(&self) -> SequenceRange {
        SequenceRange {
            start: self.range_start,
            end: self.range_end,
        }
    }

    pub fn records(&self) -> u64 {
        self.range().count()
    }
}

#[derive(Debug, Clone, Copy)]
struct CalendarUnit {
    start: Option<NaiveDate>,
    range: SequenceRange,
}

#[derive(Debug, Clone)]
pub struct ChunkPlanner {
    config: PlannerConfig,
    bytes_per_row: u64,
    ceiling: u64,
    threshold_records: u64,
}

impl ChunkPlanner {
    /// Validate `config` and derive the per-chunk ceiling.
    ///
    /// Fails when a single record already exceeds the ceiling.
    pub fn new(mut config: PlannerConfig) -> Result<Self> {
        if config.bytes_per_record == 0 || config.columns == 0 {
            return Err(GaplessErr::Config(
                "bytes_per_record and columns must be positive".to_string(),
            ));
        }
        if !(config.safety_margin > 0.0 && config.safety_margin <= 1.0) {
            return Err(GaplessErr::Config(format!(
                "safety_margin must be in (0, 1], got {}",
                config.safety_margin
            )));
        }
        if config.nominal_unit_records == 0 {
            return Err(GaplessErr::Config(
                "nominal_unit_records must be positive".to_string(),
            ));
        }
        if config.chunk_records == Some(0) {
            return Err(GaplessErr::Config(
                "chunk_records must be positive".to_string(),
            ));
        }

        let bytes_per_row = config
            .bytes_per_record
            .checked_mul(config.columns)
            .ok_or_else(|| {
                GaplessErr::Config("bytes_per_record * columns overflows".to_string())
            })?;
        let ceiling = (config.memory_limit_bytes as f64 * config.safety_margin) as u64;
        if bytes_per_row > ceiling {
            return Err(GaplessErr::Config(format!(
                "a single record needs {bytes_per_row} bytes but the memory ceiling is {ceiling} bytes"
            )));
        }
        let ceiling_records = ceiling / bytes_per_row;
        let threshold_records = config
            .chunk_records
            .map_or(ceiling_records, |records| records.min(ceiling_records));

        config.anchors.sort_by_key(|anchor| anchor.first_sequence);
        config
            .anchors
            .dedup_by_key(|anchor| anchor.first_sequence);

        Ok(Self {
            config,
            bytes_per_row,
            ceiling,
            threshold_records,
        })
    }

    /// Largest estimated footprint any planned chunk may have.
    pub fn memory_ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Largest record count any planned chunk may have.
    pub fn max_records_per_chunk(&self) -> u64 {
        self.threshold_records
    }

    /// Plan ordered, non-overlapping chunks that exactly cover `range`.
    pub fn plan(&self, range: SequenceRange) -> Result<Vec<Chunk>> {
        let mut chunks = Vec::new();
        let mut cursor = range.start;
        loop {
            let unit = self.unit_containing(cursor);
            let piece = SequenceRange {
                start: cursor,
                end: unit.range.end.min(range.end),
            };
            if piece.count() > self.threshold_records {
                if !self.config.subdivide {
                    return Err(GaplessErr::Config(format!(
                        "calendar unit {piece} holds {} records, above the {} record limit, and subdivision is disabled",
                        piece.count(),
                        self.threshold_records
                    )));
                }
                debug!(
                    "subdividing unit {piece} (starting {:?}): {} records over limit {}",
                    unit.start,
                    piece.count(),
                    self.threshold_records
                );
                self.halve_into(piece, &mut chunks);
            } else {
                chunks.push(self.chunk_for(piece));
            }
            if piece.end >= range.end {
                break;
            }
            cursor = piece.end + 1;
        }
        Ok(chunks)
    }

    fn chunk_for(&self, range: SequenceRange) -> Chunk {
        Chunk {
            range_start: range.start,
            range_end: range.end,
            estimated_bytes: range.count().saturating_mul(self.bytes_per_row),
        }
    }

    fn halve_into(&self, range: SequenceRange, chunks: &mut Vec<Chunk>) {
        if range.count() <= self.threshold_records {
            chunks.push(self.chunk_for(range));
            return;
        }
        let left_len = range.count().div_ceil(2);
        let split = range.start + left_len - 1;
        self.halve_into(
            SequenceRange {
                start: range.start,
                end: split,
            },
            chunks,
        );
        self.halve_into(
            SequenceRange {
                start: split + 1,
                end: range.end,
            },
            chunks,
        );
    }

    fn unit_containing(&self, number: u64) -> CalendarUnit {
        let anchors = &self.config.anchors;
        let nominal = self.config.nominal_unit_records;
        let idx = anchors.partition_point(|anchor| anchor.first_sequence <= number);
        if idx == 0 {
            return match anchors.first() {
                Some(first) => CalendarUnit {
                    start: None,
                    range: SequenceRange {
                        start: 0,
                        end: first.first_sequence - 1,
                    },
                },
                None => {
                    let start = number / nominal * nominal;
                    CalendarUnit {
                        start: None,
                        range: SequenceRange {
                            start,
                            end: start.saturating_add(nominal - 1),
                        },
                    }
                }
            };
        }

        let anchor = anchors[idx - 1];
        if let Some(next) = anchors.get(idx) {
            return CalendarUnit {
                start: Some(anchor.unit_start),
                range: SequenceRange {
                    start: anchor.first_sequence,
                    end: next.first_sequence - 1,
                },
            };
        }

        let offset = (number - anchor.first_sequence) / nominal;
        let start = anchor.first_sequence + offset * nominal;
        let unit_start = u32::try_from(offset)
            .ok()
            .and_then(|years| years.checked_mul(12))
            .and_then(|months| anchor.unit_start.checked_add_months(Months::new(months)));
        CalendarUnit {
            start: unit_start,
            range: SequenceRange {
                start,
                end: start.saturating_add(nominal - 1),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn anchor(year: i32, first_sequence: u64) -> CalendarAnchor {
        CalendarAnchor {
            unit_start: NaiveDate::from_ymd_opt(year, 1, 1).expect("date"),
            first_sequence,
        }
    }

    fn assert_exact_cover(chunks: &[Chunk], range: SequenceRange) {
        assert_eq!(chunks.first().map(|chunk| chunk.range_start), Some(range.start));
        assert_eq!(chunks.last().map(|chunk| chunk.range_end), Some(range.end));
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].range_end + 1, pair[1].range_start);
        }
    }

    #[test]
    fn single_record_over_ceiling_is_a_config_error() {
        let err = ChunkPlanner::new(PlannerConfig {
            bytes_per_record: 1_000,
            columns: 11,
            memory_limit_bytes: 10_000,
            ..PlannerConfig::default()
        })
        .expect_err("record larger than ceiling");
        assert!(matches!(err, GaplessErr::Config(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn default_ceiling_is_eighty_percent_of_limit() {
        let planner = ChunkPlanner::new(PlannerConfig::default()).expect("planner");
        assert_eq!(planner.memory_ceiling(), 3_435_973_836);
        assert_eq!(planner.max_records_per_chunk(), 3_435_973_836 / 1_100);
    }

    #[test]
    fn chunks_follow_calendar_units_with_short_tail() {
        let planner = ChunkPlanner::new(PlannerConfig {
            anchors: vec![anchor(2016, 1), anchor(2017, 335), anchor(2018, 668)],
            nominal_unit_records: 334,
            ..PlannerConfig::default()
        })
        .expect("planner");
        let range = SequenceRange::new(1, 1000).expect("range");

        let chunks = planner.plan(range).expect("plan");

        let bounds: Vec<_> = chunks
            .iter()
            .map(|chunk| (chunk.range_start, chunk.range_end))
            .collect();
        assert_eq!(bounds, vec![(1, 334), (335, 667), (668, 1000)]);
        assert_eq!(chunks[0].estimated_bytes, 334 * 1_100);
    }

    #[test]
    fn nominal_units_continue_after_last_anchor() {
        let planner = ChunkPlanner::new(PlannerConfig {
            anchors: vec![anchor(2020, 100)],
            nominal_unit_records: 50,
            ..PlannerConfig::default()
        })
        .expect("planner");
        let range = SequenceRange::new(120, 260).expect("range");

        let chunks = planner.plan(range).expect("plan");

        let bounds: Vec<_> = chunks
            .iter()
            .map(|chunk| (chunk.range_start, chunk.range_end))
            .collect();
        assert_eq!(bounds, vec![(120, 149), (150, 199), (200, 249), (250, 260)]);
        let unit = planner.unit_containing(230);
        assert_eq!(unit.start, NaiveDate::from_ymd_opt(2022, 1, 1));
    }

    #[test]
    fn dense_units_are_halved_until_under_ceiling() {
        // Each record costs 1_100 bytes; the ceiling fits 909 of them.
        let planner = ChunkPlanner::new(PlannerConfig {
            memory_limit_bytes: 1_250_000,
            nominal_unit_records: 2_628_000,
            ..PlannerConfig::default()
        })
        .expect("planner");
        let range = SequenceRange::new(0, 9_999).expect("range");

        let chunks = planner.plan(range).expect("plan");

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(
                chunk.estimated_bytes <= planner.memory_ceiling(),
                "chunk {chunk:?} exceeds ceiling {}",
                planner.memory_ceiling()
            );
            assert_eq!(chunk.estimated_bytes, chunk.records() * 1_100);
        }
        assert_exact_cover(&chunks, range);
    }

    #[test]
    fn explicit_threshold_forces_subdivision() {
        let planner = ChunkPlanner::new(PlannerConfig {
            chunk_records: Some(250),
            ..PlannerConfig::default()
        })
        .expect("planner");
        let range = SequenceRange::new(1, 1000).expect("range");

        let chunks = planner.plan(range).expect("plan");

        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|chunk| chunk.records() <= 250));
        assert_exact_cover(&chunks, range);
    }

    #[test]
    fn disabled_subdivision_rejects_oversized_unit() {
        let planner = ChunkPlanner::new(PlannerConfig {
            chunk_records: Some(100),
            subdivide: false,
            ..PlannerConfig::default()
        })
        .expect("planner");
        let err = planner
            .plan(SequenceRange::new(0, 500).expect("range"))
            .expect_err("oversized unit");
        assert!(matches!(err, GaplessErr::Config(_)));
    }

    #[test]
    fn range_before_first_anchor_is_one_unit() {
        let planner = ChunkPlanner::new(PlannerConfig {
            anchors: vec![anchor(2016, 10)],
            nominal_unit_records: 5,
            ..PlannerConfig::default()
        })
        .expect("planner");
        let chunks = planner
            .plan(SequenceRange::new(0, 12).expect("range"))
            .expect("plan");
        let bounds: Vec<_> = chunks
            .iter()
            .map(|chunk| (chunk.range_start, chunk.range_end))
            .collect();
        assert_eq!(bounds, vec![(0, 9), (10, 12)]);
    }
}
