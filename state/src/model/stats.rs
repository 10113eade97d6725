use anyhow::Result;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::i64_to_sequence;

/// Aggregate coverage of the canonical view.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CanonicalStats {
    pub total: u64,
    pub min: Option<u64>,
    pub max: Option<u64>,
}

impl CanonicalStats {
    pub(crate) fn try_from_row(row: &SqliteRow) -> Result<Self> {
        let total: i64 = row.try_get("total")?;
        let min = row
            .try_get::<Option<i64>, _>("min_number")?
            .map(i64_to_sequence)
            .transpose()?;
        let max = row
            .try_get::<Option<i64>, _>("max_number")?
            .map(i64_to_sequence)
            .transpose()?;
        Ok(Self {
            total: i64_to_sequence(total)?,
            min,
            max,
        })
    }

    /// Number of sequence positions between `min` and `max`, inclusive.
    pub fn expected(&self) -> u64 {
        match (self.min, self.max) {
            (Some(min), Some(max)) => max.saturating_sub(min).saturating_add(1),
            _ => 0,
        }
    }

    pub fn missing(&self) -> u64 {
        self.expected().saturating_sub(self.total)
    }

    /// Share of the covered span actually present, as a percentage.
    pub fn completeness_pct(&self) -> f64 {
        let expected = self.expected();
        if expected == 0 {
            return 0.0;
        }
        self.total as f64 / expected as f64 * 100.0
    }
}
