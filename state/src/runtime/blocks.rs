use super::*;

/// Rows per INSERT statement; keeps bind counts well under SQLite's variable cap.
const UPSERT_BATCH_ROWS: usize = 1_000;

impl StateRuntime {
    /// Append one physical write per record inside a single transaction.
    ///
    /// Writing a block number that already exists is not an error: the new
    /// copy supersedes the old one in the canonical view and the old copy is
    /// removed by [`StateRuntime::compact`]. Returns the number of rows written.
    pub async fn upsert_blocks(
        &self,
        writer: WriterKind,
        records: &[BlockRecord],
    ) -> anyhow::Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let writer = writer.to_string();
        let written_at = Utc::now().timestamp();
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            rows.push((
                sequence_to_i64(record.number)?,
                datetime_to_epoch_seconds(record.observed_at),
                serde_json::to_string(&record.payload)?,
            ));
        }

        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for batch in rows.chunks(UPSERT_BATCH_ROWS) {
            let mut builder = QueryBuilder::<Sqlite>::new(
                "INSERT INTO block_writes (number, observed_at, writer, payload, written_at) ",
            );
            builder.push_values(batch, |mut row, (number, observed_at, payload)| {
                row.push_bind(*number)
                    .push_bind(*observed_at)
                    .push_bind(writer.as_str())
                    .push_bind(payload.as_str())
                    .push_bind(written_at);
            });
            let result = builder.build().execute(&mut *tx).await?;
            written = written.saturating_add(result.rows_affected());
        }
        tx.commit().await?;
        Ok(written)
    }

    /// Sorted distinct block numbers in `[start, end]` from the canonical view,
    /// starting after `after` when given, at most `limit` entries.
    pub async fn scan_canonical(
        &self,
        start: u64,
        end: u64,
        after: Option<u64>,
        limit: u32,
    ) -> anyhow::Result<Vec<u64>> {
        let lower = match after {
            Some(after) => sequence_to_i64(after)?.saturating_add(1).max(sequence_to_i64(start)?),
            None => sequence_to_i64(start)?,
        };
        let rows = sqlx::query(
            r#"
SELECT number
FROM canonical_blocks
WHERE number >= ? AND number <= ?
ORDER BY number ASC
LIMIT ?
            "#,
        )
        .bind(lower)
        .bind(sequence_to_i64(end)?)
        .bind(i64::from(limit))
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.into_iter()
            .map(|row| crate::model::i64_to_sequence(row.try_get("number")?))
            .collect()
    }

    /// Canonical copy of a single block, if present.
    pub async fn get_block(&self, number: u64) -> anyhow::Result<Option<BlockRecord>> {
        let row = sqlx::query(
            r#"
SELECT number, observed_at, payload
FROM canonical_blocks
WHERE number = ?
            "#,
        )
        .bind(sequence_to_i64(number)?)
        .fetch_optional(self.pool.as_ref())
        .await?;
        row.map(|row| BlockRecord::try_from_row(&row)).transpose()
    }

    /// Count of canonical blocks in `[start, end]`.
    pub async fn count_canonical(&self, start: u64, end: u64) -> anyhow::Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
SELECT COUNT(*)
FROM canonical_blocks
WHERE number >= ? AND number <= ?
            "#,
        )
        .bind(sequence_to_i64(start)?)
        .bind(sequence_to_i64(end)?)
        .fetch_one(self.pool.as_ref())
        .await?;
        crate::model::i64_to_sequence(count)
    }

    /// Latest `observed_at` across the canonical view. `None` when empty.
    pub async fn max_observed_at(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(observed_at) FROM canonical_blocks")
                .fetch_one(self.pool.as_ref())
                .await?;
        max.map(epoch_seconds_to_datetime).transpose()
    }

    pub async fn canonical_stats(&self) -> anyhow::Result<CanonicalStats> {
        let row = sqlx::query(
            r#"
SELECT
    COUNT(*) AS total,
    MIN(number) AS min_number,
    MAX(number) AS max_number
FROM canonical_blocks
            "#,
        )
        .fetch_one(self.pool.as_ref())
        .await?;
        CanonicalStats::try_from_row(&row)
    }

    /// Number of physical copies, including ones superseded but not yet compacted.
    pub async fn raw_write_count(&self) -> anyhow::Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM block_writes")
            .fetch_one(self.pool.as_ref())
            .await?;
        crate::model::i64_to_sequence(count)
    }

    /// Delete every physical copy that is not the canonical one for its number.
    ///
    /// Returns the number of copies removed.
    pub async fn compact(&self) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
DELETE FROM block_writes
WHERE write_seq NOT IN (
    SELECT MAX(write_seq)
    FROM block_writes
    GROUP BY number
)
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;
        Ok(result.rows_affected())
    }
}
