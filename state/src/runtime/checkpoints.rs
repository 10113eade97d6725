use super::*;

impl StateRuntime {
    /// Load the checkpoint for `job_id`, if one was ever written.
    pub async fn get_checkpoint(&self, job_id: &str) -> anyhow::Result<Option<Checkpoint>> {
        let row = sqlx::query(
            r#"
SELECT job_id, last_completed_boundary, run_id, updated_at
FROM backfill_checkpoints
WHERE job_id = ?
            "#,
        )
        .bind(job_id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        row.map(|row| Checkpoint::try_from_row(&row)).transpose()
    }

    /// Create the checkpoint for `job_id` with no committed boundary unless it
    /// already exists, then return the stored row.
    pub async fn begin_checkpoint(
        &self,
        job_id: &str,
        run_id: &str,
    ) -> anyhow::Result<Checkpoint> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
INSERT INTO backfill_checkpoints (
    job_id,
    last_completed_boundary,
    run_id,
    created_at,
    updated_at
) VALUES (?, NULL, ?, ?, ?)
ON CONFLICT(job_id) DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(run_id)
        .bind(now)
        .bind(now)
        .execute(self.pool.as_ref())
        .await?;
        self.get_checkpoint(job_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("checkpoint {job_id} missing after insert"))
    }

    /// Record that every chunk up to and including `boundary` is durable.
    pub async fn set_checkpoint(
        &self,
        job_id: &str,
        boundary: u64,
        run_id: &str,
    ) -> anyhow::Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
INSERT INTO backfill_checkpoints (
    job_id,
    last_completed_boundary,
    run_id,
    created_at,
    updated_at
) VALUES (?, ?, ?, ?, ?)
ON CONFLICT(job_id) DO UPDATE SET
    last_completed_boundary = excluded.last_completed_boundary,
    run_id = excluded.run_id,
    updated_at = excluded.updated_at
            "#,
        )
        .bind(job_id)
        .bind(sequence_to_i64(boundary)?)
        .bind(run_id)
        .bind(now)
        .bind(now)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    /// All checkpoints, most recently updated first.
    pub async fn list_checkpoints(&self) -> anyhow::Result<Vec<Checkpoint>> {
        let rows = sqlx::query(
            r#"
SELECT job_id, last_completed_boundary, run_id, updated_at
FROM backfill_checkpoints
ORDER BY updated_at DESC, job_id ASC
            "#,
        )
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.iter().map(Checkpoint::try_from_row).collect()
    }

    /// Remove a checkpoint. Returns `false` when there was nothing to remove.
    pub async fn delete_checkpoint(&self, job_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM backfill_checkpoints WHERE job_id = ?")
            .bind(job_id)
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected() == 1)
    }
}
