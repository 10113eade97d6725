use crate::BlockRecord;
use crate::CanonicalStats;
use crate::Checkpoint;
use crate::STATE_DB_FILENAME;
use crate::STATE_DB_VERSION;
use crate::WriterKind;
use crate::migrations::MIGRATOR;
use crate::model::datetime_to_epoch_seconds;
use crate::model::epoch_seconds_to_datetime;
use crate::model::sequence_to_i64;
use chrono::DateTime;
use chrono::Utc;
use log::LevelFilter;
use sqlx::ConnectOptions;
use sqlx::QueryBuilder;
use sqlx::Row;
use sqlx::Sqlite;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::sqlite::SqliteSynchronous;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use tracing::warn;

mod blocks;
mod checkpoints;
#[cfg(test)]
mod test_support;

#[derive(Clone)]
pub struct StateRuntime {
    gapless_home: PathBuf,
    pool: Arc<sqlx::SqlitePool>,
}

impl StateRuntime {
    /// Initialize the state runtime rooted at `gapless_home`.
    ///
    /// This opens (and migrates) the SQLite database at
    /// `gapless_home/gapless_<version>.sqlite`.
    pub async fn init(gapless_home: PathBuf) -> anyhow::Result<Arc<Self>> {
        tokio::fs::create_dir_all(&gapless_home).await?;
        let state_path = state_db_path(gapless_home.as_path());
        let pool = match open_sqlite(&state_path).await {
            Ok(db) => Arc::new(db),
            Err(err) => {
                warn!("failed to open state db at {}: {err}", state_path.display());
                return Err(err);
            }
        };
        debug!("opened state db at {}", state_path.display());
        Ok(Arc::new(Self { gapless_home, pool }))
    }

    /// Return the home directory this runtime was opened in.
    pub fn gapless_home(&self) -> &Path {
        self.gapless_home.as_path()
    }
}

async fn open_sqlite(path: &Path) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5))
        .log_statements(LevelFilter::Off);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}

pub fn state_db_filename() -> String {
    format!("{STATE_DB_FILENAME}_{STATE_DB_VERSION}.sqlite")
}

pub fn state_db_path(gapless_home: &Path) -> PathBuf {
    gapless_home.join(state_db_filename())
}
