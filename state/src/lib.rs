//! SQLite-backed sequence store and backfill checkpoints.
//!
//! Every write is appended as a physical copy keyed by block number. Readers
//! go through the canonical view, which keeps the newest copy per number, and
//! [`StateRuntime::compact`] drops superseded copies. Backfill orchestration
//! and gap monitoring live in `gapless-core`.

mod migrations;
mod model;
mod runtime;

/// Preferred entrypoint: owns the connection pool and migrations.
pub use runtime::StateRuntime;

pub use model::BlockRecord;
pub use model::CanonicalStats;
pub use model::Checkpoint;
pub use model::WriterKind;
pub use runtime::state_db_filename;
pub use runtime::state_db_path;

pub const STATE_DB_FILENAME: &str = "gapless";
pub const STATE_DB_VERSION: u32 = 1;
