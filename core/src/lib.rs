//! Root of the `gapless-core` library.
//!
//! Chunked backfill, the streaming write path, and the consistency monitor
//! with its heartbeat reporter. Storage lives in `gapless-state`.

// Library code reports through tracing; only the binary prints.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod backfill;
pub mod config;
pub mod dual_write;
pub mod error;
pub mod heartbeat;
pub mod monitor;
pub mod planner;
pub mod retry;
pub mod source;
pub mod store;
#[cfg(test)]
mod test_support;

pub use backfill::BackfillOrchestrator;
pub use backfill::BackfillSummary;
pub use config::Config;
pub use config::ConfigToml;
pub use config::find_gapless_home;
pub use dual_write::StreamWriter;
pub use dual_write::Streamer;
pub use error::GaplessErr;
pub use error::SequenceRange;
pub use heartbeat::HeartbeatReporter;
pub use heartbeat::PingOutcome;
pub use monitor::ConsistencyMonitor;
pub use monitor::Gap;
pub use monitor::ScanOutcome;
pub use monitor::ScanReport;
pub use monitor::ScanStatus;
pub use planner::Chunk;
pub use planner::ChunkPlanner;
pub use retry::RetryPolicy;
pub use source::BlockSource;
pub use source::JsonRpcSource;
pub use store::CheckpointStore;
pub use store::SequenceStore;
