use crate::BlockRecord;
use chrono::DateTime;
use chrono::Utc;
use serde_json::json;
use std::path::PathBuf;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;
use uuid::Uuid;

pub(super) fn unique_temp_dir() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_nanos());
    std::env::temp_dir().join(format!(
        "gapless-state-runtime-test-{nanos}-{}",
        Uuid::new_v4()
    ))
}

/// Block `number` observed twelve seconds after its predecessor.
pub(super) fn test_block(number: u64) -> BlockRecord {
    let secs = 1_700_000_000 + i64::try_from(number).expect("small test number") * 12;
    let observed_at = DateTime::<Utc>::from_timestamp(secs, 0).expect("timestamp");
    BlockRecord::new(
        number,
        observed_at,
        json!({ "hash": format!("0x{number:064x}"), "transactions": 1 }),
    )
}
