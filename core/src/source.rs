//! Upstream block providers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use gapless_state::BlockRecord;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use tracing::Level;
use tracing::enabled;
use tracing::trace;
use url::Url;

use crate::error::GaplessErr;
use crate::error::Result;
use crate::error::SequenceRange;

const DEFAULT_RPC_BATCH_SIZE: usize = 100;
const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Range fetch capability. One implementation per upstream provider.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Fetch every block in `range` the provider knows about, in ascending
    /// order. Blocks the provider does not return are simply absent.
    async fn fetch(&self, range: SequenceRange) -> Result<Vec<BlockRecord>>;

    /// Latest block number the provider can serve.
    async fn head(&self) -> Result<u64>;
}

/// `[source]` table in `config.toml`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceToml {
    JsonRpc {
        url: String,
        batch_size: Option<usize>,
        timeout_secs: Option<u64>,
    },
}

pub fn build_source(config: &SourceToml) -> Result<Arc<dyn BlockSource>> {
    match config {
        SourceToml::JsonRpc {
            url,
            batch_size,
            timeout_secs,
        } => {
            let endpoint = Url::parse(url)
                .map_err(|err| GaplessErr::Config(format!("invalid source url {url}: {err}")))?;
            let source = JsonRpcSource::new(
                endpoint,
                batch_size.unwrap_or(DEFAULT_RPC_BATCH_SIZE),
                timeout_secs.map_or(DEFAULT_RPC_TIMEOUT, Duration::from_secs),
            )?;
            Ok(Arc::new(source))
        }
    }
}

/// Ethereum-style JSON-RPC endpoint, queried with batched
/// `eth_getBlockByNumber` calls.
#[derive(Debug, Clone)]
pub struct JsonRpcSource {
    client: reqwest::Client,
    endpoint: Url,
    batch_size: usize,
}

#[derive(Deserialize, Debug)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Deserialize, Debug)]
struct RpcError {
    code: i64,
    message: String,
}

impl JsonRpcSource {
    pub fn new(endpoint: Url, batch_size: usize, timeout: Duration) -> Result<Self> {
        if batch_size == 0 {
            return Err(GaplessErr::Config(
                "source batch_size must be positive".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| GaplessErr::Config(format!("failed to build http client: {err}")))?;
        Ok(Self {
            client,
            endpoint,
            batch_size,
        })
    }

    async fn call(&self, range: SequenceRange, body: Value) -> Result<Value> {
        if enabled!(Level::TRACE) {
            trace!("POST to {}: {body}", self.endpoint);
        }
        let resp = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|err| map_error(range, err))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GaplessErr::fetch(
                range,
                format!("{} returned {status}: {body}", self.endpoint),
            ));
        }
        resp.json::<Value>()
            .await
            .map_err(|err| map_error(range, err))
    }
}

fn map_error(range: SequenceRange, err: reqwest::Error) -> GaplessErr {
    if err.is_timeout() {
        GaplessErr::fetch(range, "request timed out")
    } else if err.is_decode() {
        GaplessErr::Decode(err.to_string())
    } else {
        GaplessErr::fetch(range, err.to_string())
    }
}

fn rpc_result(range: SequenceRange, value: Value) -> Result<Option<Value>> {
    let response: RpcResponse =
        serde_json::from_value(value).map_err(|err| GaplessErr::Decode(err.to_string()))?;
    if let Some(error) = response.error {
        return Err(GaplessErr::fetch(
            range,
            format!("rpc error {}: {}", error.code, error.message),
        ));
    }
    Ok(response.result.filter(|result| !result.is_null()))
}

#[async_trait]
impl BlockSource for JsonRpcSource {
    async fn fetch(&self, range: SequenceRange) -> Result<Vec<BlockRecord>> {
        let mut records = Vec::new();
        let mut batch_start = range.start;
        loop {
            let batch_end = batch_start
                .saturating_add(self.batch_size as u64 - 1)
                .min(range.end);
            let requests: Vec<Value> = (batch_start..=batch_end)
                .map(|number| {
                    json!({
                        "jsonrpc": "2.0",
                        "id": number,
                        "method": "eth_getBlockByNumber",
                        "params": [format!("0x{number:x}"), false],
                    })
                })
                .collect();
            let responses = match self.call(range, Value::Array(requests)).await? {
                Value::Array(responses) => responses,
                other => {
                    return Err(GaplessErr::Decode(format!(
                        "expected a batch response array, got {other}"
                    )));
                }
            };
            for response in responses {
                if let Some(block) = rpc_result(range, response)? {
                    let record = decode_block(&block)?;
                    if range.contains(record.number) {
                        records.push(record);
                    }
                }
            }
            if batch_end >= range.end {
                break;
            }
            batch_start = batch_end + 1;
        }
        records.sort_by_key(|record| record.number);
        Ok(records)
    }

    async fn head(&self) -> Result<u64> {
        let range = SequenceRange { start: 0, end: 0 };
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_blockNumber",
            "params": [],
        });
        let response = self.call(range, body).await?;
        match rpc_result(range, response)? {
            Some(Value::String(hex)) => parse_hex_u64(&hex),
            other => Err(GaplessErr::Decode(format!(
                "eth_blockNumber returned {other:?}"
            ))),
        }
    }
}

fn parse_hex_u64(value: &str) -> Result<u64> {
    let digits = value
        .strip_prefix("0x")
        .ok_or_else(|| GaplessErr::Decode(format!("quantity {value} is not 0x-prefixed")))?;
    u64::from_str_radix(digits, 16)
        .map_err(|err| GaplessErr::Decode(format!("invalid quantity {value}: {err}")))
}

fn parse_hex_u128(value: &str) -> Result<u128> {
    let digits = value
        .strip_prefix("0x")
        .ok_or_else(|| GaplessErr::Decode(format!("quantity {value} is not 0x-prefixed")))?;
    u128::from_str_radix(digits, 16)
        .map_err(|err| GaplessErr::Decode(format!("invalid quantity {value}: {err}")))
}

fn required_u64(block: &Value, field: &str) -> Result<u64> {
    match block.get(field).and_then(Value::as_str) {
        Some(hex) => parse_hex_u64(hex),
        None => Err(GaplessErr::Decode(format!("block is missing `{field}`"))),
    }
}

fn optional_u64(block: &Value, field: &str) -> Result<Value> {
    match block.get(field).and_then(Value::as_str) {
        Some(hex) => Ok(Value::from(parse_hex_u64(hex)?)),
        None => Ok(Value::Null),
    }
}

/// Difficulty values outgrow `u64`; they are kept as decimal strings.
fn optional_u128(block: &Value, field: &str) -> Result<Value> {
    match block.get(field).and_then(Value::as_str) {
        Some(hex) => Ok(Value::String(parse_hex_u128(hex)?.to_string())),
        None => Ok(Value::Null),
    }
}

/// Convert one `eth_getBlockByNumber` result into a record.
pub fn decode_block(block: &Value) -> Result<BlockRecord> {
    let number = required_u64(block, "number")?;
    let timestamp = required_u64(block, "timestamp")?;
    let observed_at = i64::try_from(timestamp)
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .ok_or_else(|| GaplessErr::Decode(format!("invalid block timestamp {timestamp}")))?;
    let transaction_count = block
        .get("transactions")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);

    let payload = json!({
        "hash": block.get("hash").cloned().unwrap_or(Value::Null),
        "parent_hash": block.get("parentHash").cloned().unwrap_or(Value::Null),
        "miner": block.get("miner").cloned().unwrap_or(Value::Null),
        "gas_limit": optional_u64(block, "gasLimit")?,
        "gas_used": optional_u64(block, "gasUsed")?,
        "base_fee_per_gas": optional_u64(block, "baseFeePerGas")?,
        "transaction_count": transaction_count,
        "difficulty": optional_u128(block, "difficulty")?,
        "total_difficulty": optional_u128(block, "totalDifficulty")?,
        "size": optional_u64(block, "size")?,
        "blob_gas_used": optional_u64(block, "blobGasUsed")?,
        "excess_blob_gas": optional_u64(block, "excessBlobGas")?,
    });
    Ok(BlockRecord::new(number, observed_at, payload))
}
