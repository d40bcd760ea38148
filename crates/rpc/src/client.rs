use std::str::FromStr;
use std::time::Duration;

use fund_feed_types::{Address, B256, BlockNumber, Bytes, RawLog};
use serde_json::{Value, json};

use crate::{
    ChainQuery, ChainQueryFuture, JsonRpcRequest, JsonRpcResponse, LogFilter, TransportError,
};

const MAX_UPSTREAM_RPC_RESPONSE_BYTES: usize = 8 * 1024 * 1024;

/// `eth_*` JSON-RPC client over HTTP.
#[derive(Clone)]
pub struct JsonRpcChainClient {
    http: reqwest::Client,
    rpc_url: String,
}

impl JsonRpcChainClient {
    pub fn new(rpc_url: impl Into<String>, timeout: Duration) -> Result<Self, String> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| format!("failed to build HTTP client: {error}"))?;
        Ok(Self {
            http,
            rpc_url: rpc_url.into(),
        })
    }

    async fn fetch_block_number(&self) -> Result<BlockNumber, TransportError> {
        let raw = self.call("eth_blockNumber", json!([])).await?;
        value_as_u64(&raw).ok_or_else(|| {
            TransportError::invalid_response("eth_blockNumber", format!("not a quantity: {raw}"))
        })
    }

    async fn fetch_chain_id(&self) -> Result<u64, TransportError> {
        let raw = self.call("eth_chainId", json!([])).await?;
        value_as_u64(&raw).ok_or_else(|| {
            TransportError::invalid_response("eth_chainId", format!("not a quantity: {raw}"))
        })
    }

    async fn fetch_logs(&self, filter: LogFilter) -> Result<Vec<RawLog>, TransportError> {
        let params = json!([{
            "address": filter.address.to_string(),
            "fromBlock": format!("0x{:x}", filter.range.from),
            "toBlock": format!("0x{:x}", filter.range.to),
            "topics": filter.topics_json(),
        }]);
        let raw = self.call("eth_getLogs", params).await?;
        let entries = raw.as_array().ok_or_else(|| {
            TransportError::invalid_response("eth_getLogs", format!("expected array, got {raw}"))
        })?;

        let mut logs = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Some(log) = parse_raw_log(entry)
                .map_err(|message| TransportError::invalid_response("eth_getLogs", message))?
            {
                logs.push(log);
            }
        }
        Ok(logs)
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let request = JsonRpcRequest::new(method, params);

        let mut response = self
            .http
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|error| TransportError::Request {
                method: method.to_string(),
                message: error.to_string(),
            })?;
        let http_status = response.status();
        let content_length = response.content_length();
        let body = read_body_with_limit(
            &mut response,
            content_length,
            MAX_UPSTREAM_RPC_RESPONSE_BYTES,
            method,
        )
        .await?;

        if !http_status.is_success() {
            return Err(TransportError::Http {
                method: method.to_string(),
                status: http_status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        let decoded: JsonRpcResponse = serde_json::from_slice(&body).map_err(|error| {
            TransportError::invalid_response(method, format!("invalid JSON response: {error}"))
        })?;
        if let Some(error) = decoded.error {
            return Err(TransportError::Rpc {
                method: method.to_string(),
                code: error.code,
                message: error.message,
            });
        }
        decoded
            .result
            .ok_or_else(|| TransportError::invalid_response(method, "response missing `result`"))
    }
}

async fn read_body_with_limit(
    response: &mut reqwest::Response,
    content_length: Option<u64>,
    max_bytes: usize,
    method: &str,
) -> Result<Vec<u8>, TransportError> {
    if let Some(length) = content_length
        && length > max_bytes as u64
    {
        return Err(TransportError::ResponseTooLarge {
            method: method.to_string(),
            size: length,
            max: max_bytes,
        });
    }
    let mut buffer = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|error| TransportError::Request {
            method: method.to_string(),
            message: format!("failed reading response chunk: {error}"),
        })?
    {
        append_limited_chunk(&mut buffer, &chunk, max_bytes, method)?;
    }
    Ok(buffer)
}

fn append_limited_chunk(
    buffer: &mut Vec<u8>,
    chunk: &[u8],
    max_bytes: usize,
    method: &str,
) -> Result<(), TransportError> {
    let new_len = buffer.len().saturating_add(chunk.len());
    if new_len > max_bytes {
        return Err(TransportError::ResponseTooLarge {
            method: method.to_string(),
            size: new_len as u64,
            max: max_bytes,
        });
    }
    buffer.extend_from_slice(chunk);
    Ok(())
}

impl ChainQuery for JsonRpcChainClient {
    fn block_number(&self) -> ChainQueryFuture<'_, BlockNumber> {
        Box::pin(JsonRpcChainClient::fetch_block_number(self))
    }

    fn chain_id(&self) -> ChainQueryFuture<'_, u64> {
        Box::pin(JsonRpcChainClient::fetch_chain_id(self))
    }

    fn logs(&self, filter: LogFilter) -> ChainQueryFuture<'_, Vec<RawLog>> {
        Box::pin(JsonRpcChainClient::fetch_logs(self, filter))
    }
}

/// Parses one `eth_getLogs` entry. Removed (reorged-out) logs yield `None`;
/// pending logs without a position are an error.
fn parse_raw_log(raw: &Value) -> Result<Option<RawLog>, String> {
    if raw.get("removed").and_then(Value::as_bool).unwrap_or(false) {
        return Ok(None);
    }

    let address = parse_hex_field::<Address>(raw, "address")?;
    let topics = raw
        .get("topics")
        .and_then(Value::as_array)
        .ok_or_else(|| format!("log missing `topics` array: {raw}"))?
        .iter()
        .map(|topic| {
            topic
                .as_str()
                .ok_or_else(|| format!("log topic is not a string: {topic}"))
                .and_then(|topic| {
                    B256::from_str(topic).map_err(|error| format!("invalid topic {topic}: {error}"))
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let data = parse_hex_field::<Bytes>(raw, "data")?;
    let block_number = raw
        .get("blockNumber")
        .and_then(value_as_u64)
        .ok_or_else(|| format!("log missing `blockNumber` (pending logs are not accepted): {raw}"))?;
    let transaction_hash = parse_hex_field::<B256>(raw, "transactionHash")?;
    let log_index = raw
        .get("logIndex")
        .and_then(value_as_u64)
        .ok_or_else(|| format!("log missing `logIndex`: {raw}"))?;

    Ok(Some(RawLog {
        address,
        topics,
        data,
        block_number,
        transaction_hash,
        log_index,
    }))
}

fn parse_hex_field<T>(raw: &Value, field: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let value = raw
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("log missing `{field}`: {raw}"))?;
    T::from_str(value).map_err(|error| format!("invalid `{field}` value {value}: {error}"))
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(raw) => {
            if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
                u64::from_str_radix(hex, 16).ok()
            } else {
                raw.parse::<u64>().ok()
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_log_json() -> Value {
        json!({
            "address": "0xf0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0",
            "topics": [
                "0x0101010101010101010101010101010101010101010101010101010101010101"
            ],
            "data": "0x",
            "blockNumber": "0x1a",
            "transactionHash": "0x0202020202020202020202020202020202020202020202020202020202020202",
            "logIndex": "0x3",
            "removed": false
        })
    }

    #[test]
    fn parses_mined_log() {
        let log = parse_raw_log(&sample_log_json())
            .expect("valid log")
            .expect("log is not removed");
        assert_eq!(log.address, Address::repeat_byte(0xf0));
        assert_eq!(log.topics, vec![B256::repeat_byte(0x01)]);
        assert!(log.data.is_empty());
        assert_eq!(log.block_number, 26);
        assert_eq!(log.transaction_hash, B256::repeat_byte(0x02));
        assert_eq!(log.log_index, 3);
    }

    #[test]
    fn skips_removed_logs() {
        let mut raw = sample_log_json();
        raw["removed"] = Value::Bool(true);
        assert_eq!(parse_raw_log(&raw), Ok(None));
    }

    #[test]
    fn rejects_pending_logs() {
        let mut raw = sample_log_json();
        raw["blockNumber"] = Value::Null;
        let error = parse_raw_log(&raw).expect_err("pending log must be rejected");
        assert!(error.contains("pending logs are not accepted"));
    }

    #[test]
    fn rejects_malformed_topics() {
        let mut raw = sample_log_json();
        raw["topics"] = json!(["0x1234"]);
        let error = parse_raw_log(&raw).expect_err("short topic must be rejected");
        assert!(error.contains("invalid topic"));
    }

    #[test]
    fn append_limited_chunk_rejects_oversized_payload() {
        let mut buffer = vec![0_u8; 4];
        let error = append_limited_chunk(&mut buffer, &[1, 2, 3], 6, "eth_getLogs")
            .expect_err("oversized payload");
        assert_eq!(
            error,
            TransportError::ResponseTooLarge {
                method: "eth_getLogs".to_string(),
                size: 7,
                max: 6,
            }
        );
        assert_eq!(buffer.len(), 4);
    }

    #[test]
    fn value_as_u64_accepts_hex_and_decimal() {
        assert_eq!(value_as_u64(&json!("0x2105")), Some(8_453));
        assert_eq!(value_as_u64(&json!("8453")), Some(8_453));
        assert_eq!(value_as_u64(&json!(7)), Some(7));
        assert_eq!(value_as_u64(&json!(null)), None);
    }
}
