#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use fund_feed_types::{Address, B256, BlockNumber, BlockRange, MAX_LOG_RANGE, RangeError, RawLog};
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod client;

pub use client::JsonRpcChainClient;

pub const JSONRPC_VERSION: &str = "2.0";
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

impl JsonRpcRequest {
    pub fn new(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
            id: Value::from(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcErrorObject>,
    #[serde(default)]
    pub id: Value,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("RPC {method} request failed: {message}")]
    Request { method: String, message: String },
    #[error("RPC {method} returned HTTP {status} with body {body}")]
    Http {
        method: String,
        status: u16,
        body: String,
    },
    #[error("RPC {method} error payload: code {code}: {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },
    #[error("RPC {method} invalid response: {message}")]
    InvalidResponse { method: String, message: String },
    #[error("RPC {method} response too large: {size} exceeds {max} bytes")]
    ResponseTooLarge {
        method: String,
        size: u64,
        max: usize,
    },
    #[error("RPC {method} timed out after {timeout_ms} ms")]
    Timeout { method: String, timeout_ms: u64 },
}

impl TransportError {
    pub fn invalid_response(method: &str, message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            method: method.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum FetchError {
    #[error(transparent)]
    Range(#[from] RangeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexedTopic {
    First,
    Second,
    Third,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub address: Address,
    pub signatures: Vec<B256>,
    pub indexed: [Option<B256>; 3],
    pub range: BlockRange,
}

impl LogFilter {
    pub fn new(address: Address, signatures: Vec<B256>, range: BlockRange) -> Self {
        Self {
            address,
            signatures,
            indexed: [None; 3],
            range,
        }
    }

    pub fn with_indexed(mut self, position: IndexedTopic, value: B256) -> Self {
        let slot = match position {
            IndexedTopic::First => 0,
            IndexedTopic::Second => 1,
            IndexedTopic::Third => 2,
        };
        self.indexed[slot] = Some(value);
        self
    }

    pub fn topics_json(&self) -> Value {
        let mut topics = Vec::with_capacity(4);
        if self.signatures.is_empty() {
            topics.push(Value::Null);
        } else {
            topics.push(Value::Array(
                self.signatures
                    .iter()
                    .map(|signature| Value::String(signature.to_string()))
                    .collect(),
            ));
        }
        for topic in &self.indexed {
            topics.push(
                topic
                    .map(|value| Value::String(value.to_string()))
                    .unwrap_or(Value::Null),
            );
        }
        while topics.len() > 1 && topics.last() == Some(&Value::Null) {
            topics.pop();
        }
        Value::Array(topics)
    }

    pub fn matches_topics(&self, log: &RawLog) -> bool {
        if !self.signatures.is_empty()
            && !log
                .topic0()
                .is_some_and(|topic0| self.signatures.contains(topic0))
        {
            return false;
        }
        self.indexed.iter().enumerate().all(|(idx, expected)| match expected {
            Some(expected) => log.topics.get(idx + 1) == Some(expected),
            None => true,
        })
    }
}

pub type ChainQueryFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

pub trait ChainQuery: Send + Sync {
    fn block_number(&self) -> ChainQueryFuture<'_, BlockNumber>;
    fn chain_id(&self) -> ChainQueryFuture<'_, u64>;
    fn logs(&self, filter: LogFilter) -> ChainQueryFuture<'_, Vec<RawLog>>;
}

#[derive(Clone)]
pub struct LogFetcher {
    chain: Arc<dyn ChainQuery>,
    timeout: Duration,
    max_range: u64,
}

impl LogFetcher {
    pub fn new(chain: Arc<dyn ChainQuery>, timeout: Duration) -> Self {
        Self {
            chain,
            timeout,
            max_range: MAX_LOG_RANGE,
        }
    }

    pub fn max_range(&self) -> u64 {
        self.max_range
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn block_number(&self) -> Result<BlockNumber, TransportError> {
        self.bounded("eth_blockNumber", self.chain.block_number())
            .await
    }

    pub async fn chain_id(&self) -> Result<u64, TransportError> {
        self.bounded("eth_chainId", self.chain.chain_id()).await
    }

    pub async fn fetch_range(
        &self,
        target: Address,
        signatures: &[B256],
        from: BlockNumber,
        to: BlockNumber,
    ) -> Result<Vec<RawLog>, FetchError> {
        let range = BlockRange::new(from, to)?;
        self.fetch_filtered(LogFilter::new(target, signatures.to_vec(), range))
            .await
    }

    pub async fn fetch_filtered(&self, filter: LogFilter) -> Result<Vec<RawLog>, FetchError> {
        filter.range.ensure_within(self.max_range)?;
        let logs = self
            .bounded("eth_getLogs", self.chain.logs(filter.clone()))
            .await?;
        let range = filter.range;
        if let Some(stray) = logs.iter().find(|log| !range.contains(log.block_number)) {
            return Err(TransportError::invalid_response(
                "eth_getLogs",
                format!(
                    "log {} at block {} is outside requested range {range}",
                    stray.id(),
                    stray.block_number
                ),
            )
            .into());
        }
        if let Some(stray) = logs
            .iter()
            .find(|log| log.address != filter.address || !filter.matches_topics(log))
        {
            return Err(TransportError::invalid_response(
                "eth_getLogs",
                format!("log {} does not match the requested filter", stray.id()),
            )
            .into());
        }
        Ok(logs)
    }

    async fn bounded<T>(
        &self,
        method: &str,
        call: ChainQueryFuture<'_, T>,
    ) -> Result<T, TransportError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                method: method.to_string(),
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use fund_feed_types::Bytes;

    use super::*;

    #[derive(Clone)]
    struct MockChainQuery {
        head: u64,
        logs: Vec<RawLog>,
        delay: Duration,
        log_calls: Arc<Mutex<Vec<BlockRange>>>,
    }

    impl MockChainQuery {
        fn new(head: u64, logs: Vec<RawLog>) -> Self {
            Self {
                head,
                logs,
                delay: Duration::ZERO,
                log_calls: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn log_calls(&self) -> Vec<BlockRange> {
            self.log_calls
                .lock()
                .expect("log_calls lock should not be poisoned")
                .clone()
        }
    }

    impl ChainQuery for MockChainQuery {
        fn block_number(&self) -> ChainQueryFuture<'_, BlockNumber> {
            Box::pin(async move { Ok(self.head) })
        }

        fn chain_id(&self) -> ChainQueryFuture<'_, u64> {
            Box::pin(async move { Ok(8_453) })
        }

        fn logs(&self, filter: LogFilter) -> ChainQueryFuture<'_, Vec<RawLog>> {
            Box::pin(async move {
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                self.log_calls
                    .lock()
                    .expect("log_calls lock should not be poisoned")
                    .push(filter.range);
                Ok(self.logs.clone())
            })
        }
    }

    fn log_at(block: u64) -> RawLog {
        RawLog {
            address: Address::repeat_byte(0xf0),
            topics: vec![B256::repeat_byte(0x01)],
            data: Bytes::new(),
            block_number: block,
            transaction_hash: B256::repeat_byte(block as u8),
            log_index: 0,
        }
    }

    #[tokio::test]
    async fn fetch_range_rejects_spans_above_limit_without_calling_upstream() {
        let chain = MockChainQuery::new(5_000, Vec::new());
        let fetcher = LogFetcher::new(Arc::new(chain.clone()), Duration::from_secs(1));

        let error = fetcher
            .fetch_range(Address::ZERO, &[], 0, MAX_LOG_RANGE)
            .await
            .expect_err("1001 block span must be rejected");
        assert!(matches!(
            error,
            FetchError::Range(RangeError::TooWide { span, .. }) if span == MAX_LOG_RANGE + 1
        ));

        let error = fetcher
            .fetch_range(Address::ZERO, &[], 10, 9)
            .await
            .expect_err("inverted range must be rejected");
        assert!(matches!(error, FetchError::Range(RangeError::Inverted { .. })));
        assert!(chain.log_calls().is_empty());

        fetcher
            .fetch_range(Address::ZERO, &[], 0, MAX_LOG_RANGE - 1)
            .await
            .expect("1000 block span is allowed");
        assert_eq!(
            chain.log_calls(),
            vec![BlockRange {
                from: 0,
                to: MAX_LOG_RANGE - 1
            }]
        );
    }

    #[tokio::test]
    async fn slow_upstream_surfaces_as_timeout() {
        let mut chain = MockChainQuery::new(10, Vec::new());
        chain.delay = Duration::from_secs(5);
        let fetcher = LogFetcher::new(Arc::new(chain), Duration::from_millis(20));

        let error = fetcher
            .fetch_range(Address::ZERO, &[], 1, 2)
            .await
            .expect_err("slow call must time out");
        assert_eq!(
            error,
            FetchError::Transport(TransportError::Timeout {
                method: "eth_getLogs".to_string(),
                timeout_ms: 20,
            })
        );
    }

    #[tokio::test]
    async fn logs_outside_requested_range_are_rejected() {
        let chain = MockChainQuery::new(10, vec![log_at(3), log_at(12)]);
        let fetcher = LogFetcher::new(Arc::new(chain), Duration::from_secs(1));

        let error = fetcher
            .fetch_range(Address::ZERO, &[], 1, 10)
            .await
            .expect_err("stray log must fail the fetch");
        assert!(error.to_string().contains("outside requested range 1..=10"));
    }

    #[test]
    fn topics_json_trims_trailing_wildcards() {
        let signature = B256::repeat_byte(0xaa);
        let recipient = B256::repeat_byte(0xbb);
        let filter = LogFilter::new(
            Address::ZERO,
            vec![signature],
            BlockRange::single(1),
        )
        .with_indexed(IndexedTopic::Second, recipient);

        assert_eq!(
            filter.topics_json(),
            serde_json::json!([[signature.to_string()], null, recipient.to_string()])
        );

        let unfiltered = LogFilter::new(Address::ZERO, Vec::new(), BlockRange::single(1));
        assert_eq!(unfiltered.topics_json(), serde_json::json!([null]));
    }

    #[test]
    fn filter_matches_signature_and_indexed_topics() {
        let signature = B256::repeat_byte(0x01);
        let recipient = B256::repeat_byte(0xbb);
        let filter = LogFilter::new(Address::ZERO, vec![signature], BlockRange::single(1))
            .with_indexed(IndexedTopic::Second, recipient);

        let mut log = log_at(1);
        log.topics = vec![signature, B256::ZERO, recipient];
        assert!(filter.matches_topics(&log));

        log.topics[2] = B256::ZERO;
        assert!(!filter.matches_topics(&log));
    }
}
