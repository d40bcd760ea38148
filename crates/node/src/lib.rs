#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use fund_feed_decode::TokenDescriptor;
use fund_feed_notify::ListenerRegistration;
use fund_feed_rpc::{ChainQuery, DEFAULT_FETCH_TIMEOUT_SECS};
use fund_feed_types::Address;

pub mod backfill;
pub mod runtime;

use crate::backfill::DEFAULT_BACKFILL_CONCURRENCY;
use crate::runtime::{FeedRuntime, SyncError};

pub const BASE_MAINNET_CHAIN_ID: u64 = 8_453;
pub const BASE_USDC_ADDRESS: &str = "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913";
pub const DEFAULT_TOKEN_DECIMALS: u8 = 6;
pub const DEFAULT_TOKEN_SYMBOL: &str = "USDC";
pub const DEFAULT_POLL_MS: u64 = 5_000;
pub const DEFAULT_LOAD_MORE_WINDOW_SECS: u64 = 10_800;
pub const DEFAULT_BLOCK_TIME_MS: u64 = 2_000;

/// How far back one "load more" request reaches: a wall-clock window turned
/// into blocks through the chain's average block time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadMoreStep {
    pub window: Duration,
    pub block_time: Duration,
}

impl Default for LoadMoreStep {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(DEFAULT_LOAD_MORE_WINDOW_SECS),
            block_time: Duration::from_millis(DEFAULT_BLOCK_TIME_MS),
        }
    }
}

impl LoadMoreStep {
    pub fn blocks(&self) -> u64 {
        let block_ms = self.block_time.as_millis().max(1);
        let window_ms = self.window.as_millis();
        let blocks = window_ms.div_ceil(block_ms).max(1);
        u64::try_from(blocks).unwrap_or(u64::MAX)
    }

    pub fn blocks_to_seconds(&self, blocks: u64) -> u64 {
        let millis = u128::from(blocks).saturating_mul(self.block_time.as_millis());
        u64::try_from(millis / 1_000).unwrap_or(u64::MAX)
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub target: Address,
    pub token: TokenDescriptor,
    pub expected_chain_id: Option<u64>,
    pub poll_interval: Duration,
    pub fetch_timeout: Duration,
    pub backfill_concurrency: usize,
    pub load_more: LoadMoreStep,
}

impl RuntimeConfig {
    pub fn new(target: Address, token: TokenDescriptor) -> Self {
        Self {
            target,
            token,
            expected_chain_id: Some(BASE_MAINNET_CHAIN_ID),
            poll_interval: Duration::from_millis(DEFAULT_POLL_MS),
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            backfill_concurrency: DEFAULT_BACKFILL_CONCURRENCY,
            load_more: LoadMoreStep::default(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.target.is_zero() {
            return Err("target contract cannot be the zero address".to_string());
        }
        if self.token.address.is_zero() {
            return Err("token contract cannot be the zero address".to_string());
        }
        if self.token.symbol.trim().is_empty() {
            return Err("token symbol cannot be empty".to_string());
        }
        if self.poll_interval.is_zero() {
            return Err("poll_interval must be > 0".to_string());
        }
        if self.fetch_timeout.is_zero() {
            return Err("fetch_timeout must be > 0".to_string());
        }
        if self.backfill_concurrency == 0 {
            return Err("backfill_concurrency must be > 0".to_string());
        }
        if self.load_more.window.is_zero() {
            return Err("load_more.window must be > 0".to_string());
        }
        if self.load_more.block_time.is_zero() {
            return Err("load_more.block_time must be > 0".to_string());
        }
        Ok(())
    }
}

/// `12 seconds`, `1 minute`, `3 hours`.
pub fn describe_age(seconds: u64) -> String {
    let (amount, unit) = if seconds < 60 {
        (seconds, "second")
    } else if seconds < 3_600 {
        (seconds / 60, "minute")
    } else {
        (seconds / 3_600, "hour")
    };
    if amount == 1 {
        format!("{amount} {unit}")
    } else {
        format!("{amount} {unit}s")
    }
}

pub struct NoChain;
pub struct WithChain(Arc<dyn ChainQuery>);

pub struct FeedRuntimeBuilder<C> {
    config: RuntimeConfig,
    listeners: Vec<ListenerRegistration>,
    chain: C,
}

impl FeedRuntimeBuilder<NoChain> {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            listeners: Vec::new(),
            chain: NoChain,
        }
    }

    pub fn with_chain(self, chain: Arc<dyn ChainQuery>) -> FeedRuntimeBuilder<WithChain> {
        FeedRuntimeBuilder {
            config: self.config,
            listeners: self.listeners,
            chain: WithChain(chain),
        }
    }
}

impl<C> FeedRuntimeBuilder<C> {
    pub fn with_listener(mut self, registration: ListenerRegistration) -> Self {
        self.listeners.push(registration);
        self
    }
}

impl FeedRuntimeBuilder<WithChain> {
    pub fn build(self) -> Result<FeedRuntime, SyncError> {
        FeedRuntime::new(self.config, self.chain.0, self.listeners)
    }
}
