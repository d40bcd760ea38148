use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fund_feed_decode::{
    DecodeError, DecodedBatch, EventNormalizer, TokenDescriptor, fund_event_signatures,
    signature_hash,
};
use fund_feed_notify::{ChangeDispatcher, ListenerRegistration, NotifyError};
use fund_feed_rpc::{
    ChainQuery, FetchError, IndexedTopic, LogFetcher, LogFilter, TransportError,
};
use fund_feed_storage::{FeedAggregator, FeedLoadState, LoadStateError, merge_and_sort};
use fund_feed_types::{ActivityEvent, Address, BlockNumber, BlockRange, EventKind};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backfill::{
    BackfillOutcome, BackfillPhase, BackfillScheduler, HistoryStatus, RequestAccepted,
    RequestRejected, load_in_batches,
};
use crate::{LoadMoreStep, RuntimeConfig, describe_age};

pub const MAX_RECENT_ERRORS: usize = 128;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("invalid runtime config: {0}")]
    Config(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("chain id mismatch: expected {expected}, upstream reported {actual}")]
    ChainIdMismatch { expected: u64, actual: u64 },
    #[error(transparent)]
    LoadState(#[from] LoadStateError),
    #[error(transparent)]
    Rejected(#[from] RequestRejected),
    #[error(transparent)]
    Listener(#[from] NotifyError),
    #[error("feed target changed while loading")]
    Superseded,
    #[error("feed state lock poisoned")]
    StateLock,
}

impl From<TransportError> for SyncError {
    fn from(error: TransportError) -> Self {
        Self::Fetch(FetchError::Transport(error))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeedEpoch {
    pub contract: Address,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "tick")]
pub enum LiveTick {
    UpToDate {
        head: BlockNumber,
    },
    Applied {
        range: BlockRange,
        inserted: usize,
        duplicates: usize,
        rejected: usize,
        bootstrapped: bool,
        lag: u64,
    },
    Stale {
        range: BlockRange,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeDiagnostics {
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u64,
    pub live_batches: u64,
    pub backfill_batches: u64,
    pub backfill_failures: u64,
    pub events_ingested: u64,
    pub duplicate_events: u64,
    pub rejected_logs: u64,
    pub stale_results: u64,
    pub listener_failures: u64,
    pub lagging_ticks: u64,
    pub last_error: Option<String>,
    pub recent_errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedStatus {
    pub contract: Address,
    pub generation: u64,
    pub chain_id: Option<u64>,
    pub head: Option<BlockNumber>,
    pub live_watermark: Option<BlockNumber>,
    pub backfill_watermark: Option<BlockNumber>,
    pub requested_backfill_watermark: Option<BlockNumber>,
    pub entries: usize,
    pub coverage_blocks: u64,
    pub coverage_seconds: u64,
    pub coverage: Option<String>,
    pub history: HistoryStatus,
    pub backfill: BackfillPhase,
    pub last_backfill: Option<BackfillOutcome>,
    pub diagnostics: RuntimeDiagnostics,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedEntry {
    pub title: &'static str,
    #[serde(flatten)]
    pub event: ActivityEvent,
    pub age_seconds: Option<u64>,
    pub age: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedPage {
    pub contract: Address,
    pub total: usize,
    pub offset: usize,
    pub entries: Vec<FeedEntry>,
}

struct FeedState {
    epoch: FeedEpoch,
    normalizer: EventNormalizer,
    feed: FeedAggregator,
    load: FeedLoadState,
    backfill: BackfillScheduler,
    head: Option<BlockNumber>,
    chain_id: Option<u64>,
    diagnostics: RuntimeDiagnostics,
    recent_errors: VecDeque<String>,
}

impl FeedState {
    fn apply_live(
        &mut self,
        epoch: FeedEpoch,
        live_before: Option<BlockNumber>,
        range: BlockRange,
        head: BlockNumber,
        batch: DecodedBatch,
    ) -> Result<(LiveTick, Vec<ActivityEvent>), LoadStateError> {
        if self.epoch != epoch || self.load.live_watermark() != live_before {
            self.diagnostics.stale_results = self.diagnostics.stale_results.saturating_add(1);
            return Ok((LiveTick::Stale { range }, Vec::new()));
        }

        let bootstrapped = live_before.is_none();
        if bootstrapped {
            self.load.bootstrap(range.to)?;
            self.backfill.on_bootstrap();
        } else {
            self.load.advance_live(range.to)?;
        }

        let rejected = batch.rejected.len();
        self.note_rejections(&batch.rejected);
        let events = merge_and_sort([batch.events]);
        let report = self.feed.append_live(events.clone());

        let lag = head.saturating_sub(range.to);
        self.diagnostics.live_batches = self.diagnostics.live_batches.saturating_add(1);
        self.diagnostics.events_ingested = self
            .diagnostics
            .events_ingested
            .saturating_add(report.inserted as u64);
        self.diagnostics.duplicate_events = self
            .diagnostics
            .duplicate_events
            .saturating_add(report.duplicates as u64);
        if lag > 0 {
            self.diagnostics.lagging_ticks = self.diagnostics.lagging_ticks.saturating_add(1);
        }

        let tick = LiveTick::Applied {
            range,
            inserted: report.inserted,
            duplicates: report.duplicates,
            rejected,
            bootstrapped,
            lag,
        };
        Ok((tick, events))
    }

    fn complete_backfill(
        &mut self,
        epoch: FeedEpoch,
        target: BlockRange,
        batches: Vec<DecodedBatch>,
    ) -> Result<BackfillOutcome, SyncError> {
        if self.epoch != epoch {
            self.diagnostics.stale_results = self.diagnostics.stale_results.saturating_add(1);
            return Ok(BackfillOutcome::Stale { range: target });
        }

        let mut events = Vec::with_capacity(batches.len());
        for batch in batches {
            self.note_rejections(&batch.rejected);
            events.push(batch.events);
        }
        let outcome = self
            .backfill
            .complete(&mut self.load, &mut self.feed, target, events)?;
        match &outcome {
            BackfillOutcome::Applied {
                chunks,
                inserted,
                duplicates,
                ..
            } => {
                self.diagnostics.backfill_batches = self
                    .diagnostics
                    .backfill_batches
                    .saturating_add(*chunks as u64);
                self.diagnostics.events_ingested = self
                    .diagnostics
                    .events_ingested
                    .saturating_add(*inserted as u64);
                self.diagnostics.duplicate_events = self
                    .diagnostics
                    .duplicate_events
                    .saturating_add(*duplicates as u64);
                self.record_success();
            }
            BackfillOutcome::Stale { .. } => {
                self.diagnostics.stale_results = self.diagnostics.stale_results.saturating_add(1);
            }
            BackfillOutcome::Failed { .. } => {}
        }
        Ok(outcome)
    }

    fn fail_backfill(
        &mut self,
        epoch: FeedEpoch,
        target: BlockRange,
        message: String,
    ) -> BackfillOutcome {
        if self.epoch != epoch {
            self.diagnostics.stale_results = self.diagnostics.stale_results.saturating_add(1);
            return BackfillOutcome::Stale { range: target };
        }
        self.diagnostics.backfill_failures = self.diagnostics.backfill_failures.saturating_add(1);
        self.record_failure(format!("backfill of {target} failed: {message}"));
        self.backfill.fail(target, message)
    }

    fn note_rejections(&mut self, rejected: &[DecodeError]) {
        for error in rejected {
            warn!(error = %error, "skipping log that does not decode");
            self.push_error(error.to_string());
        }
        self.diagnostics.rejected_logs = self
            .diagnostics
            .rejected_logs
            .saturating_add(rejected.len() as u64);
    }

    fn push_error(&mut self, message: String) {
        push_recent_error(&mut self.recent_errors, message);
        self.diagnostics.recent_errors = self.recent_errors.iter().cloned().collect();
    }

    fn record_failure(&mut self, message: String) {
        self.diagnostics.failure_count = self.diagnostics.failure_count.saturating_add(1);
        self.diagnostics.consecutive_failures =
            self.diagnostics.consecutive_failures.saturating_add(1);
        self.diagnostics.last_error = Some(message.clone());
        self.push_error(message);
    }

    fn record_success(&mut self) {
        self.diagnostics.success_count = self.diagnostics.success_count.saturating_add(1);
        self.diagnostics.consecutive_failures = 0;
        self.diagnostics.last_error = None;
    }
}

#[derive(Clone)]
pub struct FeedRuntime {
    fetcher: LogFetcher,
    state: Arc<Mutex<FeedState>>,
    dispatcher: Arc<Mutex<ChangeDispatcher>>,
    token: TokenDescriptor,
    expected_chain_id: Option<u64>,
    poll_interval: Duration,
    load_more: LoadMoreStep,
}

impl FeedRuntime {
    pub fn new(
        config: RuntimeConfig,
        chain: Arc<dyn ChainQuery>,
        listeners: Vec<ListenerRegistration>,
    ) -> Result<Self, SyncError> {
        config.validate().map_err(SyncError::Config)?;

        let fetcher = LogFetcher::new(chain, config.fetch_timeout);
        let mut dispatcher = ChangeDispatcher::new();
        for registration in listeners {
            dispatcher.register(registration)?;
        }
        let backfill = BackfillScheduler::new(
            config.load_more.blocks(),
            fetcher.max_range(),
            config.backfill_concurrency,
        );
        let state = FeedState {
            epoch: FeedEpoch {
                contract: config.target,
                generation: 0,
            },
            normalizer: EventNormalizer::new(config.target, config.token.clone()),
            feed: FeedAggregator::new(),
            load: FeedLoadState::new(),
            backfill,
            head: None,
            chain_id: None,
            diagnostics: RuntimeDiagnostics::default(),
            recent_errors: VecDeque::new(),
        };

        Ok(Self {
            fetcher,
            state: Arc::new(Mutex::new(state)),
            dispatcher: Arc::new(Mutex::new(dispatcher)),
            token: config.token,
            expected_chain_id: config.expected_chain_id,
            poll_interval: config.poll_interval,
            load_more: config.load_more,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn token(&self) -> &TokenDescriptor {
        &self.token
    }

    pub fn epoch(&self) -> Result<FeedEpoch, SyncError> {
        self.with_state(|state| state.epoch)
    }

    pub fn diagnostics(&self) -> Result<RuntimeDiagnostics, SyncError> {
        self.with_state(|state| state.diagnostics.clone())
    }

    pub async fn live_tick(&self) -> Result<LiveTick, SyncError> {
        match self.sync_live().await {
            Ok(tick) => {
                self.with_state(FeedState::record_success)?;
                Ok(tick)
            }
            Err(error) => {
                warn!(error = %error, "live tick failed");
                let message = error.to_string();
                if let Err(lock_error) = self.with_state(|state| state.record_failure(message)) {
                    warn!(error = %lock_error, "could not record live tick failure");
                }
                Err(error)
            }
        }
    }

    pub fn request_more(&self) -> Result<RequestAccepted, SyncError> {
        let accepted = self.with_state(|state| state.backfill.request(&mut state.load))??;
        info!(
            pending = %accepted.pending,
            retry = accepted.retry,
            "older activity requested"
        );
        Ok(accepted)
    }

    pub async fn run_backfill(&self) -> Result<Option<BackfillOutcome>, SyncError> {
        let planned = self.with_state(|state| {
            state
                .backfill
                .begin(&state.load)
                .map(|plan| (state.epoch, state.normalizer.clone(), plan))
        })?;
        let Some((epoch, normalizer, plan)) = planned else {
            return Ok(None);
        };
        let target = plan.target;
        info!(
            range = %target,
            chunks = plan.chunks.len(),
            concurrency = plan.concurrency,
            "loading older activity"
        );

        let normalizer = &normalizer;
        let loaded = load_in_batches(
            &plan.chunks,
            plan.concurrency,
            move |range| self.load_range(normalizer, range),
            move |done| {
                let current = self.with_state(|state| {
                    if state.epoch != epoch {
                        return false;
                    }
                    state.backfill.record_progress(target, done);
                    true
                })?;
                if current {
                    Ok(())
                } else {
                    Err(SyncError::Superseded)
                }
            },
        )
        .await;

        let outcome = match loaded {
            Ok(batches) => {
                self.with_state(|state| state.complete_backfill(epoch, target, batches))??
            }
            Err(SyncError::Superseded) => {
                self.with_state(|state| {
                    state.diagnostics.stale_results =
                        state.diagnostics.stale_results.saturating_add(1);
                })?;
                BackfillOutcome::Stale { range: target }
            }
            Err(error) => {
                let message = error.to_string();
                self.with_state(|state| state.fail_backfill(epoch, target, message))?
            }
        };

        match &outcome {
            BackfillOutcome::Applied { inserted, .. } => {
                info!(range = %target, inserted, "older activity loaded");
            }
            BackfillOutcome::Failed { error, .. } => {
                warn!(range = %target, error = %error, "older activity failed to load");
            }
            BackfillOutcome::Stale { .. } => {
                debug!(range = %target, "discarding history loaded for a previous contract");
            }
        }
        Ok(Some(outcome))
    }

    pub fn select_contract(&self, contract: Address) -> Result<FeedEpoch, SyncError> {
        if contract.is_zero() {
            return Err(SyncError::Config(
                "target contract cannot be the zero address".to_string(),
            ));
        }
        let epoch = self.with_state(|state| {
            state.epoch = FeedEpoch {
                contract,
                generation: state.epoch.generation.saturating_add(1),
            };
            state.normalizer = EventNormalizer::new(contract, self.token.clone());
            state.feed.clear();
            state.load.reset();
            state.backfill.reset();
            state.epoch
        })?;
        info!(
            contract = %epoch.contract,
            generation = epoch.generation,
            "switched feed contract"
        );
        Ok(epoch)
    }

    pub fn status(&self) -> Result<FeedStatus, SyncError> {
        self.with_state(|state| {
            let coverage_blocks = state.load.coverage_blocks();
            let span = state.load.coverage_span(state.head);
            let coverage_seconds = self
                .load_more
                .blocks_to_seconds(span.unwrap_or_default());
            let coverage = span.map(|_| {
                format!(
                    "Showing past {} of activity",
                    describe_age(coverage_seconds)
                )
            });
            FeedStatus {
                contract: state.epoch.contract,
                generation: state.epoch.generation,
                chain_id: state.chain_id,
                head: state.head,
                live_watermark: state.load.live_watermark(),
                backfill_watermark: state.load.backfill_watermark(),
                requested_backfill_watermark: state.load.requested_backfill_watermark(),
                entries: state.feed.len(),
                coverage_blocks,
                coverage_seconds,
                coverage,
                history: state.backfill.history_status(&state.load),
                backfill: state.backfill.phase(),
                last_backfill: state.backfill.last_outcome().cloned(),
                diagnostics: state.diagnostics.clone(),
            }
        })
    }

    pub fn feed_page(&self, offset: usize, limit: usize) -> Result<FeedPage, SyncError> {
        self.with_state(|state| {
            let entries = state
                .feed
                .page(offset, limit)
                .iter()
                .map(|event| {
                    let age_seconds = state.head.map(|head| {
                        self.load_more
                            .blocks_to_seconds(head.saturating_sub(event.block_number))
                    });
                    FeedEntry {
                        title: event.title(),
                        event: event.clone(),
                        age_seconds,
                        age: age_seconds.map(describe_age),
                    }
                })
                .collect();
            FeedPage {
                contract: state.epoch.contract,
                total: state.feed.len(),
                offset,
                entries,
            }
        })
    }

    async fn sync_live(&self) -> Result<LiveTick, SyncError> {
        self.ensure_chain_id().await?;
        let head = self.fetcher.block_number().await?;
        let max_range = self.fetcher.max_range();

        let planned = self.with_state(|state| {
            state.head = Some(head);
            state.load.next_live_range(head, max_range).map(|range| {
                (
                    state.epoch,
                    state.load.live_watermark(),
                    state.normalizer.clone(),
                    range,
                )
            })
        })?;
        let Some((epoch, live_before, normalizer, range)) = planned else {
            debug!(head, "feed is up to date");
            return Ok(LiveTick::UpToDate { head });
        };

        let batch = self.load_range(&normalizer, range).await?;
        let (tick, events) = self
            .with_state(|state| state.apply_live(epoch, live_before, range, head, batch))??;
        match tick {
            LiveTick::Applied {
                inserted,
                rejected,
                bootstrapped,
                lag,
                ..
            } => {
                if bootstrapped {
                    info!(head, contract = %epoch.contract, inserted, "feed bootstrapped");
                } else {
                    debug!(range = %range, inserted, rejected, lag, "live batch applied");
                }
                if lag > 0 {
                    warn!(lag, head, "live feed is behind the chain head");
                }
                self.notify(&events)?;
            }
            LiveTick::Stale { .. } => {
                debug!(range = %range, "discarding live batch loaded for a previous contract");
            }
            LiveTick::UpToDate { .. } => {}
        }
        Ok(tick)
    }

    async fn ensure_chain_id(&self) -> Result<(), SyncError> {
        let Some(expected) = self.expected_chain_id else {
            return Ok(());
        };
        if self.with_state(|state| state.chain_id.is_some())? {
            return Ok(());
        }
        let actual = self.fetcher.chain_id().await?;
        if actual != expected {
            return Err(SyncError::ChainIdMismatch { expected, actual });
        }
        self.with_state(|state| state.chain_id = Some(actual))?;
        info!(chain_id = actual, "upstream chain id validated");
        Ok(())
    }

    async fn load_range(
        &self,
        normalizer: &EventNormalizer,
        range: BlockRange,
    ) -> Result<DecodedBatch, SyncError> {
        let fund = normalizer.fund();
        let fund_logs = LogFilter::new(fund, fund_event_signatures(), range);
        let contributions = LogFilter::new(
            normalizer.token().address,
            vec![signature_hash(EventKind::FundsReceived)],
            range,
        )
        .with_indexed(IndexedTopic::Second, fund.into_word());

        let (fund_logs, contributions) = tokio::try_join!(
            self.fetcher.fetch_filtered(fund_logs),
            self.fetcher.fetch_filtered(contributions)
        )?;
        Ok(normalizer.decode_batch(fund_logs.iter().chain(contributions.iter())))
    }

    fn notify(&self, events: &[ActivityEvent]) -> Result<(), SyncError> {
        if events.is_empty() {
            return Ok(());
        }
        let report = {
            let mut dispatcher = self
                .dispatcher
                .lock()
                .map_err(|_| SyncError::StateLock)?;
            dispatcher.dispatch(events)
        };
        for notice in &report.notices {
            debug!(
                category = notice.category.as_str(),
                events = notice.event_count,
                block = notice.latest_block,
                "change notice delivered"
            );
        }
        if report.failures.is_empty() {
            return Ok(());
        }
        for failure in &report.failures {
            warn!(error = %failure, "change listener failed");
        }
        self.with_state(|state| {
            state.diagnostics.listener_failures = state
                .diagnostics
                .listener_failures
                .saturating_add(report.failures.len() as u64);
            for failure in &report.failures {
                state.push_error(failure.to_string());
            }
        })
    }

    fn with_state<R>(&self, update: impl FnOnce(&mut FeedState) -> R) -> Result<R, SyncError> {
        let mut guard = self.state.lock().map_err(|_| SyncError::StateLock)?;
        Ok(update(&mut guard))
    }
}

fn push_recent_error(errors: &mut VecDeque<String>, message: String) {
    if errors.len() >= MAX_RECENT_ERRORS {
        let _ = errors.pop_front();
    }
    errors.push_back(message);
}
