use std::future::Future;

use fund_feed_storage::{FeedAggregator, FeedLoadState, LoadStateError, merge_and_sort};
use fund_feed_types::{ActivityEvent, BlockRange};
use futures::future::try_join_all;
use serde::Serialize;

pub const DEFAULT_BACKFILL_CONCURRENCY: usize = 2;

pub fn split_chunks(pending: BlockRange, max_range: u64) -> Vec<BlockRange> {
    let width = max_range.max(1) - 1;
    let mut chunks = Vec::new();
    let mut upper = pending.to;
    loop {
        let lower = upper.saturating_sub(width).max(pending.from);
        chunks.push(BlockRange {
            from: lower,
            to: upper,
        });
        if lower <= pending.from {
            break;
        }
        upper = lower - 1;
    }
    chunks
}

pub async fn load_in_batches<T, E, F, Fut>(
    chunks: &[BlockRange],
    concurrency: usize,
    mut load: F,
    mut on_batch: impl FnMut(usize) -> Result<(), E>,
) -> Result<Vec<T>, E>
where
    F: FnMut(BlockRange) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut loaded = Vec::with_capacity(chunks.len());
    for group in chunks.chunks(concurrency.max(1)) {
        let results = try_join_all(group.iter().copied().map(&mut load)).await?;
        loaded.extend(results);
        on_batch(loaded.len())?;
    }
    Ok(loaded)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum BackfillPhase {
    Idle,
    AwaitingRequest,
    Loading {
        target: BlockRange,
        chunks_total: usize,
        chunks_done: usize,
        in_flight: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum BackfillOutcome {
    Applied {
        range: BlockRange,
        chunks: usize,
        inserted: usize,
        duplicates: usize,
    },
    Failed {
        range: BlockRange,
        error: String,
    },
    Stale {
        range: BlockRange,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Unknown,
    Available,
    Pending,
    Exhausted,
}

#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
pub enum RequestRejected {
    #[error("feed has not loaded its first block yet")]
    NotBootstrapped,
    #[error("backfill of {0} is already in flight")]
    Busy(BlockRange),
    #[error("history is fully loaded back to genesis")]
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RequestAccepted {
    pub pending: BlockRange,
    pub retry: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillPlan {
    pub target: BlockRange,
    pub chunks: Vec<BlockRange>,
    pub concurrency: usize,
}

#[derive(Debug, Clone)]
pub struct BackfillScheduler {
    step_blocks: u64,
    max_range: u64,
    concurrency: usize,
    phase: BackfillPhase,
    last_outcome: Option<BackfillOutcome>,
}

impl BackfillScheduler {
    pub fn new(step_blocks: u64, max_range: u64, concurrency: usize) -> Self {
        Self {
            step_blocks: step_blocks.max(1),
            max_range: max_range.max(1),
            concurrency: concurrency.max(1),
            phase: BackfillPhase::Idle,
            last_outcome: None,
        }
    }

    pub fn step_blocks(&self) -> u64 {
        self.step_blocks
    }

    pub fn phase(&self) -> BackfillPhase {
        self.phase
    }

    pub fn last_outcome(&self) -> Option<&BackfillOutcome> {
        self.last_outcome.as_ref()
    }

    pub fn on_bootstrap(&mut self) {
        if self.phase == BackfillPhase::Idle {
            self.phase = BackfillPhase::AwaitingRequest;
        }
    }

    pub fn history_status(&self, load: &FeedLoadState) -> HistoryStatus {
        if !load.is_bootstrapped() {
            HistoryStatus::Unknown
        } else if load.pending_backfill().is_some() {
            HistoryStatus::Pending
        } else if load.is_history_exhausted() {
            HistoryStatus::Exhausted
        } else {
            HistoryStatus::Available
        }
    }

    pub fn request(&mut self, load: &mut FeedLoadState) -> Result<RequestAccepted, RequestRejected> {
        if !load.is_bootstrapped() {
            return Err(RequestRejected::NotBootstrapped);
        }
        if let BackfillPhase::Loading { target, .. } = self.phase {
            return Err(RequestRejected::Busy(target));
        }
        if let Some(pending) = load.pending_backfill() {
            return Ok(RequestAccepted {
                pending,
                retry: true,
            });
        }
        if load.is_history_exhausted() {
            return Err(RequestRejected::Exhausted);
        }
        load.request_backfill(self.step_blocks)
            .map_err(|_| RequestRejected::NotBootstrapped)?;
        let pending = load.pending_backfill().ok_or(RequestRejected::Exhausted)?;
        Ok(RequestAccepted {
            pending,
            retry: false,
        })
    }

    pub fn begin(&mut self, load: &FeedLoadState) -> Option<BackfillPlan> {
        if matches!(self.phase, BackfillPhase::Loading { .. }) {
            return None;
        }
        let target = load.pending_backfill()?;
        let chunks = split_chunks(target, self.max_range);
        self.phase = BackfillPhase::Loading {
            target,
            chunks_total: chunks.len(),
            chunks_done: 0,
            in_flight: chunks.len().min(self.concurrency),
        };
        Some(BackfillPlan {
            target,
            chunks,
            concurrency: self.concurrency,
        })
    }

    pub fn record_progress(&mut self, target: BlockRange, loaded: usize) {
        let concurrency = self.concurrency;
        if let BackfillPhase::Loading {
            target: current,
            chunks_total,
            chunks_done,
            in_flight,
        } = &mut self.phase
            && *current == target
        {
            *chunks_done = loaded.min(*chunks_total);
            *in_flight = chunks_total.saturating_sub(*chunks_done).min(concurrency);
        }
    }

    pub fn complete(
        &mut self,
        load: &mut FeedLoadState,
        feed: &mut FeedAggregator,
        target: BlockRange,
        batches: Vec<Vec<ActivityEvent>>,
    ) -> Result<BackfillOutcome, LoadStateError> {
        let in_flight = match self.phase {
            BackfillPhase::Loading {
                target: current,
                chunks_total,
                ..
            } if current == target => Some(chunks_total),
            _ => None,
        };
        let Some(chunks) = in_flight.filter(|_| load.pending_backfill() == Some(target)) else {
            return Ok(self.settle(BackfillOutcome::Stale { range: target }));
        };

        if let Err(error) = load.complete_backfill(target.from) {
            self.phase = BackfillPhase::AwaitingRequest;
            return Err(error);
        }
        let mut merged = merge_and_sort(batches);
        merged.reverse();
        let report = feed.append_historical(merged);
        Ok(self.settle(BackfillOutcome::Applied {
            range: target,
            chunks,
            inserted: report.inserted,
            duplicates: report.duplicates,
        }))
    }

    pub fn fail(&mut self, target: BlockRange, error: String) -> BackfillOutcome {
        match self.phase {
            BackfillPhase::Loading {
                target: current, ..
            } if current == target => self.settle(BackfillOutcome::Failed {
                range: target,
                error,
            }),
            _ => self.settle(BackfillOutcome::Stale { range: target }),
        }
    }

    pub fn reset(&mut self) {
        self.phase = BackfillPhase::Idle;
        self.last_outcome = None;
    }

    fn settle(&mut self, outcome: BackfillOutcome) -> BackfillOutcome {
        if !matches!(outcome, BackfillOutcome::Stale { .. }) {
            self.phase = BackfillPhase::AwaitingRequest;
        }
        self.last_outcome = Some(outcome.clone());
        outcome
    }
}
