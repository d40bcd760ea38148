#![forbid(unsafe_code)]

use std::collections::HashSet;

use fund_feed_types::{ActivityEvent, BlockNumber, BlockRange, EventId};
use serde::Serialize;

pub fn merge_and_sort(batches: impl IntoIterator<Item = Vec<ActivityEvent>>) -> Vec<ActivityEvent> {
    let mut merged: Vec<ActivityEvent> = batches.into_iter().flatten().collect();
    merged.sort_by_key(ActivityEvent::sort_key);
    let mut seen = HashSet::with_capacity(merged.len());
    merged.retain(|event| seen.insert(event.id));
    merged
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AppendReport {
    pub inserted: usize,
    pub duplicates: usize,
    pub reordered: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FeedAggregator {
    entries: Vec<ActivityEvent>,
    ids: HashSet<EventId>,
}

impl FeedAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ActivityEvent] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.ids.contains(id)
    }

    pub fn newest_block(&self) -> Option<BlockNumber> {
        self.entries.first().map(|event| event.block_number)
    }

    pub fn oldest_block(&self) -> Option<BlockNumber> {
        self.entries.last().map(|event| event.block_number)
    }

    pub fn page(&self, offset: usize, limit: usize) -> &[ActivityEvent] {
        let start = offset.min(self.entries.len());
        let end = start.saturating_add(limit).min(self.entries.len());
        &self.entries[start..end]
    }

    pub fn append_live(&mut self, ascending: Vec<ActivityEvent>) -> AppendReport {
        let (mut fresh, duplicates) = self.take_fresh(ascending.into_iter().rev());
        let inserted = fresh.len();
        fresh.append(&mut self.entries);
        self.entries = fresh;
        let reordered = self.restore_order();
        AppendReport {
            inserted,
            duplicates,
            reordered,
        }
    }

    pub fn append_historical(&mut self, descending: Vec<ActivityEvent>) -> AppendReport {
        let (fresh, duplicates) = self.take_fresh(descending.into_iter());
        let inserted = fresh.len();
        self.entries.extend(fresh);
        let reordered = self.restore_order();
        AppendReport {
            inserted,
            duplicates,
            reordered,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.ids.clear();
    }

    fn take_fresh(
        &mut self,
        events: impl Iterator<Item = ActivityEvent>,
    ) -> (Vec<ActivityEvent>, usize) {
        let mut fresh = Vec::new();
        let mut duplicates = 0;
        for event in events {
            if self.ids.insert(event.id) {
                fresh.push(event);
            } else {
                duplicates += 1;
            }
        }
        (fresh, duplicates)
    }

    // A batch that overlaps the existing span would break the descending order.
    fn restore_order(&mut self) -> bool {
        let ordered = self
            .entries
            .windows(2)
            .all(|pair| pair[0].sort_key() >= pair[1].sort_key());
        if ordered {
            return false;
        }
        self.entries
            .sort_by(|a, b| b.sort_key().cmp(&a.sort_key()));
        true
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LoadStateError {
    #[error("feed load state is not bootstrapped")]
    NotBootstrapped,
    #[error("feed load state already bootstrapped at block {0}")]
    AlreadyBootstrapped(BlockNumber),
    #[error("live watermark cannot move backwards from {current} to {proposed}")]
    LiveRegression {
        current: BlockNumber,
        proposed: BlockNumber,
    },
    #[error("backfill watermark cannot move forwards from {current} to {proposed}")]
    BackfillRegression {
        current: BlockNumber,
        proposed: BlockNumber,
    },
    #[error("backfill down to {proposed} is below the requested watermark {requested}")]
    BeyondRequest {
        requested: BlockNumber,
        proposed: BlockNumber,
    },
}

// backfill..=live is loaded; requested..backfill is wanted but not loaded yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeedLoadState {
    live_watermark: Option<BlockNumber>,
    backfill_watermark: Option<BlockNumber>,
    requested_backfill_watermark: Option<BlockNumber>,
}

impl FeedLoadState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.live_watermark.is_some()
    }

    pub fn live_watermark(&self) -> Option<BlockNumber> {
        self.live_watermark
    }

    pub fn backfill_watermark(&self) -> Option<BlockNumber> {
        self.backfill_watermark
    }

    pub fn requested_backfill_watermark(&self) -> Option<BlockNumber> {
        self.requested_backfill_watermark
    }

    pub fn next_live_range(&self, head: BlockNumber, max_range: u64) -> Option<BlockRange> {
        match self.live_watermark {
            None => Some(BlockRange::single(head)),
            Some(live) if head > live => {
                let from = live.saturating_add(1);
                let to = from
                    .saturating_add(max_range.max(1).saturating_sub(1))
                    .min(head);
                Some(BlockRange { from, to })
            }
            Some(_) => None,
        }
    }

    pub fn bootstrap(&mut self, head: BlockNumber) -> Result<(), LoadStateError> {
        if let Some(live) = self.live_watermark {
            return Err(LoadStateError::AlreadyBootstrapped(live));
        }
        self.live_watermark = Some(head);
        self.backfill_watermark = Some(head);
        self.requested_backfill_watermark = Some(head);
        Ok(())
    }

    pub fn advance_live(&mut self, to: BlockNumber) -> Result<(), LoadStateError> {
        let current = self
            .live_watermark
            .ok_or(LoadStateError::NotBootstrapped)?;
        if to < current {
            return Err(LoadStateError::LiveRegression {
                current,
                proposed: to,
            });
        }
        self.live_watermark = Some(to);
        Ok(())
    }

    pub fn request_backfill(&mut self, blocks: u64) -> Result<BlockNumber, LoadStateError> {
        let requested = self
            .requested_backfill_watermark
            .ok_or(LoadStateError::NotBootstrapped)?;
        let lowered = requested.saturating_sub(blocks);
        self.requested_backfill_watermark = Some(lowered);
        Ok(lowered)
    }

    pub fn pending_backfill(&self) -> Option<BlockRange> {
        let backfill = self.backfill_watermark?;
        let requested = self.requested_backfill_watermark?;
        if requested >= backfill {
            return None;
        }
        Some(BlockRange {
            from: requested,
            to: backfill - 1,
        })
    }

    pub fn complete_backfill(&mut self, down_to: BlockNumber) -> Result<(), LoadStateError> {
        let current = self
            .backfill_watermark
            .ok_or(LoadStateError::NotBootstrapped)?;
        if down_to > current {
            return Err(LoadStateError::BackfillRegression {
                current,
                proposed: down_to,
            });
        }
        if let Some(requested) = self.requested_backfill_watermark
            && down_to < requested
        {
            return Err(LoadStateError::BeyondRequest {
                requested,
                proposed: down_to,
            });
        }
        self.backfill_watermark = Some(down_to);
        Ok(())
    }

    pub fn is_history_exhausted(&self) -> bool {
        self.backfill_watermark == Some(0)
    }

    pub fn coverage_blocks(&self) -> u64 {
        match (self.backfill_watermark, self.live_watermark) {
            (Some(backfill), Some(live)) => live.saturating_sub(backfill).saturating_add(1),
            _ => 0,
        }
    }

    pub fn coverage_span(&self, head: Option<BlockNumber>) -> Option<u64> {
        let backfill = self.backfill_watermark?;
        let head = head.or(self.live_watermark)?;
        Some(head.saturating_sub(backfill))
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
