#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

pub use alloy_primitives::{Address, B256, Bytes, U256};
use serde::{Deserialize, Serialize};

pub type BlockNumber = u64;
pub type Timestamp = u64;

pub const MAX_LOG_RANGE: u64 = 1_000;

#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("inverted block range: from {from} is above to {to}")]
    Inverted { from: BlockNumber, to: BlockNumber },
    #[error("block range {from}..={to} spans {span} blocks, exceeding limit {max}")]
    TooWide {
        from: BlockNumber,
        to: BlockNumber,
        span: u64,
        max: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockRange {
    pub from: BlockNumber,
    pub to: BlockNumber,
}

impl BlockRange {
    pub fn new(from: BlockNumber, to: BlockNumber) -> Result<Self, RangeError> {
        if from > to {
            return Err(RangeError::Inverted { from, to });
        }
        Ok(Self { from, to })
    }

    pub fn single(block: BlockNumber) -> Self {
        Self {
            from: block,
            to: block,
        }
    }

    pub fn block_count(&self) -> u64 {
        self.to.saturating_sub(self.from).saturating_add(1)
    }

    pub fn contains(&self, block: BlockNumber) -> bool {
        self.from <= block && block <= self.to
    }

    pub fn ensure_within(&self, max: u64) -> Result<(), RangeError> {
        if self.from > self.to {
            return Err(RangeError::Inverted {
                from: self.from,
                to: self.to,
            });
        }
        let span = self.block_count();
        if span > max {
            return Err(RangeError::TooWide {
                from: self.from,
                to: self.to,
                span,
                max,
            });
        }
        Ok(())
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.from, self.to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeCategory {
    Admin,
    Participant,
    Funds,
    Constitution,
    Name,
}

impl ChangeCategory {
    pub const ALL: [ChangeCategory; 5] = [
        ChangeCategory::Admin,
        ChangeCategory::Participant,
        ChangeCategory::Funds,
        ChangeCategory::Constitution,
        ChangeCategory::Name,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeCategory::Admin => "admin",
            ChangeCategory::Participant => "participant",
            ChangeCategory::Funds => "funds",
            ChangeCategory::Constitution => "constitution",
            ChangeCategory::Name => "name",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    AdminAdded,
    AdminRemoved,
    ParticipantAdded,
    ParticipantRemoved,
    FundsDisbursed,
    NameChanged,
    ConstitutionChanged,
    Knock,
    FundsReceived,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::AdminAdded,
        EventKind::AdminRemoved,
        EventKind::ParticipantAdded,
        EventKind::ParticipantRemoved,
        EventKind::FundsDisbursed,
        EventKind::NameChanged,
        EventKind::ConstitutionChanged,
        EventKind::Knock,
        EventKind::FundsReceived,
    ];

    pub fn title(self) -> &'static str {
        match self {
            EventKind::AdminAdded => "Administrator Added",
            EventKind::AdminRemoved => "Administrator Removed",
            EventKind::ParticipantAdded => "Participant Added",
            EventKind::ParticipantRemoved => "Participant Removed",
            EventKind::FundsDisbursed => "Funds Disbursed",
            EventKind::NameChanged => "Name Changed",
            EventKind::ConstitutionChanged => "Constitution Changed",
            EventKind::Knock => "Message Received",
            EventKind::FundsReceived => "Funds contributed",
        }
    }

    pub fn change_categories(self) -> &'static [ChangeCategory] {
        match self {
            EventKind::AdminAdded | EventKind::AdminRemoved => &[ChangeCategory::Admin],
            EventKind::ParticipantAdded | EventKind::ParticipantRemoved => {
                &[ChangeCategory::Participant, ChangeCategory::Funds]
            }
            EventKind::FundsDisbursed | EventKind::FundsReceived => &[ChangeCategory::Funds],
            EventKind::ConstitutionChanged => &[ChangeCategory::Constitution],
            EventKind::NameChanged => &[ChangeCategory::Name],
            EventKind::Knock => &[],
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId {
    pub tx_hash: B256,
    pub log_index: u64,
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_hash, self.log_index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub kind: EventKind,
    pub actor: Option<Address>,
    pub subject: Option<Address>,
    pub message: Option<String>,
    pub block_number: BlockNumber,
    pub id: EventId,
}

impl ActivityEvent {
    // tx_hash only breaks ties between malformed duplicates.
    pub fn sort_key(&self) -> (BlockNumber, u64, B256) {
        (self.block_number, self.id.log_index, self.id.tx_hash)
    }

    pub fn title(&self) -> &'static str {
        self.kind.title()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: BlockNumber,
    pub transaction_hash: B256,
    pub log_index: u64,
}

impl RawLog {
    pub fn topic0(&self) -> Option<&B256> {
        self.topics.first()
    }

    pub fn id(&self) -> EventId {
        EventId {
            tx_hash: self.transaction_hash,
            log_index: self.log_index,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RosterError {
    #[error("participant {address} has invalid rank 0")]
    ZeroRank { address: Address },
    #[error("participant {address} rank {rank} does not fit in u64")]
    RankOutOfRange { address: Address, rank: U256 },
    #[error("duplicate roster entry for {address}")]
    Duplicate { address: Address },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub address: Address,
    pub rank: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    ranks: BTreeMap<Address, u64>,
}

impl Roster {
    pub fn from_entries(
        entries: impl IntoIterator<Item = RosterEntry>,
    ) -> Result<Self, RosterError> {
        let mut ranks = BTreeMap::new();
        for entry in entries {
            if entry.rank == 0 {
                return Err(RosterError::ZeroRank {
                    address: entry.address,
                });
            }
            if ranks.insert(entry.address, entry.rank).is_some() {
                return Err(RosterError::Duplicate {
                    address: entry.address,
                });
            }
        }
        Ok(Self { ranks })
    }

    pub fn from_parallel(addresses: &[Address], ranks: &[U256]) -> Result<Self, RosterError> {
        let mut entries = Vec::with_capacity(addresses.len().min(ranks.len()));
        for (address, rank) in addresses.iter().zip(ranks) {
            let rank = u64::try_from(*rank).map_err(|_| RosterError::RankOutOfRange {
                address: *address,
                rank: *rank,
            })?;
            entries.push(RosterEntry {
                address: *address,
                rank,
            });
        }
        Self::from_entries(entries)
    }

    pub fn rank_of(&self, address: &Address) -> Option<u64> {
        self.ranks.get(address).copied()
    }

    pub fn participant_count(&self) -> u64 {
        self.ranks.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    pub fn sorted_by_rank(&self) -> Vec<RosterEntry> {
        let mut entries: Vec<RosterEntry> = self
            .ranks
            .iter()
            .map(|(address, rank)| RosterEntry {
                address: *address,
                rank: *rank,
            })
            .collect();
        entries.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.address.cmp(&b.address)));
        entries
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleParameters {
    pub start_time: Timestamp,
    pub cycle_length: u64,
    pub participant_count: u64,
}

impl CycleParameters {
    pub fn is_degenerate(&self) -> bool {
        self.cycle_length == 0 || self.participant_count == 0
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::address;

    use super::*;

    #[test]
    fn block_range_rejects_inverted_and_oversized_spans() {
        assert_eq!(
            BlockRange::new(10, 9),
            Err(RangeError::Inverted { from: 10, to: 9 })
        );
        let range = BlockRange::new(0, MAX_LOG_RANGE - 1).expect("valid range");
        assert_eq!(range.block_count(), MAX_LOG_RANGE);
        assert!(range.ensure_within(MAX_LOG_RANGE).is_ok());

        let wide = BlockRange::new(0, MAX_LOG_RANGE).expect("valid range");
        assert_eq!(
            wide.ensure_within(MAX_LOG_RANGE),
            Err(RangeError::TooWide {
                from: 0,
                to: MAX_LOG_RANGE,
                span: MAX_LOG_RANGE + 1,
                max: MAX_LOG_RANGE,
            })
        );
    }

    #[test]
    fn roster_sorts_by_rank_then_address() {
        let low = address!("0x0000000000000000000000000000000000000001");
        let high = address!("0x00000000000000000000000000000000000000ff");
        let other = address!("0x0000000000000000000000000000000000000042");
        let roster = Roster::from_entries([
            RosterEntry {
                address: high,
                rank: 2,
            },
            RosterEntry {
                address: other,
                rank: 1,
            },
            RosterEntry {
                address: low,
                rank: 2,
            },
        ])
        .expect("valid roster");

        let sorted: Vec<Address> = roster
            .sorted_by_rank()
            .into_iter()
            .map(|entry| entry.address)
            .collect();
        assert_eq!(sorted, vec![other, low, high]);
        assert_eq!(roster.rank_of(&high), Some(2));
        assert_eq!(roster.participant_count(), 3);
    }

    #[test]
    fn roster_from_parallel_truncates_and_validates_ranks() {
        let a = address!("0x00000000000000000000000000000000000000aa");
        let b = address!("0x00000000000000000000000000000000000000bb");
        let roster = Roster::from_parallel(&[a, b], &[U256::from(3_u64)]).expect("valid roster");
        assert_eq!(roster.participant_count(), 1);
        assert_eq!(roster.rank_of(&b), None);

        let error = Roster::from_parallel(&[a], &[U256::ZERO]).expect_err("rank 0 rejected");
        assert_eq!(error, RosterError::ZeroRank { address: a });

        let error =
            Roster::from_parallel(&[a], &[U256::MAX]).expect_err("oversized rank rejected");
        assert!(matches!(error, RosterError::RankOutOfRange { .. }));
    }

    #[test]
    fn roster_changes_also_touch_funds() {
        assert_eq!(
            EventKind::ParticipantRemoved.change_categories(),
            &[ChangeCategory::Participant, ChangeCategory::Funds]
        );
        assert!(EventKind::Knock.change_categories().is_empty());
        assert_eq!(EventKind::FundsReceived.title(), "Funds contributed");
    }

    #[test]
    fn activity_event_serializes_kind_by_name() {
        let event = ActivityEvent {
            kind: EventKind::Knock,
            actor: None,
            subject: None,
            message: Some("hello".to_string()),
            block_number: 7,
            id: EventId {
                tx_hash: B256::ZERO,
                log_index: 3,
            },
        };
        let encoded = serde_json::to_value(&event).expect("serialize");
        assert_eq!(encoded["kind"], "Knock");
        assert_eq!(encoded["id"]["log_index"], 3);
    }
}
