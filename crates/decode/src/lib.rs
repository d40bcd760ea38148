#![forbid(unsafe_code)]

use alloy_sol_types::{SolEvent, sol};
use fund_feed_types::{ActivityEvent, Address, B256, EventId, EventKind, RawLog, U256};

sol! {
    #[allow(missing_docs)]
    contract IFund {
        event AdminAdded(address indexed admin, address indexed by, uint256 rank, string memo);
        event AdminRemoved(address indexed admin, address indexed by, uint256 rank, string memo);
        event ParticipantAdded(address indexed participant, address indexed by, uint256 rank, string memo);
        event ParticipantRemoved(address indexed participant, address indexed by, uint256 rank, string memo);
        event FundsDisbursed(address indexed token, address indexed by, uint256 amount, string memo);
        event ConstitutionChanged(address indexed by, string constitution);
        event NameChanged(address indexed by, string name);
        event Knock(address indexed addr, string memo);
    }
}

sol! {
    #[allow(missing_docs)]
    contract IErc20 {
        event Transfer(address indexed from, address indexed to, uint256 value);
    }
}

/// Kinds emitted by the fund contract itself. `FundsReceived` comes from the token.
pub const FUND_EVENT_KINDS: [EventKind; 8] = [
    EventKind::AdminAdded,
    EventKind::AdminRemoved,
    EventKind::ParticipantAdded,
    EventKind::ParticipantRemoved,
    EventKind::FundsDisbursed,
    EventKind::NameChanged,
    EventKind::ConstitutionChanged,
    EventKind::Knock,
];

pub fn signature_hash(kind: EventKind) -> B256 {
    match kind {
        EventKind::AdminAdded => IFund::AdminAdded::SIGNATURE_HASH,
        EventKind::AdminRemoved => IFund::AdminRemoved::SIGNATURE_HASH,
        EventKind::ParticipantAdded => IFund::ParticipantAdded::SIGNATURE_HASH,
        EventKind::ParticipantRemoved => IFund::ParticipantRemoved::SIGNATURE_HASH,
        EventKind::FundsDisbursed => IFund::FundsDisbursed::SIGNATURE_HASH,
        EventKind::NameChanged => IFund::NameChanged::SIGNATURE_HASH,
        EventKind::ConstitutionChanged => IFund::ConstitutionChanged::SIGNATURE_HASH,
        EventKind::Knock => IFund::Knock::SIGNATURE_HASH,
        EventKind::FundsReceived => IErc20::Transfer::SIGNATURE_HASH,
    }
}

pub fn kind_for_topic(topic0: &B256) -> Option<EventKind> {
    EventKind::ALL
        .into_iter()
        .find(|kind| signature_hash(*kind) == *topic0)
}

pub fn fund_event_signatures() -> Vec<B256> {
    FUND_EVENT_KINDS.into_iter().map(signature_hash).collect()
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("log {id} carries no topics")]
    MissingTopics { id: EventId },
    #[error("log {id} from {emitter} has unrecognized topic0 {topic0}")]
    UnrecognizedEvent {
        id: EventId,
        emitter: Address,
        topic0: B256,
    },
    #[error("log {id} decoded as {kind} but was emitted by {emitter}, expected {expected}")]
    UnexpectedEmitter {
        id: EventId,
        kind: EventKind,
        emitter: Address,
        expected: Address,
    },
    #[error("log {id} failed to decode as {kind}: {message}")]
    Malformed {
        id: EventId,
        kind: EventKind,
        message: String,
    },
    #[error("transfer {id} is addressed to {to}, not the fund {fund}")]
    ForeignTransfer {
        id: EventId,
        to: Address,
        fund: Address,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenDescriptor {
    pub address: Address,
    pub decimals: u8,
    pub symbol: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DecodedBatch {
    pub events: Vec<ActivityEvent>,
    pub rejected: Vec<DecodeError>,
}

struct EventFields {
    actor: Option<Address>,
    subject: Option<Address>,
    message: Option<String>,
}

/// Maps raw logs of one fund (and its contribution token) onto `ActivityEvent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventNormalizer {
    fund: Address,
    token: TokenDescriptor,
}

impl EventNormalizer {
    pub fn new(fund: Address, token: TokenDescriptor) -> Self {
        Self { fund, token }
    }

    pub fn fund(&self) -> Address {
        self.fund
    }

    pub fn token(&self) -> &TokenDescriptor {
        &self.token
    }

    pub fn decode(&self, raw: &RawLog) -> Result<ActivityEvent, DecodeError> {
        let id = raw.id();
        let topic0 = raw.topic0().ok_or(DecodeError::MissingTopics { id })?;
        let kind = kind_for_topic(topic0).ok_or(DecodeError::UnrecognizedEvent {
            id,
            emitter: raw.address,
            topic0: *topic0,
        })?;

        let expected = match kind {
            EventKind::FundsReceived => self.token.address,
            _ => self.fund,
        };
        if raw.address != expected {
            return Err(DecodeError::UnexpectedEmitter {
                id,
                kind,
                emitter: raw.address,
                expected,
            });
        }

        let fields = match kind {
            EventKind::AdminAdded => {
                let event = decode_as::<IFund::AdminAdded>(raw, kind)?;
                roster_fields(event.by, event.admin, event.memo)
            }
            EventKind::AdminRemoved => {
                let event = decode_as::<IFund::AdminRemoved>(raw, kind)?;
                roster_fields(event.by, event.admin, event.memo)
            }
            EventKind::ParticipantAdded => {
                let event = decode_as::<IFund::ParticipantAdded>(raw, kind)?;
                roster_fields(event.by, event.participant, event.memo)
            }
            EventKind::ParticipantRemoved => {
                let event = decode_as::<IFund::ParticipantRemoved>(raw, kind)?;
                roster_fields(event.by, event.participant, event.memo)
            }
            EventKind::FundsDisbursed => {
                let event = decode_as::<IFund::FundsDisbursed>(raw, kind)?;
                roster_fields(event.by, event.token, event.memo)
            }
            EventKind::ConstitutionChanged => {
                let event = decode_as::<IFund::ConstitutionChanged>(raw, kind)?;
                EventFields {
                    actor: Some(event.by),
                    subject: None,
                    message: Some(event.constitution),
                }
            }
            EventKind::NameChanged => {
                let event = decode_as::<IFund::NameChanged>(raw, kind)?;
                EventFields {
                    actor: Some(event.by),
                    subject: None,
                    message: Some(event.name),
                }
            }
            EventKind::Knock => {
                let event = decode_as::<IFund::Knock>(raw, kind)?;
                EventFields {
                    actor: Some(event.addr),
                    subject: None,
                    message: Some(event.memo),
                }
            }
            EventKind::FundsReceived => {
                let event = decode_as::<IErc20::Transfer>(raw, kind)?;
                if event.to != self.fund {
                    return Err(DecodeError::ForeignTransfer {
                        id,
                        to: event.to,
                        fund: self.fund,
                    });
                }
                EventFields {
                    actor: Some(event.from),
                    subject: None,
                    message: Some(format_token_amount(
                        event.value,
                        self.token.decimals,
                        &self.token.symbol,
                    )),
                }
            }
        };

        Ok(ActivityEvent {
            kind,
            actor: fields.actor,
            subject: fields.subject,
            message: fields.message,
            block_number: raw.block_number,
            id,
        })
    }

    /// Decodes every log; rejected logs are returned alongside so callers can report them.
    pub fn decode_batch<'a>(&self, logs: impl IntoIterator<Item = &'a RawLog>) -> DecodedBatch {
        let mut batch = DecodedBatch::default();
        for raw in logs {
            match self.decode(raw) {
                Ok(event) => batch.events.push(event),
                Err(error) => batch.rejected.push(error),
            }
        }
        batch
    }
}

fn roster_fields(by: Address, subject: Address, memo: String) -> EventFields {
    EventFields {
        actor: Some(by),
        subject: Some(subject),
        message: Some(memo),
    }
}

fn decode_as<E: SolEvent>(raw: &RawLog, kind: EventKind) -> Result<E, DecodeError> {
    E::decode_raw_log(raw.topics.iter().copied(), raw.data.as_ref(), true).map_err(|error| {
        DecodeError::Malformed {
            id: raw.id(),
            kind,
            message: error.to_string(),
        }
    })
}

/// Renders a base-unit amount with two truncated fractional digits, e.g. `12.50 USDC`.
pub fn format_token_amount(value: U256, decimals: u8, symbol: &str) -> String {
    let Some(scale) = U256::from(10_u64).checked_pow(U256::from(decimals)) else {
        return format!("{value} {symbol}");
    };
    let whole = value / scale;
    let remainder = value % scale;
    let cents = if decimals >= 2 {
        remainder / (scale / U256::from(100_u64))
    } else {
        remainder * U256::from(100_u64) / scale
    };
    let cents = u64::try_from(cents).unwrap_or_default();
    format!("{whole}.{cents:02} {symbol}")
}

#[cfg(test)]
mod tests {
    use fund_feed_types::Bytes;

    use super::*;

    fn fund() -> Address {
        Address::repeat_byte(0xf0)
    }

    fn usdc() -> TokenDescriptor {
        TokenDescriptor {
            address: Address::repeat_byte(0xcc),
            decimals: 6,
            symbol: "USDC".to_string(),
        }
    }

    fn normalizer() -> EventNormalizer {
        EventNormalizer::new(fund(), usdc())
    }

    fn raw_log<E: SolEvent>(emitter: Address, event: &E, block: u64, log_index: u64) -> RawLog {
        let encoded = event.encode_log_data();
        RawLog {
            address: emitter,
            topics: encoded.topics().to_vec(),
            data: encoded.data.clone(),
            block_number: block,
            transaction_hash: B256::repeat_byte(block as u8),
            log_index,
        }
    }

    #[test]
    fn maps_admin_added_to_actor_and_subject() {
        let admin = Address::repeat_byte(0x01);
        let by = Address::repeat_byte(0x02);
        let log = raw_log(
            fund(),
            &IFund::AdminAdded {
                admin,
                by,
                rank: U256::from(1_u64),
                memo: "welcome".to_string(),
            },
            42,
            3,
        );

        let event = normalizer().decode(&log).expect("decode admin added");
        assert_eq!(event.kind, EventKind::AdminAdded);
        assert_eq!(event.actor, Some(by));
        assert_eq!(event.subject, Some(admin));
        assert_eq!(event.message.as_deref(), Some("welcome"));
        assert_eq!(event.block_number, 42);
        assert_eq!(event.id.log_index, 3);
        assert_eq!(event.title(), "Administrator Added");
    }

    #[test]
    fn maps_knock_and_name_changes() {
        let sender = Address::repeat_byte(0x07);
        let knock = raw_log(
            fund(),
            &IFund::Knock {
                addr: sender,
                memo: "let me in".to_string(),
            },
            5,
            0,
        );
        let event = normalizer().decode(&knock).expect("decode knock");
        assert_eq!(event.kind, EventKind::Knock);
        assert_eq!(event.actor, Some(sender));
        assert_eq!(event.subject, None);

        let rename = raw_log(
            fund(),
            &IFund::NameChanged {
                by: sender,
                name: "Garden Club".to_string(),
            },
            6,
            1,
        );
        let event = normalizer().decode(&rename).expect("decode rename");
        assert_eq!(event.kind, EventKind::NameChanged);
        assert_eq!(event.message.as_deref(), Some("Garden Club"));
    }

    #[test]
    fn transfer_to_fund_becomes_contribution_with_formatted_amount() {
        let donor = Address::repeat_byte(0x0d);
        let log = raw_log(
            usdc().address,
            &IErc20::Transfer {
                from: donor,
                to: fund(),
                value: U256::from(12_500_000_u64),
            },
            9,
            2,
        );

        let event = normalizer().decode(&log).expect("decode transfer");
        assert_eq!(event.kind, EventKind::FundsReceived);
        assert_eq!(event.actor, Some(donor));
        assert_eq!(event.message.as_deref(), Some("12.50 USDC"));
    }

    #[test]
    fn transfer_to_other_recipient_is_rejected() {
        let stranger = Address::repeat_byte(0x99);
        let log = raw_log(
            usdc().address,
            &IErc20::Transfer {
                from: Address::repeat_byte(0x0d),
                to: stranger,
                value: U256::from(1_u64),
            },
            9,
            2,
        );

        let error = normalizer().decode(&log).expect_err("foreign transfer");
        assert!(matches!(error, DecodeError::ForeignTransfer { to, .. } if to == stranger));
    }

    #[test]
    fn fund_event_from_other_contract_is_rejected() {
        let log = raw_log(
            Address::repeat_byte(0x55),
            &IFund::Knock {
                addr: Address::repeat_byte(0x07),
                memo: String::new(),
            },
            5,
            0,
        );

        let error = normalizer().decode(&log).expect_err("unexpected emitter");
        assert!(matches!(
            error,
            DecodeError::UnexpectedEmitter {
                kind: EventKind::Knock,
                ..
            }
        ));
    }

    #[test]
    fn unknown_topic_is_reported_not_dropped() {
        let known = raw_log(
            fund(),
            &IFund::Knock {
                addr: Address::repeat_byte(0x07),
                memo: "hi".to_string(),
            },
            5,
            0,
        );
        let unknown = RawLog {
            address: fund(),
            topics: vec![B256::repeat_byte(0xab)],
            data: Bytes::new(),
            block_number: 5,
            transaction_hash: B256::repeat_byte(0x05),
            log_index: 1,
        };
        let empty = RawLog {
            topics: Vec::new(),
            log_index: 2,
            ..unknown.clone()
        };

        let batch = normalizer().decode_batch([&known, &unknown, &empty]);
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.rejected.len(), 2);
        assert!(matches!(
            batch.rejected[0],
            DecodeError::UnrecognizedEvent { topic0, .. } if topic0 == B256::repeat_byte(0xab)
        ));
        assert!(matches!(batch.rejected[1], DecodeError::MissingTopics { .. }));
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let mut log = raw_log(
            fund(),
            &IFund::ConstitutionChanged {
                by: Address::repeat_byte(0x02),
                constitution: "be kind".to_string(),
            },
            8,
            0,
        );
        log.data = Bytes::from(vec![0_u8; 8]);

        let error = normalizer().decode(&log).expect_err("malformed payload");
        assert!(matches!(
            error,
            DecodeError::Malformed {
                kind: EventKind::ConstitutionChanged,
                ..
            }
        ));
    }

    #[test]
    fn signatures_are_distinct_and_resolvable() {
        let signatures = fund_event_signatures();
        assert_eq!(signatures.len(), FUND_EVENT_KINDS.len());
        for kind in EventKind::ALL {
            assert_eq!(kind_for_topic(&signature_hash(kind)), Some(kind));
        }
        assert!(!signatures.contains(&signature_hash(EventKind::FundsReceived)));
    }

    #[test]
    fn formats_token_amounts_with_truncated_cents() {
        assert_eq!(
            format_token_amount(U256::from(1_234_567_890_u64), 6, "USDC"),
            "1234.56 USDC"
        );
        assert_eq!(format_token_amount(U256::ZERO, 6, "USDC"), "0.00 USDC");
        assert_eq!(format_token_amount(U256::from(7_u64), 0, "PTS"), "7.00 PTS");
    }

    #[test]
    fn formats_token_amounts_at_the_widest_decimals() {
        let scale = |decimals: u64| {
            U256::from(10_u64)
                .checked_pow(U256::from(decimals))
                .expect("scale fits in U256")
        };
        let half_76 = scale(76) / U256::from(2_u64);
        assert_eq!(format_token_amount(half_76, 76, "BIG"), "0.50 BIG");

        let amount = scale(77) + scale(77) / U256::from(10_u64);
        assert_eq!(format_token_amount(amount, 77, "BIG"), "1.10 BIG");

        assert_eq!(format_token_amount(U256::from(15_u64), 1, "DEC"), "1.50 DEC");
    }
}
