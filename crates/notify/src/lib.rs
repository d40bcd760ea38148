#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use fund_feed_types::{ActivityEvent, BlockNumber, ChangeCategory};
use serde::Serialize;

/// What a listener learns about a batch: which canonical state may be stale,
/// how many events touched it, and the newest block among them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChangeNotice {
    pub category: ChangeCategory,
    pub event_count: usize,
    pub latest_block: BlockNumber,
}

/// Hooks a consumer uses to refresh canonical contract state. Every hook is
/// optional and fires at most once per live batch.
pub trait ChangeListener: Send {
    fn on_admin_change(&mut self, _notice: &ChangeNotice) -> Result<(), String> {
        Ok(())
    }

    fn on_participant_change(&mut self, _notice: &ChangeNotice) -> Result<(), String> {
        Ok(())
    }

    fn on_funds_change(&mut self, _notice: &ChangeNotice) -> Result<(), String> {
        Ok(())
    }

    fn on_constitution_change(&mut self, _notice: &ChangeNotice) -> Result<(), String> {
        Ok(())
    }

    fn on_name_change(&mut self, _notice: &ChangeNotice) -> Result<(), String> {
        Ok(())
    }
}

fn deliver(listener: &mut dyn ChangeListener, notice: &ChangeNotice) -> Result<(), String> {
    match notice.category {
        ChangeCategory::Admin => listener.on_admin_change(notice),
        ChangeCategory::Participant => listener.on_participant_change(notice),
        ChangeCategory::Funds => listener.on_funds_change(notice),
        ChangeCategory::Constitution => listener.on_constitution_change(notice),
        ChangeCategory::Name => listener.on_name_change(notice),
    }
}

pub struct ListenerRegistration {
    pub name: String,
    pub listener: Box<dyn ChangeListener>,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum NotifyError {
    #[error("listener '{0}' is already registered")]
    DuplicateListener(String),
    #[error("listener '{name}' failed on {category} change: {message}")]
    ListenerFailure {
        name: String,
        category: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub notices: Vec<ChangeNotice>,
    pub failures: Vec<NotifyError>,
}

/// Groups a batch's events by change category and notifies every listener once
/// per category. A failing listener does not stop delivery to the others.
#[derive(Default)]
pub struct ChangeDispatcher {
    listeners: Vec<(String, Box<dyn ChangeListener>)>,
}

impl ChangeDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, registration: ListenerRegistration) -> Result<(), NotifyError> {
        if self
            .listeners
            .iter()
            .any(|(name, _)| *name == registration.name)
        {
            return Err(NotifyError::DuplicateListener(registration.name));
        }
        self.listeners
            .push((registration.name, registration.listener));
        Ok(())
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn notices_for(events: &[ActivityEvent]) -> Vec<ChangeNotice> {
        let mut grouped: BTreeMap<ChangeCategory, ChangeNotice> = BTreeMap::new();
        for event in events {
            for category in event.kind.change_categories() {
                let notice = grouped.entry(*category).or_insert(ChangeNotice {
                    category: *category,
                    event_count: 0,
                    latest_block: event.block_number,
                });
                notice.event_count += 1;
                notice.latest_block = notice.latest_block.max(event.block_number);
            }
        }
        grouped.into_values().collect()
    }

    pub fn dispatch(&mut self, events: &[ActivityEvent]) -> DispatchReport {
        let notices = Self::notices_for(events);
        let mut failures = Vec::new();
        for notice in &notices {
            for (name, listener) in &mut self.listeners {
                if let Err(message) = deliver(listener.as_mut(), notice) {
                    failures.push(NotifyError::ListenerFailure {
                        name: name.clone(),
                        category: notice.category.as_str(),
                        message,
                    });
                }
            }
        }
        DispatchReport { notices, failures }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeCountersSnapshot {
    pub admin_changes: u64,
    pub participant_changes: u64,
    pub funds_changes: u64,
    pub constitution_changes: u64,
    pub name_changes: u64,
    pub last_block_number: Option<BlockNumber>,
    pub pending_refresh: BTreeSet<ChangeCategory>,
}

#[derive(Debug, Default)]
struct CounterState {
    admin_changes: AtomicU64,
    participant_changes: AtomicU64,
    funds_changes: AtomicU64,
    constitution_changes: AtomicU64,
    name_changes: AtomicU64,
    last_block_number: Mutex<Option<BlockNumber>>,
    pending_refresh: Mutex<BTreeSet<ChangeCategory>>,
}

/// Counts notifications per category and remembers which canonical state is
/// waiting for a refresh. Clones share the same counters.
#[derive(Clone, Debug, Default)]
pub struct ChangeCounters {
    state: Arc<CounterState>,
}

impl ChangeCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_registration(self, name: impl Into<String>) -> ListenerRegistration {
        ListenerRegistration {
            name: name.into(),
            listener: Box::new(self),
        }
    }

    pub fn snapshot(&self) -> Result<ChangeCountersSnapshot, String> {
        let last_block_number = *self
            .state
            .last_block_number
            .lock()
            .map_err(|_| "change counter state lock poisoned".to_string())?;
        let pending_refresh = self
            .state
            .pending_refresh
            .lock()
            .map_err(|_| "change counter state lock poisoned".to_string())?
            .clone();
        Ok(ChangeCountersSnapshot {
            admin_changes: self.state.admin_changes.load(Ordering::Relaxed),
            participant_changes: self.state.participant_changes.load(Ordering::Relaxed),
            funds_changes: self.state.funds_changes.load(Ordering::Relaxed),
            constitution_changes: self.state.constitution_changes.load(Ordering::Relaxed),
            name_changes: self.state.name_changes.load(Ordering::Relaxed),
            last_block_number,
            pending_refresh,
        })
    }

    /// Takes the set of categories noticed since the previous call.
    pub fn take_pending(&self) -> Result<BTreeSet<ChangeCategory>, String> {
        let mut pending = self
            .state
            .pending_refresh
            .lock()
            .map_err(|_| "change counter state lock poisoned".to_string())?;
        Ok(std::mem::take(&mut *pending))
    }

    fn record(&self, counter: &AtomicU64, notice: &ChangeNotice) -> Result<(), String> {
        counter.fetch_add(1, Ordering::Relaxed);
        let mut last_block = self
            .state
            .last_block_number
            .lock()
            .map_err(|_| "change counter state lock poisoned".to_string())?;
        *last_block = Some(last_block.map_or(notice.latest_block, |previous| {
            previous.max(notice.latest_block)
        }));
        drop(last_block);
        self.state
            .pending_refresh
            .lock()
            .map_err(|_| "change counter state lock poisoned".to_string())?
            .insert(notice.category);
        Ok(())
    }
}

impl ChangeListener for ChangeCounters {
    fn on_admin_change(&mut self, notice: &ChangeNotice) -> Result<(), String> {
        self.record(&self.state.admin_changes, notice)
    }

    fn on_participant_change(&mut self, notice: &ChangeNotice) -> Result<(), String> {
        self.record(&self.state.participant_changes, notice)
    }

    fn on_funds_change(&mut self, notice: &ChangeNotice) -> Result<(), String> {
        self.record(&self.state.funds_changes, notice)
    }

    fn on_constitution_change(&mut self, notice: &ChangeNotice) -> Result<(), String> {
        self.record(&self.state.constitution_changes, notice)
    }

    fn on_name_change(&mut self, notice: &ChangeNotice) -> Result<(), String> {
        self.record(&self.state.name_changes, notice)
    }
}
