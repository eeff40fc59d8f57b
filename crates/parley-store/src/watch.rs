//! Change-watch registry.
//!
//! Every live subscription is an entry in a [`WatchRegistry`] holding the
//! sending half of an unbounded channel. Writers publish after each committed
//! change; dropping a [`Subscription`] removes its entry immediately.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tracing::trace;

use parley_shared::{CallId, CallRecord, CallStatus, CandidateItem, CandidateSide, ConversationId, PartyId};

/// Which call records a record watch is interested in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFilter {
    pub conversation: ConversationId,
    pub statuses: Vec<CallStatus>,
    /// Skip records created by this party.
    pub exclude_creator: Option<PartyId>,
}

impl CallFilter {
    pub fn new(conversation: ConversationId, statuses: &[CallStatus]) -> Self {
        Self {
            conversation,
            statuses: statuses.to_vec(),
            exclude_creator: None,
        }
    }

    pub fn excluding(mut self, creator: PartyId) -> Self {
        self.exclude_creator = Some(creator);
        self
    }

    pub fn matches(&self, record: &CallRecord) -> bool {
        record.conversation_id == self.conversation
            && self.statuses.contains(&record.status)
            && self.exclude_creator.as_ref() != Some(&record.created_by)
    }
}

#[derive(Debug)]
enum CallTarget {
    Filter(CallFilter),
    Record(CallId),
}

struct CallWatch {
    target: CallTarget,
    tx: mpsc::UnboundedSender<CallRecord>,
}

struct CandidateWatch {
    call_id: CallId,
    side: CandidateSide,
    tx: mpsc::UnboundedSender<CandidateItem>,
}

#[derive(Default)]
pub(crate) struct WatchRegistry {
    next_id: u64,
    calls: HashMap<u64, CallWatch>,
    candidates: HashMap<u64, CandidateWatch>,
}

pub(crate) type SharedRegistry = Arc<Mutex<WatchRegistry>>;

impl WatchRegistry {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.len() + self.candidates.len()
    }

    pub(crate) fn add_filter(
        &mut self,
        filter: CallFilter,
        tx: mpsc::UnboundedSender<CallRecord>,
    ) -> u64 {
        let id = self.allocate();
        self.calls.insert(
            id,
            CallWatch {
                target: CallTarget::Filter(filter),
                tx,
            },
        );
        id
    }

    pub(crate) fn add_record(&mut self, call_id: CallId, tx: mpsc::UnboundedSender<CallRecord>) -> u64 {
        let id = self.allocate();
        self.calls.insert(
            id,
            CallWatch {
                target: CallTarget::Record(call_id),
                tx,
            },
        );
        id
    }

    pub(crate) fn add_candidates(
        &mut self,
        call_id: CallId,
        side: CandidateSide,
        tx: mpsc::UnboundedSender<CandidateItem>,
    ) -> u64 {
        let id = self.allocate();
        self.candidates.insert(id, CandidateWatch { call_id, side, tx });
        id
    }

    fn remove(&mut self, id: u64) {
        if self.calls.remove(&id).is_some() || self.candidates.remove(&id).is_some() {
            trace!(watch = id, "watch removed");
        }
    }

    /// Deliver a changed record to every watch it is relevant to.
    pub(crate) fn publish_call(&mut self, record: &CallRecord) {
        self.calls.retain(|_, watch| {
            let relevant = match &watch.target {
                CallTarget::Filter(filter) => filter.matches(record),
                CallTarget::Record(id) => *id == record.id,
            };
            !relevant || watch.tx.send(record.clone()).is_ok()
        });
    }

    pub(crate) fn publish_candidate(&mut self, call_id: &CallId, side: CandidateSide, item: &CandidateItem) {
        self.candidates.retain(|_, watch| {
            let relevant = watch.call_id == *call_id && watch.side == side;
            !relevant || watch.tx.send(item.clone()).is_ok()
        });
    }
}

/// Deregisters its watch when dropped.
pub(crate) struct WatchGuard {
    registry: Weak<Mutex<WatchRegistry>>,
    id: u64,
}

impl WatchGuard {
    pub(crate) fn new(registry: &SharedRegistry, id: u64) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            id,
        }
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut registry) = registry.lock() {
                registry.remove(self.id);
            }
        }
    }
}

/// A live change feed. Yields the current state first, then every change,
/// until dropped.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    _guard: WatchGuard,
}

impl<T> Subscription<T> {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<T>, guard: WatchGuard) -> Self {
        Self { rx, _guard: guard }
    }

    /// Wait for the next item. `None` once the channel side is gone.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Non-blocking poll, mostly useful in tests.
    pub fn try_next(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("watch", &self._guard.id).finish()
    }
}
