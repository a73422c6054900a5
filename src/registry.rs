//! Bookkeeping for every subscription owned by one connection.
//!
//! A subscription lives in exactly one bucket at a time:
//!
//! - `queued`: added while the socket is not connected; flushed in FIFO order
//!   once it is.
//! - `pending`: subscribe frame on the wire, keyed by sequence number.
//! - `live`: acknowledged, keyed by the server-assigned subscription id.
//! - `unsubscribing`: unsubscribe frame on the wire, keyed by sequence number.
//! - `retrying`: rejected with a transient status, waiting to be resent.
//!
//! The registry never changes subscription state itself. Callers (the
//! connection) decide transitions from what the registry hands back.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::warn;

use crate::protocol::{SequenceNumber, SubscriptionId};
use crate::subscription::Subscription;

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    last_sequence: SequenceNumber,
    queued: VecDeque<Arc<Subscription>>,
    pending: HashMap<SequenceNumber, Arc<Subscription>>,
    live: HashMap<SubscriptionId, Arc<Subscription>>,
    unsubscribing: HashMap<SequenceNumber, Arc<Subscription>>,
    retrying: Vec<Arc<Subscription>>,
    /// Subscribe requests whose subscription was removed before the ack.
    orphaned: HashSet<SequenceNumber>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Allocate the next sequence number. Never reused within one registry.
    pub(crate) fn next_sequence(&mut self) -> SequenceNumber {
        self.last_sequence = self.last_sequence.wrapping_add(1);
        self.last_sequence
    }

    // ── Insertion ───────────────────────────────────────────────────

    pub(crate) fn enqueue(&mut self, sub: Arc<Subscription>) {
        self.queued.push_back(sub);
    }

    pub(crate) fn insert_pending(&mut self, seq: SequenceNumber, sub: Arc<Subscription>) {
        sub.set_sequence(seq);
        self.pending.insert(seq, sub);
    }

    pub(crate) fn insert_live(&mut self, id: SubscriptionId, sub: Arc<Subscription>) {
        sub.set_subscription_id(Some(id));
        if let Some(previous) = self.live.insert(id, sub) {
            warn!(
                subscription_id = id,
                uri = previous.resource_uri(),
                "service reused a live subscription id; replacing"
            );
            previous.set_subscription_id(None);
        }
    }

    pub(crate) fn insert_unsubscribing(&mut self, seq: SequenceNumber, sub: Arc<Subscription>) {
        self.unsubscribing.insert(seq, sub);
    }

    pub(crate) fn insert_retrying(&mut self, sub: Arc<Subscription>) {
        self.retrying.push(sub);
    }

    pub(crate) fn orphan(&mut self, seq: SequenceNumber) {
        self.orphaned.insert(seq);
    }

    // ── Lookup / removal ────────────────────────────────────────────

    pub(crate) fn take_pending(&mut self, seq: SequenceNumber) -> Option<Arc<Subscription>> {
        self.pending.remove(&seq)
    }

    pub(crate) fn take_unsubscribing(&mut self, seq: SequenceNumber) -> Option<Arc<Subscription>> {
        self.unsubscribing.remove(&seq)
    }

    pub(crate) fn take_orphan(&mut self, seq: SequenceNumber) -> bool {
        self.orphaned.remove(&seq)
    }

    pub(crate) fn live(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        self.live.get(&id).cloned()
    }

    /// Remove `sub` from whichever pre-ack bucket holds it.
    pub(crate) fn detach_unacknowledged(&mut self, sub: &Arc<Subscription>) -> Detached {
        if let Some(pos) = self.queued.iter().position(|s| Arc::ptr_eq(s, sub)) {
            self.queued.remove(pos);
            return Detached::Queued;
        }
        if let Some(pos) = self.retrying.iter().position(|s| Arc::ptr_eq(s, sub)) {
            self.retrying.swap_remove(pos);
            return Detached::Queued;
        }
        let seq = self
            .pending
            .iter()
            .find(|(_, s)| Arc::ptr_eq(s, sub))
            .map(|(seq, _)| *seq);
        match seq {
            Some(seq) => {
                self.pending.remove(&seq);
                Detached::InFlight(seq)
            }
            None => Detached::NotFound,
        }
    }

    /// Remove `sub` from the live map, returning its subscription id.
    pub(crate) fn detach_live(&mut self, sub: &Arc<Subscription>) -> Option<SubscriptionId> {
        let id = self
            .live
            .iter()
            .find(|(_, s)| Arc::ptr_eq(s, sub))
            .map(|(id, _)| *id)?;
        self.live.remove(&id);
        Some(id)
    }

    /// Take a retrying subscription back out. `false` if it is no longer
    /// waiting (removed by the caller or requeued by a disconnect).
    pub(crate) fn take_retrying(&mut self, sub: &Arc<Subscription>) -> bool {
        match self.retrying.iter().position(|s| Arc::ptr_eq(s, sub)) {
            Some(pos) => {
                self.retrying.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn drain_queue(&mut self) -> Vec<Arc<Subscription>> {
        self.queued.drain(..).collect()
    }

    // ── Epoch changes ───────────────────────────────────────────────

    /// Prepare for a reconnect.
    ///
    /// Everything that was acknowledged, in flight or retrying moves to the
    /// front of the queue, ordered by its last sequence number, ahead of
    /// subscriptions queued while disconnected. Subscription ids are cleared.
    /// Returns the subscriptions that were mid-unsubscribe; they have nothing
    /// left to resubscribe and must be closed by the caller.
    pub(crate) fn requeue_for_reconnect(&mut self) -> Vec<Arc<Subscription>> {
        let mut carried: Vec<Arc<Subscription>> = self
            .pending
            .drain()
            .map(|(_, s)| s)
            .chain(self.live.drain().map(|(_, s)| s))
            .chain(self.retrying.drain(..))
            .collect();
        carried.sort_by_key(|s| s.sequence_number());
        for sub in &carried {
            sub.set_subscription_id(None);
        }

        let queued_later: Vec<_> = self.queued.drain(..).collect();
        self.queued.extend(carried);
        self.queued.extend(queued_later);
        self.orphaned.clear();

        self.unsubscribing.drain().map(|(_, s)| s).collect()
    }

    /// Empty every bucket, returning all subscriptions for local teardown.
    ///
    /// Acknowledged subscriptions come first so callers can walk them through
    /// `PendingUnsubscribe`.
    pub(crate) fn drain_all(&mut self) -> Vec<Arc<Subscription>> {
        let mut all: Vec<Arc<Subscription>> = self.live.drain().map(|(_, s)| s).collect();
        all.extend(self.unsubscribing.drain().map(|(_, s)| s));
        all.extend(self.pending.drain().map(|(_, s)| s));
        all.extend(self.retrying.drain(..));
        all.extend(self.queued.drain(..));
        self.orphaned.clear();
        all
    }

    // ── Introspection ───────────────────────────────────────────────

    pub(crate) fn live_count(&self) -> usize {
        self.live.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.queued.len()
            + self.pending.len()
            + self.live.len()
            + self.unsubscribing.len()
            + self.retrying.len()
    }
}

/// Where [`SubscriptionRegistry::detach_unacknowledged`] found a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Detached {
    /// It had not been sent (queued or waiting to retry).
    Queued,
    /// Its subscribe frame with this sequence number is on the wire.
    InFlight(SequenceNumber),
    NotFound,
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::subscription::SubscriptionHandler;
    use serde_json::Value;

    struct Noop;

    impl SubscriptionHandler for Noop {
        fn on_event_received(&self, _payload: &Value) {}
    }

    fn sub(uri: &str) -> Arc<Subscription> {
        Subscription::new(uri, Arc::new(Noop))
    }

    #[test]
    fn sequence_numbers_increase() {
        let mut registry = SubscriptionRegistry::new();
        let a = registry.next_sequence();
        let b = registry.next_sequence();
        assert_eq!(a, 1);
        assert!(b > a);
    }

    #[test]
    fn pending_then_live() {
        let mut registry = SubscriptionRegistry::new();
        let s = sub("a");
        let seq = registry.next_sequence();
        registry.insert_pending(seq, Arc::clone(&s));
        let found = registry.take_pending(seq).unwrap();
        assert!(Arc::ptr_eq(&found, &s));
        registry.insert_live(42, found);
        assert!(Arc::ptr_eq(&registry.live(42).unwrap(), &s));
        assert_eq!(s.subscription_id(), Some(42));
        assert_eq!(registry.detach_live(&s), Some(42));
        assert!(registry.live(42).is_none());
    }

    #[test]
    fn detach_reports_bucket() {
        let mut registry = SubscriptionRegistry::new();
        let queued = sub("queued");
        let sent = sub("sent");
        registry.enqueue(Arc::clone(&queued));
        let seq = registry.next_sequence();
        registry.insert_pending(seq, Arc::clone(&sent));

        assert_eq!(registry.detach_unacknowledged(&queued), Detached::Queued);
        assert_eq!(registry.detach_unacknowledged(&sent), Detached::InFlight(seq));
        assert_eq!(registry.detach_unacknowledged(&sent), Detached::NotFound);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn reconnect_puts_carried_subscriptions_first() {
        let mut registry = SubscriptionRegistry::new();
        let first = sub("first");
        let second = sub("second");
        let late = sub("late");
        let leaving = sub("leaving");

        let s1 = registry.next_sequence();
        registry.insert_pending(s1, Arc::clone(&first));
        let acked = registry.take_pending(s1).unwrap();
        registry.insert_live(7, acked);

        let s2 = registry.next_sequence();
        registry.insert_pending(s2, Arc::clone(&second));

        let s3 = registry.next_sequence();
        registry.insert_unsubscribing(s3, Arc::clone(&leaving));

        registry.enqueue(Arc::clone(&late));

        let to_close = registry.requeue_for_reconnect();
        assert_eq!(to_close.len(), 1);
        assert!(Arc::ptr_eq(&to_close[0], &leaving));

        let order = registry.drain_queue();
        let uris: Vec<_> = order.iter().map(|s| s.resource_uri().to_owned()).collect();
        assert_eq!(uris, vec!["first", "second", "late"]);
        assert_eq!(first.subscription_id(), None);
    }

    #[test]
    fn orphans_are_forgotten_on_reconnect() {
        let mut registry = SubscriptionRegistry::new();
        registry.orphan(5);
        registry.requeue_for_reconnect();
        assert!(!registry.take_orphan(5));
    }

    #[test]
    fn drain_all_empties_every_bucket() {
        let mut registry = SubscriptionRegistry::new();
        registry.enqueue(sub("a"));
        let seq = registry.next_sequence();
        registry.insert_pending(seq, sub("b"));
        registry.insert_live(1, sub("c"));
        registry.insert_retrying(sub("d"));
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.live_count(), 1);
        assert_eq!(registry.drain_all().len(), 4);
        assert_eq!(registry.len(), 0);
    }
}
