//! A single logical subscription and its state machine.
//!
//! A [`Subscription`] watches one resource URI. It is created by the caller,
//! handed to [`RtaConnection::add_subscription`](crate::RtaConnection::add_subscription),
//! and from then on its state is driven exclusively by the owning connection
//! in response to wire frames and explicit add/remove calls.
//!
//! ```text
//! Uninitialized ──> PendingSubscribe ──> Subscribed ──> PendingUnsubscribe ──> Closed
//!                          │                  │
//!                          └──────> Closed <──┘
//! ```
//!
//! `Closed` is terminal. To watch the same resource again, create a new
//! [`Subscription`].

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error_codes::SubscriptionError;
use crate::protocol::{SequenceNumber, SubscriptionId};

/// Lifecycle of a [`Subscription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    /// Constructed but never added to a connection.
    Uninitialized,
    /// Added to a connection; the subscribe request is queued or awaiting its ack.
    PendingSubscribe,
    /// Acknowledged by the service and receiving events.
    Subscribed,
    /// An unsubscribe request is on the wire.
    PendingUnsubscribe,
    /// Terminal.
    Closed,
}

impl SubscriptionState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: SubscriptionState) -> bool {
        use SubscriptionState::*;
        matches!(
            (self, next),
            (Uninitialized, PendingSubscribe)
                | (PendingSubscribe, Subscribed)
                | (PendingSubscribe, Closed)
                | (Subscribed, PendingUnsubscribe)
                | (PendingUnsubscribe, Closed)
        )
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::PendingSubscribe => "pending-subscribe",
            Self::Subscribed => "subscribed",
            Self::PendingUnsubscribe => "pending-unsubscribe",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Per-kind behavior of a subscription.
///
/// Only [`on_event_received`](SubscriptionHandler::on_event_received) is
/// required. It receives the initial payload from the subscribe ack and every
/// later event payload, and is never called once the subscription is
/// [`Closed`](SubscriptionState::Closed).
///
/// Callbacks never run while the connection's bookkeeping lock is held, so a
/// handler may call back into the connection (for example to remove its own
/// subscription).
pub trait SubscriptionHandler: Send + Sync + 'static {
    /// A payload arrived for this subscription.
    fn on_event_received(&self, payload: &Value);

    /// The subscription moved to `state`. Called exactly once per transition.
    fn on_state_changed(&self, state: SubscriptionState) {
        let _ = state;
    }

    /// The service rejected the subscribe request.
    fn on_error(&self, error: &SubscriptionError) {
        let _ = error;
    }
}

struct SubscriptionInner {
    state: SubscriptionState,
    sequence: Option<SequenceNumber>,
    subscription_id: Option<SubscriptionId>,
    retry_attempts: u32,
}

/// One watched resource.
///
/// Cheap to share: the connection and the caller both hold an
/// `Arc<Subscription>`. Identity is pointer identity.
pub struct Subscription {
    resource_uri: String,
    handler: Arc<dyn SubscriptionHandler>,
    inner: Mutex<SubscriptionInner>,
}

impl Subscription {
    /// Create a subscription for `resource_uri` in the
    /// [`Uninitialized`](SubscriptionState::Uninitialized) state.
    pub fn new(
        resource_uri: impl Into<String>,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            resource_uri: resource_uri.into(),
            handler,
            inner: Mutex::new(SubscriptionInner {
                state: SubscriptionState::Uninitialized,
                sequence: None,
                subscription_id: None,
                retry_attempts: 0,
            }),
        })
    }

    /// The watched resource.
    pub fn resource_uri(&self) -> &str {
        &self.resource_uri
    }

    /// Current state.
    pub fn state(&self) -> SubscriptionState {
        self.inner.lock().state
    }

    /// Server-assigned id. Only present while the subscription is
    /// acknowledged on the current connection epoch; it changes across
    /// reconnects.
    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        self.inner.lock().subscription_id
    }

    /// Sequence number of the most recent subscribe request.
    pub fn sequence_number(&self) -> Option<SequenceNumber> {
        self.inner.lock().sequence
    }

    /// The handler this subscription delivers to.
    pub fn handler(&self) -> &Arc<dyn SubscriptionHandler> {
        &self.handler
    }

    // ── Connection-side mutation ────────────────────────────────────

    /// Apply a state transition. Returns `false` (and changes nothing) when
    /// the transition is not allowed from the current state.
    pub(crate) fn transition(&self, next: SubscriptionState) -> bool {
        let mut inner = self.inner.lock();
        if !inner.state.can_transition_to(next) {
            debug!(
                uri = %self.resource_uri,
                "ignoring subscription transition {} -> {}", inner.state, next
            );
            return false;
        }
        debug!(uri = %self.resource_uri, "subscription {} -> {}", inner.state, next);
        inner.state = next;
        if next == SubscriptionState::Closed {
            inner.subscription_id = None;
        }
        true
    }

    pub(crate) fn set_sequence(&self, seq: SequenceNumber) {
        self.inner.lock().sequence = Some(seq);
    }

    pub(crate) fn set_subscription_id(&self, id: Option<SubscriptionId>) {
        self.inner.lock().subscription_id = id;
    }

    /// Bump and return the transient-failure retry counter.
    pub(crate) fn next_retry_attempt(&self) -> u32 {
        let mut inner = self.inner.lock();
        inner.retry_attempts = inner.retry_attempts.saturating_add(1);
        inner.retry_attempts
    }

    pub(crate) fn reset_retry_attempts(&self) {
        self.inner.lock().retry_attempts = 0;
    }

    // ── Handler invocation ──────────────────────────────────────────

    pub(crate) fn notify_state(&self, state: SubscriptionState) {
        self.handler.on_state_changed(state);
    }

    /// Hand a payload to the handler unless the subscription is closed.
    pub(crate) fn deliver(&self, payload: &Value) {
        if self.state() == SubscriptionState::Closed {
            warn!(uri = %self.resource_uri, "dropping payload for closed subscription");
            return;
        }
        self.handler.on_event_received(payload);
    }

    pub(crate) fn notify_error(&self, error: &SubscriptionError) {
        self.handler.on_error(error);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Subscription")
            .field("resource_uri", &self.resource_uri)
            .field("state", &inner.state)
            .field("sequence", &inner.sequence)
            .field("subscription_id", &inner.subscription_id)
            .finish()
    }
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
    use SubscriptionState::*;

    struct Recorder {
        states: Mutex<Vec<SubscriptionState>>,
        payloads: Mutex<Vec<Value>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                states: Mutex::new(Vec::new()),
                payloads: Mutex::new(Vec::new()),
            })
        }
    }

    impl SubscriptionHandler for Recorder {
        fn on_event_received(&self, payload: &Value) {
            self.payloads.lock().push(payload.clone());
        }

        fn on_state_changed(&self, state: SubscriptionState) {
            self.states.lock().push(state);
        }
    }

    #[test]
    fn new_subscription_is_uninitialized() {
        let sub = Subscription::new("stats/Stat", Recorder::new());
        assert_eq!(sub.state(), Uninitialized);
        assert_eq!(sub.resource_uri(), "stats/Stat");
        assert_eq!(sub.subscription_id(), None);
    }

    #[test]
    fn allowed_transitions() {
        assert!(Uninitialized.can_transition_to(PendingSubscribe));
        assert!(PendingSubscribe.can_transition_to(Subscribed));
        assert!(PendingSubscribe.can_transition_to(Closed));
        assert!(Subscribed.can_transition_to(PendingUnsubscribe));
        assert!(PendingUnsubscribe.can_transition_to(Closed));

        assert!(!Uninitialized.can_transition_to(Subscribed));
        assert!(!PendingSubscribe.can_transition_to(PendingSubscribe));
        assert!(!Subscribed.can_transition_to(PendingSubscribe));
        assert!(!PendingUnsubscribe.can_transition_to(Subscribed));
        assert!(!Subscribed.can_transition_to(Closed));
    }

    #[test]
    fn closed_is_terminal() {
        for next in [Uninitialized, PendingSubscribe, Subscribed, PendingUnsubscribe, Closed] {
            assert!(!Closed.can_transition_to(next));
        }
    }

    #[test]
    fn rejected_transition_leaves_state_untouched() {
        let sub = Subscription::new("r", Recorder::new());
        assert!(!sub.transition(Subscribed));
        assert_eq!(sub.state(), Uninitialized);
    }

    #[test]
    fn closing_clears_subscription_id() {
        let sub = Subscription::new("r", Recorder::new());
        assert!(sub.transition(PendingSubscribe));
        assert!(sub.transition(Subscribed));
        sub.set_subscription_id(Some(42));
        assert_eq!(sub.subscription_id(), Some(42));
        assert!(sub.transition(PendingUnsubscribe));
        assert!(sub.transition(Closed));
        assert_eq!(sub.subscription_id(), None);
    }

    #[test]
    fn closed_subscription_does_not_deliver() {
        let recorder = Recorder::new();
        let sub = Subscription::new("r", recorder.clone());
        assert!(sub.transition(PendingSubscribe));
        sub.deliver(&serde_json::json!({"value": "1"}));
        assert!(sub.transition(Closed));
        sub.deliver(&serde_json::json!({"value": "2"}));
        assert_eq!(recorder.payloads.lock().len(), 1);
    }

    #[test]
    fn retry_counter_resets() {
        let sub = Subscription::new("r", Recorder::new());
        assert_eq!(sub.next_retry_attempt(), 1);
        assert_eq!(sub.next_retry_attempt(), 2);
        sub.reset_retry_attempts();
        assert_eq!(sub.next_retry_attempt(), 1);
    }
}
