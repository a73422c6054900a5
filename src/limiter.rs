//! Per-user cap on concurrently activated real-time activity connections.
//!
//! [`ActivationLimiter`] is constructed once by whatever composes the client
//! and shared by `Arc` with every [`RtaConnection`](crate::RtaConnection) and
//! manager. Each successful increment hands back an [`ActivationGuard`] that
//! gives the slot back when dropped, so a slot can never leak on an error path.
//!
//! Two kinds of holders exist:
//!
//! - [`ActivationKind::Connection`]: one activated connection, one slot.
//! - [`ActivationKind::Manager`]: a long-lived manager (multiplayer, social).
//!   All managers for a user share a single slot, because they multiplex over
//!   one connection; the slot is released when the last manager lets go.
//!
//! ```
//! use std::sync::Arc;
//! use rta_client::limiter::{ActivationKind, ActivationLimiter};
//!
//! let limiter = Arc::new(ActivationLimiter::new(2));
//! let a = limiter.try_increment(ActivationKind::Connection, "xuid").unwrap();
//! let _b = limiter.try_increment(ActivationKind::Connection, "xuid").unwrap();
//! assert!(limiter.try_increment(ActivationKind::Connection, "xuid").is_err());
//! drop(a);
//! assert_eq!(limiter.slots_in_use("xuid"), 1);
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, RtaError};

/// Maximum number of concurrently activated connections per user.
pub const DEFAULT_MAX_CONNECTIONS_PER_USER: usize = 5;

/// What an activation slot is held for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivationKind {
    /// A directly activated connection.
    Connection,
    /// A manager sharing one connection across its lifetime.
    Manager,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    connections: usize,
    managers: usize,
}

impl Counts {
    fn slots(self) -> usize {
        self.connections + usize::from(self.managers > 0)
    }

    fn is_empty(self) -> bool {
        self.connections == 0 && self.managers == 0
    }
}

// ── Limiter ─────────────────────────────────────────────────────────

/// Process-wide (but explicitly owned) activation counter.
///
/// Every read-check-write and every decrement-and-prune happens inside one
/// critical section on a single map lock.
pub struct ActivationLimiter {
    max_per_user: usize,
    counts: Mutex<HashMap<String, Counts>>,
}

impl ActivationLimiter {
    /// Create a limiter allowing `max_per_user` slots per user.
    pub fn new(max_per_user: usize) -> Self {
        Self {
            max_per_user,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// The configured cap.
    pub fn max_per_user(&self) -> usize {
        self.max_per_user
    }

    /// Claim a slot for `user_id`.
    ///
    /// # Errors
    ///
    /// - [`RtaError::InvalidArgument`] if `user_id` is empty.
    /// - [`RtaError::LimitExceeded`] if the user already holds the maximum
    ///   number of slots. Nothing is mutated in that case.
    pub fn try_increment(
        self: &Arc<Self>,
        kind: ActivationKind,
        user_id: &str,
    ) -> Result<ActivationGuard> {
        if user_id.is_empty() {
            return Err(RtaError::invalid_argument("user id must not be empty"));
        }

        let mut counts = self.counts.lock();
        let current = counts.get(user_id).copied().unwrap_or_default();
        let needs_slot = match kind {
            ActivationKind::Connection => true,
            ActivationKind::Manager => current.managers == 0,
        };
        if needs_slot && current.slots() >= self.max_per_user {
            warn!(
                user_id,
                max = self.max_per_user,
                "activation limit reached"
            );
            return Err(RtaError::LimitExceeded {
                user_id: user_id.to_owned(),
                max: self.max_per_user,
            });
        }

        let entry = counts.entry(user_id.to_owned()).or_default();
        match kind {
            ActivationKind::Connection => entry.connections += 1,
            ActivationKind::Manager => entry.managers += 1,
        }
        debug!(
            user_id,
            ?kind,
            slots = entry.slots(),
            "activation slot claimed"
        );
        drop(counts);

        Ok(ActivationGuard {
            limiter: Arc::clone(self),
            kind,
            user_id: user_id.to_owned(),
        })
    }

    fn decrement(&self, kind: ActivationKind, user_id: &str) {
        let mut counts = self.counts.lock();
        let Some(entry) = counts.get_mut(user_id) else {
            warn!(user_id, "activation release for unknown user");
            return;
        };
        let counter = match kind {
            ActivationKind::Connection => &mut entry.connections,
            ActivationKind::Manager => &mut entry.managers,
        };
        *counter = counter.saturating_sub(1);
        debug!(user_id, ?kind, slots = entry.slots(), "activation slot released");
        if entry.is_empty() {
            counts.remove(user_id);
        }
    }

    /// Slots currently held by `user_id` (connections plus one for managers).
    pub fn slots_in_use(&self, user_id: &str) -> usize {
        self.counts
            .lock()
            .get(user_id)
            .map_or(0, |counts| counts.slots())
    }

    /// Number of managers holding the shared slot for `user_id`.
    pub fn manager_count(&self, user_id: &str) -> usize {
        self.counts
            .lock()
            .get(user_id)
            .map_or(0, |counts| counts.managers)
    }

    /// Number of users with at least one slot held.
    pub fn tracked_users(&self) -> usize {
        self.counts.lock().len()
    }
}

impl Default for ActivationLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONNECTIONS_PER_USER)
    }
}

impl fmt::Debug for ActivationLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivationLimiter")
            .field("max_per_user", &self.max_per_user)
            .field("tracked_users", &self.tracked_users())
            .finish()
    }
}

// ── Guard ───────────────────────────────────────────────────────────

/// A claimed slot. Dropping it releases the slot.
#[must_use = "dropping the guard releases the activation slot immediately"]
pub struct ActivationGuard {
    limiter: Arc<ActivationLimiter>,
    kind: ActivationKind,
    user_id: String,
}

impl ActivationGuard {
    /// User the slot belongs to.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Kind of slot.
    pub fn kind(&self) -> ActivationKind {
        self.kind
    }
}

impl fmt::Debug for ActivationGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivationGuard")
            .field("kind", &self.kind)
            .field("user_id", &self.user_id)
            .finish()
    }
}

impl Drop for ActivationGuard {
    fn drop(&mut self) {
        self.limiter.decrement(self.kind, &self.user_id);
    }
}

// ── Manager activation ──────────────────────────────────────────────

/// Activation bookkeeping for one manager instance.
///
/// A manager counts once per user no matter how often that user is added,
/// and keeps its slots until it is shut down or its last local user leaves.
pub struct ManagerActivation {
    limiter: Arc<ActivationLimiter>,
    state: Mutex<ManagerState>,
}

#[derive(Default)]
struct ManagerState {
    guards: HashMap<String, ActivationGuard>,
    local_users: HashSet<String>,
}

impl ManagerActivation {
    /// Create a manager activation with no local users.
    pub fn new(limiter: Arc<ActivationLimiter>) -> Self {
        Self {
            limiter,
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Register a local user with the manager.
    ///
    /// # Errors
    ///
    /// Propagates [`ActivationLimiter::try_increment`] errors. Adding a user
    /// that is already registered is a no-op.
    pub fn add_local_user(&self, user_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.guards.contains_key(user_id) {
            let guard = self.limiter.try_increment(ActivationKind::Manager, user_id)?;
            state.guards.insert(user_id.to_owned(), guard);
        }
        state.local_users.insert(user_id.to_owned());
        Ok(())
    }

    /// Unregister a local user. Slots are released only when no local users
    /// remain.
    pub fn remove_local_user(&self, user_id: &str) {
        let mut state = self.state.lock();
        if state.local_users.remove(user_id) && state.local_users.is_empty() {
            debug!("last local user left manager, releasing activation slots");
            state.guards.clear();
        }
    }

    /// Release every slot held by this manager.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.local_users.clear();
        state.guards.clear();
    }

    /// Whether the manager currently holds any slot.
    pub fn is_active(&self) -> bool {
        !self.state.lock().guards.is_empty()
    }
}

impl fmt::Debug for ManagerActivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManagerActivation")
            .field("users", &state.guards.len())
            .field("local_users", &state.local_users.len())
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

    const USER: &str = "2533274792693551";

    #[test]
    fn rejects_empty_user() {
        let limiter = Arc::new(ActivationLimiter::default());
        assert!(matches!(
            limiter.try_increment(ActivationKind::Connection, ""),
            Err(RtaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn cap_is_enforced_without_side_effects() {
        let limiter = Arc::new(ActivationLimiter::default());
        let guards: Vec<_> = (0..DEFAULT_MAX_CONNECTIONS_PER_USER)
            .map(|_| limiter.try_increment(ActivationKind::Connection, USER).unwrap())
            .collect();
        let err = limiter
            .try_increment(ActivationKind::Connection, USER)
            .unwrap_err();
        assert!(matches!(err, RtaError::LimitExceeded { max: 5, .. }));
        assert_eq!(limiter.slots_in_use(USER), DEFAULT_MAX_CONNECTIONS_PER_USER);
        drop(guards);
        assert_eq!(limiter.slots_in_use(USER), 0);
        assert_eq!(limiter.tracked_users(), 0);
    }

    #[test]
    fn users_are_counted_independently() {
        let limiter = Arc::new(ActivationLimiter::new(1));
        let _a = limiter.try_increment(ActivationKind::Connection, "a").unwrap();
        let _b = limiter.try_increment(ActivationKind::Connection, "b").unwrap();
        assert_eq!(limiter.tracked_users(), 2);
    }

    #[test]
    fn managers_share_one_slot() {
        let limiter = Arc::new(ActivationLimiter::default());
        let social = limiter.try_increment(ActivationKind::Manager, USER).unwrap();
        let multiplayer = limiter.try_increment(ActivationKind::Manager, USER).unwrap();
        assert_eq!(limiter.slots_in_use(USER), 1);
        assert_eq!(limiter.manager_count(USER), 2);

        let connections: Vec<_> = (0..4)
            .map(|_| limiter.try_increment(ActivationKind::Connection, USER).unwrap())
            .collect();
        assert!(limiter.try_increment(ActivationKind::Connection, USER).is_err());

        drop(social);
        assert_eq!(limiter.slots_in_use(USER), 5);
        drop(multiplayer);
        assert_eq!(limiter.slots_in_use(USER), 4);
        drop(connections);
        assert_eq!(limiter.tracked_users(), 0);
    }

    #[test]
    fn first_manager_needs_a_free_slot() {
        let limiter = Arc::new(ActivationLimiter::new(1));
        let _conn = limiter.try_increment(ActivationKind::Connection, USER).unwrap();
        assert!(limiter.try_increment(ActivationKind::Manager, USER).is_err());
        assert_eq!(limiter.manager_count(USER), 0);
    }

    #[test]
    fn manager_counts_once_per_user() {
        let limiter = Arc::new(ActivationLimiter::default());
        let manager = ManagerActivation::new(Arc::clone(&limiter));
        manager.add_local_user(USER).unwrap();
        manager.add_local_user(USER).unwrap();
        assert_eq!(limiter.manager_count(USER), 1);
        manager.shutdown();
        assert_eq!(limiter.manager_count(USER), 0);
        assert!(!manager.is_active());
    }

    #[test]
    fn manager_keeps_slots_until_last_user_leaves() {
        let limiter = Arc::new(ActivationLimiter::default());
        let manager = ManagerActivation::new(Arc::clone(&limiter));
        manager.add_local_user("a").unwrap();
        manager.add_local_user("b").unwrap();

        manager.remove_local_user("a");
        manager.remove_local_user("a");
        assert_eq!(limiter.slots_in_use("a"), 1);
        assert_eq!(limiter.slots_in_use("b"), 1);

        manager.remove_local_user("b");
        assert_eq!(limiter.tracked_users(), 0);
    }

    #[test]
    fn concurrent_increments_never_exceed_cap() {
        let limiter = Arc::new(ActivationLimiter::default());
        let extra = 7;
        let handles: Vec<_> = (0..DEFAULT_MAX_CONNECTIONS_PER_USER + extra)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || limiter.try_increment(ActivationKind::Connection, USER))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let limited = results
            .iter()
            .filter(|r| matches!(r, Err(RtaError::LimitExceeded { .. })))
            .count();
        assert_eq!(ok, DEFAULT_MAX_CONNECTIONS_PER_USER);
        assert_eq!(limited, extra);
        drop(results);
        assert_eq!(limiter.slots_in_use(USER), 0);
    }
}
