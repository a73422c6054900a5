//! Session directory access and multiplayer change notifications.
//!
//! [`MultiplayerService`] reads and writes session documents over an
//! [`HttpClient`] and keeps one real-time activity subscription on the
//! session directory. That subscription's first payload carries the
//! connection id members must write into their session to be tapped; later
//! payloads are shoulder taps naming a session that changed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::auth::CredentialProvider;
use crate::connection::RtaConnection;
use crate::error::{Result, RtaError};
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::session::{
    compare_multiplayer_sessions, MultiplayerSession, MultiplayerSessionReference,
    SessionChangeTypes,
};
use crate::subscription::{Subscription, SubscriptionHandler, SubscriptionState};

/// Default session directory endpoint.
pub const DEFAULT_SESSION_DIRECTORY_ENDPOINT: &str = "https://sessiondirectory.xboxlive.com";

/// Resource watched for connection ids and shoulder taps.
pub const MULTIPLAYER_CONNECTIONS_RESOURCE: &str =
    "https://sessiondirectory.xboxlive.com/connections/";

const DEFAULT_CONTRACT_VERSION: u32 = 107;
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 64;
const CONTRACT_VERSION_HEADER: &str = "x-xbl-contract-version";

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`MultiplayerService`].
#[derive(Debug, Clone)]
pub struct MultiplayerServiceConfig {
    /// Base URL of the session directory.
    pub endpoint: String,
    /// Value of the `x-xbl-contract-version` header. Defaults to **107**.
    pub contract_version: u32,
    /// Capacity of the broadcast event channel. Defaults to **64**.
    pub event_channel_capacity: usize,
}

impl MultiplayerServiceConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            contract_version: DEFAULT_CONTRACT_VERSION,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }

    #[must_use]
    pub fn with_contract_version(mut self, version: u32) -> Self {
        self.contract_version = version;
        self
    }

    /// Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    fn session_uri(&self, reference: &MultiplayerSessionReference) -> String {
        format!(
            "{}{}",
            self.endpoint.trim_end_matches('/'),
            reference.uri_path()
        )
    }
}

impl Default for MultiplayerServiceConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_DIRECTORY_ENDPOINT)
    }
}

// ── Write modes ─────────────────────────────────────────────────────

/// Precondition applied to a session write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Fail if the session already exists.
    CreateNew,
    /// Fail if the session does not exist.
    UpdateExisting,
    /// Write unconditionally.
    UpdateOrCreateNew,
    /// Fail unless the session is unchanged since it was read. A session
    /// that was never read is created.
    SynchronizedUpdate,
}

impl WriteMode {
    fn precondition(self, etag: Option<&str>) -> Option<(&'static str, String)> {
        match self {
            Self::CreateNew => Some(("If-None-Match", "*".into())),
            Self::UpdateExisting => Some(("If-Match", "*".into())),
            Self::UpdateOrCreateNew => None,
            Self::SynchronizedUpdate => match etag.filter(|e| !e.is_empty()) {
                Some(etag) => Some(("If-Match", etag.to_owned())),
                None => Some(("If-None-Match", "*".into())),
            },
        }
    }
}

// ── Notifications ───────────────────────────────────────────────────

/// A notification that a session changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShoulderTap {
    /// `scid~template~name`.
    pub resource: String,
    #[serde(default)]
    pub change_number: u64,
    #[serde(default)]
    pub branch: String,
}

impl ShoulderTap {
    /// The session this tap refers to.
    ///
    /// # Errors
    ///
    /// [`RtaError::InvalidArgument`] if the resource is malformed.
    pub fn session_reference(&self) -> Result<MultiplayerSessionReference> {
        MultiplayerSessionReference::from_tap_resource(&self.resource)
    }

    /// Whether `last_known` already reflects this tap.
    pub fn is_stale_for(&self, last_known: &MultiplayerSession) -> bool {
        last_known.branch() == Some(self.branch.as_str())
            && self.change_number <= last_known.change_number()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShoulderTapBatch {
    shoulder_taps: Vec<ShoulderTap>,
}

/// Decode a session-directory event payload into shoulder taps.
fn decode_taps(payload: &Value) -> Option<Vec<ShoulderTap>> {
    if let Ok(batch) = ShoulderTapBatch::deserialize(payload) {
        return Some(batch.shoulder_taps);
    }
    ShoulderTap::deserialize(payload).ok().map(|tap| vec![tap])
}

/// Multiplayer notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultiplayerEvent {
    /// A session the user is subscribed to changed.
    SessionChanged(ShoulderTap),
    /// The session directory subscription was closed without being disabled;
    /// no more taps arrive until subscriptions are enabled again.
    SubscriptionLost,
    /// The service assigned a new connection id.
    ConnectionIdChanged(String),
}

/// Result of [`MultiplayerService::reconcile`].
#[derive(Debug, Clone)]
pub struct Reconciliation {
    /// The freshly fetched session, or `None` if the fetch was skipped.
    pub session: Option<MultiplayerSession>,
    pub changes: SessionChangeTypes,
}

// ── Subscription handler ────────────────────────────────────────────

struct ServiceState {
    connection_id: Mutex<Option<String>>,
    events: broadcast::Sender<MultiplayerEvent>,
}

impl ServiceState {
    fn emit(&self, event: MultiplayerEvent) {
        if self.events.send(event).is_err() {
            debug!("no multiplayer event listeners");
        }
    }
}

/// One per enabled subscription. Once disabled, a handler stays silent even
/// if its subscription closes after a newer one has been opened.
struct ConnectionsHandler {
    state: Arc<ServiceState>,
    disabled: AtomicBool,
}

impl ConnectionsHandler {
    fn new(state: Arc<ServiceState>) -> Self {
        Self {
            state,
            disabled: AtomicBool::new(false),
        }
    }

    fn disable(&self) {
        self.disabled.store(true, Ordering::SeqCst);
    }

    fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }
}

impl SubscriptionHandler for ConnectionsHandler {
    fn on_event_received(&self, payload: &Value) {
        if self.is_disabled() {
            return;
        }
        if let Some(id) = payload.get("ConnectionId").and_then(Value::as_str) {
            let changed = {
                let mut current = self.state.connection_id.lock();
                let changed = current.as_deref() != Some(id);
                *current = Some(id.to_owned());
                changed
            };
            if changed {
                info!(connection_id = id, "multiplayer connection id assigned");
                self.state
                    .emit(MultiplayerEvent::ConnectionIdChanged(id.to_owned()));
            }
            return;
        }
        match decode_taps(payload) {
            Some(taps) => {
                for tap in taps {
                    debug!(resource = %tap.resource, change_number = tap.change_number, "shoulder tap");
                    self.state.emit(MultiplayerEvent::SessionChanged(tap));
                }
            }
            None => warn!("ignoring unrecognized session directory payload: {payload}"),
        }
    }

    fn on_state_changed(&self, state: SubscriptionState) {
        if state != SubscriptionState::Closed || self.is_disabled() {
            return;
        }
        *self.state.connection_id.lock() = None;
        warn!("session directory subscription lost");
        self.state.emit(MultiplayerEvent::SubscriptionLost);
    }
}

// ── Service ─────────────────────────────────────────────────────────

/// Session directory client for one user.
pub struct MultiplayerService {
    config: MultiplayerServiceConfig,
    http: Arc<dyn HttpClient>,
    credentials: Arc<dyn CredentialProvider>,
    rta: Arc<RtaConnection>,
    state: Arc<ServiceState>,
    subscription: Mutex<Option<(Arc<Subscription>, Arc<ConnectionsHandler>)>>,
}

impl MultiplayerService {
    pub fn new(
        config: MultiplayerServiceConfig,
        http: Arc<dyn HttpClient>,
        credentials: Arc<dyn CredentialProvider>,
        rta: Arc<RtaConnection>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        Self {
            config,
            http,
            credentials,
            rta,
            state: Arc::new(ServiceState {
                connection_id: Mutex::new(None),
                events,
            }),
            subscription: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MultiplayerServiceConfig {
        &self.config
    }

    /// Subscribe to multiplayer notifications.
    pub fn events(&self) -> broadcast::Receiver<MultiplayerEvent> {
        self.state.events.subscribe()
    }

    /// Connection id assigned by the session directory, once known.
    pub fn connection_id(&self) -> Option<String> {
        self.state.connection_id.lock().clone()
    }

    /// Whether the session directory subscription is open.
    pub fn subscriptions_enabled(&self) -> bool {
        self.subscription
            .lock()
            .as_ref()
            .is_some_and(|(sub, _)| sub.state() != SubscriptionState::Closed)
    }

    /// Open the session directory subscription on the real-time activity
    /// connection. A no-op if it is already open.
    ///
    /// # Errors
    ///
    /// Whatever [`RtaConnection::add_subscription`] returns.
    pub fn enable_subscriptions(&self) -> Result<()> {
        let mut slot = self.subscription.lock();
        if slot
            .as_ref()
            .is_some_and(|(sub, _)| sub.state() != SubscriptionState::Closed)
        {
            return Ok(());
        }
        let handler = Arc::new(ConnectionsHandler::new(Arc::clone(&self.state)));
        let sub = Subscription::new(
            MULTIPLAYER_CONNECTIONS_RESOURCE,
            Arc::clone(&handler) as Arc<dyn SubscriptionHandler>,
        );
        self.rta.add_subscription(&sub)?;
        *slot = Some((sub, handler));
        Ok(())
    }

    /// Close the session directory subscription. Does not raise
    /// [`MultiplayerEvent::SubscriptionLost`].
    ///
    /// # Errors
    ///
    /// Whatever [`RtaConnection::remove_subscription`] returns.
    pub fn disable_subscriptions(&self) -> Result<()> {
        let Some((sub, handler)) = self.subscription.lock().take() else {
            return Ok(());
        };
        if sub.state() == SubscriptionState::Closed {
            return Ok(());
        }
        handler.disable();
        *self.state.connection_id.lock() = None;
        self.rta.remove_subscription(&sub)
    }

    /// Fetch a session.
    ///
    /// # Errors
    ///
    /// - [`RtaError::InvalidArgument`] for an incomplete reference.
    /// - [`RtaError::Http`] for a non-success status.
    /// - [`RtaError::Serialization`] for an unreadable body.
    pub async fn get_session(
        &self,
        reference: &MultiplayerSessionReference,
    ) -> Result<MultiplayerSession> {
        if !reference.is_valid() {
            return Err(RtaError::invalid_argument("incomplete session reference"));
        }
        let request = HttpRequest::new("GET", self.config.session_uri(reference))
            .with_header(CONTRACT_VERSION_HEADER, self.config.contract_version.to_string());
        let response = self.send_signed(request).await?;
        self.session_from_response(reference, &response)
    }

    /// Write the staged changes of `session`.
    ///
    /// Returns the session as stored by the service, or `None` if the write
    /// removed the last member and the session no longer exists.
    ///
    /// # Errors
    ///
    /// - [`RtaError::Runtime`] if the session stages a change subscription
    ///   and no connection id is known yet.
    /// - [`RtaError::Http`] for a non-success status; a failed precondition
    ///   is status 412.
    pub async fn write_session(
        &self,
        session: &MultiplayerSession,
        mode: WriteMode,
    ) -> Result<Option<MultiplayerSession>> {
        let reference = session.reference();
        if !reference.is_valid() {
            return Err(RtaError::invalid_argument("incomplete session reference"));
        }
        let connection_id = self.connection_id();
        let body = session.write_request_body(connection_id.as_deref())?;
        let mut request = HttpRequest::new("PUT", self.config.session_uri(reference))
            .with_header(CONTRACT_VERSION_HEADER, self.config.contract_version.to_string())
            .with_header("Content-Type", "application/json; charset=utf-8")
            .with_body(serde_json::to_vec(&body)?);
        if let Some((name, value)) = mode.precondition(session.etag()) {
            request = request.with_header(name, value);
        }

        let response = self.send_signed(request).await?;
        if response.status == 204 || response.body.is_empty() {
            debug!(session = %reference, "session write left no document");
            return Ok(None);
        }
        self.session_from_response(reference, &response).map(Some)
    }

    /// Fetch the session named by `tap` and classify what changed since
    /// `last_known`.
    ///
    /// Skips the fetch, returning no session and no changes, when
    /// `last_known` is on the same branch and at least as new as the tap.
    /// Without `last_known` every facet counts as changed.
    ///
    /// # Errors
    ///
    /// - [`RtaError::InvalidArgument`] for a malformed tap or a tap naming a
    ///   different session than `last_known`.
    /// - Whatever [`get_session`](Self::get_session) returns.
    pub async fn reconcile(
        &self,
        tap: &ShoulderTap,
        last_known: Option<&MultiplayerSession>,
    ) -> Result<Reconciliation> {
        let reference = tap.session_reference()?;
        if let Some(old) = last_known {
            if !old.reference().matches(&reference) {
                return Err(RtaError::invalid_argument(format!(
                    "tap for {reference} does not match session {}",
                    old.reference()
                )));
            }
            if tap.is_stale_for(old) {
                debug!(session = %reference, change_number = tap.change_number, "skipping stale tap");
                return Ok(Reconciliation {
                    session: None,
                    changes: SessionChangeTypes::NONE,
                });
            }
        }

        let current = self.get_session(&reference).await?;
        let changes = match last_known {
            Some(old) => compare_multiplayer_sessions(&current, old)?,
            None => SessionChangeTypes::EVERYTHING,
        };
        Ok(Reconciliation {
            session: Some(current),
            changes,
        })
    }

    async fn send_signed(&self, mut request: HttpRequest) -> Result<HttpResponse> {
        let credentials = self
            .credentials
            .token_and_signature(&request.method, &request.uri, &request.headers, &request.body)
            .await?;
        request.headers.extend(credentials.headers());
        debug!(method = %request.method, uri = %request.uri, "session directory request");

        let response = self.http.send(request).await?;
        if !response.is_success() {
            warn!(status = response.status, "session directory request failed");
            return Err(RtaError::Http {
                status: response.status,
                body: response.body_text(),
            });
        }
        Ok(response)
    }

    fn session_from_response(
        &self,
        reference: &MultiplayerSessionReference,
        response: &HttpResponse,
    ) -> Result<MultiplayerSession> {
        MultiplayerSession::from_response(
            reference.clone(),
            &response.body,
            response.header("ETag").map(str::to_owned),
            Some(self.rta.user().user_id.clone()),
        )
    }
}

impl std::fmt::Debug for MultiplayerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplayerService")
            .field("endpoint", &self.config.endpoint)
            .field("connection_id", &self.connection_id())
            .field("subscriptions_enabled", &self.subscriptions_enabled())
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
    use serde_json::json;

    #[test]
    fn write_mode_preconditions() {
        assert_eq!(
            WriteMode::CreateNew.precondition(Some("e1")),
            Some(("If-None-Match", "*".to_string()))
        );
        assert_eq!(
            WriteMode::UpdateExisting.precondition(None),
            Some(("If-Match", "*".to_string()))
        );
        assert_eq!(WriteMode::UpdateOrCreateNew.precondition(Some("e1")), None);
        assert_eq!(
            WriteMode::SynchronizedUpdate.precondition(Some("e1")),
            Some(("If-Match", "e1".to_string()))
        );
        assert_eq!(
            WriteMode::SynchronizedUpdate.precondition(None),
            Some(("If-None-Match", "*".to_string()))
        );
    }

    #[test]
    fn session_uri_joins_endpoint() {
        let config = MultiplayerServiceConfig::new("https://example.test/");
        let reference = MultiplayerSessionReference::new("s", "t", "n");
        assert_eq!(
            config.session_uri(&reference),
            "https://example.test/serviceconfigs/s/sessionTemplates/t/sessions/n"
        );
    }

    #[test]
    fn taps_decode_from_batch_or_single() {
        let batch = json!({"shoulderTaps": [
            {"resource": "s~t~a", "changeNumber": 3, "branch": "b"},
            {"resource": "s~t~b", "changeNumber": 4, "branch": "b"}
        ]});
        let taps = decode_taps(&batch).unwrap();
        assert_eq!(taps.len(), 2);
        assert_eq!(taps[1].change_number, 4);

        let single = json!({"resource": "s~t~a", "changeNumber": 9, "branch": "x"});
        assert_eq!(decode_taps(&single).unwrap()[0].branch, "x");

        assert!(decode_taps(&json!(42)).is_none());
    }

    #[test]
    fn stale_tap_detection() {
        let old = MultiplayerSession::from_json(
            MultiplayerSessionReference::new("s", "t", "a"),
            json!({"changeNumber": 5, "branch": "b"}),
        )
        .unwrap();
        let tap = |n, branch: &str| ShoulderTap {
            resource: "s~t~a".into(),
            change_number: n,
            branch: branch.into(),
        };
        assert!(tap(5, "b").is_stale_for(&old));
        assert!(tap(4, "b").is_stale_for(&old));
        assert!(!tap(6, "b").is_stale_for(&old));
        assert!(!tap(1, "other").is_stale_for(&old));
    }

    #[test]
    fn handler_tracks_connection_id_and_loss() {
        let (events, mut rx) = broadcast::channel(8);
        let state = Arc::new(ServiceState {
            connection_id: Mutex::new(None),
            events,
        });
        let handler = ConnectionsHandler::new(Arc::clone(&state));

        handler.on_event_received(&json!({"ConnectionId": "c-1"}));
        handler.on_event_received(&json!({"ConnectionId": "c-1"}));
        assert_eq!(
            rx.try_recv().unwrap(),
            MultiplayerEvent::ConnectionIdChanged("c-1".into())
        );
        assert!(rx.try_recv().is_err());

        handler.on_state_changed(SubscriptionState::Closed);
        assert_eq!(rx.try_recv().unwrap(), MultiplayerEvent::SubscriptionLost);
        assert!(state.connection_id.lock().is_none());

        let disabled = ConnectionsHandler::new(Arc::clone(&state));
        disabled.disable();
        disabled.on_state_changed(SubscriptionState::Closed);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn disabled_handler_leaves_newer_connection_id_alone() {
        let (events, mut rx) = broadcast::channel(8);
        let state = Arc::new(ServiceState {
            connection_id: Mutex::new(None),
            events,
        });
        let old = ConnectionsHandler::new(Arc::clone(&state));
        old.disable();
        let current = ConnectionsHandler::new(Arc::clone(&state));

        current.on_event_received(&json!({"ConnectionId": "c-2"}));
        old.on_event_received(&json!({"ConnectionId": "c-1"}));
        old.on_state_changed(SubscriptionState::Closed);

        assert_eq!(state.connection_id.lock().as_deref(), Some("c-2"));
        assert_eq!(
            rx.try_recv().unwrap(),
            MultiplayerEvent::ConnectionIdChanged("c-2".into())
        );
        assert!(rx.try_recv().is_err());
    }
}
