//! The real-time activity connection.
//!
//! [`RtaConnection`] is a handle over shared bookkeeping and a background
//! connection loop task. Handle methods are synchronous: they update the
//! subscription registry under a short lock and, when a frame has to go out,
//! queue it to the loop over an unbounded channel. The loop owns the socket,
//! dispatches received frames in order, and reconnects with backoff when the
//! socket drops.
//!
//! Connection-level notifications are published on a broadcast channel
//! returned from [`RtaConnection::events`].
//!
//! # Example
//!
//! ```rust,ignore
//! let limiter = Arc::new(ActivationLimiter::default());
//! let connection = RtaConnection::new(user, connector, limiter, RtaConfig::default());
//! let mut events = connection.events();
//!
//! connection.activate()?;
//! connection.add_subscription(&Subscription::new(uri, handler))?;
//!
//! while let Ok(event) = events.recv().await {
//!     match event {
//!         RtaEvent::Resync => { /* re-fetch over REST */ }
//!         RtaEvent::StateChanged(RtaConnectionState::Disconnected) => break,
//!         _ => {}
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::auth::UserContext;
use crate::backoff::{transient_retry_delay, Backoff};
use crate::dispatch::{Dispatcher, HandlerDispatch};
use crate::error::{Result, RtaError};
use crate::error_codes::{self, SubscriptionError};
use crate::limiter::{ActivationGuard, ActivationKind, ActivationLimiter};
use crate::protocol::{ClientFrame, SequenceNumber, ServerFrame, SubscriptionId};
use crate::registry::{Detached, SubscriptionRegistry};
use crate::subscription::{Subscription, SubscriptionState};
use crate::transport::{Connector, Transport};

/// Default service endpoint.
pub const DEFAULT_RTA_ENDPOINT: &str = "wss://rta.xboxlive.com/connect";

/// WebSocket subprotocol spoken by the service.
pub const RTA_SUBPROTOCOL: &str = "rta.xboxlive.com.V2";

const DEFAULT_TIMEOUT_WINDOW: Duration = Duration::from_secs(300);
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(20);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;
/// The service drops sockets after two hours; reconnect well before that.
const DEFAULT_MAX_CONNECTION_LIFETIME: Duration = Duration::from_secs(90 * 60);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for an [`RtaConnection`].
///
/// # Example
///
/// ```
/// use rta_client::connection::RtaConfig;
/// use std::time::Duration;
///
/// let config = RtaConfig::default()
///     .with_timeout_window(Duration::from_secs(60))
///     .with_backoff(Duration::from_millis(250), Duration::from_secs(5));
/// assert_eq!(config.timeout_window, Duration::from_secs(60));
/// assert_eq!(config.event_channel_capacity, 256);
/// ```
#[derive(Debug, Clone)]
pub struct RtaConfig {
    /// Service endpoint, used by connectors that dial it.
    pub endpoint: String,
    /// How long the loop keeps trying to (re)connect before giving up,
    /// forcing `Disconnected` and closing every subscription.
    ///
    /// Defaults to **300 seconds**.
    pub timeout_window: Duration,
    /// First reconnect delay. Defaults to **1 second**.
    pub backoff_base: Duration,
    /// Upper bound for a single reconnect delay. Defaults to **20 seconds**.
    pub backoff_max: Duration,
    /// Bound on a single connect attempt. Defaults to **20 seconds**.
    pub connect_timeout: Duration,
    /// Capacity of the broadcast event channel. Receivers that fall further
    /// behind than this observe `RecvError::Lagged`.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// Where subscription handlers run. Defaults to
    /// [`HandlerDispatch::Inline`].
    pub handler_dispatch: HandlerDispatch,
    /// Age after which a healthy socket is closed and re-established.
    ///
    /// Defaults to **90 minutes**.
    pub max_connection_lifetime: Duration,
}

impl RtaConfig {
    /// Create a configuration for `endpoint` with default values.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout_window: DEFAULT_TIMEOUT_WINDOW,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            handler_dispatch: HandlerDispatch::default(),
            max_connection_lifetime: DEFAULT_MAX_CONNECTION_LIFETIME,
        }
    }

    /// Set the reconnect timeout window.
    #[must_use]
    pub fn with_timeout_window(mut self, window: Duration) -> Self {
        self.timeout_window = window;
        self
    }

    /// Set the reconnect backoff bounds.
    #[must_use]
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    /// Set the per-attempt connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the capacity of the broadcast event channel.
    ///
    /// Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// Set the handler routing policy.
    #[must_use]
    pub fn with_handler_dispatch(mut self, dispatch: HandlerDispatch) -> Self {
        self.handler_dispatch = dispatch;
        self
    }

    /// Set the proactive reconnect age.
    #[must_use]
    pub fn with_max_connection_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_connection_lifetime = lifetime;
        self
    }
}

impl Default for RtaConfig {
    fn default() -> Self {
        Self::new(DEFAULT_RTA_ENDPOINT)
    }
}

// ── State and events ────────────────────────────────────────────────

/// Socket-level state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RtaConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for RtaConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Connection-wide notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtaEvent {
    /// The socket state changed.
    StateChanged(RtaConnectionState),
    /// A subscribe request was rejected. The subscription is now closed.
    SubscriptionError {
        resource_uri: String,
        error: SubscriptionError,
    },
    /// The reconnect window elapsed. Every subscription has been closed; a
    /// `StateChanged(Disconnected)` follows.
    ConnectionLost,
    /// The service asked clients to re-fetch state because events may have
    /// been missed.
    Resync,
}

// ── Shared state ────────────────────────────────────────────────────

enum Command {
    Send { frame: ClientFrame, epoch: u64 },
    Retry { subscription: Arc<Subscription>, epoch: u64 },
}

struct Worker {
    cmd_tx: mpsc::UnboundedSender<Command>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

struct Inner {
    state: RtaConnectionState,
    registry: SubscriptionRegistry,
    activation: Option<ActivationGuard>,
    ever_activated: bool,
    /// Bumped on every worker spawn, teardown and successful connect. Loops
    /// and queued commands carrying an older value are stale.
    epoch: u64,
    worker: Option<Worker>,
}

struct Shared {
    user: UserContext,
    config: RtaConfig,
    connector: Arc<dyn Connector>,
    events: broadcast::Sender<RtaEvent>,
    dispatcher: Dispatcher,
    inner: Mutex<Inner>,
}

/// Runs queued inline handler callbacks when dropped. Bind it before taking
/// `Shared::inner` so the lock is released first.
struct CallbackFlush<'a>(&'a Dispatcher);

impl Drop for CallbackFlush<'_> {
    fn drop(&mut self) {
        self.0.flush();
    }
}

impl Shared {
    fn flush_on_drop(&self) -> CallbackFlush<'_> {
        CallbackFlush(&self.dispatcher)
    }

    fn emit(&self, event: RtaEvent) {
        if self.events.send(event).is_err() {
            debug!("no event listeners");
        }
    }

    fn set_state(&self, inner: &mut Inner, state: RtaConnectionState) {
        if inner.state == state {
            return;
        }
        info!(user_id = %self.user.user_id, "connection {} -> {}", inner.state, state);
        inner.state = state;
        self.emit(RtaEvent::StateChanged(state));
    }

    /// Transition `sub` and schedule its state callback.
    fn move_to(&self, sub: &Arc<Subscription>, next: SubscriptionState) -> bool {
        if !sub.transition(next) {
            return false;
        }
        let sub = Arc::clone(sub);
        self.dispatcher.run(move || sub.notify_state(next));
        true
    }

    fn deliver(&self, sub: &Arc<Subscription>, payload: Value) {
        let sub = Arc::clone(sub);
        self.dispatcher.run(move || sub.deliver(&payload));
    }

    /// Close every subscription locally without waiting for the service.
    fn close_all(&self, inner: &mut Inner) {
        for sub in inner.registry.drain_all() {
            if sub.state() == SubscriptionState::Subscribed {
                self.move_to(&sub, SubscriptionState::PendingUnsubscribe);
            }
            self.move_to(&sub, SubscriptionState::Closed);
        }
    }

    fn spawn_worker(self: &Arc<Self>, inner: &mut Inner, runtime: &Handle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        inner.epoch += 1;
        self.set_state(inner, RtaConnectionState::Connecting);
        let task = runtime.spawn(connection_loop(
            Arc::clone(self),
            inner.epoch,
            cmd_rx,
            shutdown_rx,
        ));
        inner.worker = Some(Worker {
            cmd_tx,
            shutdown_tx: Some(shutdown_tx),
            task,
        });
    }
}

// ── Connection handle ───────────────────────────────────────────────

/// One logical real-time activity connection for one user.
///
/// See the [module documentation](self) for the threading model.
pub struct RtaConnection {
    shared: Arc<Shared>,
    limiter: Arc<ActivationLimiter>,
}

impl RtaConnection {
    /// Create an inactive connection. Nothing is dialed until
    /// [`activate`](Self::activate).
    pub fn new(
        user: UserContext,
        connector: Arc<dyn Connector>,
        limiter: Arc<ActivationLimiter>,
        config: RtaConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let dispatcher = Dispatcher::new(config.handler_dispatch);
        let shared = Arc::new(Shared {
            user,
            config,
            connector,
            events,
            dispatcher,
            inner: Mutex::new(Inner {
                state: RtaConnectionState::Disconnected,
                registry: SubscriptionRegistry::new(),
                activation: None,
                ever_activated: false,
                epoch: 0,
                worker: None,
            }),
        });
        Self { shared, limiter }
    }

    /// Claim an activation slot and start connecting.
    ///
    /// Idempotent: activating an already active connection claims nothing
    /// more. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`RtaError::LimitExceeded`] if the user's activation cap is reached.
    ///   No slot is held afterwards.
    /// - [`RtaError::Runtime`] if no Tokio runtime is available.
    pub fn activate(&self) -> Result<()> {
        let runtime = Handle::try_current()
            .map_err(|_| RtaError::Runtime("activate requires a Tokio runtime".into()))?;
        let mut inner = self.shared.inner.lock();
        if inner.activation.is_none() {
            let guard = self
                .limiter
                .try_increment(ActivationKind::Connection, &self.shared.user.user_id)?;
            inner.activation = Some(guard);
            inner.ever_activated = true;
            info!(user_id = %self.shared.user.user_id, "connection activated");
        }
        self.shared.dispatcher.start(&runtime);
        if inner.worker.is_none() {
            self.shared.spawn_worker(&mut inner, &runtime);
        }
        Ok(())
    }

    /// Release the activation slot, close the socket, and close every
    /// subscription locally. A no-op if the connection is not active.
    pub fn deactivate(&self) {
        let _flush = self.shared.flush_on_drop();
        let mut inner = self.shared.inner.lock();
        let Some(guard) = inner.activation.take() else {
            return;
        };
        drop(guard);
        info!(user_id = %self.shared.user.user_id, "connection deactivated");

        if let Some(mut worker) = inner.worker.take() {
            if let Some(tx) = worker.shutdown_tx.take() {
                let _ = tx.send(());
            }
        }
        inner.epoch += 1;
        self.shared.close_all(&mut inner);
        self.shared.set_state(&mut inner, RtaConnectionState::Disconnected);
    }

    /// Start watching `subscription`.
    ///
    /// The subscription moves to `PendingSubscribe` immediately. When
    /// connected the subscribe frame is sent at once; otherwise it is queued
    /// and flushed, in order, as soon as the socket is up.
    ///
    /// # Errors
    ///
    /// - [`RtaError::InvalidArgument`] if the subscription has an empty
    ///   resource URI or was already added somewhere.
    /// - [`RtaError::Runtime`] if the connection was never activated. The
    ///   subscription is not registered.
    pub fn add_subscription(&self, subscription: &Arc<Subscription>) -> Result<()> {
        if subscription.resource_uri().is_empty() {
            return Err(RtaError::invalid_argument(
                "subscription resource URI must not be empty",
            ));
        }
        let _flush = self.shared.flush_on_drop();
        let mut inner = self.shared.inner.lock();
        if !inner.ever_activated {
            return Err(RtaError::Runtime(
                "subscription added to a connection that was never activated".into(),
            ));
        }
        if subscription.state() != SubscriptionState::Uninitialized {
            return Err(RtaError::invalid_argument(format!(
                "subscription to {} is already {}",
                subscription.resource_uri(),
                subscription.state()
            )));
        }

        self.shared
            .move_to(subscription, SubscriptionState::PendingSubscribe);

        if inner.activation.is_some() && inner.worker.is_none() {
            if let Ok(runtime) = Handle::try_current() {
                self.shared.spawn_worker(&mut inner, &runtime);
            }
        }

        let sender = match (&inner.worker, inner.state) {
            (Some(worker), RtaConnectionState::Connected) => Some(worker.cmd_tx.clone()),
            _ => None,
        };
        match sender {
            Some(cmd_tx) => {
                let seq = inner.registry.next_sequence();
                inner.registry.insert_pending(seq, Arc::clone(subscription));
                let frame = ClientFrame::Subscribe {
                    seq,
                    resource_uri: subscription.resource_uri().to_owned(),
                };
                let epoch = inner.epoch;
                if cmd_tx.send(Command::Send { frame, epoch }).is_err() {
                    debug!("connection loop gone; subscribe will be retried on reconnect");
                }
            }
            None => {
                debug!(uri = subscription.resource_uri(), "queueing subscribe until connected");
                inner.registry.enqueue(Arc::clone(subscription));
            }
        }
        Ok(())
    }

    /// Stop watching `subscription`.
    ///
    /// A subscription that has not been acknowledged closes immediately and
    /// nothing is sent. An acknowledged one moves to `PendingUnsubscribe`
    /// and closes when the service acknowledges the unsubscribe. Removing a
    /// subscription that is already closing or closed is a no-op.
    ///
    /// # Errors
    ///
    /// [`RtaError::InvalidArgument`] if the subscription has an empty
    /// resource URI.
    pub fn remove_subscription(&self, subscription: &Arc<Subscription>) -> Result<()> {
        if subscription.resource_uri().is_empty() {
            return Err(RtaError::invalid_argument(
                "subscription resource URI must not be empty",
            ));
        }
        let _flush = self.shared.flush_on_drop();
        let mut inner = self.shared.inner.lock();
        match subscription.state() {
            SubscriptionState::Uninitialized
            | SubscriptionState::PendingUnsubscribe
            | SubscriptionState::Closed => Ok(()),
            SubscriptionState::PendingSubscribe => {
                if let Detached::InFlight(seq) =
                    inner.registry.detach_unacknowledged(subscription)
                {
                    inner.registry.orphan(seq);
                }
                self.shared.move_to(subscription, SubscriptionState::Closed);
                Ok(())
            }
            SubscriptionState::Subscribed => {
                if inner.state == RtaConnectionState::Connected {
                    if let Some(id) = inner.registry.detach_live(subscription) {
                        let seq = inner.registry.next_sequence();
                        inner
                            .registry
                            .insert_unsubscribing(seq, Arc::clone(subscription));
                        self.shared
                            .move_to(subscription, SubscriptionState::PendingUnsubscribe);
                        let frame = ClientFrame::Unsubscribe {
                            seq,
                            subscription_id: id,
                        };
                        let epoch = inner.epoch;
                        let sent = inner.worker.as_ref().is_some_and(|worker| {
                            worker.cmd_tx.send(Command::Send { frame, epoch }).is_ok()
                        });
                        if !sent {
                            debug!(
                                uri = subscription.resource_uri(),
                                "connection loop gone; closing subscription locally"
                            );
                            inner.registry.take_unsubscribing(seq);
                            self.shared.move_to(subscription, SubscriptionState::Closed);
                        }
                        return Ok(());
                    }
                }
                // Being re-established after a reconnect: nothing is live on
                // the service yet, so close locally.
                if let Detached::InFlight(seq) =
                    inner.registry.detach_unacknowledged(subscription)
                {
                    inner.registry.orphan(seq);
                }
                self.shared
                    .move_to(subscription, SubscriptionState::PendingUnsubscribe);
                self.shared.move_to(subscription, SubscriptionState::Closed);
                Ok(())
            }
        }
    }

    // ── State accessors ─────────────────────────────────────────────

    /// Current socket state.
    pub fn state(&self) -> RtaConnectionState {
        self.shared.inner.lock().state
    }

    /// Whether the connection currently holds an activation slot.
    pub fn is_activated(&self) -> bool {
        self.shared.inner.lock().activation.is_some()
    }

    /// The user this connection belongs to.
    pub fn user(&self) -> &UserContext {
        &self.shared.user
    }

    /// The configuration the connection was created with.
    pub fn config(&self) -> &RtaConfig {
        &self.shared.config
    }

    /// Subscribe to connection-wide notifications.
    pub fn events(&self) -> broadcast::Receiver<RtaEvent> {
        self.shared.events.subscribe()
    }

    /// Subscriptions tracked by the connection that are not yet closed.
    pub fn subscription_count(&self) -> usize {
        self.shared.inner.lock().registry.len()
    }

    /// Subscriptions acknowledged on the current socket.
    pub fn live_subscription_count(&self) -> usize {
        self.shared.inner.lock().registry.live_count()
    }
}

impl fmt::Debug for RtaConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("RtaConnection")
            .field("user_id", &self.shared.user.user_id)
            .field("state", &inner.state)
            .field("activated", &inner.activation.is_some())
            .field("subscriptions", &inner.registry.len())
            .finish()
    }
}

impl Drop for RtaConnection {
    fn drop(&mut self) {
        // Drop cannot await a graceful close; abort the loop outright.
        let _flush = self.shared.flush_on_drop();
        let mut inner = self.shared.inner.lock();
        if let Some(worker) = inner.worker.take() {
            worker.task.abort();
        }
        inner.activation = None;
        inner.epoch += 1;
        self.shared.close_all(&mut inner);
        self.shared
            .set_state(&mut inner, RtaConnectionState::Disconnected);
    }
}

// ── Connection loop ─────────────────────────────────────────────────

enum Outcome {
    /// The socket dropped or was recycled; reconnect.
    Reconnect,
    /// The handle tore the connection down; exit quietly.
    Stop,
}

/// Background loop: connect, flush, dispatch, and reconnect until
/// deactivated or the reconnect window elapses.
async fn connection_loop(
    shared: Arc<Shared>,
    mut epoch: u64,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    debug!(user_id = %shared.user.user_id, endpoint = %shared.config.endpoint, "connection loop started");
    let mut backoff = Backoff::new(shared.config.backoff_base, shared.config.backoff_max);
    let mut first_attempt = true;

    loop {
        if !first_attempt {
            let delay = backoff.next_delay();
            debug!("reconnecting in {delay:?}");
            tokio::select! {
                _ = &mut shutdown_rx => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
        first_attempt = false;

        let Some(mut transport) = connect_within_window(&shared, &mut backoff, &mut shutdown_rx).await
        else {
            give_up(&shared, epoch);
            return;
        };

        let flushed = {
            let mut inner = shared.inner.lock();
            if inner.epoch == epoch {
                inner.epoch += 1;
                epoch = inner.epoch;
                shared.set_state(&mut inner, RtaConnectionState::Connected);
                Some(flush_queue(&mut inner))
            } else {
                None
            }
        };
        let Some(frames) = flushed else {
            let _ = transport.close().await;
            return;
        };
        backoff.reset();

        let outcome = match send_all(&mut transport, &frames).await {
            Ok(()) => run_connected(&shared, epoch, &mut transport, &mut cmd_rx, &mut shutdown_rx).await,
            Err(e) => {
                error!("failed to flush subscribe frames: {e}");
                Outcome::Reconnect
            }
        };
        let _ = transport.close().await;

        if let Outcome::Stop = outcome {
            debug!("connection loop exited");
            return;
        }

        {
            let _flush = shared.flush_on_drop();
            let mut inner = shared.inner.lock();
            if inner.epoch != epoch {
                return;
            }
            shared.set_state(&mut inner, RtaConnectionState::Connecting);
            for sub in inner.registry.requeue_for_reconnect() {
                shared.move_to(&sub, SubscriptionState::Closed);
            }
        }
    }
}

/// Try to open a transport until one succeeds or the timeout window elapses.
///
/// Returns `None` when the window elapses or shutdown is signalled.
async fn connect_within_window(
    shared: &Shared,
    backoff: &mut Backoff,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> Option<Box<dyn Transport>> {
    let started = Instant::now();
    let window = shared.config.timeout_window;
    loop {
        let attempt = tokio::time::timeout(shared.config.connect_timeout, shared.connector.connect());
        tokio::select! {
            _ = &mut *shutdown_rx => return None,
            result = attempt => match result {
                Ok(Ok(transport)) => {
                    info!(user_id = %shared.user.user_id, "socket connected");
                    return Some(transport);
                }
                Ok(Err(e)) => warn!("connect attempt failed: {e}"),
                Err(_) => warn!("connect attempt timed out"),
            }
        }

        let elapsed = started.elapsed();
        if elapsed >= window {
            return None;
        }
        let delay = backoff.next_delay().min(window - elapsed);
        tokio::select! {
            _ = &mut *shutdown_rx => return None,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// The reconnect window elapsed: close everything and go idle.
fn give_up(shared: &Shared, epoch: u64) {
    let _flush = shared.flush_on_drop();
    let mut inner = shared.inner.lock();
    if inner.epoch != epoch {
        return;
    }
    error!(
        user_id = %shared.user.user_id,
        window = ?shared.config.timeout_window,
        "could not reconnect within the timeout window"
    );
    inner.worker = None;
    inner.epoch += 1;
    shared.close_all(&mut inner);
    shared.emit(RtaEvent::ConnectionLost);
    shared.set_state(&mut inner, RtaConnectionState::Disconnected);
}

/// Assign sequence numbers to every queued subscription and build their
/// subscribe frames, preserving queue order.
fn flush_queue(inner: &mut Inner) -> Vec<ClientFrame> {
    let mut frames = Vec::new();
    for sub in inner.registry.drain_queue() {
        if sub.state() == SubscriptionState::Closed {
            continue;
        }
        let seq = inner.registry.next_sequence();
        frames.push(ClientFrame::Subscribe {
            seq,
            resource_uri: sub.resource_uri().to_owned(),
        });
        inner.registry.insert_pending(seq, sub);
    }
    frames
}

async fn send_all(transport: &mut Box<dyn Transport>, frames: &[ClientFrame]) -> Result<()> {
    for frame in frames {
        send_frame(transport, frame).await?;
    }
    Ok(())
}

async fn send_frame(transport: &mut Box<dyn Transport>, frame: &ClientFrame) -> Result<()> {
    let json = frame.to_json()?;
    debug!(seq = frame.seq(), "sending frame {json}");
    transport.send(json).await
}

async fn run_connected(
    shared: &Shared,
    epoch: u64,
    transport: &mut Box<dyn Transport>,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> Outcome {
    let lifetime = tokio::time::sleep(shared.config.max_connection_lifetime);
    tokio::pin!(lifetime);

    loop {
        let outgoing = tokio::select! {
            _ = &mut *shutdown_rx => {
                debug!("shutdown signal received");
                return Outcome::Stop;
            }

            () = &mut lifetime => {
                info!("connection reached its maximum lifetime, recycling");
                return Outcome::Reconnect;
            }

            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send { frame, epoch: sent_in }) if sent_in == epoch => vec![frame],
                Some(Command::Send { frame, .. }) => {
                    debug!(seq = frame.seq(), "dropping frame queued for an earlier socket");
                    Vec::new()
                }
                Some(Command::Retry { subscription, epoch: sent_in }) => {
                    retry_frame(shared, epoch, sent_in, &subscription).into_iter().collect()
                }
                None => return Outcome::Stop,
            },

            incoming = transport.recv() => match incoming {
                Some(Ok(text)) => handle_frame(shared, epoch, &text),
                Some(Err(e)) => {
                    error!("transport receive error: {e}");
                    return Outcome::Reconnect;
                }
                None => {
                    info!("socket closed by the service");
                    return Outcome::Reconnect;
                }
            },
        };

        if let Err(e) = send_all(transport, &outgoing).await {
            error!("transport send error: {e}");
            return Outcome::Reconnect;
        }
    }
}

fn retry_frame(
    shared: &Shared,
    epoch: u64,
    scheduled_in: u64,
    sub: &Arc<Subscription>,
) -> Option<ClientFrame> {
    if scheduled_in != epoch {
        return None;
    }
    let mut inner = shared.inner.lock();
    if inner.epoch != epoch || !inner.registry.take_retrying(sub) {
        return None;
    }
    let seq = inner.registry.next_sequence();
    inner.registry.insert_pending(seq, Arc::clone(sub));
    debug!(uri = sub.resource_uri(), seq, "retrying subscribe");
    Some(ClientFrame::Subscribe {
        seq,
        resource_uri: sub.resource_uri().to_owned(),
    })
}

/// Dispatch one received frame. Returns frames that must be sent in reply.
fn handle_frame(shared: &Shared, epoch: u64, text: &str) -> Vec<ClientFrame> {
    let frame = match ServerFrame::parse(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("dropping malformed frame: {e} (raw: {text})");
            return Vec::new();
        }
    };
    debug!("received frame {text}");

    let _flush = shared.flush_on_drop();
    let mut inner = shared.inner.lock();
    if inner.epoch != epoch {
        return Vec::new();
    }

    match frame {
        ServerFrame::SubscribeAck {
            seq,
            status,
            subscription_id,
            payload,
        } => handle_subscribe_ack(shared, &mut inner, epoch, seq, status, subscription_id, payload),
        ServerFrame::UnsubscribeAck { seq, status } => {
            match inner.registry.take_unsubscribing(seq) {
                Some(sub) => {
                    if status != error_codes::STATUS_SUCCESS {
                        warn!(uri = sub.resource_uri(), status, "unsubscribe rejected; closing anyway");
                    }
                    shared.move_to(&sub, SubscriptionState::Closed);
                }
                None => debug!(seq, "unsubscribe ack for unknown sequence number"),
            }
            Vec::new()
        }
        ServerFrame::Event {
            subscription_id,
            payload,
        } => {
            match inner.registry.live(subscription_id) {
                Some(sub) => shared.deliver(&sub, payload),
                None => debug!(subscription_id, "event for unknown subscription dropped"),
            }
            Vec::new()
        }
        ServerFrame::Resync => {
            info!("service requested resync");
            shared.emit(RtaEvent::Resync);
            Vec::new()
        }
    }
}

fn handle_subscribe_ack(
    shared: &Shared,
    inner: &mut Inner,
    epoch: u64,
    seq: SequenceNumber,
    status: u32,
    subscription_id: Option<SubscriptionId>,
    payload: Value,
) -> Vec<ClientFrame> {
    if inner.registry.take_orphan(seq) {
        // Removed by the caller while the request was in flight.
        return match (status, subscription_id) {
            (error_codes::STATUS_SUCCESS, Some(id)) => {
                let unsubscribe_seq = inner.registry.next_sequence();
                debug!(subscription_id = id, "unsubscribing orphaned subscription");
                vec![ClientFrame::Unsubscribe {
                    seq: unsubscribe_seq,
                    subscription_id: id,
                }]
            }
            _ => Vec::new(),
        };
    }

    let Some(sub) = inner.registry.take_pending(seq) else {
        debug!(seq, "subscribe ack for unknown sequence number");
        return Vec::new();
    };

    if let (error_codes::STATUS_SUCCESS, Some(id)) = (status, subscription_id) {
        sub.reset_retry_attempts();
        inner.registry.insert_live(id, Arc::clone(&sub));
        if sub.state() == SubscriptionState::PendingSubscribe {
            shared.move_to(&sub, SubscriptionState::Subscribed);
        }
        debug!(uri = sub.resource_uri(), subscription_id = id, "subscribed");
        shared.deliver(&sub, payload);
        return Vec::new();
    }

    if error_codes::is_transient(status) {
        let attempt = sub.next_retry_attempt();
        let delay = transient_retry_delay(attempt);
        warn!(uri = sub.resource_uri(), status, attempt, "transient subscribe failure, retrying in {delay:?}");
        inner.registry.insert_retrying(Arc::clone(&sub));
        if let Some(worker) = &inner.worker {
            let cmd_tx = worker.cmd_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = cmd_tx.send(Command::Retry {
                    subscription: sub,
                    epoch,
                });
            });
        }
        return Vec::new();
    }

    if status == error_codes::STATUS_SUCCESS {
        warn!(uri = sub.resource_uri(), "subscribe ack carried no subscription id");
    }
    let error = SubscriptionError::from_status(status).unwrap_or(SubscriptionError::Generic(status));
    warn!(uri = sub.resource_uri(), status, "subscribe rejected: {error}");
    let notified = Arc::clone(&sub);
    shared.dispatcher.run(move || notified.notify_error(&error));
    if sub.state() == SubscriptionState::Subscribed {
        // A carried subscription whose re-subscribe was refused.
        shared.move_to(&sub, SubscriptionState::PendingUnsubscribe);
    }
    shared.move_to(&sub, SubscriptionState::Closed);
    shared.emit(RtaEvent::SubscriptionError {
        resource_uri: sub.resource_uri().to_owned(),
        error,
    });
    Vec::new()
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

    #[test]
    fn config_defaults() {
        let config = RtaConfig::default();
        assert_eq!(config.endpoint, DEFAULT_RTA_ENDPOINT);
        assert_eq!(config.timeout_window, Duration::from_secs(300));
        assert_eq!(config.backoff_base, Duration::from_secs(1));
        assert_eq!(config.backoff_max, Duration::from_secs(20));
        assert_eq!(config.connect_timeout, Duration::from_secs(20));
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.handler_dispatch, HandlerDispatch::Inline);
        assert_eq!(config.max_connection_lifetime, Duration::from_secs(5400));
    }

    #[test]
    fn config_capacity_is_clamped() {
        let config = RtaConfig::default().with_event_channel_capacity(0);
        assert_eq!(config.event_channel_capacity, 1);
    }

    #[test]
    fn flush_preserves_queue_order_and_skips_closed() {
        struct Noop;
        impl crate::subscription::SubscriptionHandler for Noop {
            fn on_event_received(&self, _payload: &Value) {}
        }

        let mut inner = Inner {
            state: RtaConnectionState::Connecting,
            registry: SubscriptionRegistry::new(),
            activation: None,
            ever_activated: true,
            epoch: 1,
            worker: None,
        };
        let a = Subscription::new("a", Arc::new(Noop));
        let b = Subscription::new("b", Arc::new(Noop));
        let c = Subscription::new("c", Arc::new(Noop));
        for sub in [&a, &b, &c] {
            assert!(sub.transition(SubscriptionState::PendingSubscribe));
            inner.registry.enqueue(Arc::clone(sub));
        }
        assert!(b.transition(SubscriptionState::Closed));

        let frames = flush_queue(&mut inner);
        let uris: Vec<_> = frames
            .iter()
            .map(|f| match f {
                ClientFrame::Subscribe { resource_uri, .. } => resource_uri.clone(),
                ClientFrame::Unsubscribe { .. } => panic!("unexpected unsubscribe"),
            })
            .collect();
        assert_eq!(uris, vec!["a", "c"]);
        assert!(frames[0].seq() < frames[1].seq());
    }

    #[test]
    fn add_before_activation_is_rejected() {
        struct NeverConnects;
        #[async_trait::async_trait]
        impl Connector for NeverConnects {
            async fn connect(&self) -> Result<Box<dyn Transport>> {
                Err(RtaError::TransportClosed)
            }
        }
        struct Noop;
        impl crate::subscription::SubscriptionHandler for Noop {
            fn on_event_received(&self, _payload: &Value) {}
        }

        let connection = RtaConnection::new(
            UserContext::new("1"),
            Arc::new(NeverConnects),
            Arc::new(ActivationLimiter::default()),
            RtaConfig::default(),
        );
        let sub = Subscription::new("stats/Stat", Arc::new(Noop));
        assert!(matches!(
            connection.add_subscription(&sub),
            Err(RtaError::Runtime(_))
        ));
        assert_eq!(sub.state(), SubscriptionState::Uninitialized);
        assert_eq!(connection.subscription_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_closes_locally_when_the_loop_is_gone() {
        struct NeverConnects;
        #[async_trait::async_trait]
        impl Connector for NeverConnects {
            async fn connect(&self) -> Result<Box<dyn Transport>> {
                Err(RtaError::TransportClosed)
            }
        }
        struct Noop;
        impl crate::subscription::SubscriptionHandler for Noop {
            fn on_event_received(&self, _payload: &Value) {}
        }

        let connection = RtaConnection::new(
            UserContext::new("1"),
            Arc::new(NeverConnects),
            Arc::new(ActivationLimiter::default()),
            RtaConfig::default(),
        );
        let sub = Subscription::new("stats/Stat", Arc::new(Noop));
        {
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            drop(cmd_rx);
            let mut inner = connection.shared.inner.lock();
            inner.ever_activated = true;
            inner.state = RtaConnectionState::Connected;
            inner.worker = Some(Worker {
                cmd_tx,
                shutdown_tx: None,
                task: tokio::spawn(async {}),
            });
            assert!(sub.transition(SubscriptionState::PendingSubscribe));
            assert!(sub.transition(SubscriptionState::Subscribed));
            inner.registry.insert_live(3, Arc::clone(&sub));
        }

        connection.remove_subscription(&sub).unwrap();
        assert_eq!(sub.state(), SubscriptionState::Closed);
        assert_eq!(connection.subscription_count(), 0);
    }

    #[test]
    fn activate_outside_runtime_is_a_runtime_error() {
        struct NeverConnects;
        #[async_trait::async_trait]
        impl Connector for NeverConnects {
            async fn connect(&self) -> Result<Box<dyn Transport>> {
                Err(RtaError::TransportClosed)
            }
        }
        let limiter = Arc::new(ActivationLimiter::default());
        let connection = RtaConnection::new(
            UserContext::new("1"),
            Arc::new(NeverConnects),
            Arc::clone(&limiter),
            RtaConfig::default(),
        );
        assert!(matches!(connection.activate(), Err(RtaError::Runtime(_))));
        assert_eq!(limiter.slots_in_use("1"), 0);
    }
}
