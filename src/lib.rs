//! # RTA Client
//!
//! Real-time activity subscription client with multiplayer session
//! reconciliation.
//!
//! One [`RtaConnection`] per signed-in user keeps a WebSocket to the real-time
//! activity service open, multiplexes any number of [`Subscription`]s over it,
//! and reconnects with backoff when the socket drops, re-establishing every
//! subscription. An [`ActivationLimiter`] caps how many connections a user can
//! hold at once.
//!
//! On top of that, [`MultiplayerService`] watches the session directory for
//! shoulder taps and [`compare_multiplayer_sessions`] classifies what changed
//! between two snapshots of a session.
//!
//! ## Features
//!
//! - **Transport-agnostic**: implement [`Transport`] and [`Connector`] for any
//!   backend, or use the built-in `transport-websocket` feature
//! - **Enforced subscription lifecycle**: illegal state transitions are
//!   impossible
//! - **Event-driven**: connection state, rejected subscriptions and resync
//!   requests arrive on a broadcast channel
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rta_client::{
//!     ActivationLimiter, RtaConfig, RtaConnection, StatisticChangeSubscription, UserContext,
//!     WebSocketConnector,
//! };
//!
//! # async fn example(credentials: Arc<dyn rta_client::CredentialProvider>)
//! # -> Result<(), rta_client::RtaError> {
//! let config = RtaConfig::default();
//! let connector = WebSocketConnector::new(config.endpoint.clone(), credentials);
//! let limiter = Arc::new(ActivationLimiter::default());
//! let connection = RtaConnection::new(UserContext::new("2533274"), Arc::new(connector), limiter, config);
//! connection.activate()?;
//!
//! let wins = StatisticChangeSubscription::new("2533274", "scid-1", "Wins")?;
//! connection.add_subscription(wins.subscription())?;
//!
//! let mut updates = wins.watch();
//! while updates.changed().await.is_ok() {
//!     println!("wins: {:?}", wins.latest());
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
mod backoff;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod error_codes;
pub mod http;
pub mod limiter;
pub mod multiplayer;
pub mod protocol;
mod registry;
pub mod session;
pub mod statistics;
pub mod subscription;
pub mod transport;
pub mod transports;

pub use auth::{CredentialProvider, TokenAndSignature, UserContext};
pub use connection::{
    RtaConfig, RtaConnection, RtaConnectionState, RtaEvent, DEFAULT_RTA_ENDPOINT, RTA_SUBPROTOCOL,
};
pub use dispatch::HandlerDispatch;
pub use error::{Result, RtaError};
pub use error_codes::SubscriptionError;
pub use http::{HttpClient, HttpRequest, HttpResponse};
pub use limiter::{
    ActivationGuard, ActivationKind, ActivationLimiter, ManagerActivation,
    DEFAULT_MAX_CONNECTIONS_PER_USER,
};
pub use multiplayer::{
    MultiplayerEvent, MultiplayerService, MultiplayerServiceConfig, Reconciliation, ShoulderTap,
    WriteMode,
};
pub use protocol::{ClientFrame, ServerFrame};
pub use session::{
    compare_multiplayer_sessions, MemberStatus, MultiplayerSession, MultiplayerSessionMember,
    MultiplayerSessionReference, SessionChangeTypes,
};
pub use statistics::{StatisticChangeSubscription, StatisticValue};
pub use subscription::{Subscription, SubscriptionHandler, SubscriptionState};
pub use transport::{Connector, Transport};

#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};
