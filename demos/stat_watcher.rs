//! # Statistic Watcher Example
//!
//! Watches one user statistic over a live real-time activity connection:
//!
//! 1. Open a WebSocket to the RTA endpoint with an XBL token
//! 2. Subscribe to a statistic and print the initial value
//! 3. Print every change, plus connection state transitions
//! 4. Shut down on Ctrl+C or when the connection is lost for good
//!
//! ## Running
//!
//! ```sh
//! XBL_TOKEN="XBL3.0 x=...;..." XBL_XUID=2533274... XBL_SCID=00000000-... \
//!     cargo run --example stat_watcher -- Wins
//!
//! # Override the endpoint:
//! RTA_URL=wss://my-proxy/connect cargo run --example stat_watcher -- Wins
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use rta_client::{
    ActivationLimiter, CredentialProvider, RtaConfig, RtaConnection, RtaEvent,
    StatisticChangeSubscription, TokenAndSignature, UserContext, WebSocketConnector,
    DEFAULT_RTA_ENDPOINT,
};

/// Credentials read once from the environment.
struct EnvCredentials {
    token: String,
    xuid: String,
}

#[async_trait]
impl CredentialProvider for EnvCredentials {
    async fn token_and_signature(
        &self,
        _method: &str,
        _uri: &str,
        _headers: &[(String, String)],
        _body: &[u8],
    ) -> rta_client::Result<TokenAndSignature> {
        Ok(TokenAndSignature {
            token: self.token.clone(),
            signature: String::new(),
            user_id: self.xuid.clone(),
            gamertag: None,
        })
    }
}

fn required_env(name: &str) -> Result<String, Box<dyn std::error::Error>> {
    std::env::var(name).map_err(|_| format!("{name} must be set").into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Set `RUST_LOG=rta_client=debug` to see every frame.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let url = std::env::var("RTA_URL").unwrap_or_else(|_| DEFAULT_RTA_ENDPOINT.to_string());
    let xuid = required_env("XBL_XUID")?;
    let scid = required_env("XBL_SCID")?;
    let statistic = std::env::args().nth(1).unwrap_or_else(|| "Wins".to_string());
    let credentials = Arc::new(EnvCredentials {
        token: required_env("XBL_TOKEN")?,
        xuid: xuid.clone(),
    });

    // ── Connect ─────────────────────────────────────────────────────
    let connector = Arc::new(WebSocketConnector::new(url.clone(), credentials));
    let connection = RtaConnection::new(
        UserContext::new(xuid.clone()),
        connector,
        Arc::new(ActivationLimiter::default()),
        RtaConfig::new(url),
    );
    let mut events = connection.events();
    connection.activate()?;

    let stat = StatisticChangeSubscription::new(&xuid, &scid, &statistic)?;
    connection.add_subscription(stat.subscription())?;
    let mut updates = stat.watch();
    tracing::info!("Watching {statistic} for {xuid}");

    // ── Event loop ──────────────────────────────────────────────────
    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(value) = stat.latest() {
                    tracing::info!(
                        "{} = {}",
                        value.name.as_deref().unwrap_or(&statistic),
                        value.value.as_deref().unwrap_or("<none>")
                    );
                }
            }

            event = events.recv() => {
                match event {
                    Ok(RtaEvent::StateChanged(state)) => {
                        tracing::info!("Connection state → {state:?}");
                    }
                    Ok(RtaEvent::SubscriptionError { resource_uri, error }) => {
                        tracing::error!("Subscription to {resource_uri} rejected: {error}");
                        break;
                    }
                    Ok(RtaEvent::Resync) => {
                        tracing::warn!("Service asked for a resync; values may have been missed");
                    }
                    Ok(RtaEvent::ConnectionLost) => {
                        tracing::error!("Connection lost and could not be re-established");
                        break;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Dropped {n} connection event(s)");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, shutting down");
                break;
            }
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────
    connection.deactivate();
    tracing::info!("Done");
    Ok(())
}
