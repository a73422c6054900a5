//! # Loopback Session Example
//!
//! Runs the whole multiplayer flow against an in-process stand-in for the
//! session directory, so it needs no network or credentials:
//!
//! 1. Activate a real-time activity connection over an in-memory transport
//! 2. Enable session change subscriptions and wait for the connection id
//! 3. Create a session, join it and subscribe to host changes
//! 4. Change the host; the loopback service shoulder-taps the connection
//! 5. Reconcile the tap and print which facets changed
//!
//! ## Running
//!
//! ```sh
//! RUST_LOG=debug cargo run --example loopback_session
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rta_client::protocol::ClientFrame;
use rta_client::{
    ActivationLimiter, Connector, CredentialProvider, HttpClient, HttpRequest, HttpResponse,
    MultiplayerEvent, MultiplayerService, MultiplayerServiceConfig, MultiplayerSession,
    MultiplayerSessionReference, RtaConfig, RtaConnection, RtaError, ServerFrame,
    SessionChangeTypes, TokenAndSignature, Transport, UserContext, WriteMode,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;

const XUID: &str = "2533274800000001";
const CONNECTION_ID: &str = "8e4c1a6f-loopback";
const SESSIONS_ENDPOINT: &str = "https://sessions.loopback";

// ── In-memory transport ─────────────────────────────────────────────

struct LoopbackTransport {
    incoming: mpsc::UnboundedReceiver<String>,
    outgoing: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, message: String) -> Result<(), RtaError> {
        self.outgoing
            .send(message)
            .map_err(|e| RtaError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, RtaError>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), RtaError> {
        Ok(())
    }
}

// ── Loopback service ────────────────────────────────────────────────

#[derive(Default)]
struct StoredSession {
    document: Value,
    change_number: u64,
}

/// Session store plus the socket taps are pushed to.
#[derive(Default)]
struct LoopbackService {
    sessions: Mutex<HashMap<String, StoredSession>>,
    socket: Mutex<Option<(mpsc::UnboundedSender<String>, u64)>>,
}

impl LoopbackService {
    fn serve_socket(
        self: &Arc<Self>,
        to_client: mpsc::UnboundedSender<String>,
        mut from_client: mpsc::UnboundedReceiver<String>,
    ) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(text) = from_client.recv().await {
                let reply = match ClientFrame::parse(&text) {
                    Ok(ClientFrame::Subscribe { seq, resource_uri }) => {
                        tracing::debug!("loopback: subscribe {resource_uri}");
                        *service.socket.lock() = Some((to_client.clone(), 1));
                        ServerFrame::SubscribeAck {
                            seq,
                            status: 0,
                            subscription_id: Some(1),
                            payload: json!({ "ConnectionId": CONNECTION_ID }),
                        }
                    }
                    Ok(ClientFrame::Unsubscribe { seq, .. }) => {
                        *service.socket.lock() = None;
                        ServerFrame::UnsubscribeAck { seq, status: 0 }
                    }
                    Err(e) => {
                        tracing::warn!("loopback: bad frame: {e}");
                        continue;
                    }
                };
                if to_client.send(reply.to_json()).is_err() {
                    break;
                }
            }
        });
    }

    fn tap(&self, resource: &str, change_number: u64) {
        let Some((socket, subscription_id)) = self.socket.lock().clone() else {
            return;
        };
        let frame = ServerFrame::Event {
            subscription_id,
            payload: json!({ "shoulderTaps": [
                { "resource": resource, "changeNumber": change_number, "branch": "loopback" }
            ]}),
        };
        let _ = socket.send(frame.to_json());
    }

    /// Merge a write body into the stored document. `members.me` becomes
    /// member 0.
    fn apply_write(&self, uri: &str, mut body: Value) -> (Value, u64) {
        if let Some(me) = body
            .get_mut("members")
            .and_then(Value::as_object_mut)
            .and_then(|members| members.remove("me"))
        {
            if let Some(members) = body.get_mut("members").and_then(Value::as_object_mut) {
                members.insert("0".into(), me);
            }
        }

        let mut sessions = self.sessions.lock();
        let stored = sessions.entry(uri.to_owned()).or_default();
        merge(&mut stored.document, body);
        stored.change_number += 1;
        if let Some(document) = stored.document.as_object_mut() {
            document.insert("changeNumber".into(), json!(stored.change_number));
            document.insert("branch".into(), json!("loopback"));
        }
        (stored.document.clone(), stored.change_number)
    }
}

fn merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                merge(target.entry(key).or_insert(Value::Null), value);
            }
        }
        (target, patch) => *target = patch,
    }
}

fn resource_of(uri: &str) -> Option<String> {
    let path = uri.strip_prefix(SESSIONS_ENDPOINT)?;
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    match parts.as_slice() {
        ["serviceconfigs", scid, "sessionTemplates", template, "sessions", name] => {
            Some(format!("{scid}~{template}~{name}"))
        }
        _ => None,
    }
}

struct LoopbackConnector(Arc<LoopbackService>);

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, RtaError> {
        let (to_client, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_client) = mpsc::unbounded_channel();
        self.0.serve_socket(to_client, from_client);
        Ok(Box::new(LoopbackTransport { incoming, outgoing }))
    }
}

struct LoopbackHttp(Arc<LoopbackService>);

#[async_trait]
impl HttpClient for LoopbackHttp {
    async fn send(&self, request: HttpRequest) -> rta_client::Result<HttpResponse> {
        let service = &self.0;
        let not_found = HttpResponse {
            status: 404,
            headers: Vec::new(),
            body: Vec::new(),
        };
        let Some(resource) = resource_of(&request.uri) else {
            return Ok(not_found);
        };

        let (document, change_number) = match request.method.as_str() {
            "GET" => {
                let sessions = service.sessions.lock();
                let Some(stored) = sessions.get(&request.uri) else {
                    return Ok(not_found);
                };
                (stored.document.clone(), stored.change_number)
            }
            "PUT" => {
                let body: Value = serde_json::from_slice(&request.body)?;
                let (document, change_number) = service.apply_write(&request.uri, body);
                service.tap(&resource, change_number);
                (document, change_number)
            }
            _ => return Ok(HttpResponse { status: 405, ..not_found }),
        };
        Ok(HttpResponse {
            status: 200,
            headers: vec![("ETag".into(), format!("\"{change_number}\""))],
            body: serde_json::to_vec(&document)?,
        })
    }
}

struct LoopbackCredentials;

#[async_trait]
impl CredentialProvider for LoopbackCredentials {
    async fn token_and_signature(
        &self,
        _method: &str,
        _uri: &str,
        _headers: &[(String, String)],
        _body: &[u8],
    ) -> rta_client::Result<TokenAndSignature> {
        Ok(TokenAndSignature {
            token: format!("XBL3.0 x={XUID};loopback"),
            signature: String::new(),
            user_id: XUID.into(),
            gamertag: Some("Loopback".into()),
        })
    }
}

// ── Demo ────────────────────────────────────────────────────────────

async fn next_tap(
    events: &mut tokio::sync::broadcast::Receiver<MultiplayerEvent>,
) -> Result<rta_client::ShoulderTap, Box<dyn std::error::Error>> {
    loop {
        match events.recv().await? {
            MultiplayerEvent::SessionChanged(tap) => return Ok(tap),
            other => tracing::info!("Multiplayer event: {other:?}"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Wiring ──────────────────────────────────────────────────────
    let loopback = Arc::new(LoopbackService::default());
    let connection = Arc::new(RtaConnection::new(
        UserContext::new(XUID).with_gamertag("Loopback"),
        Arc::new(LoopbackConnector(Arc::clone(&loopback))),
        Arc::new(ActivationLimiter::default()),
        RtaConfig::new("loopback://rta"),
    ));
    let service = MultiplayerService::new(
        MultiplayerServiceConfig::new(SESSIONS_ENDPOINT),
        Arc::new(LoopbackHttp(Arc::clone(&loopback))),
        Arc::new(LoopbackCredentials),
        Arc::clone(&connection),
    );
    let mut events = service.events();

    connection.activate()?;
    service.enable_subscriptions()?;
    while service.connection_id().is_none() {
        match events.recv().await? {
            MultiplayerEvent::ConnectionIdChanged(id) => tracing::info!("Connection id: {id}"),
            other => tracing::info!("Multiplayer event: {other:?}"),
        }
    }

    // ── Create and join ─────────────────────────────────────────────
    let reference = MultiplayerSessionReference::with_generated_name("loopback-scid", "lobby");
    let mut session = MultiplayerSession::new(XUID, reference.clone()).with_max_members(4);
    session.join(Some(json!({ "skill": 12 })), false)?;
    session.set_host_device_token("device-a");
    session.set_session_change_subscription(
        SessionChangeTypes::HOST_DEVICE_TOKEN_CHANGE | SessionChangeTypes::MEMBER_LIST_CHANGE,
    )?;
    let Some(mut last_known) = service.write_session(&session, WriteMode::CreateNew).await? else {
        return Err("session vanished after create".into());
    };
    tracing::info!(
        "Created {} at change {}",
        last_known.reference(),
        last_known.change_number()
    );
    // The create itself taps us; it is already reflected in `last_known`.
    let tap = next_tap(&mut events).await?;
    let skipped = service.reconcile(&tap, Some(&last_known)).await?;
    tracing::info!("Tap for change {} → {}", tap.change_number, skipped.changes);

    // ── Change the host ─────────────────────────────────────────────
    let mut update = last_known.clone();
    update.set_host_device_token("device-b");
    update.set_session_custom_property_json("map", json!("harbor"))?;
    service
        .write_session(&update, WriteMode::SynchronizedUpdate)
        .await?;

    let tap = next_tap(&mut events).await?;
    let reconciliation = service.reconcile(&tap, Some(&last_known)).await?;
    tracing::info!(
        "Tap for change {} → {}",
        tap.change_number,
        reconciliation.changes
    );
    if let Some(current) = reconciliation.session {
        tracing::info!(
            "Host is now {}",
            current.host_device_token().unwrap_or("<none>")
        );
        last_known = current;
    }

    // ── Shutdown ────────────────────────────────────────────────────
    service.disable_subscriptions()?;
    connection.deactivate();
    tracing::info!("Finished at change {}", last_known.change_number());
    Ok(())
}
