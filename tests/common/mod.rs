#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for RTA client integration tests.
//!
//! [`MockConnector`] hands the test a [`ServerEnd`] for every connection the
//! client opens, so tests can play the service: read the client's frames,
//! push acknowledgements and events, and drop the socket.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rta_client::protocol::{ClientFrame, SequenceNumber, SubscriptionId};
use rta_client::{
    ActivationLimiter, Connector, CredentialProvider, HttpClient, HttpRequest, HttpResponse,
    RtaConfig, RtaConnection, RtaError, ServerFrame, SubscriptionError, SubscriptionHandler,
    SubscriptionState, TokenAndSignature, Transport, UserContext,
};
use serde_json::Value;
use tokio::sync::mpsc;

// ── MockTransport ───────────────────────────────────────────────────

/// Client half of a mock socket.
pub struct MockTransport {
    incoming: mpsc::UnboundedReceiver<String>,
    outgoing: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, message: String) -> Result<(), RtaError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RtaError::TransportClosed);
        }
        self.outgoing
            .send(message)
            .map_err(|e| RtaError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, RtaError>> {
        // `None` once the server end is dropped.
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), RtaError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Service half of a mock socket. Dropping it closes the socket.
pub struct ServerEnd {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
}

impl ServerEnd {
    /// Next frame sent by the client. Panics after five seconds of silence.
    pub async fn next_frame(&mut self) -> ClientFrame {
        let text = tokio::time::timeout(Duration::from_secs(5), self.from_client.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client transport dropped");
        ClientFrame::parse(&text).expect("client sent a malformed frame")
    }

    /// Next frame, which must be a subscribe. Returns its sequence number and
    /// resource URI.
    pub async fn expect_subscribe(&mut self) -> (SequenceNumber, String) {
        match self.next_frame().await {
            ClientFrame::Subscribe { seq, resource_uri } => (seq, resource_uri),
            other => panic!("expected subscribe, got {other:?}"),
        }
    }

    /// Next frame, which must be an unsubscribe.
    pub async fn expect_unsubscribe(&mut self) -> (SequenceNumber, SubscriptionId) {
        match self.next_frame().await {
            ClientFrame::Unsubscribe {
                seq,
                subscription_id,
            } => (seq, subscription_id),
            other => panic!("expected unsubscribe, got {other:?}"),
        }
    }

    /// A frame that has already been sent, if any.
    pub fn try_next_frame(&mut self) -> Option<ClientFrame> {
        self.from_client
            .try_recv()
            .ok()
            .map(|text| ClientFrame::parse(&text).expect("client sent a malformed frame"))
    }

    pub fn push(&self, frame: &ServerFrame) {
        self.push_raw(frame.to_json());
    }

    pub fn push_raw(&self, text: impl Into<String>) {
        let _ = self.to_client.send(text.into());
    }

    pub fn ack_subscribe(&self, seq: SequenceNumber, id: SubscriptionId, payload: Value) {
        self.push(&ServerFrame::SubscribeAck {
            seq,
            status: 0,
            subscription_id: Some(id),
            payload,
        });
    }

    pub fn reject_subscribe(&self, seq: SequenceNumber, status: u32) {
        self.push(&ServerFrame::SubscribeAck {
            seq,
            status,
            subscription_id: None,
            payload: Value::Null,
        });
    }

    pub fn ack_unsubscribe(&self, seq: SequenceNumber) {
        self.push(&ServerFrame::UnsubscribeAck { seq, status: 0 });
    }

    pub fn event(&self, id: SubscriptionId, payload: Value) {
        self.push(&ServerFrame::Event {
            subscription_id: id,
            payload,
        });
    }

    /// Whether the client closed its half.
    pub fn client_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// ── MockConnector ───────────────────────────────────────────────────

/// Connector that accepts (or refuses) connections on demand.
pub struct MockConnector {
    accepted: mpsc::UnboundedSender<ServerEnd>,
    refusing: AtomicBool,
    attempts: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            accepted,
            refusing: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
        });
        (connector, rx)
    }

    /// Make every following connect attempt fail.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, RtaError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refusing.load(Ordering::SeqCst) {
            return Err(RtaError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused",
            )));
        }
        let (to_client, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_client) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let server = ServerEnd {
            to_client,
            from_client,
            closed: Arc::clone(&closed),
        };
        self.accepted
            .send(server)
            .map_err(|_| RtaError::TransportClosed)?;
        Ok(Box::new(MockTransport {
            incoming,
            outgoing,
            closed,
        }))
    }
}

/// Wait for the client's next connection.
pub async fn accept(rx: &mut mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}

// ── Connection helpers ──────────────────────────────────────────────

/// Short, deterministic-enough timings for tests.
pub fn test_config() -> RtaConfig {
    RtaConfig::new("ws://mock")
        .with_backoff(Duration::from_millis(10), Duration::from_millis(40))
        .with_timeout_window(Duration::from_secs(2))
        .with_connect_timeout(Duration::from_millis(500))
}

pub fn new_connection(
    user_id: &str,
    connector: Arc<MockConnector>,
    limiter: Arc<ActivationLimiter>,
    config: RtaConfig,
) -> RtaConnection {
    RtaConnection::new(UserContext::new(user_id), connector, limiter, config)
}

// ── RecordingHandler ────────────────────────────────────────────────

/// Subscription handler that records every callback.
#[derive(Default)]
pub struct RecordingHandler {
    pub payloads: Mutex<Vec<Value>>,
    pub states: Mutex<Vec<SubscriptionState>>,
    pub errors: Mutex<Vec<SubscriptionError>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn states(&self) -> Vec<SubscriptionState> {
        self.states.lock().clone()
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.payloads.lock().clone()
    }
}

impl SubscriptionHandler for RecordingHandler {
    fn on_event_received(&self, payload: &Value) {
        self.payloads.lock().push(payload.clone());
    }

    fn on_state_changed(&self, state: SubscriptionState) {
        self.states.lock().push(state);
    }

    fn on_error(&self, error: &SubscriptionError) {
        self.errors.lock().push(*error);
    }
}

/// Yield until `condition` holds. Panics after five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ── HTTP and credential mocks ───────────────────────────────────────

pub struct StaticCredentials;

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn token_and_signature(
        &self,
        _method: &str,
        _uri: &str,
        _headers: &[(String, String)],
        _body: &[u8],
    ) -> rta_client::Result<TokenAndSignature> {
        Ok(TokenAndSignature {
            token: "XBL3.0 x=100;token".into(),
            signature: "signature".into(),
            user_id: "100".into(),
            gamertag: Some("Player".into()),
        })
    }
}

/// HTTP client replaying scripted responses and recording requests.
#[derive(Default)]
pub struct MockHttp {
    responses: Mutex<VecDeque<HttpResponse>>,
    pub requests: Mutex<Vec<HttpRequest>>,
}

impl MockHttp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, status: u16, etag: Option<&str>, body: Value) {
        let headers = etag
            .map(|e| vec![("ETag".to_string(), e.to_string())])
            .unwrap_or_default();
        let body = if body.is_null() {
            Vec::new()
        } else {
            serde_json::to_vec(&body).unwrap()
        };
        self.responses
            .lock()
            .push_back(HttpResponse { status, headers, body });
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl HttpClient for MockHttp {
    async fn send(&self, request: HttpRequest) -> rta_client::Result<HttpResponse> {
        self.requests.lock().push(request);
        self.responses
            .lock()
            .pop_front()
            .ok_or_else(|| RtaError::Runtime("no scripted response".into()))
    }
}
