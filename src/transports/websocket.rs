//! WebSocket transport using `tokio-tungstenite`.
//!
//! [`WebSocketConnector`] dials the real-time activity endpoint with the
//! user's credential headers and the service subprotocol, producing a
//! [`WebSocketTransport`] for each connect and reconnect. Both `ws://` and
//! `wss://` endpoints work; TLS is handled by
//! [`MaybeTlsStream`](tokio_tungstenite::MaybeTlsStream).
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example(credentials: std::sync::Arc<dyn rta_client::CredentialProvider>)
//! # -> Result<(), rta_client::RtaError> {
//! use rta_client::{Connector, WebSocketConnector, DEFAULT_RTA_ENDPOINT};
//!
//! let connector = WebSocketConnector::new(DEFAULT_RTA_ENDPOINT, credentials);
//! let mut transport = connector.connect().await?;
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::auth::CredentialProvider;
use crate::connection::RTA_SUBPROTOCOL;
use crate::error::RtaError;
use crate::transport::{Connector, Transport};

/// The underlying WebSocket stream.
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`Transport`] over one WebSocket.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) is cancel-safe and may be used in
/// `tokio::select!`.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
}

impl WebSocketTransport {
    /// Open a WebSocket with a fully prepared handshake request.
    ///
    /// # Errors
    ///
    /// [`RtaError::Io`] if the connection or handshake fails. An underlying
    /// I/O error keeps its [`ErrorKind`](std::io::ErrorKind).
    pub async fn connect_request(request: Request) -> Result<Self, RtaError> {
        let uri = request.uri().to_string();
        tracing::debug!(url = %uri, "opening WebSocket");

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(map_ws_error)?;

        tracing::info!(url = %uri, "WebSocket established");
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already established stream.
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }
}

fn map_ws_error(e: tokio_tungstenite::tungstenite::Error) -> RtaError {
    let kind = match &e {
        tokio_tungstenite::tungstenite::Error::Io(io) => io.kind(),
        _ => std::io::ErrorKind::Other,
    };
    RtaError::Io(std::io::Error::new(kind, e))
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: String) -> Result<(), RtaError> {
        if self.closed {
            return Err(RtaError::TransportClosed);
        }
        self.stream
            .send(Message::Text(message.into()))
            .await
            .map_err(|e| RtaError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, RtaError>> {
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Some(Err(RtaError::TransportReceive(e.to_string()))),
                None => return None,
            };

            match msg {
                Message::Text(text) => return Some(Ok(text.to_string())),
                Message::Close(frame) => {
                    tracing::debug!(?frame, "received WebSocket close frame");
                    return None;
                }
                // tungstenite queues the pong itself.
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Binary(_) => {
                    tracing::warn!("skipping unexpected binary WebSocket frame");
                }
                Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) -> Result<(), RtaError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| RtaError::TransportSend(e.to_string()))
    }
}

// ── Connector ───────────────────────────────────────────────────────

/// Opens authenticated WebSockets to the real-time activity endpoint.
///
/// Credentials are fetched on every connect, so a reconnect after a token
/// refresh carries the new token.
pub struct WebSocketConnector {
    endpoint: String,
    credentials: Arc<dyn CredentialProvider>,
    subprotocol: String,
}

impl WebSocketConnector {
    pub fn new(endpoint: impl Into<String>, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            endpoint: endpoint.into(),
            credentials,
            subprotocol: RTA_SUBPROTOCOL.to_owned(),
        }
    }

    /// Override the requested subprotocol.
    #[must_use]
    pub fn with_subprotocol(mut self, subprotocol: impl Into<String>) -> Self {
        self.subprotocol = subprotocol.into();
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn handshake_request(&self) -> Result<Request, RtaError> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(map_ws_error)?;

        let credentials = self
            .credentials
            .token_and_signature("GET", &self.endpoint, &[], &[])
            .await?;

        let mut headers = vec![("Sec-WebSocket-Protocol".to_owned(), self.subprotocol.clone())];
        headers.extend(credentials.headers());
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| RtaError::invalid_argument(format!("bad header name {name}: {e}")))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| RtaError::invalid_argument(format!("bad value for header {name}: {e}")))?;
            request.headers_mut().insert(name, value);
        }
        Ok(request)
    }
}

impl std::fmt::Debug for WebSocketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnector")
            .field("endpoint", &self.endpoint)
            .field("subprotocol", &self.subprotocol)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, RtaError> {
        let request = self.handshake_request().await?;
        let transport = WebSocketTransport::connect_request(request).await?;
        Ok(Box::new(transport))
    }
}

#[cfg(test)]
#[cfg(feature = "transport-websocket")]
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
    use crate::auth::TokenAndSignature;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite::handshake::server::{Request as ServerRequest, Response};

    struct StaticCredentials;

    #[async_trait]
    impl CredentialProvider for StaticCredentials {
        async fn token_and_signature(
            &self,
            _method: &str,
            _uri: &str,
            _headers: &[(String, String)],
            _body: &[u8],
        ) -> crate::error::Result<TokenAndSignature> {
            Ok(TokenAndSignature {
                token: "XBL3.0 x=1;tok".into(),
                signature: "sig".into(),
                user_id: "1".into(),
                gamertag: None,
            })
        }
    }

    type Captured = Vec<(String, String)>;

    /// Accept one connection, agree to the subprotocol, report the request
    /// headers and run `handler` on the socket.
    async fn start_mock_server<F, Fut>(handler: F) -> (String, oneshot::Receiver<Captured>)
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (headers_tx, headers_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_hdr_async(
                tcp,
                move |req: &ServerRequest, mut resp: Response| {
                    let captured = req
                        .headers()
                        .iter()
                        .map(|(k, v)| (k.as_str().to_owned(), v.to_str().unwrap_or("").to_owned()))
                        .collect();
                    let _ = headers_tx.send(captured);
                    resp.headers_mut().insert(
                        "Sec-WebSocket-Protocol",
                        HeaderValue::from_static(RTA_SUBPROTOCOL),
                    );
                    Ok(resp)
                },
            )
            .await
            .unwrap();
            handler(ws).await;
        });

        (format!("ws://{addr}"), headers_rx)
    }

    fn header<'a>(headers: &'a Captured, name: &str) -> Option<&'a str> {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn websocket_transport_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<WebSocketTransport>();
    }

    #[tokio::test]
    async fn connector_sends_credentials_and_subprotocol() {
        let (url, headers) = start_mock_server(|mut ws| async move {
            ws.close(None).await.unwrap();
        })
        .await;

        let connector = WebSocketConnector::new(url, Arc::new(StaticCredentials));
        let mut transport = connector.connect().await.unwrap();
        let headers = headers.await.unwrap();
        assert_eq!(header(&headers, "authorization"), Some("XBL3.0 x=1;tok"));
        assert_eq!(header(&headers, "signature"), Some("sig"));
        assert_eq!(header(&headers, "sec-websocket-protocol"), Some(RTA_SUBPROTOCOL));
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn connect_fails_with_unreachable_host() {
        let connector = WebSocketConnector::new("ws://127.0.0.1:1", Arc::new(StaticCredentials));
        let Err(err) = connector.connect().await else {
            panic!("connect to an unreachable host succeeded");
        };
        assert!(matches!(err, RtaError::Io(_)));
    }

    #[tokio::test]
    async fn invalid_endpoint_is_an_io_error() {
        let connector = WebSocketConnector::new("not a url", Arc::new(StaticCredentials));
        assert!(matches!(connector.connect().await, Err(RtaError::Io(_))));
    }

    #[tokio::test]
    async fn frames_round_trip_and_binary_is_skipped() {
        let (url, _headers) = start_mock_server(|mut ws| async move {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                ws.send(Message::Binary(vec![0xDE, 0xAD].into())).await.unwrap();
                ws.send(Message::Text(text)).await.unwrap();
            }
            ws.close(None).await.unwrap();
        })
        .await;

        let connector = WebSocketConnector::new(url, Arc::new(StaticCredentials));
        let mut transport = connector.connect().await.unwrap();
        transport.send("[1,1,\"uri\"]".to_string()).await.unwrap();
        assert_eq!(transport.recv().await.unwrap().unwrap(), "[1,1,\"uri\"]");
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_after_close_returns_transport_closed() {
        let (url, _headers) =
            start_mock_server(|mut ws| async move { while let Some(Ok(_)) = ws.next().await {} })
                .await;

        let connector = WebSocketConnector::new(url, Arc::new(StaticCredentials));
        let mut transport = connector.connect().await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        let err = transport.send("late".to_string()).await.unwrap_err();
        assert!(matches!(err, RtaError::TransportClosed));
    }
}
