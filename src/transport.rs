//! Transport abstraction for the real-time activity protocol.
//!
//! The [`Transport`] trait defines one bidirectional text-frame channel between
//! the client and the service. The protocol uses JSON text frames, so every
//! transport implementation must handle framing internally.
//!
//! Unlike a single-shot client, an [`RtaConnection`](crate::RtaConnection) has
//! to open a *new* socket every time it reconnects. Connection setup is
//! therefore expressed as a separate [`Connector`] trait: the connection loop
//! asks its connector for a fresh transport on every attempt.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use rta_client::error::RtaError;
//! use rta_client::transport::{Connector, Transport};
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, message: String) -> Result<(), RtaError> {
//!         todo!()
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, RtaError>> {
//!         todo!()
//!     }
//!
//!     async fn close(&mut self) -> Result<(), RtaError> {
//!         todo!()
//!     }
//! }
//!
//! struct MyConnector;
//!
//! #[async_trait]
//! impl Connector for MyConnector {
//!     async fn connect(&self) -> Result<Box<dyn Transport>, RtaError> {
//!         Ok(Box::new(MyTransport { }))
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::RtaError;

/// A bidirectional text message transport.
///
/// Each call to [`send`](Transport::send) transmits one complete JSON frame.
/// Each call to [`recv`](Transport::recv) returns one complete JSON frame.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method **MUST** be cancel-safe because it is
/// used inside `tokio::select!`. If `recv` is cancelled before completion,
/// calling it again must not lose data.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send a JSON text frame to the service.
    ///
    /// # Errors
    ///
    /// Returns [`RtaError::TransportSend`] if the frame could not be sent.
    async fn send(&mut self, message: String) -> Result<(), RtaError>;

    /// Receive the next JSON text frame from the service.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: a complete frame was received
    /// - `Some(Err(e))`: a transport error occurred
    /// - `None`: the socket was closed
    async fn recv(&mut self) -> Option<Result<String, RtaError>>;

    /// Close the transport connection gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails. Implementations should
    /// still release resources.
    async fn close(&mut self) -> Result<(), RtaError>;
}

/// Opens fresh [`Transport`]s for one user.
///
/// Called once per connect attempt, including every reconnect. Implementations
/// should acquire up-to-date credentials on each call.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new, connected transport.
    ///
    /// # Errors
    ///
    /// Any error is treated as a failed attempt; the connection backs off and
    /// retries until its timeout window elapses.
    async fn connect(&self) -> Result<Box<dyn Transport>, RtaError>;
}
