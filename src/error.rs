//! Error types for the real-time activity client.

use thiserror::Error;

use crate::error_codes::SubscriptionError;

/// Errors that can occur when using the real-time activity client.
///
/// Only programmer errors ([`InvalidArgument`](RtaError::InvalidArgument),
/// [`LimitExceeded`](RtaError::LimitExceeded), [`Runtime`](RtaError::Runtime))
/// are returned synchronously from handle methods. Subscription rejections and
/// connection loss are reported asynchronously through
/// [`RtaEvent`](crate::connection::RtaEvent)s and subscription callbacks.
#[derive(Debug, Error)]
pub enum RtaError {
    /// A required argument was null, empty or otherwise unusable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The per-user activation cap has been reached. No side effect occurred.
    #[error("activation limit of {max} reached for user {user_id}")]
    LimitExceeded {
        /// User whose cap was hit.
        user_id: String,
        /// Configured cap.
        max: usize,
    },

    /// The service rejected a subscribe request.
    #[error("subscription rejected: {0}")]
    SubscriptionRejected(SubscriptionError),

    /// The connection was lost and could not be re-established in time.
    #[error("connection lost")]
    ConnectionLost,

    /// An operation was attempted in a state that does not allow it.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Failed to send a frame through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a frame from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize or deserialize JSON.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An HTTP call returned a non-success status.
    #[error("http status {status}: {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body as text (possibly empty).
        body: String,
    },

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RtaError {
    /// Shorthand for [`RtaError::InvalidArgument`].
    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

/// A specialized [`Result`] type for real-time activity client operations.
pub type Result<T> = std::result::Result<T, RtaError>;
