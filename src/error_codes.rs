//! Status codes carried by subscribe and unsubscribe acknowledgements.
//!
//! The service answers every subscribe request with a numeric status code.
//! `0` means success; the remaining codes are classified into a
//! [`SubscriptionError`] that is delivered to the subscription's error callback
//! and to the connection-wide [`RtaEvent::SubscriptionError`](crate::connection::RtaEvent)
//! notification.

use std::fmt;

/// Subscribe succeeded.
pub const STATUS_SUCCESS: u32 = 0;
/// Too many subscriptions are active on this connection.
pub const STATUS_TOO_MANY_SUBSCRIPTIONS: u32 = 1;
/// The caller may not watch the requested resource.
pub const STATUS_ACCESS_DENIED: u32 = 2;
/// The service throttled the request; retry later.
pub const STATUS_THROTTLED: u32 = 1001;
/// The service is temporarily unavailable; retry later.
pub const STATUS_SERVICE_UNAVAILABLE: u32 = 1002;

/// Classified reason for a rejected subscribe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionError {
    /// Status code `1`.
    TooManySubscriptions,
    /// Status code `2`.
    AccessDenied,
    /// Any other non-zero status code.
    Generic(u32),
}

impl SubscriptionError {
    /// Classify a non-zero status code.
    ///
    /// Returns `None` for [`STATUS_SUCCESS`].
    pub fn from_status(status: u32) -> Option<Self> {
        match status {
            STATUS_SUCCESS => None,
            STATUS_TOO_MANY_SUBSCRIPTIONS => Some(Self::TooManySubscriptions),
            STATUS_ACCESS_DENIED => Some(Self::AccessDenied),
            other => Some(Self::Generic(other)),
        }
    }

    /// The wire status code this error was classified from.
    pub fn status_code(&self) -> u32 {
        match self {
            Self::TooManySubscriptions => STATUS_TOO_MANY_SUBSCRIPTIONS,
            Self::AccessDenied => STATUS_ACCESS_DENIED,
            Self::Generic(code) => *code,
        }
    }

    /// Returns a human-readable description of this error.
    pub fn description(&self) -> &'static str {
        match self {
            Self::TooManySubscriptions => {
                "The connection has reached the service's subscription limit. Remove unused subscriptions before adding more."
            }
            Self::AccessDenied => {
                "The signed-in user is not allowed to watch this resource."
            }
            Self::Generic(_) => "The service rejected the subscription.",
        }
    }
}

impl fmt::Display for SubscriptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManySubscriptions => f.write_str("too many subscriptions"),
            Self::AccessDenied => f.write_str("access denied"),
            Self::Generic(code) => write!(f, "generic error (status {code})"),
        }
    }
}

/// Whether a non-zero subscribe status is transient and should be retried
/// rather than closing the subscription.
pub fn is_transient(status: u32) -> bool {
    matches!(status, STATUS_THROTTLED | STATUS_SERVICE_UNAVAILABLE)
}
