//! Statistic-change subscriptions.
//!
//! The user statistics service publishes `{ "name", "type", "value" }` objects
//! for one statistic of one user in one service configuration. The initial
//! payload of the subscribe ack carries the current value.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::warn;

use crate::error::{Result, RtaError};
use crate::subscription::{Subscription, SubscriptionHandler};

/// One decoded statistic update. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub stat_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Resource URI of a user statistic.
pub fn statistic_resource_uri(xuid: &str, scid: &str, statistic_name: &str) -> String {
    format!("https://userstats.xboxlive.com/users/xuid({xuid})/scids/{scid}/stats/{statistic_name}")
}

struct StatisticHandler {
    latest: watch::Sender<Option<StatisticValue>>,
}

impl SubscriptionHandler for StatisticHandler {
    fn on_event_received(&self, payload: &Value) {
        match StatisticValue::deserialize(payload) {
            Ok(update) => {
                self.latest.send_replace(Some(update));
            }
            Err(e) => warn!("ignoring undecodable statistic payload: {e}"),
        }
    }
}

/// Watches one statistic.
///
/// ```
/// use rta_client::statistics::StatisticChangeSubscription;
///
/// let stat = StatisticChangeSubscription::new("2533274", "scid-1", "Wins").unwrap();
/// assert!(stat.latest().is_none());
/// assert!(stat.subscription().resource_uri().ends_with("/stats/Wins"));
/// ```
#[derive(Debug, Clone)]
pub struct StatisticChangeSubscription {
    xuid: String,
    scid: String,
    statistic_name: String,
    subscription: Arc<Subscription>,
    latest: watch::Receiver<Option<StatisticValue>>,
}

impl StatisticChangeSubscription {
    /// Create a subscription for `statistic_name` of user `xuid` in service
    /// configuration `scid`.
    ///
    /// # Errors
    ///
    /// [`RtaError::InvalidArgument`] if any identifier is empty.
    pub fn new(xuid: &str, scid: &str, statistic_name: &str) -> Result<Self> {
        if xuid.is_empty() || scid.is_empty() || statistic_name.is_empty() {
            return Err(RtaError::invalid_argument(
                "xuid, scid and statistic name are required",
            ));
        }
        let (tx, rx) = watch::channel(None);
        let subscription = Subscription::new(
            statistic_resource_uri(xuid, scid, statistic_name),
            Arc::new(StatisticHandler { latest: tx }),
        );
        Ok(Self {
            xuid: xuid.to_owned(),
            scid: scid.to_owned(),
            statistic_name: statistic_name.to_owned(),
            subscription,
            latest: rx,
        })
    }

    /// The subscription to hand to a connection.
    pub fn subscription(&self) -> &Arc<Subscription> {
        &self.subscription
    }

    pub fn xuid(&self) -> &str {
        &self.xuid
    }

    pub fn scid(&self) -> &str {
        &self.scid
    }

    pub fn statistic_name(&self) -> &str {
        &self.statistic_name
    }

    /// Most recent value, if any payload has arrived.
    pub fn latest(&self) -> Option<StatisticValue> {
        self.latest.borrow().clone()
    }

    /// A receiver that is notified on every update.
    pub fn watch(&self) -> watch::Receiver<Option<StatisticValue>> {
        self.latest.clone()
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
    use crate::subscription::SubscriptionState;
    use serde_json::json;

    #[test]
    fn resource_uri_shape() {
        assert_eq!(
            statistic_resource_uri("123", "abc", "Kills"),
            "https://userstats.xboxlive.com/users/xuid(123)/scids/abc/stats/Kills"
        );
    }

    #[test]
    fn empty_identifiers_are_rejected() {
        assert!(matches!(
            StatisticChangeSubscription::new("", "scid", "name"),
            Err(RtaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn payloads_update_latest() {
        let stat = StatisticChangeSubscription::new("1", "scid", "Stat").unwrap();
        let sub = stat.subscription();
        assert!(sub.transition(SubscriptionState::PendingSubscribe));

        sub.deliver(&json!({"name": "Stat", "type": "Integer", "value": "31"}));
        assert_eq!(stat.latest().unwrap().value.as_deref(), Some("31"));

        sub.deliver(&json!({"value": "32"}));
        let latest = stat.latest().unwrap();
        assert_eq!(latest.value.as_deref(), Some("32"));
        assert_eq!(latest.name, None);
    }

    #[test]
    fn undecodable_payload_keeps_previous_value() {
        let stat = StatisticChangeSubscription::new("1", "scid", "Stat").unwrap();
        let sub = stat.subscription();
        assert!(sub.transition(SubscriptionState::PendingSubscribe));
        sub.deliver(&json!({"value": "5"}));
        sub.deliver(&json!("not an object"));
        assert_eq!(stat.latest().unwrap().value.as_deref(), Some("5"));
    }
}
