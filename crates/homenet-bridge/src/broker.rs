//! Broker seam and topic layout.
//!
//! The real message-broker client is an external collaborator; the bus
//! runtime talks to it through [`Broker`]. Topic layout under the prefix
//! (default `homenet`, `MQTT_TOPIC_PREFIX` override):
//!
//! | Topic | Direction | Payload |
//! |---|---|---|
//! | `<prefix>/<id>/state` | out, retained | JSON state record |
//! | `<prefix>/<id>/availability` | out, retained | `online` / `offline` |
//! | `<prefix>/<id>/event` | out | transient events (buttons) |
//! | `<prefix>/<id>/set` | in | whole-entity command |
//! | `<prefix>/<id>/set_<property>` | in | per-property command |
//! | `<prefix>/bridge/...` | out | raw-packet and automation events |

use std::future::Future;

use thiserror::Error;
use tokio::sync::mpsc;

/// Broker failures; transients are retried by the implementation.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The broker link is gone and the message was dropped.
    #[error("broker disconnected")]
    Disconnected,
}

/// An inbound command message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Full topic.
    pub topic: String,
    /// Raw payload (JSON or plain string).
    pub payload: String,
}

/// An outbound publish, as handed to the broker client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Full topic.
    pub topic: String,
    /// Payload.
    pub payload: String,
    /// Retain flag.
    pub retain: bool,
}

/// The broker capability the bus runtime consumes.
pub trait Broker: Send {
    /// Publish a message.
    fn publish(
        &mut self,
        topic: &str,
        payload: &str,
        retain: bool,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Next inbound command message; `None` when the broker is closed.
    fn recv(&mut self) -> impl Future<Output = Option<InboundMessage>> + Send;
}

/// Topic builder/parser for one bus prefix.
#[derive(Debug, Clone)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    /// Topics under `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    /// `<prefix>/<id>/state`
    pub fn state(&self, entity_id: &str) -> String {
        format!("{}/{entity_id}/state", self.prefix)
    }

    /// `<prefix>/<id>/availability`
    pub fn availability(&self, entity_id: &str) -> String {
        format!("{}/{entity_id}/availability", self.prefix)
    }

    /// `<prefix>/<id>/event`
    pub fn event(&self, entity_id: &str) -> String {
        format!("{}/{entity_id}/event", self.prefix)
    }

    /// `<prefix>/bridge/<kind>`
    pub fn bridge(&self, kind: &str) -> String {
        format!("{}/bridge/{kind}", self.prefix)
    }

    /// Parse an inbound `set` topic into `(entity_id, property)`.
    ///
    /// `<prefix>/<id>/set` → `(id, None)`;
    /// `<prefix>/<id>/set_<prop>` → `(id, Some(prop))`.
    pub fn parse_set<'a>(&self, topic: &'a str) -> Option<(&'a str, Option<&'a str>)> {
        let rest = topic.strip_prefix(&self.prefix)?.strip_prefix('/')?;
        let (entity_id, leaf) = rest.split_once('/')?;
        if entity_id.is_empty() || leaf.contains('/') {
            return None;
        }
        if leaf == "set" {
            Some((entity_id, None))
        } else {
            let property = leaf.strip_prefix("set_")?;
            if property.is_empty() {
                return None;
            }
            Some((entity_id, Some(property)))
        }
    }
}

/// In-process broker backed by channels.
///
/// Publishes drain to one channel, inbound commands arrive on another; tests
/// and simulations hold the far ends.
pub struct ChannelBroker {
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    inbound: mpsc::UnboundedReceiver<InboundMessage>,
}

impl ChannelBroker {
    /// Build a broker plus the far ends: the published-message stream and the
    /// inbound-command sender.
    pub fn new() -> (
        Self,
        mpsc::UnboundedReceiver<OutboundMessage>,
        mpsc::UnboundedSender<InboundMessage>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (Self { outbound: out_tx, inbound: in_rx }, out_rx, in_tx)
    }
}

impl Broker for ChannelBroker {
    async fn publish(
        &mut self,
        topic: &str,
        payload: &str,
        retain: bool,
    ) -> Result<(), BrokerError> {
        self.outbound
            .send(OutboundMessage {
                topic: topic.to_owned(),
                payload: payload.to_owned(),
                retain,
            })
            .map_err(|_| BrokerError::Disconnected)
    }

    async fn recv(&mut self) -> Option<InboundMessage> {
        self.inbound.recv().await
    }
}

/// Broker stand-in for standalone runs: publishes go to the log, no inbound.
#[derive(Debug, Default)]
pub struct LogBroker;

impl Broker for LogBroker {
    async fn publish(
        &mut self,
        topic: &str,
        payload: &str,
        retain: bool,
    ) -> Result<(), BrokerError> {
        tracing::info!(topic, payload, retain, "publish");
        Ok(())
    }

    async fn recv(&mut self) -> Option<InboundMessage> {
        std::future::pending().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_layout() {
        let topics = Topics::new("homenet");
        assert_eq!(topics.state("fan"), "homenet/fan/state");
        assert_eq!(topics.availability("fan"), "homenet/fan/availability");
        assert_eq!(topics.bridge("packet"), "homenet/bridge/packet");
    }

    #[test]
    fn parse_set_topics() {
        let topics = Topics::new("homenet");
        assert_eq!(topics.parse_set("homenet/fan/set"), Some(("fan", None)));
        assert_eq!(
            topics.parse_set("homenet/clim/set_temperature"),
            Some(("clim", Some("temperature")))
        );
        assert_eq!(topics.parse_set("homenet/fan/state"), None);
        assert_eq!(topics.parse_set("other/fan/set"), None);
        assert_eq!(topics.parse_set("homenet/fan/set_"), None);
    }

    #[tokio::test]
    async fn channel_broker_round_trip() {
        let (mut broker, mut published, inbound) = ChannelBroker::new();
        broker.publish("t", "p", true).await.unwrap();
        assert_eq!(
            published.recv().await.unwrap(),
            OutboundMessage { topic: "t".into(), payload: "p".into(), retain: true }
        );

        inbound
            .send(InboundMessage { topic: "homenet/fan/set".into(), payload: "ON".into() })
            .unwrap();
        assert_eq!(broker.recv().await.unwrap().payload, "ON");
    }
}
