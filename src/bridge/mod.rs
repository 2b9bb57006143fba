//! Event Bridge
//!
//! Subscribes to broker topics and turns every delivered message into an
//! annotation. The [`BridgeSupervisor`] owns the control loop; the other
//! pieces are small helpers it drives:
//!
//! - [`SubscriptionManager`]: (re-)subscribes the topic set after each connect
//! - [`EventTranslator`]: message to annotation request
//! - [`LifecycleAnnouncer`]: startup and shutdown markers

mod lifecycle;
mod subscription;
mod supervisor;
mod translator;


pub use lifecycle::LifecycleAnnouncer;
pub use subscription::SubscriptionManager;
pub use supervisor::BridgeSupervisor;
pub use translator::EventTranslator;

use std::fmt;
use std::time::Duration;

use crate::config::{Config, MqttConfig};
use crate::connection::ConnectionError;
use crate::protocol::QoS;

/// Error type for a bridge run. Only fatal conditions end up here.
#[derive(Debug)]
pub enum BridgeError {
    /// The initial connection could not be established
    Connect(ConnectionError),
    /// The broker rejected or did not confirm the subscriptions
    Subscribe(ConnectionError),
    /// The connection stopped delivering events without being asked to
    ConnectionClosed,
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Connect(e) => write!(f, "Could not connect to MQTT: {}", e),
            BridgeError::Subscribe(e) => write!(f, "Could not subscribe: {}", e),
            BridgeError::ConnectionClosed => write!(f, "MQTT connection closed unexpectedly"),
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BridgeError::Connect(e) | BridgeError::Subscribe(e) => Some(e),
            BridgeError::ConnectionClosed => None,
        }
    }
}

/// What the bridge needs to know, fixed for the lifetime of the process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSettings {
    /// Name used in lifecycle annotations
    pub client_identity: String,
    pub topics: Vec<String>,
    pub tags: Vec<String>,
    pub qos: QoS,
    pub subscribe_timeout: Duration,
    pub disconnect_grace: Duration,
}

impl BridgeSettings {
    /// Settings with default timeouts
    pub fn new(
        client_identity: impl Into<String>,
        topics: Vec<String>,
        tags: Vec<String>,
    ) -> Self {
        let defaults = MqttConfig::default();
        Self {
            client_identity: client_identity.into(),
            topics,
            tags,
            qos: defaults.qos(),
            subscribe_timeout: defaults.subscribe_timeout,
            disconnect_grace: defaults.disconnect_grace,
        }
    }

    pub fn from_config(config: &Config, client_identity: impl Into<String>) -> Self {
        Self {
            client_identity: client_identity.into(),
            topics: config.mqtt.unique_topics(),
            tags: config.grafana.tags.clone(),
            qos: config.mqtt.qos(),
            subscribe_timeout: config.mqtt.subscribe_timeout,
            disconnect_grace: config.mqtt.disconnect_grace,
        }
    }
}
