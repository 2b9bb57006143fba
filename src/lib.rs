//! mqtt-annotator - turn MQTT messages into Grafana annotations
//!
//! Subscribes to a set of topics on an MQTT v3.1.1/v5.0 broker and records
//! every received message as an annotation, bracketed by startup and
//! shutdown markers for the running process.

pub mod annotation;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod connection;
pub mod logging;
pub mod protocol;
pub mod signal;
pub mod transport;

pub use annotation::{Annotation, AnnotationRequest, AnnotationSink, GrafanaClient};
pub use bridge::{BridgeError, BridgeSettings, BridgeSupervisor};
pub use config::Config;
pub use connection::{Connection, ConnectionEvent, ConnectionState, MqttClient, MqttClientOptions};
pub use protocol::{ProtocolVersion, QoS};
