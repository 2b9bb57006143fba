//! Broker Connection
//!
//! The seam between the bridge and the message broker. A connection hands out
//! a stream of [`ConnectionEvent`]s once established and accepts subscribe and
//! disconnect requests while it runs.

mod client;

pub use client::{MqttClient, MqttClientOptions};

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::protocol::{DecodeError, EncodeError, QoS, ReasonCode};

/// Error type for broker connection operations
#[derive(Debug)]
pub enum ConnectionError {
    /// Transport failed or was closed
    ConnectionLost(String),
    /// Broker refused the CONNECT
    Refused(ReasonCode),
    /// Broker rejected one of the requested topic filters
    SubscriptionRejected { topic: String, reason: ReasonCode },
    /// Operation timed out
    Timeout,
    /// No live session to carry the request
    NotConnected,
    /// Broker sent something we could not make sense of
    Protocol(String),
    /// Invalid configuration
    InvalidConfig(String),
}

impl ConnectionError {
    /// Whether the failure is a dropped transport that a reconnect will heal
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectionError::ConnectionLost(_) | ConnectionError::NotConnected
        )
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            ConnectionError::Refused(code) => write!(f, "Connection refused: {}", code),
            ConnectionError::SubscriptionRejected { topic, reason } => {
                write!(f, "Subscription to '{}' rejected: {}", topic, reason)
            }
            ConnectionError::Timeout => write!(f, "Operation timed out"),
            ConnectionError::NotConnected => write!(f, "Not connected"),
            ConnectionError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            ConnectionError::InvalidConfig(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::ConnectionLost(e.to_string())
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Protocol(e.to_string())
    }
}

impl From<EncodeError> for ConnectionError {
    fn from(e: EncodeError) -> Self {
        ConnectionError::Protocol(e.to_string())
    }
}

/// State of the broker connection as seen by its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Message delivered by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Events emitted by a running connection.
///
/// `session` is a generation counter that increases with every transport
/// session, so a consumer can tell messages of a dead session apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A transport session was established and acknowledged
    Connected { session: u64, session_present: bool },
    /// The transport was lost; the connection is retrying in the background
    Reconnecting,
    /// A message arrived on a subscribed topic
    Message { session: u64, message: Message },
}

/// Receiving end of a connection's events
pub type EventStream = mpsc::Receiver<ConnectionEvent>;

/// Trait for broker connections
///
/// Implemented by [`MqttClient`] and by scripted fakes in tests.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Establish the first session and start delivering events.
    ///
    /// Fails if the broker cannot be reached or refuses the session. After
    /// success, transport losses are retried internally and surface as
    /// [`ConnectionEvent::Reconnecting`] followed by a new `Connected`.
    async fn connect(&self) -> Result<EventStream, ConnectionError>;

    /// Subscribe to all `topics` in one request and wait for the broker's answer
    async fn subscribe(&self, topics: &[String], qos: QoS) -> Result<(), ConnectionError>;

    /// Close the session, waiting at most `grace` for the goodbye to be written
    async fn disconnect(&self, grace: Duration);

    /// Current transport state
    fn state(&self) -> ConnectionState;
}
