//! Topic subscription lifecycle

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::timeout;
use tracing::info;

use crate::connection::{Connection, ConnectionError};
use crate::protocol::QoS;

/// Owns the topic set and (re-)subscribes it in a single request
#[derive(Debug, Clone)]
pub struct SubscriptionManager {
    topics: Vec<String>,
    qos: QoS,
    timeout: Duration,
}

impl SubscriptionManager {
    /// Duplicate topics are collapsed, keeping first-seen order
    pub fn new(topics: Vec<String>, qos: QoS, timeout: Duration) -> Self {
        let mut seen = HashSet::new();
        let topics = topics
            .into_iter()
            .filter(|t| seen.insert(t.clone()))
            .collect();
        Self {
            topics,
            qos,
            timeout,
        }
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Subscribe every topic and wait for the broker's confirmation.
    ///
    /// No answer within the timeout is reported as [`ConnectionError::Timeout`].
    pub async fn subscribe_all<C>(&self, connection: &C) -> Result<(), ConnectionError>
    where
        C: Connection + ?Sized,
    {
        info!("Subscribing to {}", self.topics.join(","));
        timeout(self.timeout, connection.subscribe(&self.topics, self.qos))
            .await
            .map_err(|_| ConnectionError::Timeout)?
    }
}
