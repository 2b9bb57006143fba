//! Bridge control loop

use std::future::Future;

use tracing::{debug, error, info, warn};

use super::{
    BridgeError, BridgeSettings, EventTranslator, LifecycleAnnouncer, SubscriptionManager,
};
use crate::annotation::AnnotationSink;
use crate::connection::{Connection, ConnectionEvent, ConnectionState, EventStream, Message};

/// Drives one bridge run from connect to ordered shutdown.
///
/// Events are handled inline, one at a time, so a slow annotation service
/// pushes back on the broker connection through its bounded event channel.
/// The shutdown future is polled ahead of every event.
pub struct BridgeSupervisor<C, S> {
    connection: C,
    sink: S,
    settings: BridgeSettings,
    subscriptions: SubscriptionManager,
    translator: EventTranslator,
    lifecycle: LifecycleAnnouncer,
    state: ConnectionState,
    /// Generation of the session currently considered live
    session: Option<u64>,
}

impl<C, S> BridgeSupervisor<C, S>
where
    C: Connection,
    S: AnnotationSink,
{
    pub fn new(connection: C, sink: S, settings: BridgeSettings) -> Self {
        let subscriptions = SubscriptionManager::new(
            settings.topics.clone(),
            settings.qos,
            settings.subscribe_timeout,
        );
        let translator = EventTranslator::new(settings.tags.clone());
        let lifecycle =
            LifecycleAnnouncer::new(settings.client_identity.clone(), settings.tags.clone());

        Self {
            connection,
            sink,
            settings,
            subscriptions,
            translator,
            lifecycle,
            state: ConnectionState::Disconnected,
            session: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Run until `shutdown` resolves or a fatal error occurs.
    ///
    /// Returns `Ok(())` only after the shutdown marker was attempted and
    /// the connection was closed.
    pub async fn run<F>(mut self, shutdown: F) -> Result<(), BridgeError>
    where
        F: Future<Output = ()>,
    {
        self.state = ConnectionState::Connecting;
        let mut events = match self.connection.connect().await {
            Ok(events) => events,
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                return Err(BridgeError::Connect(e));
            }
        };

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Termination requested");
                    break;
                }

                event = events.recv() => {
                    let Some(event) = event else {
                        error!("Broker connection stopped delivering events");
                        self.state = ConnectionState::Disconnected;
                        return Err(BridgeError::ConnectionClosed);
                    };
                    if let Err(e) = self.handle_event(event).await {
                        error!("{}", e);
                        self.close(events).await;
                        return Err(e);
                    }
                }
            }
        }

        self.lifecycle.announce_shutdown(&self.sink).await;
        self.close(events).await;
        Ok(())
    }

    async fn handle_event(&mut self, event: ConnectionEvent) -> Result<(), BridgeError> {
        match event {
            ConnectionEvent::Connected {
                session,
                session_present,
            } => {
                info!(
                    "Connected to MQTT (session {}, session_present={})",
                    session, session_present
                );
                self.state = ConnectionState::Connected;
                self.session = Some(session);
                self.on_connected().await
            }
            ConnectionEvent::Reconnecting => {
                info!("Reconnecting to MQTT");
                self.state = ConnectionState::Reconnecting;
                self.session = None;
                Ok(())
            }
            ConnectionEvent::Message { session, message } => {
                if self.state != ConnectionState::Connected || self.session != Some(session) {
                    debug!(
                        "Dropping message on '{}' from stale session {}",
                        message.topic, session
                    );
                    return Ok(());
                }
                self.forward(&message).await;
                Ok(())
            }
        }
    }

    async fn on_connected(&mut self) -> Result<(), BridgeError> {
        match self.subscriptions.subscribe_all(&self.connection).await {
            Ok(()) => {
                self.lifecycle.announce_startup(&self.sink).await;
                Ok(())
            }
            Err(e) if e.is_transient() => {
                warn!("Subscription interrupted, will retry after reconnect: {}", e);
                Ok(())
            }
            Err(e) => Err(BridgeError::Subscribe(e)),
        }
    }

    async fn forward(&self, message: &Message) {
        let request = self.translator.translate(message);
        info!(
            "Publishing annotation: {} ({})",
            request.text,
            request.tags.join(",")
        );
        if let Err(e) = self.sink.create(&request).await {
            error!(
                "Could not publish annotation {}: {}",
                String::from_utf8_lossy(&message.payload),
                e
            );
        }
    }

    /// Stop consuming events, then close the connection within the grace period
    async fn close(&mut self, events: EventStream) {
        drop(events);
        self.connection
            .disconnect(self.settings.disconnect_grace)
            .await;
        self.state = ConnectionState::Disconnected;
        self.session = None;
    }
}
