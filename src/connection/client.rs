//! MQTT Client
//!
//! A subscribing MQTT client. One background task owns the socket: it answers
//! keep-alives, acknowledges QoS 1 deliveries, matches SUBACKs to pending
//! requests and reconnects with exponential backoff when the transport drops.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use super::{Connection, ConnectionError, ConnectionEvent, ConnectionState, EventStream, Message};
use crate::codec::{Decoder, Encoder};
use crate::config::{BrokerAddress, ConfigError, MqttConfig};
use crate::protocol::{
    Connect, Disconnect, Packet, Properties, ProtocolVersion, PubAck, Publish, QoS, Subscribe,
    Subscription,
};
use crate::transport::{self, MqttStream};

/// Capacity of the command channel into the connection task
const COMMAND_BUFFER: usize = 16;

/// Settings for an [`MqttClient`]
#[derive(Clone)]
pub struct MqttClientOptions {
    pub address: BrokerAddress,
    pub client_id: String,
    pub protocol_version: ProtocolVersion,
    /// Keep-alive in seconds, 0 disables pings
    pub keep_alive: u16,
    pub clean_start: bool,
    /// Session Expiry Interval for v5 sessions
    pub session_expiry: Duration,
    pub connect_timeout: Duration,
    pub reconnect_interval: Duration,
    pub max_reconnect_interval: Duration,
    pub event_buffer: usize,
    pub max_packet_size: usize,
    pub tls: Option<TlsConnector>,
}

impl MqttClientOptions {
    /// Options with library defaults: v3.1.1, persistent session, plain TCP
    pub fn new(address: BrokerAddress, client_id: impl Into<String>) -> Self {
        let defaults = MqttConfig::default();
        Self {
            address,
            client_id: client_id.into(),
            protocol_version: ProtocolVersion::V311,
            keep_alive: defaults.keep_alive,
            clean_start: false,
            session_expiry: defaults.session_expiry,
            connect_timeout: defaults.connect_timeout,
            reconnect_interval: defaults.reconnect_interval,
            max_reconnect_interval: defaults.max_reconnect_interval,
            event_buffer: defaults.event_buffer,
            max_packet_size: defaults.max_packet_size,
            tls: None,
        }
    }

    /// Build options from the `[mqtt]` section, loading TLS roots if needed
    pub fn from_config(config: &MqttConfig, client_id: String) -> Result<Self, ConfigError> {
        let address = config.broker_address()?;
        let tls = if address.protocol.uses_tls() {
            let connector = transport::client_connector(config.ca_cert.as_deref())
                .map_err(|e| ConfigError::Validation(format!("TLS setup failed: {}", e)))?;
            Some(connector)
        } else {
            None
        };

        Ok(Self {
            address,
            client_id,
            protocol_version: config.version()?,
            keep_alive: config.keep_alive,
            clean_start: false,
            session_expiry: config.session_expiry,
            connect_timeout: config.connect_timeout,
            reconnect_interval: config.reconnect_interval,
            max_reconnect_interval: config.max_reconnect_interval,
            event_buffer: config.event_buffer,
            max_packet_size: config.max_packet_size,
            tls,
        })
    }
}

/// Request sent to the connection task
enum ClientCommand {
    Subscribe {
        subscriptions: Vec<Subscription>,
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
}

/// SUBSCRIBE waiting for its SUBACK
struct PendingSubscribe {
    filters: Vec<String>,
    reply: oneshot::Sender<Result<(), ConnectionError>>,
}

/// A message the event channel had no room for, with the PUBACK it is owed
struct Parked {
    event: ConnectionEvent,
    ack: Option<u16>,
}

/// How a session ended without a transport error
enum SessionEnd {
    /// Disconnect was requested and DISCONNECT sent
    Closed,
    /// Nobody is listening for events any more
    Abandoned,
}

/// MQTT client implementing [`Connection`]
pub struct MqttClient {
    options: MqttClientOptions,
    state: Arc<RwLock<ConnectionState>>,
    command_tx: RwLock<Option<mpsc::Sender<ClientCommand>>>,
}

impl MqttClient {
    pub fn new(options: MqttClientOptions) -> Self {
        Self {
            options,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            command_tx: RwLock::new(None),
        }
    }

    /// Drive sessions until disconnect is requested or the event receiver is gone
    async fn connection_loop(
        options: MqttClientOptions,
        state: Arc<RwLock<ConnectionState>>,
        mut session: Session,
        mut commands: mpsc::Receiver<ClientCommand>,
        events: mpsc::Sender<ConnectionEvent>,
    ) {
        let mut generation: u64 = 1;

        loop {
            match session.run(generation, &mut commands, &events).await {
                Ok(SessionEnd::Closed) => {
                    info!("Disconnected from {}", options.address);
                    break;
                }
                Ok(SessionEnd::Abandoned) => {
                    debug!("Event receiver dropped, closed session to {}", options.address);
                    break;
                }
                Err(e) => {
                    info!("Connection to {} lost: {}", options.address, e);
                }
            }
            drop(session);

            *state.write() = ConnectionState::Reconnecting;
            if !announce(ConnectionEvent::Reconnecting, &mut commands, &events).await {
                break;
            }

            let Some(mut next) = Self::reconnect(&options, &mut commands, &events).await else {
                break;
            };

            generation += 1;
            let connected = ConnectionEvent::Connected {
                session: generation,
                session_present: next.session_present,
            };
            if !announce(connected, &mut commands, &events).await {
                next.close().await;
                break;
            }
            *state.write() = ConnectionState::Connected;
            session = next;
        }

        *state.write() = ConnectionState::Disconnected;
    }

    /// Retry with exponential backoff until a session is up.
    /// Returns `None` when the client is told to stop meanwhile.
    async fn reconnect(
        options: &MqttClientOptions,
        commands: &mut mpsc::Receiver<ClientCommand>,
        events: &mpsc::Sender<ConnectionEvent>,
    ) -> Option<Session> {
        let mut delay = options.reconnect_interval;

        loop {
            debug!("Reconnecting to {} in {:?}", options.address, delay);
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    _ = events.closed() => return None,
                    cmd = commands.recv() => {
                        if !refuse_while_offline(cmd) {
                            return None;
                        }
                    }
                }
            }

            let attempt = timeout(options.connect_timeout, Session::establish(options));
            tokio::pin!(attempt);
            let result = loop {
                tokio::select! {
                    result = &mut attempt => break result,
                    cmd = commands.recv() => {
                        if !refuse_while_offline(cmd) {
                            return None;
                        }
                    }
                }
            };

            match result {
                Ok(Ok(session)) => {
                    info!(
                        "Reconnected to {} (session_present={})",
                        options.address, session.session_present
                    );
                    return Some(session);
                }
                Ok(Err(e)) => warn!("Reconnect to {} failed: {}", options.address, e),
                Err(_) => warn!("Reconnect to {} timed out", options.address),
            }

            delay = std::cmp::min(delay * 2, options.max_reconnect_interval);
        }
    }
}

/// Answer a command while no session exists. Returns false when the
/// connection should stop.
fn refuse_while_offline(cmd: Option<ClientCommand>) -> bool {
    match cmd {
        Some(ClientCommand::Subscribe { reply, .. }) => {
            let _ = reply.send(Err(ConnectionError::NotConnected));
            true
        }
        Some(ClientCommand::Disconnect { done }) => {
            let _ = done.send(());
            false
        }
        None => false,
    }
}

/// Queue a lifecycle event between sessions, refusing commands while the
/// channel is full. Returns false when the connection should stop.
async fn announce(
    event: ConnectionEvent,
    commands: &mut mpsc::Receiver<ClientCommand>,
    events: &mpsc::Sender<ConnectionEvent>,
) -> bool {
    let permit = loop {
        tokio::select! {
            permit = events.reserve() => match permit {
                Ok(permit) => break permit,
                Err(_) => return false,
            },
            cmd = commands.recv() => {
                if !refuse_while_offline(cmd) {
                    return false;
                }
            }
        }
    };
    permit.send(event);
    true
}

#[async_trait]
impl Connection for MqttClient {
    async fn connect(&self) -> Result<EventStream, ConnectionError> {
        if self.command_tx.read().is_some() {
            return Err(ConnectionError::InvalidConfig(
                "client is already connected".to_string(),
            ));
        }

        *self.state.write() = ConnectionState::Connecting;
        debug!(
            "Connecting to {} as '{}' (MQTT {})",
            self.options.address, self.options.client_id, self.options.protocol_version
        );

        let established = timeout(
            self.options.connect_timeout,
            Session::establish(&self.options),
        )
        .await
        .map_err(|_| ConnectionError::Timeout)
        .and_then(|r| r);

        let session = match established {
            Ok(session) => session,
            Err(e) => {
                *self.state.write() = ConnectionState::Disconnected;
                return Err(e);
            }
        };

        info!(
            "Connected to {} (session_present={})",
            self.options.address, session.session_present
        );

        let (event_tx, event_rx) = mpsc::channel(self.options.event_buffer.max(1));
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);

        let connected = ConnectionEvent::Connected {
            session: 1,
            session_present: session.session_present,
        };
        event_tx
            .send(connected)
            .await
            .map_err(|_| ConnectionError::NotConnected)?;

        *self.state.write() = ConnectionState::Connected;
        *self.command_tx.write() = Some(command_tx);

        tokio::spawn(Self::connection_loop(
            self.options.clone(),
            self.state.clone(),
            session,
            command_rx,
            event_tx,
        ));

        Ok(event_rx)
    }

    async fn subscribe(&self, topics: &[String], qos: QoS) -> Result<(), ConnectionError> {
        if topics.is_empty() {
            return Err(ConnectionError::InvalidConfig(
                "no topics to subscribe".to_string(),
            ));
        }

        let tx = self
            .command_tx
            .read()
            .clone()
            .ok_or(ConnectionError::NotConnected)?;

        let subscriptions = topics
            .iter()
            .map(|filter| Subscription {
                filter: filter.clone(),
                qos,
            })
            .collect();

        let (reply, response) = oneshot::channel();
        tx.send(ClientCommand::Subscribe {
            subscriptions,
            reply,
        })
        .await
        .map_err(|_| ConnectionError::NotConnected)?;

        response.await.map_err(|_| {
            ConnectionError::ConnectionLost("session closed before SUBACK".to_string())
        })?
    }

    async fn disconnect(&self, grace: Duration) {
        let tx = self.command_tx.write().take();
        let Some(tx) = tx else {
            return;
        };

        let (done, finished) = oneshot::channel();
        let goodbye = async move {
            if tx.send(ClientCommand::Disconnect { done }).await.is_ok() {
                let _ = finished.await;
            }
        };

        if timeout(grace, goodbye).await.is_err() {
            warn!("Disconnect did not complete within {:?}", grace);
        }
        *self.state.write() = ConnectionState::Disconnected;
    }

    fn state(&self) -> ConnectionState {
        *self.state.read()
    }
}

/// Write half plus encoder
struct PacketWriter {
    inner: WriteHalf<MqttStream>,
    encoder: Encoder,
    buf: BytesMut,
}

impl PacketWriter {
    async fn send(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.buf.clear();
        self.encoder.encode(packet, &mut self.buf)?;
        self.inner.write_all(&self.buf).await?;
        self.inner.flush().await?;
        debug!("Sent {}", packet.name());
        Ok(())
    }
}

/// One transport session: a socket that has seen a successful CONNACK
struct Session {
    reader: ReadHalf<MqttStream>,
    writer: PacketWriter,
    decoder: Decoder,
    read_buf: BytesMut,
    session_present: bool,
    keep_alive: Duration,
    /// When the oldest unanswered PINGREQ went out
    ping_sent: Option<Instant>,
    next_packet_id: u16,
    pending: HashMap<u16, PendingSubscribe>,
    /// Messages waiting for room in the event channel, oldest first
    backlog: VecDeque<Parked>,
}

impl Session {
    /// Open the transport, send CONNECT and wait for a successful CONNACK
    async fn establish(options: &MqttClientOptions) -> Result<Session, ConnectionError> {
        let address = &options.address;
        let stream = transport::connect(&address.host, address.port, options.tls.as_ref()).await?;
        let (reader, writer) = tokio::io::split(stream);

        let version = options.protocol_version;
        let mut session = Session {
            reader,
            writer: PacketWriter {
                inner: writer,
                encoder: Encoder::new(version),
                buf: BytesMut::with_capacity(256),
            },
            decoder: Decoder::new(version).with_max_packet_size(options.max_packet_size),
            read_buf: BytesMut::with_capacity(4096),
            session_present: false,
            keep_alive: Duration::from_secs(options.keep_alive as u64),
            ping_sent: None,
            next_packet_id: 1,
            pending: HashMap::new(),
            backlog: VecDeque::new(),
        };

        let properties = if version == ProtocolVersion::V5 {
            Properties {
                session_expiry_interval: Some(
                    options.session_expiry.as_secs().min(u32::MAX as u64) as u32,
                ),
                maximum_packet_size: Some(options.max_packet_size.min(u32::MAX as usize) as u32),
                ..Default::default()
            }
        } else {
            Properties::default()
        };

        let connect = Packet::Connect(Box::new(Connect {
            protocol_version: version,
            client_id: options.client_id.clone(),
            clean_start: options.clean_start,
            keep_alive: options.keep_alive,
            username: address.username.clone(),
            password: address.password.clone().map(Bytes::from),
            properties,
        }));
        session.writer.send(&connect).await?;

        let connack = loop {
            if let Some((packet, used)) = session.decoder.decode(&session.read_buf)? {
                session.read_buf.advance(used);
                match packet {
                    Packet::ConnAck(connack) => break connack,
                    other => {
                        return Err(ConnectionError::Protocol(format!(
                            "expected CONNACK, got {}",
                            other.name()
                        )))
                    }
                }
            }
            let n = session.reader.read_buf(&mut session.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::ConnectionLost(
                    "connection closed before CONNACK".to_string(),
                ));
            }
        };

        if !connack.reason_code.is_success() {
            return Err(ConnectionError::Refused(connack.reason_code));
        }

        session.session_present = connack.session_present;
        if let Some(server_keep_alive) = connack.properties.server_keep_alive {
            debug!("Broker assigned keep-alive of {}s", server_keep_alive);
            session.keep_alive = Duration::from_secs(server_keep_alive as u64);
        }

        Ok(session)
    }

    fn next_packet_id(&mut self) -> u16 {
        loop {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1).max(1);
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Send DISCONNECT and close the write side, ignoring transport errors
    async fn close(&mut self) {
        let _ = self
            .writer
            .send(&Packet::Disconnect(Disconnect::default()))
            .await;
        let _ = self.writer.inner.shutdown().await;
    }

    /// Run the session until it ends. Transport and protocol failures come
    /// back as errors so the caller can reconnect.
    ///
    /// Reading from the socket pauses while parked messages wait for the
    /// consumer, except when a SUBACK is due. Commands, the backlog and the
    /// keep-alive timer are serviced either way.
    async fn run(
        &mut self,
        generation: u64,
        commands: &mut mpsc::Receiver<ClientCommand>,
        events: &mpsc::Sender<ConnectionEvent>,
    ) -> Result<SessionEnd, ConnectionError> {
        let pings_enabled = !self.keep_alive.is_zero();
        let period = if pings_enabled {
            self.keep_alive
        } else {
            Duration::from_secs(3600)
        };
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ping_sent = None;

        // Anything that arrived together with the CONNACK
        if let Some(end) = self.drain_read_buf(generation, events).await? {
            return Ok(end);
        }

        let mut reading = true;
        loop {
            let resume = self.backlog.is_empty() || !self.pending.is_empty();
            if resume && !reading {
                // Any PINGRESP sat unread in the socket meanwhile
                if let Some(sent) = self.ping_sent.as_mut() {
                    *sent = Instant::now();
                }
                debug!("Consumer caught up, resuming reads in session {}", generation);
            } else if !resume && reading {
                debug!("Event channel full, {} messages parked", self.backlog.len());
            }
            reading = resume;

            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(ClientCommand::Subscribe { subscriptions, reply }) => {
                        let packet_id = self.next_packet_id();
                        let filters = subscriptions.iter().map(|s| s.filter.clone()).collect();
                        let packet = Packet::Subscribe(Subscribe { packet_id, subscriptions });
                        if let Err(e) = self.writer.send(&packet).await {
                            let _ = reply.send(Err(ConnectionError::ConnectionLost(e.to_string())));
                            return Err(e);
                        }
                        self.pending.insert(packet_id, PendingSubscribe { filters, reply });
                    }
                    Some(ClientCommand::Disconnect { done }) => {
                        self.close().await;
                        let _ = done.send(());
                        return Ok(SessionEnd::Closed);
                    }
                    None => {
                        self.close().await;
                        return Ok(SessionEnd::Closed);
                    }
                },

                permit = events.reserve(), if !self.backlog.is_empty() => {
                    let Ok(permit) = permit else {
                        self.close().await;
                        return Ok(SessionEnd::Abandoned);
                    };
                    if let Some(parked) = self.backlog.pop_front() {
                        permit.send(parked.event);
                        self.acknowledge(parked.ack).await?;
                    }
                }

                result = self.reader.read_buf(&mut self.read_buf), if reading => {
                    let n = result?;
                    if n == 0 {
                        return Err(ConnectionError::ConnectionLost(
                            "connection closed by broker".to_string(),
                        ));
                    }
                    if let Some(end) = self.drain_read_buf(generation, events).await? {
                        return Ok(end);
                    }
                }

                _ = keepalive.tick(), if pings_enabled => {
                    match self.ping_sent {
                        // Only while reading could a PINGRESP have been seen
                        Some(sent) if reading && sent.elapsed() >= self.keep_alive => {
                            return Err(ConnectionError::ConnectionLost(
                                "keep-alive timeout".to_string(),
                            ));
                        }
                        Some(_) => {}
                        None => self.ping_sent = Some(Instant::now()),
                    }
                    // Still owed to the broker while paused
                    self.writer.send(&Packet::PingReq).await?;
                }
            }
        }
    }

    /// Decode and handle every complete packet in the read buffer
    async fn drain_read_buf(
        &mut self,
        generation: u64,
        events: &mpsc::Sender<ConnectionEvent>,
    ) -> Result<Option<SessionEnd>, ConnectionError> {
        while let Some((packet, used)) = self.decoder.decode(&self.read_buf)? {
            self.read_buf.advance(used);
            debug!("Received {}", packet.name());

            match packet {
                Packet::Publish(publish) => {
                    if !self.deliver(generation, publish, events).await? {
                        self.close().await;
                        return Ok(Some(SessionEnd::Abandoned));
                    }
                }
                Packet::SubAck(suback) => {
                    let Some(pending) = self.pending.remove(&suback.packet_id) else {
                        debug!("SUBACK for unknown packet id {}", suback.packet_id);
                        continue;
                    };
                    let outcome = if suback.reason_codes.len() != pending.filters.len() {
                        Err(ConnectionError::Protocol(format!(
                            "SUBACK carries {} reason codes for {} topics",
                            suback.reason_codes.len(),
                            pending.filters.len()
                        )))
                    } else if let Some((index, reason)) = suback.first_failure() {
                        Err(ConnectionError::SubscriptionRejected {
                            topic: pending.filters[index].clone(),
                            reason,
                        })
                    } else {
                        Ok(())
                    };
                    let _ = pending.reply.send(outcome);
                }
                Packet::PingResp => self.ping_sent = None,
                Packet::PubAck(_) => {}
                Packet::Disconnect(disconnect) => {
                    return Err(ConnectionError::ConnectionLost(format!(
                        "broker sent DISCONNECT ({})",
                        disconnect.reason_code
                    )));
                }
                other => {
                    return Err(ConnectionError::Protocol(format!(
                        "unexpected {} during session",
                        other.name()
                    )));
                }
            }
        }
        Ok(None)
    }

    /// Hand a message to the event channel, or park it when the channel is
    /// full. A QoS 1 message is acknowledged once it is in the channel.
    /// Returns false once the receiver is gone.
    async fn deliver(
        &mut self,
        generation: u64,
        publish: Publish,
        events: &mpsc::Sender<ConnectionEvent>,
    ) -> Result<bool, ConnectionError> {
        let ack = match publish.qos {
            QoS::AtMostOnce => None,
            QoS::AtLeastOnce => Some(publish.packet_id.ok_or_else(|| {
                ConnectionError::Protocol("QoS 1 PUBLISH without packet id".to_string())
            })?),
            // Subscriptions never ask for more than QoS 1
            QoS::ExactlyOnce => {
                return Err(ConnectionError::Protocol(format!(
                    "QoS 2 PUBLISH on '{}' above the granted QoS",
                    publish.topic
                )));
            }
        };

        let event = ConnectionEvent::Message {
            session: generation,
            message: Message {
                topic: publish.topic,
                payload: publish.payload,
            },
        };

        if !self.backlog.is_empty() {
            self.backlog.push_back(Parked { event, ack });
            return Ok(true);
        }

        match events.try_send(event) {
            Ok(()) => {
                self.acknowledge(ack).await?;
                Ok(true)
            }
            Err(TrySendError::Closed(_)) => Ok(false),
            Err(TrySendError::Full(event)) => {
                self.backlog.push_back(Parked { event, ack });
                Ok(true)
            }
        }
    }

    async fn acknowledge(&mut self, ack: Option<u16>) -> Result<(), ConnectionError> {
        match ack {
            Some(packet_id) => {
                self.writer
                    .send(&Packet::PubAck(PubAck::new(packet_id)))
                    .await
            }
            None => Ok(()),
        }
    }
}
