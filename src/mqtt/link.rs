//! Transport seam between a session and the broker
//!
//! A [`Connector`] builds the TLS security context and opens links. An opened link
//! is a [`BrokerLink`] for outbound requests plus a stream of [`LinkEvent`]s
//! produced by the network loop.
//!
//! # Network pump
//!
//! The rumqttc implementation drives its event loop with a two-state machine:
//!
//! ```text
//! Handshaking ──CONNACK accepted──► Streaming ──error / shutdown──► (ended)
//!      │
//!      └──refused / transport error──► (ended)
//! ```
//!
//! The pump never polls again after an error, so rumqttc's built-in reconnect is
//! never triggered. Retries only happen through `Session::connect`.

use super::error::{CarLinkError, Result};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, TlsConfiguration,
};
use statum::{machine, state};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REQUEST_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// What the network context reports to the session
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Broker accepted the CONNECT
    Accepted,
    /// Broker answered CONNECT with a non-zero return code
    Rejected(ConnectReturnCode),
    /// Transport failed or closed; the link is dead
    Dropped(String),
    Message { topic: String, payload: Vec<u8> },
    /// A publish left the client with this packet id
    PublishSent(u16),
    /// Final acknowledgment for a packet id (PUBACK or PUBCOMP)
    PublishAcked(u16),
}

/// Outbound half of an open link; calls never block on the network
pub trait BrokerLink: Send + Sync {
    fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: String) -> Result<()>;
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<()>;
    /// Queues DISCONNECT behind pending publishes and stops the network loop
    fn close(&self);
}

pub struct OpenedLink {
    pub link: Arc<dyn BrokerLink>,
    pub events: mpsc::Receiver<LinkEvent>,
}

pub trait Connector: Send + Sync {
    /// Builds the TLS configuration; sessions call this at most once
    ///
    /// `ca_bundle` holds the PEM file named by `ConnectionConfig::ca_path`, already
    /// read by the caller.
    fn security_context(&self, ca_bundle: Option<Vec<u8>>) -> Result<TlsConfiguration>;

    fn open(&self, options: MqttOptions) -> Result<OpenedLink>;
}

/// Production connector backed by rumqttc
#[derive(Debug, Default, Clone)]
pub struct RumqttcConnector;

impl Connector for RumqttcConnector {
    fn security_context(&self, ca_bundle: Option<Vec<u8>>) -> Result<TlsConfiguration> {
        match ca_bundle {
            Some(ca) => {
                info!("Building TLS context from {} byte CA bundle", ca.len());
                Ok(TlsConfiguration::Simple {
                    ca,
                    alpn: None,
                    client_auth: None,
                })
            }
            None => {
                info!("Building TLS context from platform root certificates");
                Ok(TlsConfiguration::default())
            }
        }
    }

    fn open(&self, options: MqttOptions) -> Result<OpenedLink> {
        let (host, port) = options.broker_address();
        info!("Opening MQTT link to {}:{}", host, port);

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let shutdown = CancellationToken::new();

        let pump = EventPump::create(eventloop, event_tx, shutdown.clone());
        tokio::spawn(async move {
            if let Some(streaming) = pump.handshake().await {
                streaming.stream().await;
            }
            debug!("Network pump finished");
        });

        Ok(OpenedLink {
            link: Arc::new(RumqttcLink { client, shutdown }),
            events: event_rx,
        })
    }
}

struct RumqttcLink {
    client: AsyncClient,
    shutdown: CancellationToken,
}

impl BrokerLink for RumqttcLink {
    fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: String) -> Result<()> {
        self.client
            .try_publish(topic, qos, retain, payload)
            .map_err(|e| CarLinkError::PublishFailed(e.to_string()))
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        self.client
            .try_subscribe(topic, qos)
            .map_err(|e| CarLinkError::ConnectionError(e.to_string()))
    }

    fn close(&self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request not delivered: {}", e);
        }
        self.shutdown.cancel();
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum PumpState {
    Handshaking,
    Streaming,
}

#[machine]
pub struct EventPump<S: PumpState> {
    eventloop: EventLoop,
    events: mpsc::Sender<LinkEvent>,
    shutdown: CancellationToken,
}

impl<S: PumpState> EventPump<S> {
    async fn report(&mut self, event: LinkEvent) -> bool {
        // EventLoop is not Sync, so no borrow of self may live across the await
        let events = self.events.clone();
        if events.send(event).await.is_err() {
            debug!("Session stopped listening to link events");
            return false;
        }
        true
    }
}

impl EventPump<Handshaking> {
    pub fn create(
        eventloop: EventLoop,
        events: mpsc::Sender<LinkEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self::new(eventloop, events, shutdown)
    }

    /// Polls until the broker answers CONNECT
    pub async fn handshake(mut self) -> Option<EventPump<Streaming>> {
        loop {
            let polled = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Handshake cancelled");
                    return None;
                }
                polled = self.eventloop.poll() => polled,
            };

            match polled {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!("Broker accepted connection: {:?}", ack.code);
                    if !self.report(LinkEvent::Accepted).await {
                        return None;
                    }
                    return Some(self.transition());
                }
                Ok(event) => debug!("Handshake event: {:?}", event),
                Err(ConnectionError::ConnectionRefused(code)) => {
                    warn!("Broker refused connection: {:?}", code);
                    self.report(LinkEvent::Rejected(code)).await;
                    return None;
                }
                Err(e) => {
                    error!("Transport error during handshake: {}", e);
                    self.report(LinkEvent::Dropped(e.to_string())).await;
                    return None;
                }
            }
        }
    }
}

impl EventPump<Streaming> {
    /// Forwards packets until the transport drops or the link is closed
    pub async fn stream(mut self) {
        loop {
            let polled = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    self.drain().await;
                    debug!("Network loop stopped");
                    return;
                }
                polled = self.eventloop.poll() => polled,
            };

            let event = match polled {
                Ok(Event::Incoming(Packet::Publish(publish))) => LinkEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                },
                Ok(Event::Incoming(Packet::PubAck(ack))) => LinkEvent::PublishAcked(ack.pkid),
                Ok(Event::Incoming(Packet::PubComp(comp))) => LinkEvent::PublishAcked(comp.pkid),
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => LinkEvent::PublishSent(pkid),
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("Disconnect sent, network loop stopped");
                    return;
                }
                Ok(event) => {
                    debug!("Network event: {:?}", event);
                    continue;
                }
                Err(e) => {
                    if self.shutdown.is_cancelled() {
                        return;
                    }
                    warn!("Lost connection to broker: {}", e);
                    self.report(LinkEvent::Dropped(e.to_string())).await;
                    return;
                }
            };

            if !self.report(event).await {
                if self.shutdown.is_cancelled() {
                    self.drain().await;
                }
                return;
            }
        }
    }

    /// Flushes queued requests up to the DISCONNECT, bounded by `DRAIN_TIMEOUT`
    async fn drain(&mut self) {
        let flushed = tokio::time::timeout(DRAIN_TIMEOUT, async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => return,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Network loop ended while draining: {}", e);
                        return;
                    }
                }
            }
        })
        .await;
        if flushed.is_err() {
            warn!("Broker link did not drain within {:?}", DRAIN_TIMEOUT);
        }
    }
}
