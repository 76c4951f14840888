//! Session and connection lifecycle
//!
//! A [`Session`] binds one device, one [`ConnectionConfig`] and at most one live
//! link. It is created once per operator session and device and reused for every
//! command, so the security context and the broker connection are paid for once.
//!
//! # Connection states
//!
//! ```text
//! Idle ──connect──► Connecting ──accepted──► Connected ──network loss──► Disconnected
//!                       │                                                   │
//!                       └──refused / transport error──► Failed              │
//!                                                         │                 │
//!                 Connecting ◄──────────connect───────────┴─────────────────┘
//!
//! any state ──disconnect──► Idle
//! ```
//!
//! State lives in a `watch` channel. The supervisor task applies link events and
//! every update carries the epoch of the link that produced it; events from a link
//! that was already replaced or torn down are discarded.

use super::codec::Command;
use super::config::{ConnectionConfig, DeliveryQuality, LWT_OFFLINE, LWT_ONLINE};
use super::error::{CarLinkError, Result};
use super::link::{BrokerLink, Connector, LinkEvent};
use super::message_manager::StatusSubscriber;
use super::publisher::{self, AckTracker};
use super::topics::{DeviceIdentity, Topics};
use chrono::{DateTime, Local};
use rumqttc::{ConnectReturnCode, TlsConfiguration};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

/// Why the last connection attempt or link ended
#[derive(Clone, Debug, PartialEq)]
pub enum LinkFailure {
    Rejected(ConnectReturnCode),
    Transport(String),
}

impl LinkFailure {
    pub fn to_error(&self) -> CarLinkError {
        match self {
            LinkFailure::Rejected(code) => CarLinkError::AuthError { code: *code },
            LinkFailure::Transport(reason) => CarLinkError::ConnectionError(reason.clone()),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SessionStatus {
    pub connection_state: ConnectionState,
    pub last_failure: Option<LinkFailure>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Local>>,
    epoch: u64,
}

enum SecurityContextState {
    Uninitialized,
    Ready(TlsConfiguration),
}

pub(crate) struct ActiveLink {
    pub(crate) link: Arc<dyn BrokerLink>,
    pub(crate) tracker: Arc<AckTracker>,
    stop: CancellationToken,
}

impl ActiveLink {
    fn retire(&self) {
        self.stop.cancel();
        self.link.close();
        self.tracker.abandon();
    }
}

pub struct Session {
    identity: DeviceIdentity,
    topics: Topics,
    config: ConnectionConfig,
    client_id: String,
    connector: Arc<dyn Connector>,
    // Serializes connect/disconnect and owns the one-time TLS setup
    gate: tokio::sync::Mutex<SecurityContextState>,
    active: Mutex<Option<Arc<ActiveLink>>>,
    status_tx: Arc<watch::Sender<SessionStatus>>,
    subscriber: Arc<StatusSubscriber>,
}

impl Session {
    pub fn new(
        identity: DeviceIdentity,
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;

        let topics = identity.topics();
        let uuid = Uuid::new_v4().simple().to_string();
        let client_id = format!("carlink-{}-{}", identity, &uuid[..8]);
        let (status_tx, _) = watch::channel(SessionStatus::default());

        info!(
            "Created session {} for {} ({:?} {}:{})",
            client_id, identity, config.transport, config.host, config.port
        );

        Ok(Self {
            subscriber: Arc::new(StatusSubscriber::new(topics.clone())),
            identity,
            topics,
            config,
            client_id,
            connector,
            gate: tokio::sync::Mutex::new(SecurityContextState::Uninitialized),
            active: Mutex::new(None),
            status_tx: Arc::new(status_tx),
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn subscriber(&self) -> &StatusSubscriber {
        &self.subscriber
    }

    pub fn state(&self) -> ConnectionState {
        self.status_tx.borrow().connection_state
    }

    pub fn status(&self) -> SessionStatus {
        self.status_tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    /// Starts a connection attempt and waits briefly for the broker's verdict
    ///
    /// Returns `Connected` on acceptance, or `Connecting` if the verdict did not
    /// arrive within `connect_wait_ms`; the caller polls `state()` after that. A
    /// session that is already Connecting or Connected is left untouched.
    ///
    /// # Errors
    ///
    /// * [`CarLinkError::AuthError`] - the broker refused the CONNECT
    /// * [`CarLinkError::ConnectionError`] - DNS, socket or TLS failure
    pub async fn connect(&self) -> Result<ConnectionState> {
        let (epoch, mut status_rx) = {
            let mut security = self.gate.lock().await;

            let state = self.state();
            if matches!(
                state,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                debug!("connect ignored, session already {:?}", state);
                return Ok(state);
            }

            let tls = if self.config.transport.uses_tls() {
                match &*security {
                    SecurityContextState::Ready(tls) => Some(tls.clone()),
                    SecurityContextState::Uninitialized => {
                        info!("Initializing security context for {}", self.identity);
                        let built = match self.load_ca_bundle().await {
                            Ok(ca_bundle) => self.connector.security_context(ca_bundle),
                            Err(e) => Err(e),
                        };
                        match built {
                            Ok(tls) => {
                                *security = SecurityContextState::Ready(tls.clone());
                                Some(tls)
                            }
                            Err(e) => {
                                error!("Security context setup failed: {}", e);
                                self.fail_now(LinkFailure::Transport(e.to_string()));
                                return Err(e);
                            }
                        }
                    }
                }
            } else {
                None
            };

            self.retire_link();
            let options = self
                .config
                .mqtt_options(&self.client_id, &self.topics, tls)?;
            let epoch = self.begin_connecting();

            let opened = match self.connector.open(options) {
                Ok(opened) => opened,
                Err(e) => {
                    error!("Failed to open transport: {}", e);
                    self.fail_now(LinkFailure::Transport(e.to_string()));
                    return Err(e);
                }
            };

            let active = Arc::new(ActiveLink {
                link: opened.link,
                tracker: Arc::new(AckTracker::new()),
                stop: CancellationToken::new(),
            });
            if let Ok(mut slot) = self.active.lock() {
                *slot = Some(active.clone());
            }

            let supervisor = Supervisor {
                epoch,
                topics: self.topics.clone(),
                quality: self.config.qos,
                link: active.link.clone(),
                tracker: active.tracker.clone(),
                stop: active.stop.clone(),
                status_tx: self.status_tx.clone(),
                subscriber: self.subscriber.clone(),
            };
            tokio::spawn(supervisor.run(opened.events));

            (epoch, self.status_tx.subscribe())
        };

        let wait = self.config.connect_wait();
        let settled = tokio::time::timeout(wait, async {
            status_rx
                .wait_for(|s| {
                    s.epoch != epoch || s.connection_state != ConnectionState::Connecting
                })
                .await
                .map(|_| ())
        })
        .await;
        if settled.is_err() {
            debug!("No broker verdict within {:?}, still connecting", wait);
        }

        let status = self.status();
        match status.connection_state {
            ConnectionState::Failed => Err(status
                .last_failure
                .map(|failure| failure.to_error())
                .unwrap_or_else(|| {
                    CarLinkError::ConnectionError("connection failed".to_string())
                })),
            state => Ok(state),
        }
    }

    /// Stops the network loop, closes the transport and returns to Idle
    ///
    /// A Connected session first publishes a retained "offline" on the lwt topic,
    /// since the broker drops the last will on a clean DISCONNECT.
    pub async fn disconnect(&self) {
        let _security = self.gate.lock().await;

        if self.state() == ConnectionState::Connected {
            self.announce_offline();
        }
        let retired = self.retire_link();
        if !retired && self.state() == ConnectionState::Idle {
            debug!("disconnect ignored, session already idle");
            return;
        }

        self.status_tx.send_modify(|s| {
            s.epoch += 1;
            s.connection_state = ConnectionState::Idle;
        });
        info!("Session for {} disconnected", self.identity);
    }

    pub async fn send(&self, command: &Command) -> Result<()> {
        publisher::send(self, command).await
    }

    pub(crate) fn active_link(&self) -> Option<Arc<ActiveLink>> {
        self.active.lock().ok().and_then(|slot| slot.clone())
    }

    async fn load_ca_bundle(&self) -> Result<Option<Vec<u8>>> {
        let Some(path) = &self.config.ca_path else {
            return Ok(None);
        };
        info!("Loading CA bundle from {}", path.display());
        tokio::fs::read(path).await.map(Some).map_err(|e| {
            CarLinkError::ConnectionError(format!(
                "Failed to read CA bundle {}: {}",
                path.display(),
                e
            ))
        })
    }

    fn announce_offline(&self) {
        let Some(active) = self.active_link() else {
            return;
        };
        match active.tracker.publish(
            active.link.as_ref(),
            &self.topics.lwt,
            self.config.qos,
            true,
            LWT_OFFLINE.to_string(),
        ) {
            Ok(_) => debug!("Announced offline on {}", self.topics.lwt),
            Err(e) => warn!("Failed to announce offline on {}: {}", self.topics.lwt, e),
        }
    }

    pub(crate) fn record_sent(&self) {
        self.status_tx.send_modify(|s| {
            s.messages_sent += 1;
            s.last_activity = Some(Local::now());
        });
    }

    fn begin_connecting(&self) -> u64 {
        let mut epoch = 0;
        self.status_tx.send_modify(|s| {
            s.epoch += 1;
            s.connection_state = ConnectionState::Connecting;
            s.last_failure = None;
            epoch = s.epoch;
        });
        info!(
            "Connecting to {}:{} as {}",
            self.config.host, self.config.port, self.client_id
        );
        epoch
    }

    fn fail_now(&self, failure: LinkFailure) {
        self.status_tx.send_modify(|s| {
            s.epoch += 1;
            s.connection_state = ConnectionState::Failed;
            s.last_failure = Some(failure);
        });
    }

    fn retire_link(&self) -> bool {
        let previous = self.active.lock().ok().and_then(|mut slot| slot.take());
        match previous {
            Some(active) => {
                active.retire();
                true
            }
            None => false,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.retire_link() {
            debug!("Session for {} dropped with a live link", self.identity);
        }
    }
}

/// Applies link events of one epoch to the session state
struct Supervisor {
    epoch: u64,
    topics: Topics,
    quality: DeliveryQuality,
    link: Arc<dyn BrokerLink>,
    tracker: Arc<AckTracker>,
    stop: CancellationToken,
    status_tx: Arc<watch::Sender<SessionStatus>>,
    subscriber: Arc<StatusSubscriber>,
}

impl Supervisor {
    async fn run(self, mut events: mpsc::Receiver<LinkEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.stop.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Some(LinkEvent::Accepted) => {
                    if !self.on_accepted() {
                        break;
                    }
                }
                Some(LinkEvent::Rejected(code)) => {
                    warn!("Broker rejected connection with {:?}", code);
                    self.update(|s| {
                        s.connection_state = ConnectionState::Failed;
                        s.last_failure = Some(LinkFailure::Rejected(code));
                    });
                    break;
                }
                Some(LinkEvent::Dropped(reason)) => {
                    self.on_dropped(reason);
                    break;
                }
                Some(LinkEvent::Message { topic, payload }) => {
                    self.subscriber.on_message(&topic, &payload);
                    self.update(|s| {
                        s.messages_received += 1;
                        s.last_activity = Some(Local::now());
                    });
                }
                Some(LinkEvent::PublishSent(pkid)) => self.tracker.on_sent(pkid),
                Some(LinkEvent::PublishAcked(pkid)) => self.tracker.on_acked(pkid),
                None => {
                    self.on_dropped("network loop ended".to_string());
                    break;
                }
            }
        }

        self.tracker.abandon();
        debug!("Supervisor for epoch {} finished", self.epoch);
    }

    fn on_accepted(&self) -> bool {
        let qos = self.quality.qos();
        for topic in [&self.topics.status, &self.topics.cmd] {
            if let Err(e) = self.link.subscribe(topic, qos) {
                error!("Failed to subscribe to {}: {}", topic, e);
                self.link.close();
                self.update(|s| {
                    s.connection_state = ConnectionState::Failed;
                    s.last_failure = Some(LinkFailure::Transport(e.to_string()));
                });
                return false;
            }
            debug!("Subscribed to {}", topic);
        }

        // Retained birth message, the counterpart of the last will
        if let Err(e) = self.tracker.publish(
            self.link.as_ref(),
            &self.topics.lwt,
            self.quality,
            true,
            LWT_ONLINE.to_string(),
        ) {
            warn!("Failed to announce presence on {}: {}", self.topics.lwt, e);
        }

        if self.update(|s| {
            s.connection_state = ConnectionState::Connected;
            s.last_activity = Some(Local::now());
        }) {
            info!("Connected, commands go to {}", self.topics.cmd);
        }
        true
    }

    fn on_dropped(&self, reason: String) {
        self.update(|s| match s.connection_state {
            ConnectionState::Connecting => {
                error!("Connection attempt failed: {}", reason);
                s.connection_state = ConnectionState::Failed;
                s.last_failure = Some(LinkFailure::Transport(reason.clone()));
            }
            ConnectionState::Connected => {
                warn!("Connection lost: {}", reason);
                s.connection_state = ConnectionState::Disconnected;
                s.last_failure = Some(LinkFailure::Transport(reason.clone()));
            }
            _ => {}
        });
    }

    /// Applies `f` unless a newer link or a disconnect superseded this one
    fn update(&self, f: impl FnOnce(&mut SessionStatus)) -> bool {
        self.status_tx.send_if_modified(|s| {
            if s.epoch != self.epoch {
                return false;
            }
            f(s);
            true
        })
    }
}
