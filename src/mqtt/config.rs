use super::error::{CarLinkError, Result};
use super::topics::Topics;
use clap::ValueEnum;
use rumqttc::{LastWill, MqttOptions, QoS, TlsConfiguration, Transport};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const LWT_OFFLINE: &str = "offline";
pub const LWT_ONLINE: &str = "online";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Tcp,
    Tls,
    #[serde(alias = "ws")]
    #[value(name = "websocket", alias = "ws")]
    WebSocket,
    #[serde(alias = "wss")]
    #[value(name = "secure_websocket", alias = "wss")]
    SecureWebSocket,
}

impl TransportKind {
    pub fn default_port(&self) -> u16 {
        match self {
            TransportKind::Tcp => 1883,
            TransportKind::Tls => 8883,
            TransportKind::WebSocket => 8000,
            TransportKind::SecureWebSocket => 8081,
        }
    }

    pub fn uses_tls(&self) -> bool {
        matches!(self, TransportKind::Tls | TransportKind::SecureWebSocket)
    }

    pub fn is_websocket(&self) -> bool {
        matches!(
            self,
            TransportKind::WebSocket | TransportKind::SecureWebSocket
        )
    }
}

/// Delivery guarantee applied to every publish and subscription of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DeliveryQuality {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl DeliveryQuality {
    pub fn qos(&self) -> QoS {
        match self {
            DeliveryQuality::AtMostOnce => QoS::AtMostOnce,
            DeliveryQuality::AtLeastOnce => QoS::AtLeastOnce,
            DeliveryQuality::ExactlyOnce => QoS::ExactlyOnce,
        }
    }

    /// Whether a publish waits for the broker's acknowledgment
    pub fn awaits_ack(&self) -> bool {
        !matches!(self, DeliveryQuality::AtMostOnce)
    }
}

impl TryFrom<u8> for DeliveryQuality {
    type Error = CarLinkError;

    fn try_from(level: u8) -> Result<Self> {
        match level {
            0 => Ok(DeliveryQuality::AtMostOnce),
            1 => Ok(DeliveryQuality::AtLeastOnce),
            2 => Ok(DeliveryQuality::ExactlyOnce),
            other => Err(CarLinkError::Config(format!(
                "delivery quality must be 0, 1 or 2, got {}",
                other
            ))),
        }
    }
}

impl From<DeliveryQuality> for u8 {
    fn from(quality: DeliveryQuality) -> Self {
        match quality {
            DeliveryQuality::AtMostOnce => 0,
            DeliveryQuality::AtLeastOnce => 1,
            DeliveryQuality::ExactlyOnce => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Broker connection settings
///
/// Immutable for the lifetime of a connection. Changing any field means tearing
/// the session down and building a new one, which `SessionRegistry` does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    /// Request path for WebSocket transports
    pub ws_path: String,
    pub credentials: Option<Credentials>,
    pub qos: DeliveryQuality,
    pub keep_alive_secs: u64,
    /// How long `connect` waits for the broker's verdict before returning
    pub connect_wait_ms: u64,
    /// How long `send` waits for a delivery acknowledgment
    pub ack_timeout_ms: u64,
    /// PEM bundle to trust instead of the platform roots
    pub ca_path: Option<PathBuf>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "broker.hivemq.com".to_string(),
            port: TransportKind::Tcp.default_port(),
            transport: TransportKind::Tcp,
            ws_path: "/mqtt".to_string(),
            credentials: None,
            qos: DeliveryQuality::AtMostOnce,
            keep_alive_secs: 30,
            connect_wait_ms: 500,
            ack_timeout_ms: 2000,
            ca_path: None,
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(CarLinkError::Config("broker host is empty".to_string()));
        }
        if self.port == 0 {
            return Err(CarLinkError::Config("broker port must be non-zero".to_string()));
        }
        if self.transport.is_websocket() && !self.ws_path.starts_with('/') {
            return Err(CarLinkError::Config(format!(
                "websocket path {:?} must start with '/'",
                self.ws_path
            )));
        }
        if self.keep_alive_secs == 0 {
            return Err(CarLinkError::Config("keep alive must be at least 1s".to_string()));
        }
        Ok(())
    }

    pub fn connect_wait(&self) -> Duration {
        Duration::from_millis(self.connect_wait_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Address handed to the client; WebSocket transports need the full URL
    pub fn broker_address(&self) -> String {
        match self.transport {
            TransportKind::Tcp | TransportKind::Tls => self.host.clone(),
            TransportKind::WebSocket => {
                format!("ws://{}:{}{}", self.host, self.port, self.ws_path)
            }
            TransportKind::SecureWebSocket => {
                format!("wss://{}:{}{}", self.host, self.port, self.ws_path)
            }
        }
    }

    /// Builds CONNECT options: transport, credentials, keep alive and the last will
    ///
    /// `tls` must be present for TLS transports; it comes from the session's
    /// security context so it is only ever built once.
    pub fn mqtt_options(
        &self,
        client_id: &str,
        topics: &Topics,
        tls: Option<TlsConfiguration>,
    ) -> Result<MqttOptions> {
        self.validate()?;

        let mut options = MqttOptions::new(client_id, self.broker_address(), self.port);
        options
            .set_keep_alive(Duration::from_secs(self.keep_alive_secs))
            .set_clean_session(true)
            .set_last_will(LastWill::new(
                topics.lwt.clone(),
                LWT_OFFLINE,
                self.qos.qos(),
                true,
            ));

        if let Some(credentials) = &self.credentials {
            options.set_credentials(credentials.username.clone(), credentials.password.clone());
        }

        let transport = match (self.transport, tls) {
            (TransportKind::Tcp, _) => Transport::Tcp,
            (TransportKind::WebSocket, _) => Transport::Ws,
            (TransportKind::Tls, Some(tls)) => Transport::tls_with_config(tls),
            (TransportKind::SecureWebSocket, Some(tls)) => Transport::wss_with_config(tls),
            (kind, None) => {
                return Err(CarLinkError::Config(format!(
                    "{:?} transport requires a security context",
                    kind
                )))
            }
        };
        options.set_transport(transport);

        Ok(options)
    }
}
