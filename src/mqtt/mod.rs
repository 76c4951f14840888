//! # Command & Telemetry Channel
//!
//! Drives a remote vehicle over MQTT: motion commands go out on the device's command
//! topic, status and echoes come back on its status and command topics.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── topics.rs           - Device identity and topic scheme
//! ├── codec.rs            - Motion command model and wire grammar
//! ├── config.rs           - Broker settings, transports, delivery quality
//! ├── link.rs             - Transport seam and the rumqttc network pump
//! ├── mqtt_handler.rs     - Session and connection state machine
//! ├── publisher.rs        - Command publishing with acknowledgment wait
//! ├── message_manager.rs  - Status and echo last-value stores
//! └── registry.rs         - One session per device per operator session
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! operator ─► Command::encode ─► publisher::send ─► BrokerLink ─► broker ─► vehicle
//! vehicle ─► broker ─► network pump ─► Supervisor ─► StatusSubscriber ─► watch ─► display
//! ```
//!
//! The network pump and the supervisor run as tokio tasks. Callers only observe
//! state through `watch` receivers and never touch it directly.

pub mod codec;
pub mod config;
pub mod error;
pub mod link;
pub mod message_manager;
pub mod mqtt_handler;
pub mod publisher;
pub mod registry;
pub mod topics;

#[cfg(test)]
pub(crate) mod testing;

pub use codec::{Command, Controls, Heading, Maneuver, Motion, MAX_DURATION_MS};
pub use config::{ConnectionConfig, Credentials, DeliveryQuality, TransportKind};
pub use error::{CarLinkError, Result};
pub use link::{BrokerLink, Connector, LinkEvent, RumqttcConnector};
pub use message_manager::{EchoRecord, StatusRecord, StatusSubscriber};
pub use mqtt_handler::{ConnectionState, LinkFailure, Session, SessionStatus};
pub use registry::SessionRegistry;
pub use topics::{resolve, DeviceIdentity, Topics};
