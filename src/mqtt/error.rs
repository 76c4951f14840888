//! Error definitions for the command and telemetry channel

use rumqttc::ConnectReturnCode;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the channel to the operator
///
/// Precondition failures (`NotConnected`, `InvalidCommand`) are produced before any
/// network activity. Transport failures are reported verbatim and never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CarLinkError {
    /// Device identifier was empty
    #[error("Invalid device identity: identifier must not be empty")]
    InvalidIdentity,

    /// Command fields are malformed or out of range
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// DNS, socket or TLS handshake failure
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Broker refused the CONNECT packet
    #[error("Broker rejected the connection: {code:?}")]
    AuthError { code: ConnectReturnCode },

    /// Operation attempted outside the Connected state
    #[error("Not connected to the broker")]
    NotConnected,

    /// Delivery acknowledgment did not arrive in time
    #[error("No delivery acknowledgment within {0:?}")]
    PublishTimeout(Duration),

    /// Transport was closed while the publish was in flight
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Inbound payload does not follow the command grammar
    #[error("Malformed payload: {0}")]
    DecodeError(String),

    /// Connection settings are unusable
    #[error("Configuration error: {0}")]
    Config(String),

    /// Request/response peer interface failure
    #[error("HTTP peer error: {0}")]
    Peer(String),
}

pub type Result<T> = std::result::Result<T, CarLinkError>;
