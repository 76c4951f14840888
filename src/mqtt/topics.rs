//! Device identity and the topic scheme bound to it
//!
//! Every device owns three channels under a shared root:
//!
//! ```text
//! esp32car/{device_id}/cmd     operator → vehicle
//! esp32car/{device_id}/status  vehicle  → operator
//! esp32car/{device_id}/lwt     broker presence (last will)
//! ```

use super::error::{CarLinkError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const TOPIC_ROOT: &str = "esp32car";

/// Opaque, non-empty device identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(CarLinkError::InvalidIdentity);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Channel names for this device
    pub fn topics(&self) -> Topics {
        Topics {
            cmd: format!("{}/{}/cmd", TOPIC_ROOT, self.0),
            status: format!("{}/{}/status", TOPIC_ROOT, self.0),
            lwt: format!("{}/{}/lwt", TOPIC_ROOT, self.0),
        }
    }
}

impl TryFrom<String> for DeviceIdentity {
    type Error = CarLinkError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<DeviceIdentity> for String {
    fn from(value: DeviceIdentity) -> Self {
        value.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub cmd: String,
    pub status: String,
    pub lwt: String,
}

/// Maps a raw identifier to its topics, rejecting empty identifiers
pub fn resolve(device_id: &str) -> Result<Topics> {
    DeviceIdentity::new(device_id).map(|identity| identity.topics())
}
