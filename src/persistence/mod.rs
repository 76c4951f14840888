//! # Persistence Module
//!
//! ## Why This Module Exists
//! Operators drive the same vehicle through the same broker again and again. Profiles
//! keep the device id, broker settings and slider values between runs so a restart
//! lands on the last used setup.
//!
//! ## Layout
//! ```text
//! ~/.config/carlink/
//! └── <profile>/
//!     ├── connection_config.toml  - ConnectionConfig
//!     └── device_config.toml      - device id and control values
//! ```
//!
//! ## Error Handling Strategy
//! Uses `color_eyre` for file operation context. A missing file inside an existing
//! profile falls back to defaults with a warning instead of failing startup.

pub mod profile_store;

use crate::mqtt::codec::Controls;
use crate::mqtt::config::ConnectionConfig;
use serde::{Deserialize, Serialize};

pub const DEFAULT_DEVICE_ID: &str = "esp32car-01";

/// Device selection and the operator's last control values
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceConfig {
    pub device_id: String,
    pub controls: Controls,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: DEFAULT_DEVICE_ID.to_string(),
            controls: Controls::default(),
        }
    }
}

/// Everything needed to resume driving a vehicle
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Profile {
    pub device: DeviceConfig,
    pub connection: ConnectionConfig,
}
