//! Process-scoped session ownership
//!
//! Holds exactly one [`Session`] per device for the lifetime of the operator
//! session. Every command-issuing action asks the registry for the session instead
//! of building its own client, so repeated activations reuse the live connection.

use super::config::ConnectionConfig;
use super::error::Result;
use super::link::Connector;
use super::mqtt_handler::Session;
use super::topics::DeviceIdentity;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct SessionRegistry {
    connector: Arc<dyn Connector>,
    sessions: Mutex<HashMap<DeviceIdentity, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the device's session, replacing it when the config changed
    pub async fn session(&self, device_id: &str, config: ConnectionConfig) -> Result<Arc<Session>> {
        let identity = DeviceIdentity::new(device_id)?;
        let mut sessions = self.sessions.lock().await;

        if let Some(existing) = sessions.get(&identity) {
            if *existing.config() == config {
                debug!("Reusing session {} for {}", existing.client_id(), identity);
                return Ok(existing.clone());
            }
            info!("Connection settings for {} changed, rebuilding session", identity);
            existing.disconnect().await;
        }

        let session = Arc::new(Session::new(
            identity.clone(),
            config,
            self.connector.clone(),
        )?);
        sessions.insert(identity, session.clone());
        Ok(session)
    }

    pub async fn get(&self, device_id: &str) -> Option<Arc<Session>> {
        let identity = DeviceIdentity::new(device_id).ok()?;
        self.sessions.lock().await.get(&identity).cloned()
    }

    /// Disconnects and forgets a device's session
    pub async fn end(&self, device_id: &str) -> bool {
        let Ok(identity) = DeviceIdentity::new(device_id) else {
            return false;
        };
        let removed = self.sessions.lock().await.remove(&identity);
        match removed {
            Some(session) => {
                session.disconnect().await;
                info!("Ended session for {}", identity);
                true
            }
            None => false,
        }
    }

    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .lock()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in sessions {
            session.disconnect().await;
        }
    }
}
