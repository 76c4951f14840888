use crate::mqtt::codec::Command;
use crate::mqtt::error::{CarLinkError, Result};
use reqwest::{Client, Url};
use std::time::Duration;
use tracing::{debug, info};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

pub struct HttpPeer {
    base: Url,
    client: Client,
}

impl HttpPeer {
    pub fn new(base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| CarLinkError::Peer(format!("invalid base url {base_url}: {e}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(CarLinkError::Peer(format!(
                "unsupported scheme {} in {base_url}",
                base.scheme()
            )));
        }

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CarLinkError::Peer(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { base, client })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Absolute URL a command is sent to
    pub fn command_url(&self, command: &Command) -> Result<Url> {
        self.endpoint(&command.http_path())
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| CarLinkError::Peer(format!("invalid request path {path}: {e}")))
    }

    /// Sends a command and returns the vehicle's reply body
    pub async fn send(&self, command: &Command) -> Result<String> {
        let url = self.command_url(command)?;
        info!("HTTP command {} -> {}", command, url);
        self.get(url).await
    }

    pub async fn status(&self) -> Result<String> {
        let url = self.endpoint("/status")?;
        self.get(url).await
    }

    async fn get(&self, url: Url) -> Result<String> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| CarLinkError::Peer(format!("request to {url} failed: {e}")))?
            .error_for_status()
            .map_err(|e| CarLinkError::Peer(format!("vehicle rejected {url}: {e}")))?;

        let body = response
            .text()
            .await
            .map_err(|e| CarLinkError::Peer(format!("unreadable reply from {url}: {e}")))?;
        debug!("HTTP reply from {}: {}", url, body);
        Ok(body)
    }
}
