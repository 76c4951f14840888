//! Inbound message routing and last-value stores
//!
//! The subscriber runs on the network context and hands every update to the
//! caller's context through `watch` channels. Only the newest payload per topic is
//! kept; readers never see history.

use super::codec::Command;
use super::error::Result;
use super::topics::Topics;
use chrono::{DateTime, Local};
use std::fmt;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Last payload received on a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    pub topic: String,
    pub payload: String,
    pub received_at: DateTime<Local>,
}

impl StatusRecord {
    pub fn from_topic(topic: &str, payload: &[u8]) -> Self {
        StatusRecord {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            received_at: Local::now(),
        }
    }

    pub fn render(&self) -> String {
        format!(
            "{}: {}\n{}",
            self.received_at.format("%H:%M:%S%.3f"),
            self.topic,
            self.payload
        )
    }
}

impl fmt::Display for StatusRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.payload.chars().take(40).collect();
        write!(f, "{} - {}", self.received_at.format("%H:%M:%S"), preview)
    }
}

/// A command observed on the command topic
#[derive(Debug, Clone, PartialEq)]
pub struct EchoRecord {
    pub record: StatusRecord,
    /// Decoded form, or why the payload did not parse
    pub command: Result<Command>,
}

/// Classification of an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Status,
    Echo,
    Ignored,
}

pub struct StatusSubscriber {
    topics: Topics,
    status_tx: watch::Sender<Option<StatusRecord>>,
    echo_tx: watch::Sender<Option<EchoRecord>>,
}

impl StatusSubscriber {
    pub fn new(topics: Topics) -> Self {
        let (status_tx, _) = watch::channel(None);
        let (echo_tx, _) = watch::channel(None);
        Self {
            topics,
            status_tx,
            echo_tx,
        }
    }

    pub fn on_message(&self, topic: &str, payload: &[u8]) -> Routed {
        if topic == self.topics.status {
            let record = StatusRecord::from_topic(topic, payload);
            debug!("Status update on {}: {}", topic, record.payload);
            self.status_tx.send_replace(Some(record));
            Routed::Status
        } else if topic == self.topics.cmd {
            let record = StatusRecord::from_topic(topic, payload);
            let command = Command::decode(&record.payload);
            match &command {
                Ok(cmd) => debug!("Echo on {}: {}", topic, cmd),
                Err(e) => warn!("Echo on {} is not a valid command: {}", topic, e),
            }
            self.echo_tx.send_replace(Some(EchoRecord { record, command }));
            Routed::Echo
        } else {
            debug!("Ignoring message on unrelated topic {}", topic);
            Routed::Ignored
        }
    }

    pub fn last_status(&self) -> Option<StatusRecord> {
        self.status_tx.borrow().clone()
    }

    pub fn last_echo(&self) -> Option<EchoRecord> {
        self.echo_tx.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<Option<StatusRecord>> {
        self.status_tx.subscribe()
    }

    pub fn watch_echo(&self) -> watch::Receiver<Option<EchoRecord>> {
        self.echo_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::codec::Heading;
    use crate::mqtt::error::CarLinkError;
    use crate::mqtt::topics::resolve;

    fn subscriber() -> StatusSubscriber {
        StatusSubscriber::new(resolve("esp32car-01").unwrap())
    }

    #[test]
    fn status_is_last_value_wins() {
        let sub = subscriber();
        assert_eq!(
            sub.on_message("esp32car/esp32car-01/status", b"battery=80"),
            Routed::Status
        );
        sub.on_message("esp32car/esp32car-01/status", b"battery=79");

        let record = sub.last_status().unwrap();
        assert_eq!(record.payload, "battery=79");
        assert_eq!(record.topic, "esp32car/esp32car-01/status");
        assert!(sub.last_echo().is_none());
    }

    #[test]
    fn command_topic_updates_echo_only() {
        let sub = subscriber();
        assert_eq!(
            sub.on_message("esp32car/esp32car-01/cmd", b"L,120,0"),
            Routed::Echo
        );

        let echo = sub.last_echo().unwrap();
        assert_eq!(echo.record.payload, "L,120,0");
        assert_eq!(
            echo.command,
            Ok(Command::drive(Heading::Left, 120, 0).unwrap())
        );
        assert!(sub.last_status().is_none());
    }

    #[test]
    fn malformed_echo_is_recorded_not_fatal() {
        let sub = subscriber();
        sub.on_message("esp32car/esp32car-01/cmd", b"jump");

        let echo = sub.last_echo().unwrap();
        assert!(matches!(echo.command, Err(CarLinkError::DecodeError(_))));
    }

    #[test]
    fn unrelated_topics_are_ignored() {
        let sub = subscriber();
        assert_eq!(
            sub.on_message("esp32car/other-car/status", b"hello"),
            Routed::Ignored
        );
        assert_eq!(
            sub.on_message("esp32car/esp32car-01/lwt", b"offline"),
            Routed::Ignored
        );
        assert!(sub.last_status().is_none());
    }

    #[test]
    fn non_utf8_status_is_kept_lossily() {
        let sub = subscriber();
        sub.on_message("esp32car/esp32car-01/status", &[0x6f, 0x6b, 0xff]);
        assert_eq!(sub.last_status().unwrap().payload, "ok\u{fffd}");
    }

    #[tokio::test]
    async fn observers_are_notified() {
        let sub = subscriber();
        let mut rx = sub.watch_status();
        sub.on_message("esp32car/esp32car-01/status", b"rpm=0");

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_ref().unwrap().payload, "rpm=0");
    }
}
