//! Command publishing with bounded acknowledgment wait
//!
//! rumqttc reports an outgoing publish by packet id only after it has been written,
//! and the request queue is FIFO. The tracker therefore queues a waiter per
//! publish in request order and binds it to the packet id announced by the next
//! `PublishSent` event. The matching PUBACK (QoS 1) or PUBCOMP (QoS 2) resolves it.

use super::codec::Command;
use super::config::DeliveryQuality;
use super::error::{CarLinkError, Result};
use super::link::BrokerLink;
use super::mqtt_handler::{ConnectionState, Session};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Default)]
struct Pending {
    queued: VecDeque<oneshot::Sender<()>>,
    inflight: HashMap<u16, oneshot::Sender<()>>,
    abandoned: bool,
}

/// Correlates publishes with broker acknowledgments for one link
#[derive(Default)]
pub struct AckTracker {
    pending: Mutex<Pending>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands the payload to the link and returns a receiver that resolves on ack
    ///
    /// At QoS 0 nothing is tracked and `None` is returned once the link accepted
    /// the request.
    pub fn publish(
        &self,
        link: &dyn BrokerLink,
        topic: &str,
        quality: DeliveryQuality,
        retain: bool,
        payload: String,
    ) -> Result<Option<oneshot::Receiver<()>>> {
        if !quality.awaits_ack() {
            link.publish(topic, quality.qos(), retain, payload)?;
            return Ok(None);
        }

        // The lock spans the request so queue order equals request order
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| CarLinkError::PublishFailed("ack tracker poisoned".to_string()))?;
        if pending.abandoned {
            return Err(CarLinkError::PublishFailed("link closed".to_string()));
        }
        link.publish(topic, quality.qos(), retain, payload)?;
        let (tx, rx) = oneshot::channel();
        pending.queued.push_back(tx);
        Ok(Some(rx))
    }

    pub fn on_sent(&self, pkid: u16) {
        if let Ok(mut pending) = self.pending.lock() {
            // QoS 0 traffic reports pkid 0 and never has a waiter
            if pkid == 0 {
                return;
            }
            if let Some(waiter) = pending.queued.pop_front() {
                pending.inflight.insert(pkid, waiter);
            }
        }
    }

    pub fn on_acked(&self, pkid: u16) {
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(waiter) = pending.inflight.remove(&pkid) {
                // Receiver may have timed out already
                let _ = waiter.send(());
            } else {
                debug!("Acknowledgment for untracked packet {}", pkid);
            }
        }
    }

    /// Fails every waiter; later publishes through this tracker are refused
    pub fn abandon(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            let dropped = pending.queued.len() + pending.inflight.len();
            if dropped > 0 {
                debug!("Abandoning {} unacknowledged publishes", dropped);
            }
            pending.abandoned = true;
            pending.queued.clear();
            pending.inflight.clear();
        }
    }
}

/// Publishes a command on the session's command topic
///
/// Fails with `NotConnected` without touching the network unless the session is
/// Connected. A missing acknowledgment yields `PublishTimeout` and leaves the
/// connection state alone.
pub async fn send(session: &Session, command: &Command) -> Result<()> {
    let state = session.state();
    if state != ConnectionState::Connected {
        debug!("Rejecting {} while {:?}", command, state);
        return Err(CarLinkError::NotConnected);
    }
    let active = session.active_link().ok_or(CarLinkError::NotConnected)?;

    let config = session.config();
    let topic = &session.topics().cmd;
    let payload = command.encode();

    let waiter = active.tracker.publish(
        active.link.as_ref(),
        topic,
        config.qos,
        false,
        payload.clone(),
    )?;
    session.record_sent();

    if let Some(ack) = waiter {
        let timeout = config.ack_timeout();
        match tokio::time::timeout(timeout, ack).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                warn!("Link closed before {} was acknowledged", payload);
                return Err(CarLinkError::PublishFailed(
                    "link closed before acknowledgment".to_string(),
                ));
            }
            Err(_) => {
                warn!("No acknowledgment for {} within {:?}", payload, timeout);
                return Err(CarLinkError::PublishTimeout(timeout));
            }
        }
    }

    info!("→ {}: {}", topic, payload);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::testing::RecordingLink;

    #[test]
    fn waiters_resolve_in_request_order() {
        let link = RecordingLink::default();
        let tracker = AckTracker::new();

        let mut first = tracker
            .publish(&link, "t", DeliveryQuality::AtLeastOnce, false, "a".into())
            .unwrap()
            .unwrap();
        let mut second = tracker
            .publish(&link, "t", DeliveryQuality::AtLeastOnce, false, "b".into())
            .unwrap()
            .unwrap();

        tracker.on_sent(7);
        tracker.on_sent(8);
        tracker.on_acked(8);

        assert!(first.try_recv().is_err());
        assert!(second.try_recv().is_ok());

        tracker.on_acked(7);
        assert!(first.try_recv().is_ok());
        assert_eq!(link.published().len(), 2);
    }

    #[test]
    fn qos_zero_is_not_tracked() {
        let link = RecordingLink::default();
        let tracker = AckTracker::new();

        let waiter = tracker
            .publish(&link, "t", DeliveryQuality::AtMostOnce, false, "S".into())
            .unwrap();
        assert!(waiter.is_none());

        tracker.on_sent(0);
        assert_eq!(link.published()[0].payload, "S");
    }

    #[test]
    fn abandon_fails_waiters_and_refuses_new_publishes() {
        let link = RecordingLink::default();
        let tracker = AckTracker::new();

        let mut waiter = tracker
            .publish(&link, "t", DeliveryQuality::ExactlyOnce, false, "a".into())
            .unwrap()
            .unwrap();
        tracker.abandon();

        assert!(matches!(
            waiter.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
        assert!(matches!(
            tracker.publish(&link, "t", DeliveryQuality::ExactlyOnce, false, "b".into()),
            Err(CarLinkError::PublishFailed(_))
        ));
        assert_eq!(link.published().len(), 1);
    }
}
