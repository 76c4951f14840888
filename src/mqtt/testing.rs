//! In-memory transport for driving sessions in tests

use super::error::{CarLinkError, Result};
use super::link::{BrokerLink, Connector, LinkEvent, OpenedLink};
use super::mqtt_handler::{ConnectionState, Session};
use rumqttc::{ConnectReturnCode, MqttOptions, QoS, TlsConfiguration};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: String,
}

#[derive(Default)]
pub struct RecordingLink {
    published: Mutex<Vec<Published>>,
    subscriptions: Mutex<Vec<String>>,
    closed: AtomicBool,
    acks: Option<mpsc::Sender<LinkEvent>>,
    next_pkid: AtomicU16,
}

impl RecordingLink {
    fn acking(events: mpsc::Sender<LinkEvent>) -> Self {
        Self {
            acks: Some(events),
            ..Self::default()
        }
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl BrokerLink for RecordingLink {
    fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: String) -> Result<()> {
        if self.is_closed() {
            return Err(CarLinkError::PublishFailed("link closed".to_string()));
        }
        self.published.lock().unwrap().push(Published {
            topic: topic.to_string(),
            qos,
            retain,
            payload,
        });
        if let (Some(acks), false) = (&self.acks, qos == QoS::AtMostOnce) {
            let pkid = self.next_pkid.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = acks.try_send(LinkEvent::PublishSent(pkid));
            let _ = acks.try_send(LinkEvent::PublishAcked(pkid));
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str, _qos: QoS) -> Result<()> {
        self.subscriptions.lock().unwrap().push(topic.to_string());
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Broker answer queued on every newly opened link
#[derive(Debug, Clone)]
pub enum Handshake {
    Accept,
    Reject(ConnectReturnCode),
    Fail(String),
    Silent,
}

pub struct ScriptedConnector {
    handshake: Mutex<Handshake>,
    auto_ack: AtomicBool,
    fail_security: AtomicBool,
    security_inits: AtomicUsize,
    links: Mutex<Vec<Arc<RecordingLink>>>,
    senders: Mutex<Vec<mpsc::Sender<LinkEvent>>>,
    last_options: Mutex<Option<MqttOptions>>,
}

impl ScriptedConnector {
    pub fn new(handshake: Handshake) -> Arc<Self> {
        Arc::new(Self {
            handshake: Mutex::new(handshake),
            auto_ack: AtomicBool::new(false),
            fail_security: AtomicBool::new(false),
            security_inits: AtomicUsize::new(0),
            links: Mutex::new(Vec::new()),
            senders: Mutex::new(Vec::new()),
            last_options: Mutex::new(None),
        })
    }

    pub fn set_handshake(&self, handshake: Handshake) {
        *self.handshake.lock().unwrap() = handshake;
    }

    pub fn auto_ack(&self, enabled: bool) {
        self.auto_ack.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_security_context(&self, fail: bool) {
        self.fail_security.store(fail, Ordering::SeqCst);
    }

    pub fn security_inits(&self) -> usize {
        self.security_inits.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub fn link(&self, index: usize) -> Arc<RecordingLink> {
        self.links.lock().unwrap()[index].clone()
    }

    pub fn last_options(&self) -> Option<MqttOptions> {
        self.last_options.lock().unwrap().clone()
    }

    /// Pushes an event as if it came from the network loop of link `index`
    pub fn inject(&self, index: usize, event: LinkEvent) {
        let sender = self.senders.lock().unwrap()[index].clone();
        let _ = sender.try_send(event);
    }
}

impl Connector for ScriptedConnector {
    fn security_context(&self, _ca_bundle: Option<Vec<u8>>) -> Result<TlsConfiguration> {
        self.security_inits.fetch_add(1, Ordering::SeqCst);
        if self.fail_security.load(Ordering::SeqCst) {
            return Err(CarLinkError::ConnectionError(
                "CA bundle unreadable".to_string(),
            ));
        }
        Ok(TlsConfiguration::Simple {
            ca: Vec::new(),
            alpn: None,
            client_auth: None,
        })
    }

    fn open(&self, options: MqttOptions) -> Result<OpenedLink> {
        let (tx, rx) = mpsc::channel(64);
        match self.handshake.lock().unwrap().clone() {
            Handshake::Accept => {
                let _ = tx.try_send(LinkEvent::Accepted);
            }
            Handshake::Reject(code) => {
                let _ = tx.try_send(LinkEvent::Rejected(code));
            }
            Handshake::Fail(reason) => {
                let _ = tx.try_send(LinkEvent::Dropped(reason));
            }
            Handshake::Silent => {}
        }

        let link = if self.auto_ack.load(Ordering::SeqCst) {
            Arc::new(RecordingLink::acking(tx.clone()))
        } else {
            Arc::new(RecordingLink::default())
        };

        self.links.lock().unwrap().push(link.clone());
        self.senders.lock().unwrap().push(tx);
        *self.last_options.lock().unwrap() = Some(options);

        Ok(OpenedLink { link, events: rx })
    }
}

pub async fn wait_for_state(session: &Session, state: ConnectionState) {
    let mut rx = session.watch();
    tokio::time::timeout(Duration::from_secs(1), async {
        rx.wait_for(|s| s.connection_state == state).await.map(|_| ())
    })
    .await
    .expect("state not reached in time")
    .expect("status channel closed");
}

/// One MQTT control packet as read off the socket by [`FakeBroker`]
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub kind: u8,
    pub flags: u8,
    pub body: Vec<u8>,
}

impl RawPacket {
    pub const PUBLISH: u8 = 3;
    pub const DISCONNECT: u8 = 14;

    pub fn retain(&self) -> bool {
        self.flags & 0x01 != 0
    }

    fn qos(&self) -> u8 {
        (self.flags >> 1) & 0x03
    }

    /// Topic, packet id and payload of a PUBLISH
    pub fn publish(&self) -> (String, Option<u16>, String) {
        let len = u16::from_be_bytes([self.body[0], self.body[1]]) as usize;
        let topic = String::from_utf8_lossy(&self.body[2..2 + len]).into_owned();
        let mut rest = &self.body[2 + len..];
        let pkid = if self.qos() > 0 {
            let id = u16::from_be_bytes([rest[0], rest[1]]);
            rest = &rest[2..];
            Some(id)
        } else {
            None
        };
        (topic, pkid, String::from_utf8_lossy(rest).into_owned())
    }
}

/// Single-connection MQTT 3.1.1 broker on a loopback port
///
/// Answers CONNECT with `connack_code`, SUBSCRIBE with a granted SUBACK and QoS 1
/// PUBLISH with PUBACK unless the topic is `withheld`. Every packet received is
/// forwarded to `packets`.
pub struct FakeBroker {
    pub port: u16,
    pub packets: mpsc::UnboundedReceiver<RawPacket>,
}

impl FakeBroker {
    pub async fn start(connack_code: u8, withheld: Option<&str>) -> Self {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let withheld = withheld.map(str::to_string);
        let (tx, packets) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            loop {
                let Ok(header) = socket.read_u8().await else {
                    return;
                };
                let mut remaining = 0usize;
                let mut shift = 0;
                loop {
                    let Ok(byte) = socket.read_u8().await else {
                        return;
                    };
                    remaining |= ((byte & 0x7f) as usize) << shift;
                    shift += 7;
                    if byte & 0x80 == 0 {
                        break;
                    }
                }
                let mut body = vec![0; remaining];
                if socket.read_exact(&mut body).await.is_err() {
                    return;
                }
                let packet = RawPacket {
                    kind: header >> 4,
                    flags: header & 0x0f,
                    body,
                };

                let reply = match packet.kind {
                    1 => vec![0x20, 0x02, 0x00, connack_code],
                    8 => vec![0x90, 0x03, packet.body[0], packet.body[1], 0x01],
                    RawPacket::PUBLISH => match packet.publish() {
                        (topic, Some(pkid), _) if withheld.as_deref() != Some(topic.as_str()) => {
                            let [hi, lo] = pkid.to_be_bytes();
                            vec![0x40, 0x02, hi, lo]
                        }
                        _ => Vec::new(),
                    },
                    _ => Vec::new(),
                };
                let refused = packet.kind == 1 && connack_code != 0;
                let _ = tx.send(packet);
                if !reply.is_empty() && socket.write_all(&reply).await.is_err() {
                    return;
                }
                if refused {
                    return;
                }
            }
        });

        Self { port, packets }
    }

    /// Collects packets until a DISCONNECT arrives or the connection ends
    pub async fn until_disconnect(&mut self) -> Vec<RawPacket> {
        let mut seen = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(3), async {
            while let Some(packet) = self.packets.recv().await {
                let done = packet.kind == RawPacket::DISCONNECT;
                seen.push(packet);
                if done {
                    break;
                }
            }
        })
        .await;
        seen
    }
}
