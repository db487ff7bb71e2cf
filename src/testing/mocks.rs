//! In-memory MQTT broker and transport for tests
//!
//! [`MockBroker`] speaks the broker side of MQTT 3.1.1 well enough to drive
//! the agent through connect, publish, subscribe and reconnect scenarios.
//! Every [`MockTransport`] obtained from it is one client connection; bytes
//! written by the agent are decoded and answered immediately, and replies
//! wait in a per-client buffer until the agent reads them.

use crate::protocol::codec::{self, CodecError, Packet, SUBACK_FAILURE};
use crate::protocol::{topic_matches, PublishInfo, QoS};
use crate::transport::{Credentials, SecureTransport, ServerInfo, TransportError, TransportIo};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Headroom added to payload sizes when encoding broker replies
const REPLY_OVERHEAD: usize = 512;

/// Owned copy of a packet the broker received from a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceivedPacket {
    Connect {
        client_id: String,
        clean_session: bool,
        keep_alive_secs: u16,
        username: Option<String>,
        password: Option<Vec<u8>>,
    },
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        dup: bool,
        packet_id: Option<u16>,
    },
    PubAck {
        packet_id: u16,
    },
    Subscribe {
        packet_id: u16,
        filters: Vec<(String, QoS)>,
    },
    Unsubscribe {
        packet_id: u16,
        filters: Vec<String>,
    },
    PingReq,
    Disconnect,
    /// A packet a client should never send, by name
    Unexpected(&'static str),
    Malformed(CodecError),
}

impl ReceivedPacket {
    fn from_packet(packet: &Packet<'_>) -> Self {
        match packet {
            Packet::Connect(connect) => ReceivedPacket::Connect {
                client_id: connect.client_id.to_string(),
                clean_session: connect.clean_session,
                keep_alive_secs: connect.keep_alive_secs,
                username: connect.username.map(str::to_string),
                password: connect.password.map(<[u8]>::to_vec),
            },
            Packet::Publish(publish) => ReceivedPacket::Publish {
                topic: publish.topic.to_string(),
                payload: publish.payload.to_vec(),
                qos: publish.qos,
                retain: publish.retain,
                dup: publish.dup,
                packet_id: publish.packet_id,
            },
            Packet::PubAck { packet_id } => ReceivedPacket::PubAck {
                packet_id: *packet_id,
            },
            Packet::Subscribe { packet_id, filters } => ReceivedPacket::Subscribe {
                packet_id: *packet_id,
                filters: filters
                    .iter()
                    .map(|f| (f.filter.to_string(), f.qos))
                    .collect(),
            },
            Packet::Unsubscribe { packet_id, filters } => ReceivedPacket::Unsubscribe {
                packet_id: *packet_id,
                filters: filters.iter().map(|f| f.to_string()).collect(),
            },
            Packet::PingReq => ReceivedPacket::PingReq,
            Packet::Disconnect => ReceivedPacket::Disconnect,
            other => ReceivedPacket::Unexpected(other.name()),
        }
    }
}

#[derive(Debug, Default)]
struct ClientState {
    link_up: bool,
    connected: bool,
    inbound: Vec<u8>,
    outbound: VecDeque<u8>,
    subscriptions: Vec<(String, QoS)>,
    last_packet_id: u16,
}

impl ClientState {
    fn reply<F>(&mut self, size_hint: usize, encode: F)
    where
        F: FnOnce(&mut [u8]) -> Result<usize, CodecError>,
    {
        let mut buf = vec![0u8; size_hint + REPLY_OVERHEAD];
        match encode(&mut buf) {
            Ok(len) => self.outbound.extend(&buf[..len]),
            Err(e) => tracing::error!(error = %e, "Mock broker failed to encode reply"),
        }
    }

    fn next_packet_id(&mut self) -> u16 {
        self.last_packet_id = self.last_packet_id.wrapping_add(1).max(1);
        self.last_packet_id
    }

    fn granted_qos(&self, topic: &str) -> Option<QoS> {
        self.subscriptions
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, qos)| *qos)
            .max()
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    clients: Vec<ClientState>,
    received: Vec<ReceivedPacket>,
    connect_count: usize,
    session_present: bool,
    connack_code: u8,
    reject_filters: HashSet<String>,
    hold_publish_acks: bool,
    held_acks: Vec<(usize, u16)>,
    ignore_pings: bool,
    ignore_connects: bool,
    refuse_connects: u32,
}

impl BrokerState {
    fn handle(&mut self, client: usize, packet: ReceivedPacket) {
        match &packet {
            ReceivedPacket::Connect { .. } if self.ignore_connects => {}
            ReceivedPacket::Connect { clean_session, .. } => {
                self.connect_count += 1;
                let code = self.connack_code;
                let session_present = self.session_present && !clean_session;
                let state = &mut self.clients[client];
                if code == 0 {
                    state.connected = true;
                    if !session_present {
                        state.subscriptions.clear();
                    }
                }
                state.reply(0, |buf| codec::encode_connack(buf, session_present && code == 0, code));
            }
            ReceivedPacket::Publish {
                topic,
                payload,
                qos,
                retain,
                packet_id,
                ..
            } => {
                if let (QoS::AtLeastOnce, Some(id)) = (qos, packet_id) {
                    if self.hold_publish_acks {
                        self.held_acks.push((client, *id));
                    } else {
                        self.clients[client].reply(0, |buf| codec::encode_puback(buf, *id));
                    }
                }
                self.fan_out(topic, payload, *qos, *retain);
            }
            ReceivedPacket::Subscribe { packet_id, filters } => {
                let mut codes = Vec::with_capacity(filters.len());
                let state = &mut self.clients[client];
                for (filter, qos) in filters {
                    if self.reject_filters.contains(filter) {
                        codes.push(SUBACK_FAILURE);
                        continue;
                    }
                    let granted = (*qos).min(QoS::AtLeastOnce);
                    state.subscriptions.retain(|(existing, _)| existing != filter);
                    state.subscriptions.push((filter.clone(), granted));
                    codes.push(granted as u8);
                }
                state.reply(codes.len(), |buf| codec::encode_suback(buf, *packet_id, &codes));
            }
            ReceivedPacket::Unsubscribe { packet_id, filters } => {
                let state = &mut self.clients[client];
                state
                    .subscriptions
                    .retain(|(existing, _)| !filters.contains(existing));
                state.reply(0, |buf| codec::encode_unsuback(buf, *packet_id));
            }
            ReceivedPacket::PingReq => {
                if !self.ignore_pings {
                    self.clients[client].reply(0, codec::encode_pingresp);
                }
            }
            ReceivedPacket::Disconnect => {
                let state = &mut self.clients[client];
                state.connected = false;
                state.link_up = false;
            }
            ReceivedPacket::PubAck { .. }
            | ReceivedPacket::Unexpected(_)
            | ReceivedPacket::Malformed(_) => {}
        }
        self.received.push(packet);
    }

    /// Deliver once per connected client, at the lower of the publish QoS and
    /// the highest granted QoS among matching subscriptions.
    fn fan_out(&mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool) {
        for state in self.clients.iter_mut() {
            if !(state.link_up && state.connected) {
                continue;
            }
            let Some(granted) = state.granted_qos(topic) else {
                continue;
            };
            let delivered = qos.min(granted);
            let packet_id = (delivered != QoS::AtMostOnce).then(|| state.next_packet_id());
            let publish = PublishInfo {
                topic,
                payload,
                qos: delivered,
                retain,
                dup: false,
                packet_id,
            };
            state.reply(topic.len() + payload.len(), |buf| {
                codec::encode_publish(buf, &publish)
            });
        }
    }
}

/// Scripted broker shared by any number of [`MockTransport`]s
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A new client connection to this broker
    pub fn transport(&self) -> MockTransport {
        let mut state = self.lock();
        state.clients.push(ClientState::default());
        MockTransport {
            broker: self.clone(),
            client: state.clients.len() - 1,
        }
    }

    /// Session-present flag reported to `clean_session = false` connects.
    /// Without it the broker forgets a client's subscriptions on reconnect.
    pub fn set_session_present(&self, session_present: bool) {
        self.lock().session_present = session_present;
    }

    /// Non-zero return codes refuse the connection.
    pub fn set_connack_code(&self, code: u8) {
        self.lock().connack_code = code;
    }

    /// Answer SUBSCRIBE requests for `filter` with a failure code.
    pub fn reject_filter(&self, filter: &str) {
        self.lock().reject_filters.insert(filter.to_string());
    }

    /// Withhold PUBACKs until [`release_held_acks`](Self::release_held_acks).
    pub fn hold_publish_acks(&self, hold: bool) {
        self.lock().hold_publish_acks = hold;
    }

    /// Send every withheld PUBACK to clients whose link is up.
    pub fn release_held_acks(&self) {
        let mut state = self.lock();
        let held = std::mem::take(&mut state.held_acks);
        for (client, packet_id) in held {
            let client = &mut state.clients[client];
            if client.link_up {
                client.reply(0, |buf| codec::encode_puback(buf, packet_id));
            }
        }
    }

    /// Drop PINGREQs without answering.
    pub fn ignore_pings(&self, ignore: bool) {
        self.lock().ignore_pings = ignore;
    }

    /// Accept the link but never answer CONNECT.
    pub fn ignore_connects(&self, ignore: bool) {
        self.lock().ignore_connects = ignore;
    }

    /// Fail the next `count` transport connects.
    pub fn refuse_connects(&self, count: u32) {
        self.lock().refuse_connects = count;
    }

    /// Sever every client link. Buffered bytes in both directions are lost
    /// and withheld PUBACKs are discarded.
    pub fn kill_link(&self) {
        let mut state = self.lock();
        state.held_acks.clear();
        for client in state.clients.iter_mut() {
            client.link_up = false;
            client.connected = false;
            client.inbound.clear();
            client.outbound.clear();
        }
    }

    /// Publish from the broker side to every matching subscriber.
    pub fn inject_publish(&self, topic: &str, payload: &[u8], qos: QoS) {
        self.lock().fan_out(topic, payload, qos, false);
    }

    /// Every packet received so far, in arrival order
    pub fn received(&self) -> Vec<ReceivedPacket> {
        self.lock().received.clone()
    }

    pub fn clear_received(&self) {
        self.lock().received.clear();
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connect_count
    }

    /// PUBLISH packets received so far
    pub fn publishes(&self) -> Vec<ReceivedPacket> {
        self.received()
            .into_iter()
            .filter(|p| matches!(p, ReceivedPacket::Publish { .. }))
            .collect()
    }

    /// SUBSCRIBE packets received so far
    pub fn subscribes(&self) -> Vec<ReceivedPacket> {
        self.received()
            .into_iter()
            .filter(|p| matches!(p, ReceivedPacket::Subscribe { .. }))
            .collect()
    }

    /// Filters the broker currently holds for a client
    pub fn client_subscriptions(&self, client: usize) -> Vec<String> {
        self.lock()
            .clients
            .get(client)
            .map(|c| c.subscriptions.iter().map(|(f, _)| f.clone()).collect())
            .unwrap_or_default()
    }
}

/// Client side of a [`MockBroker`] connection
#[derive(Debug)]
pub struct MockTransport {
    broker: MockBroker,
    client: usize,
}

impl MockTransport {
    /// Index of this connection in the broker's client list
    pub fn client_index(&self) -> usize {
        self.client
    }
}

#[async_trait]
impl SecureTransport for MockTransport {
    async fn connect(
        &mut self,
        server: &ServerInfo,
        _credentials: &Credentials,
        _recv_timeout: Duration,
        _send_timeout: Duration,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(TransportError::Connect {
                endpoint: server.to_string(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            });
        }
        let client = &mut state.clients[self.client];
        client.link_up = true;
        client.connected = false;
        client.inbound.clear();
        client.outbound.clear();
        Ok(())
    }

    async fn disconnect(&mut self) {
        let mut state = self.broker.lock();
        let client = &mut state.clients[self.client];
        client.link_up = false;
        client.connected = false;
        client.inbound.clear();
        client.outbound.clear();
    }

    async fn send(&mut self, buf: &[u8]) -> Result<TransportIo, TransportError> {
        let mut state = self.broker.lock();
        let client = &mut state.clients[self.client];
        if !client.link_up {
            return Err(TransportError::PeerClosed);
        }
        client.inbound.extend_from_slice(buf);

        let inbound = std::mem::take(&mut client.inbound);
        let mut packets = Vec::new();
        let mut offset = 0;
        loop {
            match codec::decode_incremental(&inbound[offset..]) {
                Ok(Some((packet, len))) => {
                    packets.push(ReceivedPacket::from_packet(&packet));
                    offset += len;
                }
                Ok(None) => break,
                Err(e) => {
                    packets.push(ReceivedPacket::Malformed(e));
                    offset = inbound.len();
                    break;
                }
            }
        }
        state.clients[self.client].inbound = inbound[offset..].to_vec();

        for packet in packets {
            state.handle(self.client, packet);
        }
        Ok(TransportIo::Done(buf.len()))
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<TransportIo, TransportError> {
        let mut state = self.broker.lock();
        let client = &mut state.clients[self.client];
        if !client.link_up {
            return Err(TransportError::PeerClosed);
        }
        if client.outbound.is_empty() {
            return Ok(TransportIo::NoData);
        }
        let n = buf.len().min(client.outbound.len());
        for (slot, byte) in buf.iter_mut().zip(client.outbound.drain(..n)) {
            *slot = byte;
        }
        Ok(TransportIo::Done(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::{ConnectInfo, SubscribeInfo};

    async fn connect(transport: &mut MockTransport) {
        transport
            .connect(
                &ServerInfo::new("mock", 1883),
                &Credentials::default(),
                Duration::from_millis(10),
                Duration::from_millis(10),
            )
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        let len = codec::encode_connect(
            &mut buf,
            &ConnectInfo {
                client_id: "mock-client",
                keep_alive_secs: 60,
                clean_session: true,
                username: None,
                password: None,
                will: None,
            },
        )
        .unwrap();
        transport.send(&buf[..len]).await.unwrap();
    }

    async fn read_all(transport: &mut MockTransport) -> Vec<u8> {
        let mut buf = [0u8; 256];
        match transport.recv(&mut buf).await.unwrap() {
            TransportIo::Done(n) => buf[..n].to_vec(),
            _ => Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_connect_is_acknowledged() {
        let broker = MockBroker::new();
        let mut transport = broker.transport();

        connect(&mut transport).await;

        let bytes = read_all(&mut transport).await;
        let (packet, _) = codec::decode_incremental(&bytes).unwrap().unwrap();
        assert_eq!(
            packet,
            Packet::ConnAck {
                session_present: false,
                return_code: 0
            }
        );
        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_with_rejection_and_echo() {
        // Arrange
        let broker = MockBroker::new();
        broker.reject_filter("denied/#");
        let mut transport = broker.transport();
        connect(&mut transport).await;
        read_all(&mut transport).await;

        // Act
        let mut buf = [0u8; 128];
        let len = codec::encode_subscribe(
            &mut buf,
            7,
            &[
                SubscribeInfo {
                    filter: "echo/+",
                    qos: QoS::AtLeastOnce,
                },
                SubscribeInfo {
                    filter: "denied/#",
                    qos: QoS::AtMostOnce,
                },
            ],
        )
        .unwrap();
        transport.send(&buf[..len]).await.unwrap();
        broker.inject_publish("echo/1", b"hi", QoS::AtLeastOnce);

        // Assert
        let bytes = read_all(&mut transport).await;
        let (suback, used) = codec::decode_incremental(&bytes).unwrap().unwrap();
        assert_eq!(
            suback,
            Packet::SubAck {
                packet_id: 7,
                return_codes: &[1, SUBACK_FAILURE]
            }
        );
        let (publish, _) = codec::decode_incremental(&bytes[used..]).unwrap().unwrap();
        let Packet::Publish(publish) = publish else {
            panic!("expected PUBLISH");
        };
        assert_eq!(publish.topic, "echo/1");
        assert_eq!(publish.qos, QoS::AtLeastOnce);
        assert_eq!(broker.client_subscriptions(0), vec!["echo/+".to_string()]);
    }

    #[tokio::test]
    async fn test_killed_link_fails_io() {
        let broker = MockBroker::new();
        let mut transport = broker.transport();
        connect(&mut transport).await;

        broker.kill_link();

        let mut buf = [0u8; 8];
        assert!(matches!(
            transport.recv(&mut buf).await,
            Err(TransportError::PeerClosed)
        ));
        assert!(matches!(
            transport.send(&[0xC0, 0]).await,
            Err(TransportError::PeerClosed)
        ));
    }

    #[tokio::test]
    async fn test_refused_connects_count_down() {
        let broker = MockBroker::new();
        broker.refuse_connects(1);
        let mut transport = broker.transport();
        let server = ServerInfo::new("mock", 1883);
        let credentials = Credentials::default();
        let timeout = Duration::from_millis(10);

        let first = transport.connect(&server, &credentials, timeout, timeout).await;
        let second = transport.connect(&server, &credentials, timeout, timeout).await;

        assert!(matches!(first, Err(TransportError::Connect { .. })));
        assert!(second.is_ok());
    }
}
