//! The agent task: owns the MQTT session and serializes every command onto
//! one connection
//!
//! Each loop iteration reads the socket and dispatches inbound packets,
//! transmits at most one command, services keep-alive, and then waits
//! briefly on the command queue if nothing happened. Transport failures
//! send the agent through reconnect-with-backoff and session resumption
//! without leaving the loop.

use super::backoff::{Backoff, BackoffStep};
use super::command::{
    Command, CommandKind, CommandPayload, CommandStatus, IncomingPublishCallback, ReturnInfo,
    Subscription,
};
use super::facade::AgentHandle;
use super::inflight::InFlightTable;
use super::pool::CommandPool;
use super::queue::{command_queue, CommandReceiver, Received};
use super::session::{AgentStats, ConnectionStatus, KeepAlive, KeepAliveAction, SessionState};
use super::subscriptions::SubscriptionTable;
use super::AgentSettings;
use crate::command_span;
use crate::error::{AgentError, AgentResult, ErrorKind};
use crate::protocol::codec::{self, CodecError, ConnectInfo, Packet, SubscribeInfo, SUBACK_FAILURE};
use crate::protocol::{PublishInfo, QoS};
use crate::transport::{SecureTransport, TransportError, TransportIo};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// Pause between reads while waiting for CONNACK
const CONNACK_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Smallest QoS 1 PUBLISH frame: header, topic length, one-byte topic, packet id
const MIN_QOS1_PUBLISH_LEN: usize = 7;

const PUBACK_LEN: usize = 4;

/// Why the command loop returned normally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// A Terminate command shut the agent down.
    Terminated,
    /// A Disconnect command closed the session. The agent can connect again.
    Disconnected,
}

enum Flow {
    Continue,
    Reconnect,
    Exit(LoopExit),
    Terminate(Command),
}

/// Single-connection MQTT agent
pub struct MqttAgent<T> {
    settings: AgentSettings,
    transport: T,
    transport_open: bool,
    pool: Arc<CommandPool>,
    queue: CommandReceiver,
    /// Commands picked up while idling, dispatched ahead of the queue
    pending: VecDeque<Command>,
    /// Packet ids of inbound QoS 1 publishes awaiting our PUBACK. Sized for
    /// a full receive buffer and flushed after every read.
    pubacks: Vec<u16>,
    inflight: InFlightTable,
    subscriptions: SubscriptionTable,
    unsolicited: Option<IncomingPublishCallback>,
    state: SessionState,
    status_tx: watch::Sender<ConnectionStatus>,
    stats: Arc<AgentStats>,
    tx_buf: Vec<u8>,
    rx_buf: Vec<u8>,
    rx_len: usize,
}

impl<T: SecureTransport> MqttAgent<T> {
    /// Allocate buffers, pool, queue and subscription table.
    pub fn new(settings: AgentSettings, transport: T) -> (Self, AgentHandle) {
        let pool_size = settings.command_pool_size.max(1);
        let buffer_size = settings.network_buffer_size;
        let pool = Arc::new(CommandPool::new(pool_size));
        let (sender, receiver) = command_queue(settings.command_queue_depth);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let stats = Arc::new(AgentStats::default());

        let handle = AgentHandle::new(
            pool.clone(),
            sender,
            status_rx,
            stats.clone(),
            buffer_size,
        );

        let agent = Self {
            transport,
            transport_open: false,
            pool,
            queue: receiver,
            pending: VecDeque::with_capacity(settings.command_queue_depth.max(1)),
            pubacks: Vec::with_capacity(buffer_size / MIN_QOS1_PUBLISH_LEN + 1),
            // One slot beyond the pool for the agent's own resubscribe
            inflight: InFlightTable::new(pool_size + 1),
            subscriptions: SubscriptionTable::new(settings.subscription_capacity),
            unsolicited: None,
            state: SessionState::Disconnected,
            status_tx,
            stats,
            tx_buf: vec![0; buffer_size],
            rx_buf: vec![0; buffer_size],
            rx_len: 0,
            settings,
        };
        (agent, handle)
    }

    /// Handler for inbound publishes that match no subscription.
    pub fn set_unsolicited_publish_handler<F>(&mut self, handler: F)
    where
        F: Fn(&PublishInfo<'_>) + Send + Sync + 'static,
    {
        self.unsolicited = Some(Arc::new(handler));
    }

    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.subscriptions
    }

    /// Direct table access, for registering callbacks before the loop runs.
    pub fn subscriptions_mut(&mut self) -> &mut SubscriptionTable {
        &mut self.subscriptions
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.status()
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Commands awaiting an acknowledgement
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    /// Open the transport and exchange CONNECT/CONNACK once.
    ///
    /// Returns the broker's session-present flag.
    pub async fn connect(&mut self, clean_session: bool) -> AgentResult<bool> {
        self.set_state(SessionState::Connecting);
        match self.open_session(clean_session).await {
            Ok(session_present) => {
                let keep_alive = KeepAlive::new(self.settings.keep_alive, Instant::now());
                self.set_state(SessionState::Connected(keep_alive));
                info!(
                    client_id = %self.settings.client_id,
                    session_present,
                    "MQTT session established with {}",
                    self.settings.server
                );
                Ok(session_present)
            }
            Err(e) => {
                self.close_transport().await;
                self.set_state(SessionState::Disconnected);
                Err(e)
            }
        }
    }

    /// [`connect`](Self::connect) plus session resumption, retried under
    /// the backoff engine. The first attempt is made immediately.
    pub async fn connect_with_backoff(&mut self, clean_session: bool) -> AgentResult<bool> {
        let mut backoff = self.new_backoff();
        loop {
            let error = match self.establish(clean_session).await {
                Ok(session_present) => return Ok(session_present),
                Err(e) => e,
            };
            match backoff.next_random() {
                BackoffStep::Retry { attempt, delay } => {
                    warn!(
                        error = %error,
                        "Connection attempt failed, retry {}/{} in {}ms",
                        attempt,
                        backoff.max_attempts(),
                        delay.as_millis()
                    );
                    self.set_state(SessionState::Reconnecting(backoff));
                    tokio::time::sleep(delay).await;
                }
                BackoffStep::Exhausted => {
                    error!(error = %error, "Giving up on connecting to the broker");
                    self.set_state(SessionState::Disconnected);
                    return Err(AgentError::BackoffExhausted {
                        attempts: backoff.attempts_done(),
                    });
                }
            }
        }
    }

    /// Restore session state after a CONNACK.
    ///
    /// With a resumed broker session, in-flight publishes are retransmitted
    /// with `dup` set. Without one, every table filter is first resubscribed
    /// in one SUBSCRIBE at QoS 1, then the in-flight commands are sent again.
    /// Packet identifiers are preserved either way.
    pub async fn resume_session(&mut self, session_present: bool) -> AgentResult<()> {
        if !session_present {
            // Superseded by the resubscribe below
            let stale = self.inflight.discard_internal(CommandKind::Subscribe);
            if stale > 0 {
                debug!(stale, "Dropped unacknowledged resubscribe requests");
            }
        }
        let retransmit = self.inflight.len();

        if !session_present {
            let filters = self.subscriptions.distinct_filters();
            if !filters.is_empty() {
                info!("Resubscribing to {} topic filters", filters.len());
                let subscriptions = filters
                    .into_iter()
                    .map(|filter| Subscription::new(filter, QoS::AtLeastOnce))
                    .collect();
                let command = Command::unpooled(
                    CommandKind::Subscribe,
                    CommandPayload::Subscribe(subscriptions),
                );
                if self.inflight.is_full() {
                    return Err(AgentError::session_resume(
                        "no in-flight slot left for the resubscribe request",
                    ));
                }
                self.transmit(command).await?;
            }
        }

        for index in 0..retransmit {
            let len = match self.inflight.get(index) {
                Some(command) => {
                    let dup = session_present && command.kind == CommandKind::Publish;
                    encode_command(&mut self.tx_buf, command, dup)?
                }
                None => break,
            };
            self.send_buffer(len).await?;
        }
        if retransmit > 0 {
            info!(
                session_present,
                "Retransmitted {} in-flight commands", retransmit
            );
        }
        Ok(())
    }

    /// Run until Terminate, Disconnect, or a fatal error.
    ///
    /// Transport failures are handled internally by reconnecting. When the
    /// backoff is exhausted every pending command fails and the error is
    /// returned; the caller decides whether to start over.
    pub async fn command_loop(&mut self) -> AgentResult<LoopExit> {
        info!(client_id = %self.settings.client_id, "Agent command loop started");

        if !self.state.status().is_connected() {
            if let Err(e) = self.reconnect().await {
                self.fail_pending(CommandStatus::Failed);
                return Err(e);
            }
        }

        loop {
            match self.iterate().await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit(exit)) => {
                    info!(?exit, "Agent command loop finished");
                    return Ok(exit);
                }
                Ok(Flow::Terminate(command)) => {
                    self.terminate(command).await;
                    info!("Agent command loop terminated");
                    return Ok(LoopExit::Terminated);
                }
                Ok(Flow::Reconnect) => {
                    if let Err(e) = self.reconnect().await {
                        self.fail_pending(CommandStatus::Failed);
                        return Err(e);
                    }
                }
                Err(e) if e.kind() == ErrorKind::Transport => {
                    warn!(error = %e, "Connection lost");
                    if let Err(e) = self.reconnect().await {
                        self.fail_pending(CommandStatus::Failed);
                        return Err(e);
                    }
                }
                Err(e) => {
                    error!(error = %e, "Command loop stopping on unrecoverable error");
                    self.close_transport().await;
                    self.set_state(SessionState::Disconnected);
                    self.fail_pending(CommandStatus::Failed);
                    return Err(e);
                }
            }
        }
    }

    async fn iterate(&mut self) -> AgentResult<Flow> {
        let had_input = self.process_input().await?;

        let command = match self.pending.pop_front() {
            Some(command) => Some(command),
            None => match self.queue.try_recv() {
                Received::Command(command) => Some(command),
                Received::Empty | Received::Closed => None,
            },
        };
        let had_command = command.is_some();
        if let Some(command) = command {
            let span = command_span!(kind = ?command.kind);
            match self.dispatch(command).instrument(span).await? {
                Flow::Continue => {}
                other => return Ok(other),
            }
        }

        self.service_keep_alive().await?;

        if !had_input && !had_command && self.pending.is_empty() {
            match self.queue.recv(self.settings.loop_idle).await {
                Received::Command(command) => self.pending.push_back(command),
                Received::Empty => {}
                Received::Closed => tokio::time::sleep(self.settings.loop_idle).await,
            }
        }
        Ok(Flow::Continue)
    }

    // --- Inbound ---

    /// Read what the transport has and handle every complete packet.
    async fn process_input(&mut self) -> AgentResult<bool> {
        let received = self.read_transport().await?;
        if self.rx_len > 0 {
            self.drain_frames()?;
        }
        self.flush_pubacks().await?;
        Ok(received)
    }

    /// Acknowledge every QoS 1 publish handled since the last flush.
    async fn flush_pubacks(&mut self) -> AgentResult<()> {
        if self.pubacks.is_empty() {
            return Ok(());
        }
        let result = self.send_pubacks().await;
        debug!(count = self.pubacks.len(), "Acknowledged inbound publishes");
        self.pubacks.clear();
        result
    }

    async fn send_pubacks(&mut self) -> AgentResult<()> {
        let mut len = 0;
        let mut index = 0;
        while index < self.pubacks.len() {
            if self.tx_buf.len() - len < PUBACK_LEN {
                self.send_buffer(len).await?;
                len = 0;
            }
            len += codec::encode_puback(&mut self.tx_buf[len..], self.pubacks[index])?;
            index += 1;
        }
        if len > 0 {
            self.send_buffer(len).await?;
        }
        Ok(())
    }

    async fn read_transport(&mut self) -> AgentResult<bool> {
        if !self.transport_open {
            return Err(TransportError::NotConnected.into());
        }
        if self.rx_len == self.rx_buf.len() {
            return Err(AgentError::protocol(format!(
                "inbound packet exceeds the {}-byte network buffer",
                self.rx_buf.len()
            )));
        }
        match self.transport.recv(&mut self.rx_buf[self.rx_len..]).await? {
            TransportIo::Done(n) if n > 0 => {
                self.rx_len += n;
                if let Some(keep_alive) = self.state.keep_alive_mut() {
                    keep_alive.on_rx(Instant::now());
                }
                Ok(true)
            }
            TransportIo::Done(_) | TransportIo::WantRetry | TransportIo::NoData => Ok(false),
        }
    }

    fn drain_frames(&mut self) -> AgentResult<()> {
        // Decoded packets borrow the buffer while handlers need `&mut self`.
        let buf = std::mem::take(&mut self.rx_buf);
        let mut offset = 0;
        let outcome = loop {
            match codec::frame_length(&buf[offset..self.rx_len]) {
                Ok(Some(len)) => {
                    let frame = &buf[offset..offset + len];
                    offset += len;
                    match codec::decode_packet(frame) {
                        Ok(packet) => self.handle_packet(packet),
                        Err(e) => {
                            self.stats.protocol_error();
                            warn!(error = %e, "Dropping malformed packet");
                        }
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(AgentError::from(e)),
            }
        };
        self.rx_buf = buf;
        self.consume_rx(offset);
        outcome
    }

    fn consume_rx(&mut self, len: usize) {
        self.rx_buf.copy_within(len..self.rx_len, 0);
        self.rx_len -= len;
    }

    fn handle_packet(&mut self, packet: Packet<'_>) {
        match packet {
            Packet::Publish(publish) => self.handle_publish(&publish),
            Packet::PubAck { packet_id } => self.handle_ack(packet_id, CommandKind::Publish, &[]),
            Packet::SubAck {
                packet_id,
                return_codes,
            } => self.handle_ack(packet_id, CommandKind::Subscribe, return_codes),
            Packet::UnsubAck { packet_id } => {
                self.handle_ack(packet_id, CommandKind::Unsubscribe, &[])
            }
            Packet::PingResp => {
                if let Some(keep_alive) = self.state.keep_alive_mut() {
                    keep_alive.on_pingresp(Instant::now());
                }
                debug!("PINGRESP received");
            }
            other => {
                self.stats.protocol_error();
                warn!(packet = other.name(), "Dropping unexpected packet from broker");
            }
        }
    }

    fn handle_publish(&mut self, publish: &PublishInfo<'_>) {
        match (publish.qos, publish.packet_id) {
            (QoS::AtLeastOnce, Some(packet_id)) => {
                if self.pubacks.len() < self.pubacks.capacity() {
                    self.pubacks.push(packet_id);
                } else {
                    warn!(packet_id, "PUBACK backlog full, broker will redeliver");
                }
            }
            (QoS::ExactlyOnce, _) => {
                self.stats.protocol_error();
                warn!(topic = publish.topic, "Dropping QoS 2 publish, QoS 2 is not supported");
                return;
            }
            _ => {}
        }

        let routed = self.subscriptions.route_incoming(publish);
        if !routed {
            match &self.unsolicited {
                Some(handler) => handler(publish),
                None => warn!(
                    topic = publish.topic,
                    "Incoming publish matched no subscription"
                ),
            }
        }
        self.stats.publish_received(routed);
    }

    fn handle_ack(&mut self, packet_id: u16, kind: CommandKind, return_codes: &[u8]) {
        let Some(command) = self.inflight.take(packet_id, kind) else {
            self.stats.ack_dropped();
            warn!(packet_id, ?kind, "Dropping acknowledgement for unknown packet id");
            return;
        };

        let info = match (&command.payload, kind) {
            (CommandPayload::Subscribe(subscriptions), CommandKind::Subscribe) => {
                self.apply_suback(subscriptions, return_codes)
            }
            (CommandPayload::Unsubscribe(filters), CommandKind::Unsubscribe) => {
                for filter in filters {
                    self.subscriptions.remove(filter);
                }
                ReturnInfo::new(CommandStatus::Success)
            }
            _ => ReturnInfo::new(CommandStatus::Success),
        };
        self.finish(command, info);
    }

    /// Register granted filters that carry a handler and prune rejected
    /// filters from the table.
    fn apply_suback(&mut self, subscriptions: &[Subscription], return_codes: &[u8]) -> ReturnInfo {
        if return_codes.len() != subscriptions.len() {
            self.stats.protocol_error();
            warn!(
                requested = subscriptions.len(),
                acknowledged = return_codes.len(),
                "SUBACK return code count does not match the request"
            );
        }

        let mut rejected = false;
        let mut registration_failed = false;
        for (index, subscription) in subscriptions.iter().enumerate() {
            let code = return_codes.get(index).copied().unwrap_or(SUBACK_FAILURE);
            if code == SUBACK_FAILURE {
                rejected = true;
                let removed = self.subscriptions.remove(&subscription.filter);
                warn!(
                    filter = %subscription.filter,
                    removed,
                    "Broker rejected subscription"
                );
            } else if let Some(handler) = &subscription.handler {
                if let Err(e) = self
                    .subscriptions
                    .add(subscription.filter.clone(), handler.clone())
                {
                    registration_failed = true;
                    warn!(filter = %subscription.filter, error = %e, "Granted subscription could not be registered");
                }
            }
        }

        let status = if registration_failed {
            CommandStatus::Failed
        } else if rejected {
            CommandStatus::Rejected(SUBACK_FAILURE)
        } else {
            CommandStatus::Success
        };
        ReturnInfo {
            status,
            suback_codes: return_codes.to_vec(),
        }
    }

    // --- Outbound ---

    async fn dispatch(&mut self, command: Command) -> AgentResult<Flow> {
        match command.kind {
            CommandKind::Publish | CommandKind::Subscribe | CommandKind::Unsubscribe => {
                self.transmit(command).await
            }
            CommandKind::Ping => {
                let len = codec::encode_pingreq(&mut self.tx_buf)?;
                if let Err(e) = self.send_buffer(len).await {
                    self.finish(command, ReturnInfo::new(CommandStatus::SendFailed));
                    return Err(e);
                }
                if let Some(keep_alive) = self.state.keep_alive_mut() {
                    keep_alive.on_ping_sent(Instant::now());
                }
                self.finish(command, ReturnInfo::new(CommandStatus::Success));
                Ok(Flow::Continue)
            }
            CommandKind::ProcessIncoming => {
                self.finish(command, ReturnInfo::new(CommandStatus::Success));
                Ok(Flow::Continue)
            }
            CommandKind::Connect => {
                let clean_session = matches!(
                    command.payload,
                    CommandPayload::Connect {
                        clean_session: true
                    }
                );
                match self.establish(clean_session).await {
                    Ok(_) => {
                        self.finish(command, ReturnInfo::new(CommandStatus::Success));
                        Ok(Flow::Continue)
                    }
                    Err(e) => {
                        let status = match e {
                            AgentError::ConnectionRefused { code } => CommandStatus::Rejected(code),
                            _ => CommandStatus::Failed,
                        };
                        warn!(error = %e, "Connect command failed");
                        self.finish(command, ReturnInfo::new(status));
                        Ok(Flow::Reconnect)
                    }
                }
            }
            CommandKind::Disconnect => {
                self.disconnect_session().await;
                self.finish(command, ReturnInfo::new(CommandStatus::Success));
                Ok(Flow::Exit(LoopExit::Disconnected))
            }
            CommandKind::Terminate => Ok(Flow::Terminate(command)),
        }
    }

    /// Serialize and send a Publish/Subscribe/Unsubscribe.
    ///
    /// Commands that await an acknowledgement get a packet identifier and
    /// enter the in-flight table before the bytes go out; if the send then
    /// fails they stay there and are retransmitted after reconnecting.
    async fn transmit(&mut self, mut command: Command) -> AgentResult<Flow> {
        let awaits_ack = command.awaits_ack();
        if awaits_ack {
            let packet_id = if self.inflight.is_full() {
                None
            } else {
                self.inflight.allocate_packet_id()
            };
            let Some(packet_id) = packet_id else {
                warn!(kind = ?command.kind, "In-flight table full, failing command");
                self.finish(command, ReturnInfo::new(CommandStatus::Failed));
                return Ok(Flow::Continue);
            };
            command.packet_id = packet_id;
        }

        let len = match encode_command(&mut self.tx_buf, &command, false) {
            Ok(len) => len,
            Err(e) => {
                self.stats.protocol_error();
                warn!(kind = ?command.kind, error = %e, "Failed to serialize command");
                self.finish(command, ReturnInfo::new(CommandStatus::Failed));
                return Ok(Flow::Continue);
            }
        };

        if awaits_ack {
            let packet_id = command.packet_id;
            if let Err(command) = self.inflight.insert(command) {
                self.finish(command, ReturnInfo::new(CommandStatus::Failed));
                return Ok(Flow::Continue);
            }
            debug!(packet_id, "Command in flight");
            self.send_buffer(len).await?;
        } else {
            if let Err(e) = self.send_buffer(len).await {
                self.finish(command, ReturnInfo::new(CommandStatus::SendFailed));
                return Err(e);
            }
            self.finish(command, ReturnInfo::new(CommandStatus::Success));
        }
        Ok(Flow::Continue)
    }

    async fn send_buffer(&mut self, len: usize) -> AgentResult<()> {
        let limit = self.settings.transport_timeout;
        let deadline = Instant::now() + limit;
        let mut sent = 0;
        while sent < len {
            match self.transport.send(&self.tx_buf[sent..len]).await? {
                TransportIo::Done(n) if n > 0 => sent += n,
                TransportIo::Done(_) | TransportIo::WantRetry | TransportIo::NoData => {
                    if Instant::now() >= deadline {
                        return Err(TransportError::SendTimeout(limit).into());
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
        }
        if let Some(keep_alive) = self.state.keep_alive_mut() {
            keep_alive.on_tx(Instant::now());
        }
        Ok(())
    }

    async fn service_keep_alive(&mut self) -> AgentResult<()> {
        let now = Instant::now();
        let action = match self.state.keep_alive_mut() {
            Some(keep_alive) => keep_alive.poll(now),
            None => return Ok(()),
        };
        match action {
            KeepAliveAction::Idle => Ok(()),
            KeepAliveAction::SendPing => {
                let len = codec::encode_pingreq(&mut self.tx_buf)?;
                self.send_buffer(len).await?;
                if let Some(keep_alive) = self.state.keep_alive_mut() {
                    keep_alive.on_ping_sent(now);
                }
                debug!("Sent PINGREQ");
                Ok(())
            }
            KeepAliveAction::TimedOut => Err(AgentError::KeepAliveTimeout {
                waited: self.settings.keep_alive + self.settings.keep_alive / 2,
            }),
        }
    }

    // --- Session management ---

    async fn open_session(&mut self, clean_session: bool) -> AgentResult<bool> {
        self.close_transport().await;
        let timeout = self.settings.transport_timeout;
        self.transport
            .connect(
                &self.settings.server,
                &self.settings.credentials,
                timeout,
                timeout,
            )
            .await?;
        self.transport_open = true;

        let connect = ConnectInfo {
            client_id: &self.settings.client_id,
            keep_alive_secs: u16::try_from(self.settings.keep_alive.as_secs()).unwrap_or(u16::MAX),
            clean_session,
            username: self.settings.username.as_deref(),
            password: self.settings.password.as_deref().map(str::as_bytes),
            will: None,
        };
        let len = codec::encode_connect(&mut self.tx_buf, &connect)?;
        self.send_buffer(len).await?;
        self.await_connack().await
    }

    async fn await_connack(&mut self) -> AgentResult<bool> {
        let waited = self.settings.connack_timeout;
        let deadline = Instant::now() + waited;
        loop {
            if let Some(len) = codec::frame_length(&self.rx_buf[..self.rx_len])? {
                let result = match codec::decode_packet(&self.rx_buf[..len])? {
                    Packet::ConnAck {
                        session_present,
                        return_code: 0,
                    } => Ok(session_present),
                    Packet::ConnAck { return_code, .. } => {
                        warn!(return_code, "Broker refused connection");
                        Err(AgentError::ConnectionRefused { code: return_code })
                    }
                    other => Err(AgentError::protocol(format!(
                        "expected CONNACK, received {}",
                        other.name()
                    ))),
                };
                // Anything after the CONNACK is left for the command loop.
                self.consume_rx(len);
                return result;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(AgentError::ConnackTimeout { waited });
            }
            if !self.read_transport().await? {
                tokio::time::sleep(CONNACK_POLL_INTERVAL.min(deadline - now)).await;
            }
        }
    }

    /// Connect and resume; closes the transport on any failure.
    async fn establish(&mut self, clean_session: bool) -> AgentResult<bool> {
        let session_present = self.connect(clean_session).await?;
        if let Err(e) = self.resume_session(session_present).await {
            self.close_transport().await;
            self.set_state(SessionState::Disconnected);
            return Err(e);
        }
        Ok(session_present)
    }

    /// Reconnect with `clean_session = false`, sleeping the backoff delay
    /// before every attempt.
    async fn reconnect(&mut self) -> AgentResult<()> {
        self.close_transport().await;
        self.stats.reconnected();
        // PUBACKs for the old connection; a resumed session redelivers.
        self.pubacks.clear();

        let mut backoff = self.new_backoff();
        loop {
            let (attempt, delay) = match backoff.next_random() {
                BackoffStep::Retry { attempt, delay } => (attempt, delay),
                BackoffStep::Exhausted => {
                    self.set_state(SessionState::Disconnected);
                    error!("Reconnection failed after {} attempts", backoff.attempts_done());
                    return Err(AgentError::BackoffExhausted {
                        attempts: backoff.attempts_done(),
                    });
                }
            };
            self.set_state(SessionState::Reconnecting(backoff));
            info!(
                "Attempting reconnection {}/{} after {}ms delay",
                attempt,
                backoff.max_attempts(),
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;

            match self.establish(false).await {
                Ok(session_present) => {
                    info!(attempt, session_present, "Reconnected to broker");
                    return Ok(());
                }
                Err(e) => warn!(attempt, error = %e, "Reconnection attempt failed"),
            }
        }
    }

    async fn terminate(&mut self, command: Command) {
        info!("Terminating agent");
        self.set_state(SessionState::Terminating);
        self.queue.close();
        self.fail_pending(CommandStatus::Terminated);
        self.disconnect_session().await;
        self.finish(command, ReturnInfo::new(CommandStatus::Success));
    }

    /// Send DISCONNECT if possible and close the transport.
    async fn disconnect_session(&mut self) {
        if self.transport_open {
            match codec::encode_disconnect(&mut self.tx_buf) {
                Ok(len) => {
                    if let Err(e) = self.send_buffer(len).await {
                        debug!(error = %e, "DISCONNECT not delivered");
                    }
                }
                Err(e) => debug!(error = %e, "Could not encode DISCONNECT"),
            }
        }
        self.close_transport().await;
        self.set_state(SessionState::Disconnected);
    }

    /// Complete every in-flight, pending and queued command with `status`.
    fn fail_pending(&mut self, status: CommandStatus) {
        let info = ReturnInfo::new(status);
        let inflight: Vec<Command> = self.inflight.drain().collect();
        let pending: Vec<Command> = self.pending.drain(..).collect();
        let count = inflight.len() + pending.len();
        for command in inflight.into_iter().chain(pending) {
            self.finish(command, info.clone());
        }

        let mut queued = 0;
        while let Received::Command(command) = self.queue.try_recv() {
            self.finish(command, info.clone());
            queued += 1;
        }
        if count + queued > 0 {
            info!(?status, "Failed {} pending commands", count + queued);
        }
    }

    async fn close_transport(&mut self) {
        if self.transport_open {
            self.transport.disconnect().await;
            self.transport_open = false;
        }
        self.rx_len = 0;
    }

    fn finish(&mut self, mut command: Command, info: ReturnInfo) {
        debug!(
            kind = ?command.kind,
            packet_id = command.packet_id,
            status = ?info.status,
            "Command completed"
        );
        command.complete(&info);
        self.stats.command_processed();
        self.pool.release(command);
    }

    fn set_state(&mut self, state: SessionState) {
        let previous = self.state.status();
        self.state = state;
        let current = self.state.status();
        if previous != current {
            info!(from = %previous, to = %current, "Connection state changed");
            self.status_tx.send_replace(current);
        }
    }

    fn new_backoff(&self) -> Backoff {
        let retry = &self.settings.retry;
        Backoff::new(retry.base_backoff, retry.max_backoff, retry.max_attempts)
    }
}

/// Encode a queued command into `buf`.
fn encode_command(buf: &mut [u8], command: &Command, dup: bool) -> Result<usize, CodecError> {
    match &command.payload {
        CommandPayload::Publish(publish) => {
            codec::encode_publish(buf, &publish.as_info(command.packet_id, dup))
        }
        CommandPayload::Subscribe(subscriptions) => {
            let filters: Vec<SubscribeInfo<'_>> = subscriptions
                .iter()
                .map(|s| SubscribeInfo {
                    filter: &s.filter,
                    qos: s.qos,
                })
                .collect();
            codec::encode_subscribe(buf, command.packet_id, &filters)
        }
        CommandPayload::Unsubscribe(filters) => {
            codec::encode_unsubscribe(buf, command.packet_id, filters.as_slice())
        }
        CommandPayload::Empty | CommandPayload::Connect { .. } => Err(
            CodecError::MalformedPacket("command has no packet representation"),
        ),
    }
}
