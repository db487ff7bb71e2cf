//! Command records handed from application tasks to the agent

use crate::protocol::{PublishInfo, QoS};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Invoked once when a command is finalized, on the agent task.
pub type CompletionCallback = Box<dyn FnOnce(&ReturnInfo) + Send>;

/// Invoked for every inbound PUBLISH routed to a subscription, on the agent task.
///
/// Must not block; hand work off to another task instead.
pub type IncomingPublishCallback = Arc<dyn Fn(&PublishInfo<'_>) + Send + Sync>;

/// Command kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Connect,
    Publish,
    Subscribe,
    Unsubscribe,
    Ping,
    Disconnect,
    Terminate,
    ProcessIncoming,
}

impl CommandKind {
    /// Whether the broker answers this command with an acknowledgement that
    /// must be correlated by packet identifier.
    pub fn awaits_ack(self) -> bool {
        matches!(self, CommandKind::Subscribe | CommandKind::Unsubscribe)
    }
}

/// Final state of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Success,
    /// Cancelled by Terminate or loop shutdown
    Terminated,
    /// Refused by the broker with the given return code
    Rejected(u8),
    /// The transport failed while sending a command that cannot be retried
    SendFailed,
    Failed,
}

/// What a completion callback is told
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnInfo {
    pub status: CommandStatus,
    /// Per-filter SUBACK return codes, in request order
    pub suback_codes: Vec<u8>,
}

impl ReturnInfo {
    pub fn new(status: CommandStatus) -> Self {
        Self {
            status,
            suback_codes: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Success
    }
}

/// Per-call options for every facade operation
pub struct CommandInfo {
    pub completion: Option<CompletionCallback>,
    /// Longest time to wait for a free record and again for queue space
    pub block_time: Duration,
}

impl CommandInfo {
    pub fn new(block_time: Duration) -> Self {
        Self {
            completion: None,
            block_time,
        }
    }

    pub fn with_completion<F>(mut self, completion: F) -> Self
    where
        F: FnOnce(&ReturnInfo) + Send + 'static,
    {
        self.completion = Some(Box::new(completion));
        self
    }

    /// Completion delivered through a oneshot channel.
    pub fn with_notifier(block_time: Duration) -> (Self, oneshot::Receiver<ReturnInfo>) {
        let (tx, rx) = oneshot::channel();
        let info = Self::new(block_time).with_completion(move |result: &ReturnInfo| {
            let _ = tx.send(result.clone());
        });
        (info, rx)
    }
}

impl Default for CommandInfo {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl fmt::Debug for CommandInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandInfo")
            .field("completion", &self.completion.is_some())
            .field("block_time", &self.block_time)
            .finish()
    }
}

/// Owned PUBLISH request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingPublish {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl OutgoingPublish {
    pub fn new(topic: impl Into<Arc<str>>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
        }
    }

    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Borrowed view for the encoder
    pub fn as_info(&self, packet_id: u16, dup: bool) -> PublishInfo<'_> {
        PublishInfo {
            topic: &self.topic,
            payload: &self.payload,
            qos: self.qos,
            retain: self.retain,
            dup,
            packet_id: (self.qos != QoS::AtMostOnce).then_some(packet_id),
        }
    }
}

/// One filter of a SUBSCRIBE request
///
/// With a handler, the agent adds `(filter, handler)` to its subscription
/// table once the broker grants the filter.
#[derive(Clone)]
pub struct Subscription {
    pub filter: Arc<str>,
    pub qos: QoS,
    pub handler: Option<IncomingPublishCallback>,
}

impl Subscription {
    pub fn new(filter: impl Into<Arc<str>>, qos: QoS) -> Self {
        Self {
            filter: filter.into(),
            qos,
            handler: None,
        }
    }

    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&PublishInfo<'_>) + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn with_shared_handler(mut self, handler: IncomingPublishCallback) -> Self {
        self.handler = Some(handler);
        self
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("filter", &self.filter)
            .field("qos", &self.qos)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// Kind-specific command data
#[derive(Debug, Default)]
pub enum CommandPayload {
    #[default]
    Empty,
    Connect {
        clean_session: bool,
    },
    Publish(OutgoingPublish),
    Subscribe(Vec<Subscription>),
    Unsubscribe(Vec<Arc<str>>),
}

/// A pending operation
///
/// Records come from a [`CommandPool`](super::pool::CommandPool) and go back
/// to it once completed. A record is never cloned, so exactly one holder
/// owns it at a time.
pub struct Command {
    pub(crate) kind: CommandKind,
    pub(crate) payload: CommandPayload,
    pub(crate) completion: Option<CompletionCallback>,
    pub(crate) packet_id: u16,
    pub(crate) enqueued_at: Option<Instant>,
    pool_id: Option<u64>,
}

impl Command {
    pub(crate) fn pooled(pool_id: u64) -> Self {
        Self {
            pool_id: Some(pool_id),
            ..Self::unpooled(CommandKind::ProcessIncoming, CommandPayload::Empty)
        }
    }

    /// A record created by the agent itself; releasing it is a no-op.
    pub(crate) fn unpooled(kind: CommandKind, payload: CommandPayload) -> Self {
        Self {
            kind,
            payload,
            completion: None,
            packet_id: 0,
            enqueued_at: None,
            pool_id: None,
        }
    }

    pub(crate) fn fill(
        &mut self,
        kind: CommandKind,
        payload: CommandPayload,
        completion: Option<CompletionCallback>,
    ) {
        self.kind = kind;
        self.payload = payload;
        self.completion = completion;
        self.packet_id = 0;
        self.enqueued_at = Some(Instant::now());
    }

    pub(crate) fn reset(&mut self) {
        self.kind = CommandKind::ProcessIncoming;
        self.payload = CommandPayload::Empty;
        self.completion = None;
        self.packet_id = 0;
        self.enqueued_at = None;
    }

    pub(crate) fn pool_id(&self) -> Option<u64> {
        self.pool_id
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn packet_id(&self) -> u16 {
        self.packet_id
    }

    /// Whether the command occupies an in-flight slot until acknowledged.
    pub(crate) fn awaits_ack(&self) -> bool {
        match (&self.kind, &self.payload) {
            (CommandKind::Publish, CommandPayload::Publish(publish)) => {
                publish.qos != QoS::AtMostOnce
            }
            (kind, _) => kind.awaits_ack(),
        }
    }

    /// Run the completion callback, at most once.
    pub(crate) fn complete(&mut self, info: &ReturnInfo) {
        if let Some(completion) = self.completion.take() {
            completion(info);
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("kind", &self.kind)
            .field("packet_id", &self.packet_id)
            .field("pooled", &self.pool_id.is_some())
            .finish()
    }
}
