//! Handle that application tasks use to submit work to the agent
//!
//! Every operation validates its arguments, takes a record from the
//! command pool, fills it and enqueues it, waiting at most
//! `CommandInfo::block_time` for each of the two resources. The outcome of
//! the operation itself arrives later through the completion callback.

use super::command::{
    CommandInfo, CommandKind, CommandPayload, OutgoingPublish, Subscription,
};
use super::pool::CommandPool;
use super::queue::{CommandSender, QueueSendError};
use super::session::{AgentStats, ConnectionStatus, StatsSnapshot};
use crate::error::{AgentError, AgentResult};
use crate::protocol::{validate_topic_filter, validate_topic_name, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Fixed header plus the largest remaining-length field
const MAX_FIXED_HEADER: usize = 5;

/// Cloneable producer side of an [`MqttAgent`](super::MqttAgent)
#[derive(Debug, Clone)]
pub struct AgentHandle {
    pool: Arc<CommandPool>,
    queue: CommandSender,
    status: watch::Receiver<ConnectionStatus>,
    stats: Arc<AgentStats>,
    max_packet_size: usize,
}

impl AgentHandle {
    pub(crate) fn new(
        pool: Arc<CommandPool>,
        queue: CommandSender,
        status: watch::Receiver<ConnectionStatus>,
        stats: Arc<AgentStats>,
        max_packet_size: usize,
    ) -> Self {
        Self {
            pool,
            queue,
            status,
            stats,
            max_packet_size,
        }
    }

    /// Queue a PUBLISH. QoS 1 completes on PUBACK, QoS 0 once sent.
    pub async fn publish(&self, publish: OutgoingPublish, info: CommandInfo) -> AgentResult<()> {
        validate_topic_name(&publish.topic)?;
        check_qos(publish.qos)?;

        let id_len = if publish.qos == QoS::AtMostOnce { 0 } else { 2 };
        let packet_len = MAX_FIXED_HEADER + 2 + publish.topic.len() + id_len + publish.payload.len();
        if packet_len > self.max_packet_size {
            return Err(AgentError::parameter(format!(
                "publish of {} bytes exceeds the {}-byte network buffer",
                packet_len, self.max_packet_size
            )));
        }

        self.enqueue(CommandKind::Publish, CommandPayload::Publish(publish), info)
            .await
    }

    /// Queue a SUBSCRIBE. Granted filters with a handler are added to the
    /// subscription table when the SUBACK arrives.
    pub async fn subscribe(
        &self,
        subscriptions: Vec<Subscription>,
        info: CommandInfo,
    ) -> AgentResult<()> {
        if subscriptions.is_empty() {
            return Err(AgentError::parameter("subscribe needs at least one filter"));
        }
        let mut packet_len = MAX_FIXED_HEADER + 2;
        for subscription in &subscriptions {
            validate_topic_filter(&subscription.filter)?;
            check_qos(subscription.qos)?;
            packet_len += 2 + subscription.filter.len() + 1;
        }
        self.check_packet_len(packet_len)?;

        self.enqueue(
            CommandKind::Subscribe,
            CommandPayload::Subscribe(subscriptions),
            info,
        )
        .await
    }

    /// Queue an UNSUBSCRIBE. The filters leave the subscription table when
    /// the UNSUBACK arrives.
    pub async fn unsubscribe(&self, filters: Vec<Arc<str>>, info: CommandInfo) -> AgentResult<()> {
        if filters.is_empty() {
            return Err(AgentError::parameter("unsubscribe needs at least one filter"));
        }
        let mut packet_len = MAX_FIXED_HEADER + 2;
        for filter in &filters {
            validate_topic_filter(filter)?;
            packet_len += 2 + filter.len();
        }
        self.check_packet_len(packet_len)?;

        self.enqueue(
            CommandKind::Unsubscribe,
            CommandPayload::Unsubscribe(filters),
            info,
        )
        .await
    }

    /// Ask the agent to open a new session. Mostly useful after a
    /// Disconnect when the command loop is run again.
    pub async fn connect(&self, clean_session: bool, info: CommandInfo) -> AgentResult<()> {
        self.enqueue(
            CommandKind::Connect,
            CommandPayload::Connect { clean_session },
            info,
        )
        .await
    }

    pub async fn ping(&self, info: CommandInfo) -> AgentResult<()> {
        self.enqueue(CommandKind::Ping, CommandPayload::Empty, info)
            .await
    }

    /// Send DISCONNECT and stop the command loop with `LoopExit::Disconnected`.
    pub async fn disconnect(&self, info: CommandInfo) -> AgentResult<()> {
        self.enqueue(CommandKind::Disconnect, CommandPayload::Empty, info)
            .await
    }

    /// Wake the agent so it drains inbound data promptly.
    pub async fn process_incoming(&self, info: CommandInfo) -> AgentResult<()> {
        self.enqueue(CommandKind::ProcessIncoming, CommandPayload::Empty, info)
            .await
    }

    /// Stop the agent. Pending commands complete with `Terminated`.
    pub async fn terminate(&self, info: CommandInfo) -> AgentResult<()> {
        self.enqueue(CommandKind::Terminate, CommandPayload::Empty, info)
            .await
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Wait until the status satisfies `predicate`, for at most `timeout`.
    pub async fn wait_for_status<F>(&self, timeout: Duration, predicate: F) -> Option<ConnectionStatus>
    where
        F: FnMut(&ConnectionStatus) -> bool,
    {
        let mut status = self.status.clone();
        let reached = match tokio::time::timeout(timeout, status.wait_for(predicate)).await {
            Ok(Ok(current)) => Some(*current),
            _ => None,
        };
        reached
    }

    pub async fn wait_until_connected(&self, timeout: Duration) -> bool {
        self.wait_for_status(timeout, |status| status.is_connected())
            .await
            .is_some()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Free command records
    pub fn pool_available(&self) -> usize {
        self.pool.available()
    }

    fn check_packet_len(&self, packet_len: usize) -> AgentResult<()> {
        if packet_len > self.max_packet_size {
            return Err(AgentError::parameter(format!(
                "request of {} bytes exceeds the {}-byte network buffer",
                packet_len, self.max_packet_size
            )));
        }
        Ok(())
    }

    async fn enqueue(
        &self,
        kind: CommandKind,
        payload: CommandPayload,
        info: CommandInfo,
    ) -> AgentResult<()> {
        let CommandInfo {
            completion,
            block_time,
        } = info;

        let Some(mut command) = self.pool.acquire(block_time).await else {
            warn!(?kind, waited = ?block_time, "No free command record");
            return Err(AgentError::PoolExhausted { waited: block_time });
        };
        command.fill(kind, payload, completion);

        match self.queue.send(command, block_time).await {
            Ok(()) => {
                debug!(?kind, "Command enqueued");
                Ok(())
            }
            Err(QueueSendError::Full(command)) => {
                self.pool.release(command);
                warn!(?kind, waited = ?block_time, "Command queue full");
                Err(AgentError::QueueFull { waited: block_time })
            }
            Err(QueueSendError::Closed(command)) => {
                self.pool.release(command);
                warn!(?kind, "Agent no longer accepts commands");
                Err(AgentError::AgentStopped)
            }
        }
    }
}

fn check_qos(qos: QoS) -> AgentResult<()> {
    if qos == QoS::ExactlyOnce {
        return Err(AgentError::parameter("QoS 2 is not supported"));
    }
    Ok(())
}
