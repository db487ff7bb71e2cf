//! Session state, keep-alive tracking and the status snapshot producers see

use super::backoff::Backoff;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Connection status as observed by application tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Terminating,
}

impl ConnectionStatus {
    pub fn is_connected(self) -> bool {
        self == ConnectionStatus::Connected
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Reconnecting { attempt } => write!(f, "reconnecting ({attempt})"),
            ConnectionStatus::Terminating => write!(f, "terminating"),
        }
    }
}

/// Agent-private session state
#[derive(Debug)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected(KeepAlive),
    Reconnecting(Backoff),
    Terminating,
}

impl SessionState {
    pub fn status(&self) -> ConnectionStatus {
        match self {
            SessionState::Disconnected => ConnectionStatus::Disconnected,
            SessionState::Connecting => ConnectionStatus::Connecting,
            SessionState::Connected(_) => ConnectionStatus::Connected,
            SessionState::Reconnecting(backoff) => ConnectionStatus::Reconnecting {
                attempt: backoff.attempts_done(),
            },
            SessionState::Terminating => ConnectionStatus::Terminating,
        }
    }

    pub fn keep_alive_mut(&mut self) -> Option<&mut KeepAlive> {
        match self {
            SessionState::Connected(keep_alive) => Some(keep_alive),
            _ => None,
        }
    }
}

/// What the keep-alive timer wants done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    Idle,
    SendPing,
    /// A PINGREQ went unanswered for 1.5 intervals.
    TimedOut,
}

/// Keep-alive bookkeeping for a connected session
#[derive(Debug, Clone)]
pub struct KeepAlive {
    interval: Duration,
    last_tx: Instant,
    last_rx: Instant,
    ping_sent_at: Option<Instant>,
}

impl KeepAlive {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last_tx: now,
            last_rx: now,
            ping_sent_at: None,
        }
    }

    pub fn on_tx(&mut self, now: Instant) {
        self.last_tx = now;
    }

    pub fn on_rx(&mut self, now: Instant) {
        self.last_rx = now;
    }

    pub fn on_ping_sent(&mut self, now: Instant) {
        self.ping_sent_at = Some(now);
        self.last_tx = now;
    }

    pub fn on_pingresp(&mut self, now: Instant) {
        self.ping_sent_at = None;
        self.last_rx = now;
    }

    pub fn ping_outstanding(&self) -> bool {
        self.ping_sent_at.is_some()
    }

    pub fn last_rx(&self) -> Instant {
        self.last_rx
    }

    /// A zero interval disables keep-alive.
    pub fn poll(&self, now: Instant) -> KeepAliveAction {
        if self.interval.is_zero() {
            return KeepAliveAction::Idle;
        }
        match self.ping_sent_at {
            Some(sent) if now.duration_since(sent) >= self.interval + self.interval / 2 => {
                KeepAliveAction::TimedOut
            }
            Some(_) => KeepAliveAction::Idle,
            None if now.duration_since(self.last_tx) >= self.interval => KeepAliveAction::SendPing,
            None => KeepAliveAction::Idle,
        }
    }
}

/// Counters shared between the agent and its handles
#[derive(Debug, Default)]
pub struct AgentStats {
    commands_processed: AtomicU64,
    publishes_received: AtomicU64,
    publishes_routed: AtomicU64,
    publishes_unsolicited: AtomicU64,
    acks_dropped: AtomicU64,
    protocol_errors: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time copy of [`AgentStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub commands_processed: u64,
    pub publishes_received: u64,
    pub publishes_routed: u64,
    pub publishes_unsolicited: u64,
    pub acks_dropped: u64,
    pub protocol_errors: u64,
    pub reconnects: u64,
}

impl AgentStats {
    pub(crate) fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn publish_received(&self, routed: bool) {
        self.publishes_received.fetch_add(1, Ordering::Relaxed);
        if routed {
            self.publishes_routed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.publishes_unsolicited.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn ack_dropped(&self) {
        self.acks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reconnected(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            commands_processed: self.commands_processed.load(Ordering::Relaxed),
            publishes_received: self.publishes_received.load(Ordering::Relaxed),
            publishes_routed: self.publishes_routed.load(Ordering::Relaxed),
            publishes_unsolicited: self.publishes_unsolicited.load(Ordering::Relaxed),
            acks_dropped: self.acks_dropped.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}
