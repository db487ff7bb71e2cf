//! The MQTT agent
//!
//! One [`MqttAgent`] task owns the broker connection. Any number of
//! application tasks submit work through cloned [`AgentHandle`]s; each
//! request becomes a [`Command`] drawn from a fixed pool, travels through a
//! bounded queue, and is completed on the agent task.

pub mod backoff;
pub mod command;
pub mod core;
pub mod facade;
pub mod inflight;
pub mod pool;
pub mod queue;
pub mod session;
pub mod subscriptions;

pub use backoff::{Backoff, BackoffStep};
pub use command::{
    Command, CommandInfo, CommandKind, CommandStatus, CompletionCallback, IncomingPublishCallback,
    OutgoingPublish, ReturnInfo, Subscription,
};
pub use self::core::{LoopExit, MqttAgent};
pub use facade::AgentHandle;
pub use pool::CommandPool;
pub use session::{AgentStats, ConnectionStatus, StatsSnapshot};
pub use subscriptions::{SubscriptionError, SubscriptionTable};

use crate::transport::{Credentials, ServerInfo};
use std::fmt;
use std::time::Duration;

/// Reconnect backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(5000),
        }
    }
}

/// Everything the agent needs at construction time
#[derive(Clone)]
pub struct AgentSettings {
    pub client_id: String,
    /// Zero disables keep-alive.
    pub keep_alive: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
    pub server: ServerInfo,
    pub credentials: Credentials,
    pub connack_timeout: Duration,
    /// Applies to each transport send and receive
    pub transport_timeout: Duration,
    pub command_queue_depth: usize,
    pub command_pool_size: usize,
    pub subscription_capacity: usize,
    /// Size of each of the transmit and receive buffers
    pub network_buffer_size: usize,
    pub retry: RetrySettings,
    /// How long an idle loop iteration waits on the command queue
    pub loop_idle: Duration,
}

impl AgentSettings {
    pub fn new(client_id: impl Into<String>, server: ServerInfo) -> Self {
        Self {
            client_id: client_id.into(),
            server,
            ..Self::default()
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            keep_alive: Duration::from_secs(60),
            username: None,
            password: None,
            server: ServerInfo::new("localhost", 1883),
            credentials: Credentials::default(),
            connack_timeout: Duration::from_millis(1000),
            transport_timeout: Duration::from_millis(750),
            command_queue_depth: 10,
            command_pool_size: 10,
            subscription_capacity: 10,
            network_buffer_size: 5000,
            retry: RetrySettings::default(),
            loop_idle: Duration::from_millis(10),
        }
    }
}

impl fmt::Debug for AgentSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentSettings")
            .field("client_id", &self.client_id)
            .field("keep_alive", &self.keep_alive)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("server", &self.server)
            .field("credentials", &self.credentials)
            .field("connack_timeout", &self.connack_timeout)
            .field("transport_timeout", &self.transport_timeout)
            .field("command_queue_depth", &self.command_queue_depth)
            .field("command_pool_size", &self.command_pool_size)
            .field("subscription_capacity", &self.subscription_capacity)
            .field("network_buffer_size", &self.network_buffer_size)
            .field("retry", &self.retry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = AgentSettings::new("sensor-7", ServerInfo::new("broker.local", 8883));
        assert_eq!(settings.client_id, "sensor-7");
        assert_eq!(settings.server.port, 8883);
        assert_eq!(settings.keep_alive, Duration::from_secs(60));
        assert_eq!(settings.command_pool_size, 10);
        assert_eq!(settings.network_buffer_size, 5000);
        assert_eq!(settings.retry.max_attempts, 5);
    }

    #[test]
    fn test_debug_redacts_password() {
        let settings = AgentSettings {
            password: Some("hunter2".to_string()),
            ..AgentSettings::default()
        };
        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
