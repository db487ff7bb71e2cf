//! Single-connection MQTT agent
//!
//! Many tasks share one MQTT 3.1.1 session. Producers submit commands
//! through a cloneable [`AgentHandle`](agent::AgentHandle); a single agent
//! task owns the connection, serializes every request onto it, correlates
//! acknowledgements, routes inbound publishes to per-filter callbacks and
//! reconnects with jittered backoff when the link drops.
//!
//! # Quick Start
//!
//! ```no_run
//! use mqtt_agent::agent::{AgentSettings, CommandInfo, MqttAgent, OutgoingPublish, Subscription};
//! use mqtt_agent::protocol::QoS;
//! use mqtt_agent::transport::{ServerInfo, TcpTransport};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), mqtt_agent::AgentError> {
//! let settings = AgentSettings::new("sensor-7", ServerInfo::new("localhost", 1883));
//! let (mut agent, handle) = MqttAgent::new(settings, TcpTransport::new());
//! agent.connect_with_backoff(true).await?;
//! tokio::spawn(async move { agent.command_loop().await });
//!
//! let block = Duration::from_millis(100);
//! handle
//!     .subscribe(
//!         vec![Subscription::new("commands/sensor-7/#", QoS::AtLeastOnce)
//!             .with_handler(|publish| println!("{}", publish.topic))],
//!         CommandInfo::new(block),
//!     )
//!     .await?;
//! handle
//!     .publish(
//!         OutgoingPublish::new("telemetry/sensor-7", "21.5", QoS::AtLeastOnce),
//!         CommandInfo::new(block),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use agent::{AgentHandle, AgentSettings, MqttAgent};
pub use config::{AgentConfig, ConfigError};
pub use error::{AgentError, AgentResult, ErrorKind};
