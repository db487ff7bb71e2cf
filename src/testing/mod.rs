//! Testing utilities and mock implementations
//!
//! An in-memory broker that lets the agent be exercised end to end without
//! a network or a real MQTT server.
//!
//! ```
//! use mqtt_agent::agent::{AgentSettings, MqttAgent};
//! use mqtt_agent::testing::{MockBroker, ReceivedPacket};
//! use mqtt_agent::transport::ServerInfo;
//!
//! # tokio_test::block_on(async {
//! let broker = MockBroker::new();
//! let settings = AgentSettings::new("doc-client", ServerInfo::new("mock", 1883));
//! let (mut agent, _handle) = MqttAgent::new(settings, broker.transport());
//!
//! let session_present = agent.connect(true).await.unwrap();
//! assert!(!session_present);
//! assert!(matches!(broker.received()[0], ReceivedPacket::Connect { .. }));
//! # });
//! ```

pub mod mocks;

pub use mocks::*;
