//! Test helpers and utilities for integration tests

use mqtt_agent::agent::{
    AgentHandle, AgentSettings, CommandInfo, LoopExit, MqttAgent, ReturnInfo, RetrySettings,
};
use mqtt_agent::protocol::PublishInfo;
use mqtt_agent::testing::{MockBroker, MockTransport};
use mqtt_agent::transport::ServerInfo;
use mqtt_agent::AgentResult;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Block time used for facade calls in tests
#[allow(dead_code)]
pub const BLOCK: Duration = Duration::from_millis(500);

/// Settings with short timeouts and millisecond backoff
#[allow(dead_code)]
pub fn test_settings(client_id: &str) -> AgentSettings {
    AgentSettings {
        client_id: client_id.to_string(),
        server: ServerInfo::new("mock-broker", 1883),
        connack_timeout: Duration::from_millis(200),
        transport_timeout: Duration::from_millis(100),
        retry: RetrySettings {
            max_attempts: 5,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
        loop_idle: Duration::from_millis(1),
        ..AgentSettings::default()
    }
}

/// An agent on a fresh broker connection, connected with a clean session
#[allow(dead_code)]
pub async fn connected_agent(
    broker: &MockBroker,
    settings: AgentSettings,
) -> (MqttAgent<MockTransport>, AgentHandle) {
    let (mut agent, handle) = MqttAgent::new(settings, broker.transport());
    agent
        .connect_with_backoff(true)
        .await
        .expect("Agent should connect to the mock broker");
    (agent, handle)
}

#[allow(dead_code)]
pub fn spawn_loop(mut agent: MqttAgent<MockTransport>) -> JoinHandle<AgentResult<LoopExit>> {
    tokio::spawn(async move { agent.command_loop().await })
}

/// Poll `condition` every millisecond until it holds or `timeout` passes.
#[allow(dead_code)]
pub async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    condition()
}

/// Inbound publishes seen by a handler, as (topic, payload)
#[allow(dead_code)]
#[derive(Clone, Default)]
pub struct Received {
    inner: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

#[allow(dead_code)]
impl Received {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self) -> impl Fn(&PublishInfo<'_>) + Send + Sync + 'static {
        let inner = self.inner.clone();
        move |publish: &PublishInfo<'_>| {
            inner
                .lock()
                .unwrap()
                .push((publish.topic.to_string(), publish.payload.to_vec()));
        }
    }

    pub fn all(&self) -> Vec<(String, Vec<u8>)> {
        self.inner.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

/// Completion results in the order they fired, tagged by the caller
#[allow(dead_code)]
#[derive(Clone, Default)]
pub struct Completions {
    inner: Arc<Mutex<Vec<(String, ReturnInfo)>>>,
}

#[allow(dead_code)]
impl Completions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&self, tag: &str) -> CommandInfo {
        let inner = self.inner.clone();
        let tag = tag.to_string();
        CommandInfo::new(BLOCK).with_completion(move |result: &ReturnInfo| {
            inner.lock().unwrap().push((tag, result.clone()));
        })
    }

    pub fn all(&self) -> Vec<(String, ReturnInfo)> {
        self.inner.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}
