//! Error types for the MQTT agent
//!
//! Every failure maps onto one of six kinds that decide how it is handled:
//! rejected at the call site, retried, reconnected, dropped, reported to a
//! completion callback, or ending the command loop.

use crate::config::ConfigError;
use crate::protocol::{CodecError, TopicError};
use crate::transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// How a failure is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input, rejected before anything is enqueued
    Parameter,
    /// Pool empty or queue full; the caller may retry
    Resource,
    /// Link failure; the agent reconnects
    Transport,
    /// Malformed or unexpected packet; logged and dropped
    Protocol,
    /// Broker refused the session or a subscription
    Session,
    /// The command loop stops
    Fatal,
}

/// Main error type for agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Invalid parameter: {message}")]
    Parameter { message: String },

    #[error("Invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),

    #[error("No free command record after waiting {waited:?}")]
    PoolExhausted { waited: Duration },

    #[error("Command queue full after waiting {waited:?}")]
    QueueFull { waited: Duration },

    #[error("Agent is not accepting commands")]
    AgentStopped,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("No CONNACK within {waited:?}")]
    ConnackTimeout { waited: Duration },

    #[error("No PINGRESP within {waited:?}")]
    KeepAliveTimeout { waited: Duration },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Broker refused connection with return code {code}")]
    ConnectionRefused { code: u8 },

    #[error("Session resume failed: {message}")]
    SessionResume { message: String },

    #[error("Reconnect attempts exhausted after {attempts} tries")]
    BackoffExhausted { attempts: u32 },

    #[error("Agent terminated")]
    Terminated,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Parameter { .. } | AgentError::InvalidTopic(_) => ErrorKind::Parameter,
            AgentError::PoolExhausted { .. } | AgentError::QueueFull { .. } => ErrorKind::Resource,
            AgentError::Transport(_)
            | AgentError::ConnackTimeout { .. }
            | AgentError::KeepAliveTimeout { .. } => ErrorKind::Transport,
            AgentError::Protocol { .. } | AgentError::Codec(_) => ErrorKind::Protocol,
            AgentError::ConnectionRefused { .. } | AgentError::SessionResume { .. } => {
                ErrorKind::Session
            }
            AgentError::AgentStopped
            | AgentError::BackoffExhausted { .. }
            | AgentError::Terminated
            | AgentError::Config(_) => ErrorKind::Fatal,
        }
    }

    /// Whether the caller can retry the same call unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Resource | ErrorKind::Transport)
    }

    /// Create parameter error
    pub fn parameter<S: Into<String>>(message: S) -> Self {
        Self::Parameter {
            message: message.into(),
        }
    }

    /// Create protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn session_resume<S: Into<String>>(message: S) -> Self {
        Self::SessionResume {
            message: message.into(),
        }
    }
}

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;
