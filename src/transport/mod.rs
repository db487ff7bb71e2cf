//! Byte-stream transport consumed by the agent
//!
//! The agent only needs connect/send/recv/disconnect with non-blocking
//! semantics. [`TcpTransport`] speaks plaintext; [`TlsTransport`] takes its
//! root CA, client certificate, ALPN and SNI settings from [`Credentials`].

use std::time::Duration;
use thiserror::Error;

pub mod tcp;
pub mod tls;

pub use tcp::TcpTransport;
pub use tls::TlsTransport;

/// Broker endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub host: String,
    pub port: u16,
}

impl ServerInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// TLS material handed to the transport on connect.
///
/// PEM contents, not paths. Every field is optional so a plaintext
/// transport can be driven with `Credentials::default()`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub root_ca_pem: Option<String>,
    pub client_cert_pem: Option<String>,
    pub private_key_pem: Option<String>,
    pub alpn: Option<String>,
    pub disable_sni: bool,
}

impl Credentials {
    /// Whether any TLS setting is present.
    pub fn requires_tls(&self) -> bool {
        self.root_ca_pem.is_some()
            || self.client_cert_pem.is_some()
            || self.private_key_pem.is_some()
            || self.alpn.is_some()
    }
}

// Keep key material out of logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("root_ca_pem", &self.root_ca_pem.as_ref().map(|_| "<pem>"))
            .field("client_cert_pem", &self.client_cert_pem.as_ref().map(|_| "<pem>"))
            .field("private_key_pem", &self.private_key_pem.as_ref().map(|_| "<redacted>"))
            .field("alpn", &self.alpn)
            .field("disable_sni", &self.disable_sni)
            .finish()
    }
}

/// Outcome of a single send or receive attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportIo {
    /// `n` bytes were moved.
    Done(usize),
    /// Transient condition; try again.
    WantRetry,
    /// Nothing to read right now.
    NoData,
}

/// Transport failures. Every variant sends the agent into reconnection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Connecting to {endpoint} timed out after {waited:?}")]
    ConnectTimeout { endpoint: String, waited: Duration },
    #[error("Send timed out after {0:?}")]
    SendTimeout(Duration),
    #[error("Peer closed the connection")]
    PeerClosed,
    #[error("Transport is not connected")]
    NotConnected,
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unsupported transport configuration: {0}")]
    Unsupported(String),
    #[error("TLS error: {0}")]
    Tls(String),
}

/// Byte-stream transport to the broker
///
/// `send` and `recv` must not block beyond the timeouts given to `connect`.
/// `recv` returns [`TransportIo::NoData`] when nothing is buffered and an
/// error once the peer has gone away.
#[async_trait::async_trait]
pub trait SecureTransport: Send + Sync {
    /// Open the connection
    async fn connect(
        &mut self,
        server: &ServerInfo,
        credentials: &Credentials,
        recv_timeout: Duration,
        send_timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Close the connection. Closing a closed transport is a no-op.
    async fn disconnect(&mut self);

    /// Write some of `buf`
    async fn send(&mut self, buf: &[u8]) -> Result<TransportIo, TransportError>;

    /// Read into `buf`
    async fn recv(&mut self, buf: &mut [u8]) -> Result<TransportIo, TransportError>;
}
