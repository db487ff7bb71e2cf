//! Plaintext TCP transport on tokio

use super::{Credentials, SecureTransport, ServerInfo, TransportError, TransportIo};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Unencrypted TCP connection to a broker
///
/// Refuses to connect when TLS material is supplied rather than silently
/// downgrading.
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    connect_timeout: Duration,
    send_timeout: Duration,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            stream: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            send_timeout: Duration::from_millis(750),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

#[async_trait::async_trait]
impl SecureTransport for TcpTransport {
    async fn connect(
        &mut self,
        server: &ServerInfo,
        credentials: &Credentials,
        _recv_timeout: Duration,
        send_timeout: Duration,
    ) -> Result<(), TransportError> {
        if credentials.requires_tls() {
            return Err(TransportError::Unsupported(
                "TLS credentials supplied to the plaintext TCP transport".to_string(),
            ));
        }

        self.disconnect().await;
        let endpoint = server.to_string();
        debug!("Opening TCP connection to {}", endpoint);

        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((server.host.as_str(), server.port)),
        )
        .await
        .map_err(|_| TransportError::ConnectTimeout {
            endpoint: endpoint.clone(),
            waited: self.connect_timeout,
        })?
        .map_err(|source| TransportError::Connect {
            endpoint: endpoint.clone(),
            source,
        })?;

        stream.set_nodelay(true)?;
        self.send_timeout = send_timeout;
        self.stream = Some(stream);
        info!("TCP connection established to {}", endpoint);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            debug!("Closing TCP connection");
            drop(stream);
        }
    }

    async fn send(&mut self, buf: &[u8]) -> Result<TransportIo, TransportError> {
        let stream = self.stream.as_ref().ok_or(TransportError::NotConnected)?;
        match tokio::time::timeout(self.send_timeout, stream.writable()).await {
            Err(_) => return Ok(TransportIo::WantRetry),
            Ok(ready) => ready?,
        }
        match stream.try_write(buf) {
            Ok(n) => Ok(TransportIo::Done(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(TransportIo::WantRetry),
            Err(e) => Err(e.into()),
        }
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<TransportIo, TransportError> {
        let stream = self.stream.as_ref().ok_or(TransportError::NotConnected)?;
        match stream.try_read(buf) {
            Ok(0) if !buf.is_empty() => Err(TransportError::PeerClosed),
            Ok(n) => Ok(TransportIo::Done(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(TransportIo::NoData),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(TransportIo::WantRetry),
            Err(e) => Err(e.into()),
        }
    }
}
