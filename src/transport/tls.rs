//! TLS transport on tokio-rustls
//!
//! Server authentication uses the root CA from [`Credentials`]. A client
//! certificate and key enable mutual authentication. ALPN and SNI follow the
//! credential settings, which is what AWS IoT on port 443 needs.

use super::{Credentials, SecureTransport, ServerInfo, TransportError, TransportIo};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// TLS connection to a broker
pub struct TlsTransport {
    stream: Option<TlsStream<TcpStream>>,
    connect_timeout: Duration,
    send_timeout: Duration,
}

impl Default for TlsTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransport")
            .field("connected", &self.stream.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .field("send_timeout", &self.send_timeout)
            .finish()
    }
}

impl TlsTransport {
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

/// Build the rustls client configuration for `credentials`.
///
/// A root CA is required. The client certificate and key must be given
/// together.
pub fn client_config(credentials: &Credentials) -> Result<ClientConfig, TransportError> {
    let root_pem = credentials
        .root_ca_pem
        .as_deref()
        .ok_or_else(|| tls_error("a root CA certificate is required"))?;
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(parse_certs(root_pem)?);
    if added == 0 {
        return Err(tls_error("no usable certificate in the root CA"));
    }
    if ignored > 0 {
        debug!(ignored, "Skipped unparsable root CA certificates");
    }

    let builder = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| tls_error(e.to_string()))?
    .with_root_certificates(roots);

    let mut config = match (
        credentials.client_cert_pem.as_deref(),
        credentials.private_key_pem.as_deref(),
    ) {
        (Some(cert_pem), Some(key_pem)) => builder
            .with_client_auth_cert(parse_certs(cert_pem)?, parse_key(key_pem)?)
            .map_err(|e| tls_error(format!("client certificate rejected: {e}")))?,
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(tls_error(
                "client certificate and private key must be configured together",
            ))
        }
    };

    apply_session_options(&mut config, credentials);
    Ok(config)
}

fn apply_session_options(config: &mut ClientConfig, credentials: &Credentials) {
    config.alpn_protocols = credentials
        .alpn
        .iter()
        .map(|protocol| protocol.as_bytes().to_vec())
        .collect();
    config.enable_sni = !credentials.disable_sni;
}

fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("invalid certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(tls_error("no certificate found in PEM"));
    }
    Ok(certs)
}

fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>, TransportError> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| tls_error(format!("invalid private key PEM: {e}")))?
        .ok_or_else(|| tls_error("no private key found in PEM"))
}

fn tls_error(message: impl Into<String>) -> TransportError {
    TransportError::Tls(message.into())
}

#[async_trait::async_trait]
impl SecureTransport for TlsTransport {
    async fn connect(
        &mut self,
        server: &ServerInfo,
        credentials: &Credentials,
        _recv_timeout: Duration,
        send_timeout: Duration,
    ) -> Result<(), TransportError> {
        self.disconnect().await;
        let config = client_config(credentials)?;
        let server_name = ServerName::try_from(server.host.clone())
            .map_err(|e| tls_error(format!("invalid server name '{}': {e}", server.host)))?;

        let endpoint = server.to_string();
        debug!("Opening TLS connection to {}", endpoint);

        let connector = TlsConnector::from(Arc::new(config));
        let handshake = async {
            let tcp = TcpStream::connect((server.host.as_str(), server.port)).await?;
            tcp.set_nodelay(true)?;
            connector.connect(server_name, tcp).await
        };
        let stream = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                endpoint: endpoint.clone(),
                waited: self.connect_timeout,
            })?
            .map_err(|source| TransportError::Connect {
                endpoint: endpoint.clone(),
                source,
            })?;

        self.send_timeout = send_timeout;
        self.stream = Some(stream);
        info!("TLS connection established to {}", endpoint);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            debug!("Closing TLS connection");
            // close_notify is best effort
            let _ = tokio::time::timeout(self.send_timeout, stream.shutdown()).await;
        }
    }

    async fn send(&mut self, buf: &[u8]) -> Result<TransportIo, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        let written = match tokio::time::timeout(self.send_timeout, stream.write(buf)).await {
            Err(_) => return Ok(TransportIo::WantRetry),
            Ok(Err(e)) if e.kind() == ErrorKind::WouldBlock => return Ok(TransportIo::WantRetry),
            Ok(result) => result?,
        };
        tokio::time::timeout(self.send_timeout, stream.flush())
            .await
            .map_err(|_| TransportError::SendTimeout(self.send_timeout))??;
        Ok(TransportIo::Done(written))
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<TransportIo, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        // A zero timeout polls the read exactly once.
        match tokio::time::timeout(Duration::ZERO, stream.read(buf)).await {
            Err(_) => Ok(TransportIo::NoData),
            Ok(Ok(0)) if !buf.is_empty() => Err(TransportError::PeerClosed),
            Ok(Ok(n)) => Ok(TransportIo::Done(n)),
            Ok(Err(e)) if e.kind() == ErrorKind::WouldBlock => Ok(TransportIo::NoData),
            Ok(Err(e)) if e.kind() == ErrorKind::Interrupted => Ok(TransportIo::WantRetry),
            Ok(Err(e)) => Err(e.into()),
        }
    }
}
