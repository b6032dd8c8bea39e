use std::{fmt, io, str::FromStr, time::Duration};

use keyward_common::{
    is_name_mismatch,
    tls_stream::{read_payload, write_payload},
    SslConfigError, StreamError, Timeouts, TlsConfig,
};
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::{net::TcpStream, time::timeout};
use tokio_rustls::{client::TlsStream, TlsConnector};

const HTTPS_PORT: u16 = 443;

/// Per-request failures. None of them are retried here.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid target address {0:?}")]
    InvalidTarget(String),

    /// TCP connect plus TLS handshake exceeded the handshake timeout.
    #[error("connect and handshake did not complete within {0:?}")]
    ConnectTimeout(Duration),

    /// The server certificate was not trusted, or the server refused ours.
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),

    /// The server certificate chains to a trusted anchor but names another host.
    #[error("server certificate is not valid for {host}: {reason}")]
    PeerIdentityMismatch { host: String, reason: String },

    #[error("no response data within {0:?}")]
    ReadTimeout(Duration),

    #[error("request write did not complete within {0:?}")]
    WriteTimeout(Duration),

    #[error("failed to connect: {0}")]
    Connect(#[source] io::Error),

    #[error("response exceeds {limit} bytes")]
    ResponseTooLarge { limit: usize },

    #[error("connection I/O failed: {0}")]
    Io(#[source] io::Error),

    #[error(transparent)]
    Config(#[from] SslConfigError),
}

impl ClientError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectTimeout(_) | ClientError::ReadTimeout(_) | ClientError::WriteTimeout(_)
        )
    }
}

/// A parsed `host:port`, `[v6]:port` or `https://host[:port]/path` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    host: String,
    port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The name checked against the server certificate.
    pub fn server_name(&self) -> Result<ServerName<'static>, ClientError> {
        ServerName::try_from(self.host.clone()).map_err(|_| ClientError::InvalidTarget(self.host.clone()))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Target {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ClientError::InvalidTarget(s.to_string());

        let (authority, default_port) = match s.split_once("://") {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("https") => {
                let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
                (authority, Some(HTTPS_PORT))
            }
            // Anything but https would mean a plaintext attempt.
            Some(_) => return Err(invalid()),
            None => (s, None),
        };

        let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
            match after.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if after.is_empty() => (host, None),
                None => return Err(invalid()),
            }
        } else {
            match authority.rsplit_once(':') {
                // unbracketed IPv6
                Some((host, _)) if host.contains(':') => return Err(invalid()),
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(invalid());
        }
        let port = match port {
            Some(port) => port.parse::<u16>().map_err(|_| invalid())?,
            None => default_port.ok_or_else(invalid)?,
        };

        Ok(Self::new(host, port))
    }
}

/// An outbound mutual TLS client built from a client-role [`TlsConfig`].
///
/// Every request opens its own connection: connect, handshake, send the
/// payload and close the write half, then read the response to EOF.
#[derive(Clone)]
pub struct SecureClient {
    connector: TlsConnector,
    config:    TlsConfig,
}

impl fmt::Debug for SecureClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureClient").field("config", &self.config).finish()
    }
}

impl SecureClient {
    /// Fails with [`ClientError::Config`] if `config` is not a client context.
    pub fn new(config: TlsConfig) -> Result<Self, ClientError> {
        let rustls_config = config.client_config()?;
        Ok(Self {
            connector: TlsConnector::from(rustls_config),
            config,
        })
    }

    pub fn timeouts(&self) -> Timeouts {
        self.config.timeouts()
    }

    /// Sends `payload` to `target` and returns the full response.
    pub async fn request(&self, target: &str, payload: &[u8]) -> Result<Vec<u8>, ClientError> {
        let target: Target = target.parse()?;
        self.send(&target, payload).await
    }

    pub async fn send(&self, target: &Target, payload: &[u8]) -> Result<Vec<u8>, ClientError> {
        let timeouts = self.timeouts();

        let mut stream = timeout(timeouts.handshake, self.connect(target))
            .await
            .map_err(|_| ClientError::ConnectTimeout(timeouts.handshake))??;
        tracing::debug!(peer = %target, "handshake complete");

        write_payload(&mut stream, payload, timeouts.write)
            .await
            .map_err(classify_stream_error)?;

        let response = read_payload(&mut stream, self.config.options().max_payload_size, timeouts.read)
            .await
            .map_err(classify_stream_error)?;

        tracing::debug!(
            peer = %target,
            sent = payload.len(),
            received = response.len(),
            "request completed"
        );
        Ok(response)
    }

    async fn connect(&self, target: &Target) -> Result<TlsStream<TcpStream>, ClientError> {
        let server_name = target.server_name()?;
        let tcp = TcpStream::connect((target.host(), target.port()))
            .await
            .map_err(ClientError::Connect)?;
        tcp.set_nodelay(true).map_err(ClientError::Connect)?;

        self.connector
            .connect(server_name, tcp)
            .await
            .map_err(|err| classify_handshake_error(target, err))
    }
}

fn rustls_error(err: &io::Error) -> Option<&rustls::Error> {
    err.get_ref()?.downcast_ref::<rustls::Error>()
}

fn is_abortive_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

fn classify_handshake_error(target: &Target, err: io::Error) -> ClientError {
    if let Some(tls_err) = rustls_error(&err) {
        return match tls_err {
            rustls::Error::InvalidCertificate(cert_err) if is_name_mismatch(cert_err) => {
                ClientError::PeerIdentityMismatch {
                    host:   target.host().to_string(),
                    reason: cert_err.to_string(),
                }
            }
            other => ClientError::HandshakeFailed(other.to_string()),
        };
    }
    if is_abortive_close(&err) {
        return ClientError::HandshakeFailed(format!(
            "server closed the connection during the handshake: {err}"
        ));
    }
    ClientError::Io(err)
}

/// With TLS 1.3 the server checks our certificate after our side of the
/// handshake is done, so a rejection shows up on the first read or write.
fn classify_stream_error(err: StreamError) -> ClientError {
    let (source, before_response) = match err {
        StreamError::ReadTimeout(bound) => return ClientError::ReadTimeout(bound),
        StreamError::WriteTimeout(bound) => return ClientError::WriteTimeout(bound),
        StreamError::TooLarge { limit } => return ClientError::ResponseTooLarge { limit },
        StreamError::Read { received, source } => (source, received == 0),
        StreamError::Write(source) => (source, true),
    };

    if before_response {
        if let Some(tls_err) = rustls_error(&source) {
            return ClientError::HandshakeFailed(format!("server rejected the connection: {tls_err}"));
        }
        if is_abortive_close(&source) {
            return ClientError::HandshakeFailed(format!(
                "server closed the connection before responding: {source}"
            ));
        }
    }
    ClientError::Io(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let target: Target = "localhost:8443".parse().unwrap();
        assert_eq!(target, Target::new("localhost", 8443));
        assert_eq!(target.to_string(), "localhost:8443");
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let target: Target = "[::1]:9443".parse().unwrap();
        assert_eq!(target.host(), "::1");
        assert_eq!(target.port(), 9443);
        assert_eq!(target.to_string(), "[::1]:9443");
    }

    #[test]
    fn parses_https_urls() {
        let target: Target = "https://localhost:8443/server.api/v1/user".parse().unwrap();
        assert_eq!(target, Target::new("localhost", 8443));

        let target: Target = "https://api.example.com/v1?x=1".parse().unwrap();
        assert_eq!(target, Target::new("api.example.com", 443));

        let target: Target = "HTTPS://[::1]".parse().unwrap();
        assert_eq!(target, Target::new("::1", 443));
    }

    #[test]
    fn rejects_plaintext_and_malformed_targets() {
        for bad in [
            "http://localhost:8080/",
            "localhost",
            "localhost:",
            "localhost:99999",
            ":8443",
            "::1:8443",
            "[::1",
            "[::1]x",
            "https://",
        ] {
            assert!(
                matches!(bad.parse::<Target>(), Err(ClientError::InvalidTarget(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn ip_targets_produce_ip_server_names() {
        let target = Target::new("127.0.0.1", 8443);
        assert!(matches!(target.server_name().unwrap(), ServerName::IpAddress(_)));
        let target = Target::new("localhost", 8443);
        assert!(matches!(target.server_name().unwrap(), ServerName::DnsName(_)));
    }

    #[test]
    fn stream_errors_map_to_client_errors() {
        let bound = Duration::from_millis(10);
        assert!(matches!(
            classify_stream_error(StreamError::ReadTimeout(bound)),
            ClientError::ReadTimeout(_)
        ));
        assert!(matches!(
            classify_stream_error(StreamError::WriteTimeout(bound)),
            ClientError::WriteTimeout(_)
        ));
        assert!(matches!(
            classify_stream_error(StreamError::Read {
                received: 0,
                source:   io::Error::from(io::ErrorKind::UnexpectedEof),
            }),
            ClientError::HandshakeFailed(_)
        ));
        assert!(matches!(
            classify_stream_error(StreamError::Read {
                received: 12,
                source:   io::Error::from(io::ErrorKind::UnexpectedEof),
            }),
            ClientError::Io(_)
        ));
        let alert = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::AlertReceived(rustls::AlertDescription::CertificateRequired),
        );
        assert!(matches!(
            classify_stream_error(StreamError::Read { received: 0, source: alert }),
            ClientError::HandshakeFailed(_)
        ));
    }

    #[test]
    fn name_mismatch_is_an_identity_error() {
        let target = Target::new("keyward.internal", 8443);
        let err = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(rustls::CertificateError::NotValidForName),
        );
        assert!(matches!(
            classify_handshake_error(&target, err),
            ClientError::PeerIdentityMismatch { .. }
        ));

        let err = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer),
        );
        assert!(matches!(
            classify_handshake_error(&target, err),
            ClientError::HandshakeFailed(_)
        ));
    }

    #[test]
    fn server_context_is_refused() {
        let pki = keyward_common::testing::Pki::generate();
        let server = TlsConfig::server(
            pki.server.key_material(),
            Some(pki.trust_anchors()),
            keyward_common::TlsOptions::default(),
        )
        .unwrap();
        assert!(matches!(
            SecureClient::new(server),
            Err(ClientError::Config(SslConfigError::WrongRole { .. }))
        ));
    }
}
