//! Keyward Server Library
//!
//! A mutual TLS listener that hands each request to a [`Handler`] together
//! with the verified identity of the client that sent it.
//!
//! Per connection, strictly in this order: TLS handshake under the
//! handshake timeout, principal extraction, request read, handler,
//! response write, `close_notify`. A connection whose handshake fails
//! never reaches principal extraction or the handler.
//!
//! A handler error is answered with an empty body and a normal
//! `close_notify`. Callers that need to tell a failure from an empty
//! success must encode that in their non-empty responses; [`WhoAmI`]
//! never returns an empty subject, so for it an empty body always means
//! the caller was unauthenticated.

use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use keyward_common::{
    principal,
    tls_stream::{read_payload, write_payload},
    PrincipalError, SslConfigError, StreamError, TlsConfig, TlsOptions,
};
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    task::JoinSet,
    time::timeout,
};
use tokio_rustls::TlsAcceptor;
use tracing::Instrument;
use uuid::Uuid;

mod context;
mod handler;

/// Pause after a failed `accept`, e.g. when the process is out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub use context::{AuthError, RequestContext};
pub use handler::{Handler, HandlerError, HandlerResult, WhoAmI};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind listener: {0}")]
    Bind(#[source] io::Error),

    #[error("failed to read listener address: {0}")]
    LocalAddr(#[source] io::Error),

    #[error(transparent)]
    Config(#[from] SslConfigError),
}

/// Why a single connection ended early. Logged, never returned.
#[derive(Debug, Error)]
enum ConnectionError {
    #[error("handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("handshake failed: {0}")]
    Handshake(#[source] io::Error),

    #[error("mutual auth is required but the client presented no certificate")]
    MissingPrincipal,

    #[error("cannot derive principal: {0}")]
    Principal(#[from] PrincipalError),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// A bound mutual TLS server built from a server-role [`TlsConfig`].
pub struct SecureServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    options:  Arc<TlsOptions>,
}

impl SecureServer {
    /// Binds `addr`. Fails with [`ServerError::Config`] if `config` is not a
    /// server context.
    pub async fn bind(addr: impl ToSocketAddrs, config: TlsConfig) -> Result<Self, ServerError> {
        let server_config = config.server_config()?;
        let listener = TcpListener::bind(addr).await.map_err(ServerError::Bind)?;

        tracing::info!(
            addr = ?listener.local_addr().ok(),
            mutual_auth = config.mutual_auth_required(),
            "keyward server listening"
        );

        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(server_config),
            options: Arc::new(config.options().clone()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener.local_addr().map_err(ServerError::LocalAddr)
    }

    /// Serves connections until the task is dropped.
    pub async fn run<H: Handler>(self, handler: H) -> Result<(), ServerError> {
        self.run_with_shutdown(handler, std::future::pending()).await
    }

    /// Serves connections until `shutdown` resolves, then waits for the
    /// connections in flight. Each of those is bounded by its timeouts.
    pub async fn run_with_shutdown<H, S>(self, handler: H, shutdown: S) -> Result<(), ServerError>
    where
        H: Handler,
        S: Future<Output = ()>,
    {
        let handler = Arc::new(handler);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(in_flight = connections.len(), "shutdown requested");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((tcp, peer_addr)) => {
                        let connection_id = Uuid::new_v4();
                        let span = tracing::info_span!("connection", id = %connection_id, peer = %peer_addr);
                        connections.spawn(
                            serve_connection(
                                tcp,
                                peer_addr,
                                connection_id,
                                self.acceptor.clone(),
                                Arc::clone(&self.options),
                                Arc::clone(&handler),
                            )
                            .instrument(span),
                        );
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "incoming connection failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        tracing::error!(error = %e, "connection task panicked");
                    }
                }
            }
        }

        while connections.join_next().await.is_some() {}
        tracing::info!("keyward server stopped");
        Ok(())
    }
}

async fn serve_connection<H: Handler>(
    tcp: TcpStream,
    peer_addr: SocketAddr,
    connection_id: Uuid,
    acceptor: TlsAcceptor,
    options: Arc<TlsOptions>,
    handler: Arc<H>,
) {
    match handle_connection(tcp, peer_addr, connection_id, &acceptor, &options, handler.as_ref()).await {
        Ok(()) => tracing::debug!("request handled, connection closed"),
        Err(ConnectionError::MissingPrincipal) => {
            tracing::error!("invariant violated: handshake completed without a client certificate; dropping connection")
        }
        Err(e @ ConnectionError::Handshake(_)) | Err(e @ ConnectionError::HandshakeTimeout(_)) => {
            tracing::warn!(error = %e, "rejected connection")
        }
        Err(e) => tracing::warn!(error = %e, "connection failed"),
    }
}

async fn handle_connection<H: Handler>(
    tcp: TcpStream,
    peer_addr: SocketAddr,
    connection_id: Uuid,
    acceptor: &TlsAcceptor,
    options: &TlsOptions,
    handler: &H,
) -> Result<(), ConnectionError> {
    let timeouts = options.timeouts;

    let mut stream = timeout(timeouts.handshake, acceptor.accept(tcp))
        .await
        .map_err(|_| ConnectionError::HandshakeTimeout(timeouts.handshake))?
        .map_err(ConnectionError::Handshake)?;

    let principal = match principal::extract(stream.get_ref().1, options.subject_field) {
        Ok(principal) => Some(principal),
        Err(PrincipalError::NoPeerCertificate) if options.mutual_auth_required => {
            return Err(ConnectionError::MissingPrincipal)
        }
        Err(PrincipalError::NoPeerCertificate) => None,
        Err(e) => return Err(e.into()),
    };
    match &principal {
        Some(principal) => tracing::info!(
            subject = principal.subject_identifier(),
            fingerprint = principal.fingerprint(),
            "client authenticated"
        ),
        None => tracing::info!("anonymous client connected"),
    }

    let ctx = RequestContext::new(connection_id, peer_addr, principal);
    let request = read_payload(&mut stream, options.max_payload_size, timeouts.read).await?;
    tracing::debug!(bytes = request.len(), "request received");

    let response = match handler.handle(ctx, request).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(error = %e, "handler failed; sending empty response");
            Vec::new()
        }
    };

    write_payload(&mut stream, &response, timeouts.write).await?;
    Ok(())
}
