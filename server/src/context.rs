use std::net::SocketAddr;

use keyward_common::AuthenticatedPrincipal;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No verified principal is attached to this request.
    #[error("request has no authenticated principal")]
    Unauthenticated,
}

/// Everything a handler may know about the connection it serves.
///
/// Created after the handshake completes and dropped with the request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    connection_id: Uuid,
    peer_addr:     SocketAddr,
    principal:     Option<AuthenticatedPrincipal>,
}

impl RequestContext {
    pub fn new(connection_id: Uuid, peer_addr: SocketAddr, principal: Option<AuthenticatedPrincipal>) -> Self {
        Self {
            connection_id,
            peer_addr,
            principal,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_authenticated(&self) -> bool {
        self.principal.is_some()
    }

    pub fn principal(&self) -> Result<&AuthenticatedPrincipal, AuthError> {
        self.principal.as_ref().ok_or(AuthError::Unauthenticated)
    }

    /// The caller's login identity.
    pub fn subject_identifier(&self) -> Result<&str, AuthError> {
        self.principal().map(AuthenticatedPrincipal::subject_identifier)
    }
}

#[cfg(test)]
mod tests {
    use keyward_common::{principal::extract_from_chain, testing::Pki, SubjectField};

    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[test]
    fn anonymous_context_is_unauthenticated() {
        let ctx = RequestContext::new(Uuid::new_v4(), peer(), None);
        assert!(!ctx.is_authenticated());
        assert_eq!(ctx.subject_identifier(), Err(AuthError::Unauthenticated));
        assert!(matches!(ctx.principal(), Err(AuthError::Unauthenticated)));
    }

    #[test]
    fn authenticated_context_exposes_subject() {
        let pki = Pki::generate();
        let chain = [pki.client.cert.clone()];
        let principal = extract_from_chain(Some(&chain[..]), SubjectField::CommonName).unwrap();

        let ctx = RequestContext::new(Uuid::new_v4(), peer(), Some(principal));
        assert!(ctx.is_authenticated());
        assert_eq!(ctx.subject_identifier(), Ok("client1"));
        assert_eq!(ctx.peer_addr(), peer());
    }
}
