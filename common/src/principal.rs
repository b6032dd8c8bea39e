//! Verified peer identity, projected from a completed handshake.
//!
//! Chain validation already happened inside the handshake; nothing here
//! re-verifies. A principal lives exactly as long as the request that
//! carries it.

use std::{fmt, sync::Arc};

use rustls::{pki_types::CertificateDer, ServerConnection};
use sha2::{Digest, Sha256};
use x509_parser::prelude::*;

use crate::{error::PrincipalError, tls_config::SubjectField};

/// The client identity behind one connection.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthenticatedPrincipal {
    subject_identifier: String,
    distinguished_name: String,
    fingerprint:        String,
    chain:              Arc<[CertificateDer<'static>]>,
}

impl AuthenticatedPrincipal {
    /// The application-facing login identity.
    pub fn subject_identifier(&self) -> &str {
        &self.subject_identifier
    }

    /// The full subject of the leaf certificate.
    pub fn distinguished_name(&self) -> &str {
        &self.distinguished_name
    }

    /// Lowercase hex SHA-256 of the leaf certificate.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// The peer's chain as presented, leaf first.
    pub fn certificate_chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }
}

impl fmt::Debug for AuthenticatedPrincipal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticatedPrincipal")
            .field("subject_identifier", &self.subject_identifier)
            .field("fingerprint", &self.fingerprint)
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

impl fmt::Display for AuthenticatedPrincipal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.subject_identifier)
    }
}

/// Extracts the principal from a server connection whose handshake is done.
pub fn extract(
    connection: &ServerConnection,
    field: SubjectField,
) -> Result<AuthenticatedPrincipal, PrincipalError> {
    extract_from_chain(connection.peer_certificates(), field)
}

/// Extracts the principal from the chain a peer presented.
pub fn extract_from_chain(
    chain: Option<&[CertificateDer<'_>]>,
    field: SubjectField,
) -> Result<AuthenticatedPrincipal, PrincipalError> {
    let chain = chain
        .filter(|chain| !chain.is_empty())
        .ok_or(PrincipalError::NoPeerCertificate)?;
    let leaf = &chain[0];

    let (_, cert) = X509Certificate::from_der(leaf.as_ref())
        .map_err(|e| PrincipalError::MalformedCertificate(e.to_string()))?;
    let subject = cert.subject();
    let distinguished_name = subject.to_string();

    let subject_identifier = match field {
        SubjectField::CommonName => subject
            .iter_common_name()
            .next()
            .ok_or(PrincipalError::MissingSubjectField("CN"))?
            .as_str()
            .map_err(|e| PrincipalError::MalformedCertificate(format!("CN is not a string: {e}")))?
            .to_string(),
        SubjectField::DistinguishedName => distinguished_name.clone(),
    };
    if subject_identifier.is_empty() {
        return Err(PrincipalError::MissingSubjectField("CN"));
    }

    Ok(AuthenticatedPrincipal {
        subject_identifier,
        distinguished_name,
        fingerprint: hex::encode(Sha256::digest(leaf.as_ref())),
        chain: chain.iter().map(|cert| cert.clone().into_owned()).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Pki;

    #[test]
    fn common_name_becomes_subject_identifier() {
        let pki = Pki::generate();
        let chain = [pki.client.cert.clone(), pki.ca_cert.clone()];
        let principal = extract_from_chain(Some(&chain[..]), SubjectField::CommonName).unwrap();
        assert_eq!(principal.subject_identifier(), "client1");
        assert_eq!(principal.certificate_chain().len(), 2);
        assert_eq!(principal.fingerprint().len(), 64);
        assert_eq!(principal.to_string(), "client1");
    }

    #[test]
    fn distinguished_name_can_be_the_identifier() {
        let pki = Pki::generate();
        let chain = [pki.client.cert.clone()];
        let principal = extract_from_chain(Some(&chain[..]), SubjectField::DistinguishedName).unwrap();
        assert!(principal.subject_identifier().contains("CN=client1"));
        assert!(principal.subject_identifier().contains("O=Keyward"));
    }

    #[test]
    fn missing_certificate_is_reported() {
        assert!(matches!(
            extract_from_chain(None, SubjectField::CommonName),
            Err(PrincipalError::NoPeerCertificate)
        ));
        let empty: [CertificateDer<'static>; 0] = [];
        assert!(matches!(
            extract_from_chain(Some(&empty[..]), SubjectField::CommonName),
            Err(PrincipalError::NoPeerCertificate)
        ));
    }

    #[test]
    fn empty_common_name_is_not_an_identity() {
        let pki = Pki::generate();
        let chain = [pki.issue_client("").cert];
        assert!(matches!(
            extract_from_chain(Some(&chain[..]), SubjectField::CommonName),
            Err(PrincipalError::MissingSubjectField("CN"))
        ));
    }

    #[test]
    fn garbage_certificate_is_malformed() {
        let chain = [CertificateDer::from(b"not a certificate".to_vec())];
        assert!(matches!(
            extract_from_chain(Some(&chain[..]), SubjectField::CommonName),
            Err(PrincipalError::MalformedCertificate(_))
        ));
    }
}
