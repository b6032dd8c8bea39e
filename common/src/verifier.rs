//! Server certificate verification without the hostname check.

use std::sync::Arc;

use rustls::{
    client::{
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        WebPkiServerVerifier,
    },
    pki_types::{CertificateDer, ServerName, UnixTime},
    CertificateError, DigitallySignedStruct, SignatureScheme,
};

/// Whether `err` only says the certificate was issued for another name.
pub fn is_name_mismatch(err: &CertificateError) -> bool {
    matches!(
        err,
        CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
    )
}

/// Runs full WebPKI chain validation and forgives a name mismatch.
///
/// The name is checked last by WebPKI, so a mismatch error means the
/// chain, validity window and key usage already passed.
#[derive(Debug)]
pub(crate) struct ChainOnlyVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ChainOnlyVerifier {
    pub(crate) fn new(inner: Arc<WebPkiServerVerifier>) -> Self {
        Self { inner }
    }
}

impl ServerCertVerifier for ChainOnlyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(err)) if is_name_mismatch(&err) => {
                tracing::debug!(server_name = ?server_name, "accepting certificate issued for another name");
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Pki;

    fn verifier(pki: &Pki) -> ChainOnlyVerifier {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(pki.ca_cert.clone()).unwrap();
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .unwrap();
        ChainOnlyVerifier::new(inner)
    }

    #[test]
    fn accepts_trusted_certificate_for_another_name() {
        let pki = Pki::generate();
        let name = ServerName::try_from("elsewhere.example").unwrap();
        let result = verifier(&pki).verify_server_cert(&pki.server.cert, &[], &name, &[], UnixTime::now());
        assert!(result.is_ok());
    }

    #[test]
    fn still_rejects_untrusted_chain() {
        let pki = Pki::generate();
        let rogue = Pki::rogue();
        let name = ServerName::try_from("localhost").unwrap();
        let result = verifier(&pki).verify_server_cert(&rogue.server.cert, &[], &name, &[], UnixTime::now());
        assert!(matches!(result, Err(rustls::Error::InvalidCertificate(_))));
    }
}
