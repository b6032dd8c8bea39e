//! Role-tagged TLS contexts built once at startup.
//!
//! Uses rustls 0.23 with the aws-lc-rs provider. All validation happens
//! here: missing material, key/certificate pairing and certificate
//! validity windows. A context that builds is ready for every connection
//! of its role; nothing mutates it afterwards.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use rustls::{
    client::{Resumption, WebPkiServerVerifier},
    crypto::CryptoProvider,
    pki_types::CertificateDer,
    server::{NoServerSessionStorage, WebPkiClientVerifier},
    sign::CertifiedKey,
    ClientConfig, InconsistentKeys, RootCertStore, ServerConfig,
};
use x509_parser::prelude::*;

use crate::{
    config::{StoreSettings, DEFAULT_TIMEOUT},
    error::{ConfigError, SslConfigError},
    store::{self, KeyMaterial, TrustAnchorSet},
    verifier::ChainOnlyVerifier,
};

/// Largest request or response body accepted by default.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Which side of the handshake a context serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Independent bounds for the three blocking phases of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// TCP connect plus TLS handshake
    pub handshake: Duration,
    /// Longest wait for a whole payload, from the first read to EOF
    pub read:      Duration,
    /// Longest wait for the whole payload write
    pub write:     Duration,
}

impl Timeouts {
    /// The same bound for every phase.
    pub fn uniform(bound: Duration) -> Self {
        Self {
            handshake: bound,
            read:      bound,
            write:     bound,
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::uniform(DEFAULT_TIMEOUT)
    }
}

/// Which part of the peer certificate subject becomes the principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubjectField {
    /// The first CN attribute, used as a login name
    #[default]
    CommonName,
    /// The full RFC 4514 distinguished name
    DistinguishedName,
}

/// Options for [`TlsConfig::build`].
#[derive(Debug, Clone)]
pub struct TlsOptions {
    /// Server: reject clients without a trusted certificate.
    /// Client: always present a certificate.
    pub mutual_auth_required: bool,
    /// Client only: check the server certificate against the target host
    pub verify_hostname:      bool,
    pub timeouts:             Timeouts,
    pub subject_field:        SubjectField,
    pub alpn_protocols:       Vec<Vec<u8>>,
    pub max_payload_size:     usize,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            mutual_auth_required: true,
            verify_hostname:      true,
            timeouts:             Timeouts::default(),
            subject_field:        SubjectField::default(),
            alpn_protocols:       Vec::new(),
            max_payload_size:     DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl TlsOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require a certificate from the peer (server) or present one (client)
    pub fn with_mutual_auth(mut self, required: bool) -> Self {
        self.mutual_auth_required = required;
        self
    }

    /// Check the server certificate against the target host
    pub fn with_hostname_verification(mut self, enabled: bool) -> Self {
        self.verify_hostname = enabled;
        self
    }

    /// Set the connect, read and write bounds
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set which subject field becomes the principal
    pub fn with_subject_field(mut self, field: SubjectField) -> Self {
        self.subject_field = field;
        self
    }

    /// Set the ALPN protocols to offer or accept
    pub fn with_alpn_protocols(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn_protocols = protocols;
        self
    }

    /// Set the largest request or response body in bytes
    pub fn with_max_payload_size(mut self, bytes: usize) -> Self {
        self.max_payload_size = bytes;
        self
    }
}

#[derive(Clone)]
enum RoleConfig {
    Client(Arc<ClientConfig>),
    Server(Arc<ServerConfig>),
}

/// An immutable TLS context for one role, cheap to clone and share.
#[derive(Clone)]
pub struct TlsConfig {
    role_config: RoleConfig,
    options:     TlsOptions,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("role", &self.role())
            .field("mutual_auth_required", &self.options.mutual_auth_required)
            .field("verify_hostname", &self.options.verify_hostname)
            .field("timeouts", &self.options.timeouts)
            .finish_non_exhaustive()
    }
}

impl TlsConfig {
    /// Builds a context for `role` from already loaded material.
    ///
    /// Server contexts always need key material and need trust anchors
    /// when mutual auth is required. Client contexts always need trust
    /// anchors and need key material when mutual auth is required.
    pub fn build(
        role: Role,
        key_material: Option<KeyMaterial>,
        trust_anchors: Option<TrustAnchorSet>,
        options: TlsOptions,
    ) -> Result<Self, SslConfigError> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

        if let Some(material) = &key_material {
            check_key_material(material, &provider)?;
        }
        let roots = trust_anchors.as_ref().map(root_store).transpose()?;

        let role_config = match role {
            Role::Server => {
                let material = key_material.ok_or(SslConfigError::MissingKeyMaterial { role })?;
                if options.mutual_auth_required && roots.is_none() {
                    return Err(SslConfigError::MissingTrustAnchors { role });
                }
                RoleConfig::Server(Arc::new(server_config(material, roots, &options, provider)?))
            }
            Role::Client => {
                let roots = roots.ok_or(SslConfigError::MissingTrustAnchors { role })?;
                if options.mutual_auth_required && key_material.is_none() {
                    return Err(SslConfigError::MissingKeyMaterial { role });
                }
                RoleConfig::Client(Arc::new(client_config(key_material, roots, &options, provider)?))
            }
        };

        tracing::info!(
            role = %role,
            mutual_auth = options.mutual_auth_required,
            verify_hostname = options.verify_hostname,
            "built TLS context"
        );

        Ok(Self {
            role_config,
            options,
        })
    }

    pub fn client(
        key_material: Option<KeyMaterial>,
        trust_anchors: TrustAnchorSet,
        options: TlsOptions,
    ) -> Result<Self, SslConfigError> {
        Self::build(Role::Client, key_material, Some(trust_anchors), options)
    }

    pub fn server(
        key_material: KeyMaterial,
        trust_anchors: Option<TrustAnchorSet>,
        options: TlsOptions,
    ) -> Result<Self, SslConfigError> {
        Self::build(Role::Server, Some(key_material), trust_anchors, options)
    }

    /// Loads this role's stores and builds its context.
    ///
    /// Only the stores the role needs are opened: a client without mutual
    /// auth skips its keystore. A server without mutual auth still opens
    /// its truststore when the file exists, so certificates are requested
    /// and verified but not required; without one it never asks for them.
    pub fn from_settings(
        role: Role,
        settings: &StoreSettings,
        options: TlsOptions,
    ) -> Result<Self, ConfigError> {
        let needs_key = role == Role::Server || options.mutual_auth_required;
        let needs_trust = match role {
            Role::Client => true,
            Role::Server => options.mutual_auth_required || settings.truststore.exists(),
        };
        if role == Role::Server && !needs_trust {
            tracing::warn!(
                truststore = ?settings.truststore,
                "no truststore found; client certificates will not be requested"
            );
        }

        let key_material = needs_key
            .then(|| store::load_key_material(&settings.key_reference()))
            .transpose()?;
        let trust_anchors = needs_trust
            .then(|| store::load_trust_anchors(&settings.trust_reference()))
            .transpose()?;

        Ok(Self::build(role, key_material, trust_anchors, options)?)
    }

    pub fn role(&self) -> Role {
        match self.role_config {
            RoleConfig::Client(_) => Role::Client,
            RoleConfig::Server(_) => Role::Server,
        }
    }

    pub fn options(&self) -> &TlsOptions {
        &self.options
    }

    pub fn timeouts(&self) -> Timeouts {
        self.options.timeouts
    }

    pub fn mutual_auth_required(&self) -> bool {
        self.options.mutual_auth_required
    }

    /// The rustls client configuration, if this is a client context.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>, SslConfigError> {
        match &self.role_config {
            RoleConfig::Client(config) => Ok(Arc::clone(config)),
            RoleConfig::Server(_) => Err(SslConfigError::WrongRole {
                expected: Role::Client,
                actual:   Role::Server,
            }),
        }
    }

    /// The rustls server configuration, if this is a server context.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, SslConfigError> {
        match &self.role_config {
            RoleConfig::Server(config) => Ok(Arc::clone(config)),
            RoleConfig::Client(_) => Err(SslConfigError::WrongRole {
                expected: Role::Server,
                actual:   Role::Client,
            }),
        }
    }
}

fn server_config(
    material: KeyMaterial,
    roots: Option<RootCertStore>,
    options: &TlsOptions,
    provider: Arc<CryptoProvider>,
) -> Result<ServerConfig, SslConfigError> {
    let builder =
        ServerConfig::builder_with_provider(Arc::clone(&provider)).with_safe_default_protocol_versions()?;

    let builder = match roots {
        Some(roots) => {
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider);
            let verifier = if options.mutual_auth_required {
                verifier
            } else {
                verifier.allow_unauthenticated()
            };
            let verifier = verifier
                .build()
                .map_err(|e| SslConfigError::Verifier(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let mut config = builder.with_single_cert(material.chain().to_vec(), material.key().clone_key())?;
    config.alpn_protocols = options.alpn_protocols.clone();
    // Every connection gets a full handshake and a freshly verified client
    // certificate.
    config.session_storage = Arc::new(NoServerSessionStorage {});
    config.send_tls13_tickets = 0;
    Ok(config)
}

fn client_config(
    material: Option<KeyMaterial>,
    roots: RootCertStore,
    options: &TlsOptions,
    provider: Arc<CryptoProvider>,
) -> Result<ClientConfig, SslConfigError> {
    let builder =
        ClientConfig::builder_with_provider(Arc::clone(&provider)).with_safe_default_protocol_versions()?;

    let builder = if options.verify_hostname {
        builder.with_root_certificates(roots)
    } else {
        tracing::warn!("server hostname verification is disabled");
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|e| SslConfigError::Verifier(e.to_string()))?;
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(ChainOnlyVerifier::new(inner)))
    };

    let mut config = match material {
        Some(material) => {
            builder.with_client_auth_cert(material.chain().to_vec(), material.key().clone_key())?
        }
        None => builder.with_no_client_auth(),
    };
    config.alpn_protocols = options.alpn_protocols.clone();
    config.resumption = Resumption::disabled();
    Ok(config)
}

/// Checks validity windows and that the leaf matches the private key.
fn check_key_material(material: &KeyMaterial, provider: &CryptoProvider) -> Result<(), SslConfigError> {
    let now = unix_now()?;
    for cert in material.chain() {
        check_validity(cert, now)?;
    }

    let signing_key = provider
        .key_provider
        .load_private_key(material.key().clone_key())
        .map_err(|e| SslConfigError::KeyMismatch(format!("unusable private key: {e}")))?;
    let certified = CertifiedKey::new(material.chain().to_vec(), signing_key);
    match certified.keys_match() {
        Ok(()) => Ok(()),
        Err(rustls::Error::InconsistentKeys(InconsistentKeys::Unknown)) => {
            tracing::debug!(alias = material.alias(), "key pairing could not be checked for this key type");
            Ok(())
        }
        Err(e) => Err(SslConfigError::KeyMismatch(e.to_string())),
    }
}

/// Builds a root store, skipping anchors outside their validity window.
fn root_store(anchors: &TrustAnchorSet) -> Result<RootCertStore, SslConfigError> {
    let now = unix_now()?;
    let mut roots = RootCertStore::empty();
    let mut skipped = 0;
    for (alias, cert) in anchors.iter() {
        match check_validity(cert, now) {
            Ok(()) => roots
                .add(cert.clone())
                .map_err(|e| SslConfigError::InvalidCertificate(format!("{alias}: {e}")))?,
            Err(e) => {
                tracing::warn!(alias, error = %e, "skipping trust anchor");
                skipped += 1;
            }
        }
    }

    if roots.is_empty() {
        return Err(SslConfigError::NoUsableTrustAnchors);
    }
    if skipped > 0 {
        tracing::info!(skipped, valid = roots.len(), "trust anchor validity check completed");
    }
    Ok(roots)
}

fn check_validity(cert_der: &CertificateDer<'_>, now: i64) -> Result<(), SslConfigError> {
    let (_, cert) = X509Certificate::from_der(cert_der.as_ref())
        .map_err(|e| SslConfigError::InvalidCertificate(format!("failed to parse certificate: {e}")))?;

    let validity = cert.validity();
    let not_before = validity.not_before.timestamp();
    let not_after = validity.not_after.timestamp();

    if now < not_before {
        return Err(SslConfigError::CertificateNotYetValid {
            subject: cert.subject().to_string(),
            not_before,
            now,
        });
    }
    if now > not_after {
        return Err(SslConfigError::CertificateExpired {
            subject: cert.subject().to_string(),
            not_after,
            now,
        });
    }
    Ok(())
}

fn unix_now() -> Result<i64, SslConfigError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .map_err(|e| SslConfigError::Clock(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::StoreError, testing::Pki};

    #[test]
    fn mutual_server_context_builds() {
        let pki = Pki::generate();
        let config = TlsConfig::server(
            pki.server.key_material(),
            Some(pki.trust_anchors()),
            TlsOptions::default(),
        )
        .unwrap();
        assert_eq!(config.role(), Role::Server);
        assert!(config.mutual_auth_required());
        assert!(config.server_config().is_ok());
    }

    #[test]
    fn server_requires_key_material() {
        let pki = Pki::generate();
        let err = TlsConfig::build(Role::Server, None, Some(pki.trust_anchors()), TlsOptions::default())
            .unwrap_err();
        assert!(matches!(err, SslConfigError::MissingKeyMaterial { role: Role::Server }));
    }

    #[test]
    fn mutual_server_requires_trust_anchors() {
        let pki = Pki::generate();
        let err = TlsConfig::server(pki.server.key_material(), None, TlsOptions::default()).unwrap_err();
        assert!(matches!(err, SslConfigError::MissingTrustAnchors { role: Role::Server }));
    }

    #[test]
    fn server_without_mutual_auth_needs_no_anchors() {
        let pki = Pki::generate();
        let options = TlsOptions::default().with_mutual_auth(false);
        assert!(TlsConfig::server(pki.server.key_material(), None, options).is_ok());
    }

    #[test]
    fn client_requires_trust_anchors() {
        let pki = Pki::generate();
        let err = TlsConfig::build(Role::Client, Some(pki.client.key_material()), None, TlsOptions::default())
            .unwrap_err();
        assert!(matches!(err, SslConfigError::MissingTrustAnchors { role: Role::Client }));
    }

    #[test]
    fn mutual_client_requires_key_material() {
        let pki = Pki::generate();
        let err = TlsConfig::client(None, pki.trust_anchors(), TlsOptions::default()).unwrap_err();
        assert!(matches!(err, SslConfigError::MissingKeyMaterial { role: Role::Client }));

        let anonymous = TlsConfig::client(None, pki.trust_anchors(), TlsOptions::default().with_mutual_auth(false));
        assert!(anonymous.is_ok());
    }

    #[test]
    fn mismatched_key_is_rejected() {
        let pki = Pki::generate();
        let crossed = KeyMaterial::new(
            "crossed",
            vec![pki.server.cert.clone()],
            pki.client.key.clone_key(),
        );
        let err = TlsConfig::server(crossed, Some(pki.trust_anchors()), TlsOptions::default()).unwrap_err();
        assert!(matches!(err, SslConfigError::KeyMismatch(_)), "{err:?}");
    }

    #[test]
    fn expired_chain_is_rejected() {
        let pki = Pki::generate();
        let expired = pki.issue_expired_client("old-client");
        let err = TlsConfig::client(Some(expired.key_material()), pki.trust_anchors(), TlsOptions::default())
            .unwrap_err();
        assert!(matches!(err, SslConfigError::CertificateExpired { .. }), "{err:?}");
    }

    #[test]
    fn expired_anchors_are_skipped() {
        let pki = Pki::generate();
        let mut anchors = pki.trust_anchors();
        anchors.push("stale", pki.issue_expired_client("stale").cert);
        assert!(TlsConfig::client(Some(pki.client.key_material()), anchors, TlsOptions::default()).is_ok());

        let mut only_stale = TrustAnchorSet::new();
        only_stale.push("stale", pki.issue_expired_client("stale").cert);
        let err = TlsConfig::client(Some(pki.client.key_material()), only_stale, TlsOptions::default())
            .unwrap_err();
        assert!(matches!(err, SslConfigError::NoUsableTrustAnchors));
    }

    #[test]
    fn role_accessors_refuse_the_other_role() {
        let pki = Pki::generate();
        let client = TlsConfig::client(Some(pki.client.key_material()), pki.trust_anchors(), TlsOptions::default())
            .unwrap();
        assert!(client.client_config().is_ok());
        assert!(matches!(
            client.server_config(),
            Err(SslConfigError::WrongRole {
                expected: Role::Server,
                actual:   Role::Client,
            })
        ));
    }

    #[test]
    fn alpn_protocols_are_applied() {
        let pki = Pki::generate();
        let options = TlsOptions::default().with_alpn_protocols(vec![b"keyward".to_vec()]);
        let server = TlsConfig::server(pki.server.key_material(), Some(pki.trust_anchors()), options).unwrap();
        assert_eq!(server.server_config().unwrap().alpn_protocols, vec![b"keyward".to_vec()]);
    }

    #[test]
    fn builds_from_store_settings() {
        let pki = Pki::generate();
        let dir = tempfile::tempdir().unwrap();
        let settings = pki.write_role_stores(dir.path(), Role::Server, &pki.server);
        let config = TlsConfig::from_settings(Role::Server, &settings, TlsOptions::default()).unwrap();
        assert_eq!(config.role(), Role::Server);
    }

    #[test]
    fn store_failures_surface_as_config_errors() {
        let pki = Pki::generate();
        let dir = tempfile::tempdir().unwrap();
        let mut settings = pki.write_role_stores(dir.path(), Role::Client, &pki.client);
        settings.keystore_passphrase = "wrong".into();
        let err = TlsConfig::from_settings(Role::Client, &settings, TlsOptions::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Store(StoreError::PassphraseInvalid { .. })), "{err:?}");
    }

    #[test]
    fn optional_auth_server_still_opens_an_existing_truststore() {
        let pki = Pki::generate();
        let dir = tempfile::tempdir().unwrap();
        let mut settings = pki.write_role_stores(dir.path(), Role::Server, &pki.server);
        settings.truststore_passphrase = "wrong".into();
        let options = TlsOptions::default().with_mutual_auth(false);
        let err = TlsConfig::from_settings(Role::Server, &settings, options.clone()).unwrap_err();
        assert!(matches!(err, ConfigError::Store(StoreError::PassphraseInvalid { .. })), "{err:?}");

        settings.truststore = dir.path().join("absent.json");
        assert!(TlsConfig::from_settings(Role::Server, &settings, options).is_ok());
    }
}
