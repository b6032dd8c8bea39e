//! Error taxonomy shared by both peer roles.
//!
//! Configuration errors ([`StoreError`], [`SslConfigError`]) are fatal at
//! startup. Nothing in this crate retries or falls back to plaintext.

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::tls_config::Role;

/// Failures while reading a credential store from storage.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store is missing or cannot be read.
    #[error("credential store {path:?} not found or unreadable: {source}")]
    StoreNotFound {
        path:   PathBuf,
        #[source]
        source: io::Error,
    },

    /// The store exists but its contents cannot be parsed.
    #[error("credential store {path:?} is corrupt: {reason}")]
    StoreCorrupt { path: PathBuf, reason: String },

    /// The store passphrase does not open the store.
    #[error("store passphrase rejected for {path:?}")]
    PassphraseInvalid { path: PathBuf },

    /// The private key entry exists but the key passphrase does not open it.
    #[error("private key {alias:?} in {path:?} cannot be recovered with the given key passphrase")]
    KeyUnrecoverable { path: PathBuf, alias: String },

    /// No private key entry matches the request.
    #[error("no private key entry {alias} in {path:?}")]
    KeyEntryNotFound { path: PathBuf, alias: String },
}

impl StoreError {
    pub(crate) fn corrupt(path: &std::path::Path, reason: impl Into<String>) -> Self {
        Self::StoreCorrupt {
            path:   path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// Failures while turning loaded material into a TLS context.
#[derive(Debug, Error)]
pub enum SslConfigError {
    #[error("{role} TLS context requires key material")]
    MissingKeyMaterial { role: Role },

    #[error("{role} TLS context requires trust anchors")]
    MissingTrustAnchors { role: Role },

    #[error("no usable trust anchors remain after validation")]
    NoUsableTrustAnchors,

    #[error("certificate chain does not match the private key: {0}")]
    KeyMismatch(String),

    #[error("certificate {subject} expired (not_after: {not_after}, now: {now})")]
    CertificateExpired {
        subject:   String,
        not_after: i64,
        now:       i64,
    },

    #[error("certificate {subject} not yet valid (not_before: {not_before}, now: {now})")]
    CertificateNotYetValid {
        subject:    String,
        not_before: i64,
        now:        i64,
    },

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("failed to build certificate verifier: {0}")]
    Verifier(String),

    #[error("expected a {expected} TLS context, got {actual}")]
    WrongRole { expected: Role, actual: Role },

    #[error("system clock error: {0}")]
    Clock(String),

    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Any configuration failure that must abort startup for a role.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ssl(#[from] SslConfigError),
}

/// Failures while projecting a peer certificate onto a principal.
#[derive(Debug, Error)]
pub enum PrincipalError {
    /// The peer presented no certificate.
    #[error("peer presented no certificate")]
    NoPeerCertificate,

    #[error("peer certificate cannot be parsed: {0}")]
    MalformedCertificate(String),

    #[error("peer certificate subject has no {0} attribute")]
    MissingSubjectField(&'static str),
}
