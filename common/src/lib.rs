//! Keyward Common Library
//!
//! Shared building blocks for the keyward client and server. It includes:
//!
//! - Encrypted credential stores holding key material or trust anchors
//! - Role-tagged TLS contexts with mutual authentication
//! - Extraction of the authenticated client principal
//! - Timed payload exchange over an established TLS stream
//!
//! # Features
//!
//! - **Mutual TLS**: both peers present certificates chained to a configured
//!   trust anchor set
//! - **Fail fast**: stores, keys and validity windows are checked once when a
//!   context is built, never per connection
//! - **Redacted secrets**: passphrases never appear in debug output or logs
//! - **`testing`**: a throwaway PKI and store writer for integration tests

/// Store locations, passphrases and environment configuration
pub mod config;

pub mod error;

/// Peer principal extraction
pub mod principal;

/// Encrypted credential store format
pub mod store;

/// TLS context builder
pub mod tls_config;

/// Timed read/write helpers for TLS streams
pub mod tls_stream;

mod verifier;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types for convenience
pub use config::{timeouts_from_env, CredentialReference, Secret, StoreSettings, DEFAULT_TIMEOUT};
pub use error::{ConfigError, PrincipalError, SslConfigError, StoreError};
pub use principal::AuthenticatedPrincipal;
pub use store::{
    load, load_key_material, load_trust_anchors, KeyMaterial, LoadedMaterial, MaterialKind,
    StoreWriter, TrustAnchorSet,
};
pub use tls_config::{Role, SubjectField, Timeouts, TlsConfig, TlsOptions, DEFAULT_MAX_PAYLOAD};
pub use tls_stream::StreamError;
pub use verifier::is_name_mismatch;
