use std::{env, fmt, path::PathBuf, time::Duration};

use crate::tls_config::{Role, Timeouts};

const CERTS_DIR_ENV: &str = "KEYWARD_CERTS_DIR";
const DEFAULT_CERTS_DIR: &str = "certs";

const TIMEOUT_ENV: &str = "KEYWARD_TIMEOUT_MS";
const HANDSHAKE_TIMEOUT_ENV: &str = "KEYWARD_HANDSHAKE_TIMEOUT_MS";
const READ_TIMEOUT_ENV: &str = "KEYWARD_READ_TIMEOUT_MS";
const WRITE_TIMEOUT_ENV: &str = "KEYWARD_WRITE_TIMEOUT_MS";

/// Shared bound applied to every phase unless overridden.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

fn get_certs_dir() -> PathBuf {
    env::var(CERTS_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CERTS_DIR))
}

/// A passphrase. Debug output is redacted and the type is not serializable.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the cleartext passphrase.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Where a credential store lives and how to open it.
#[derive(Debug, Clone)]
pub struct CredentialReference {
    /// Path to the store file
    pub store_location:   PathBuf,
    /// Opens the store envelope
    pub store_passphrase: Secret,
    /// Opens the private key entry; unused for trust stores
    pub key_passphrase:   Secret,
    /// Private key entry to select; required when the store holds several
    pub alias:            Option<String>,
}

impl CredentialReference {
    pub fn new(
        store_location: impl Into<PathBuf>,
        store_passphrase: impl Into<Secret>,
        key_passphrase: impl Into<Secret>,
    ) -> Self {
        Self {
            store_location:   store_location.into(),
            store_passphrase: store_passphrase.into(),
            key_passphrase:   key_passphrase.into(),
            alias:            None,
        }
    }

    /// Reference to a trust store, which has no key passphrase.
    pub fn trust_store(
        store_location: impl Into<PathBuf>,
        store_passphrase: impl Into<Secret>,
    ) -> Self {
        Self::new(store_location, store_passphrase, Secret::default())
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

/// Startup credential settings for one role.
///
/// Field for field this is the `server.ssl.*` property block: keystore,
/// keystore passphrase, key passphrase, truststore, truststore passphrase.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Path to the keystore holding this role's private key and chain
    pub keystore:              PathBuf,
    pub keystore_passphrase:   Secret,
    pub key_passphrase:        Secret,
    pub key_alias:             Option<String>,
    /// Path to the truststore holding the peer's trust anchors
    pub truststore:            PathBuf,
    pub truststore_passphrase: Secret,
}

impl StoreSettings {
    /// Creates settings with default store locations for `role`.
    ///
    /// Stores are expected in a `server` or `client` subdirectory of the
    /// certs directory, which `KEYWARD_CERTS_DIR` overrides.
    pub fn new(role: Role) -> Self {
        let base = get_certs_dir().join(role.as_str());
        Self {
            keystore:              base.join("keystore.json"),
            keystore_passphrase:   Secret::default(),
            key_passphrase:        Secret::default(),
            key_alias:             None,
            truststore:            base.join("truststore.json"),
            truststore_passphrase: Secret::default(),
        }
    }

    /// Creates settings from `KEYWARD_<ROLE>_*` environment variables,
    /// falling back to the defaults of [`StoreSettings::new`].
    ///
    /// An empty key passphrase falls back to the keystore passphrase, the
    /// usual convention for single-passphrase keystores.
    pub fn from_env(role: Role) -> Self {
        let mut settings = Self::new(role);
        let prefix = format!("KEYWARD_{}", role.as_str().to_uppercase());
        let var = |suffix: &str| env::var(format!("{prefix}_{suffix}")).ok();

        if let Some(path) = var("KEYSTORE") {
            settings.keystore = PathBuf::from(path);
        }
        if let Some(pass) = var("KEYSTORE_PASSWORD") {
            settings.keystore_passphrase = Secret::from(pass);
        }
        settings.key_passphrase = var("KEY_PASSWORD")
            .map(Secret::from)
            .unwrap_or_else(|| settings.keystore_passphrase.clone());
        settings.key_alias = var("KEY_ALIAS").filter(|alias| !alias.is_empty());
        if let Some(path) = var("TRUSTSTORE") {
            settings.truststore = PathBuf::from(path);
        }
        if let Some(pass) = var("TRUSTSTORE_PASSWORD") {
            settings.truststore_passphrase = Secret::from(pass);
        }

        settings
    }

    /// Reference to this role's keystore.
    pub fn key_reference(&self) -> CredentialReference {
        CredentialReference {
            store_location:   self.keystore.clone(),
            store_passphrase: self.keystore_passphrase.clone(),
            key_passphrase:   self.key_passphrase.clone(),
            alias:            self.key_alias.clone(),
        }
    }

    /// Reference to this role's truststore.
    pub fn trust_reference(&self) -> CredentialReference {
        CredentialReference::trust_store(&self.truststore, self.truststore_passphrase.clone())
    }
}

/// Reads phase timeouts from the environment.
///
/// `KEYWARD_TIMEOUT_MS` sets the shared bound; the per-phase variables
/// override it. Unparseable values are ignored with a warning.
pub fn timeouts_from_env() -> Timeouts {
    let shared = millis_from_env(TIMEOUT_ENV).unwrap_or(DEFAULT_TIMEOUT);
    Timeouts {
        handshake: millis_from_env(HANDSHAKE_TIMEOUT_ENV).unwrap_or(shared),
        read:      millis_from_env(READ_TIMEOUT_ENV).unwrap_or(shared),
        write:     millis_from_env(WRITE_TIMEOUT_ENV).unwrap_or(shared),
    }
}

fn millis_from_env(name: &str) -> Option<Duration> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Some(Duration::from_millis(ms)),
        _ => {
            tracing::warn!(variable = name, value = %raw, "ignoring invalid timeout");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_debug_is_redacted() {
        let secret = Secret::from("hunter2");
        assert_eq!(format!("{secret:?}"), "Secret(***)");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn reference_debug_never_shows_passphrases() {
        let reference = CredentialReference::new("ks.json", "store-pass", "key-pass");
        let rendered = format!("{reference:?}");
        assert!(!rendered.contains("store-pass"));
        assert!(!rendered.contains("key-pass"));
    }

    #[test]
    fn default_locations_are_per_role() {
        let server = StoreSettings::new(Role::Server);
        let client = StoreSettings::new(Role::Client);
        assert!(server.keystore.ends_with("server/keystore.json"));
        assert!(client.truststore.ends_with("client/truststore.json"));
    }

    #[test]
    fn trust_reference_has_no_key_passphrase() {
        let mut settings = StoreSettings::new(Role::Client);
        settings.truststore_passphrase = Secret::from("trust");
        settings.key_passphrase = Secret::from("key");
        let reference = settings.trust_reference();
        assert_eq!(reference.store_passphrase.expose(), "trust");
        assert_eq!(reference.key_passphrase.expose(), "");
        assert!(reference.alias.is_none());
    }
}
