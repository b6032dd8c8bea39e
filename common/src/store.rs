//! Credential stores: passphrase-sealed containers of key entries and
//! trust anchors.
//!
//! A store is a JSON envelope whose body is encrypted with
//! ChaCha20-Poly1305 under a PBKDF2-HMAC-SHA256 key derived from the store
//! passphrase. Inside, each private key is additionally sealed as a PKCS#8
//! `EncryptedPrivateKeyInfo` under its own key passphrase, so a wrong store
//! passphrase and a wrong key passphrase are told apart.

use std::{fmt, fs, io, path::Path};

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use pkcs8::{pkcs5::pbes2, EncryptedPrivateKeyInfo, PrivateKeyInfo};
use rand::{rngs::OsRng, RngCore};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::{
    config::{CredentialReference, Secret},
    error::StoreError,
};

/// Identifies the envelope format.
pub const STORE_FORMAT: &str = "keyward-store";
pub const STORE_VERSION: u32 = 1;

/// PBKDF2 rounds used when sealing unless overridden.
pub const DEFAULT_ITERATIONS: u32 = 210_000;
const MAX_ITERATIONS: u32 = 10_000_000;
const KDF_ALGORITHM: &str = "pbkdf2-sha256";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

#[derive(Serialize, Deserialize)]
struct Envelope {
    format:     String,
    version:    u32,
    kdf:        KdfParams,
    nonce:      String,
    ciphertext: String,
}

#[derive(Serialize, Deserialize)]
struct KdfParams {
    algorithm:  String,
    iterations: u32,
    salt:       String,
}

impl KdfParams {
    /// Associated data binding the ciphertext to its header.
    fn aad(&self, version: u32) -> Vec<u8> {
        format!(
            "{STORE_FORMAT}:{version}:{}:{}:{}",
            self.algorithm, self.iterations, self.salt
        )
        .into_bytes()
    }
}

#[derive(Serialize, Deserialize)]
struct StoreBody {
    entries: Vec<StoreEntry>,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StoreEntry {
    PrivateKey {
        alias:         String,
        chain:         Vec<String>,
        encrypted_key: String,
    },
    TrustedCertificate {
        alias:       String,
        certificate: String,
    },
}

impl StoreEntry {
    fn alias(&self) -> &str {
        match self {
            StoreEntry::PrivateKey { alias, .. } | StoreEntry::TrustedCertificate { alias, .. } => {
                alias
            }
        }
    }
}

/// A private key and its certificate chain, leaf first.
pub struct KeyMaterial {
    alias: String,
    chain: Vec<CertificateDer<'static>>,
    key:   PrivateKeyDer<'static>,
}

impl KeyMaterial {
    pub fn new(
        alias: impl Into<String>,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Self {
        Self {
            alias: alias.into(),
            chain,
            key,
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    pub(crate) fn key(&self) -> &PrivateKeyDer<'static> {
        &self.key
    }
}

impl Clone for KeyMaterial {
    fn clone(&self) -> Self {
        Self {
            alias: self.alias.clone(),
            chain: self.chain.clone(),
            key:   self.key.clone_key(),
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("alias", &self.alias)
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

/// Certificates trusted to anchor a peer's chain.
#[derive(Debug, Clone, Default)]
pub struct TrustAnchorSet {
    anchors: Vec<(String, CertificateDer<'static>)>,
}

impl TrustAnchorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, alias: impl Into<String>, certificate: CertificateDer<'static>) {
        self.anchors.push((alias.into(), certificate));
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Aliases and certificates in store order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &CertificateDer<'static>)> {
        self.anchors.iter().map(|(alias, cert)| (alias.as_str(), cert))
    }
}

/// What to read out of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialKind {
    KeyMaterial,
    TrustAnchors,
}

#[derive(Debug)]
pub enum LoadedMaterial {
    Key(KeyMaterial),
    Trust(TrustAnchorSet),
}

/// Reads `kind` from the store named by `reference`.
pub fn load(
    reference: &CredentialReference,
    kind: MaterialKind,
) -> Result<LoadedMaterial, StoreError> {
    match kind {
        MaterialKind::KeyMaterial => load_key_material(reference).map(LoadedMaterial::Key),
        MaterialKind::TrustAnchors => load_trust_anchors(reference).map(LoadedMaterial::Trust),
    }
}

/// Loads the private key entry selected by `reference.alias`.
///
/// Without an alias the store must hold exactly one private key entry.
pub fn load_key_material(reference: &CredentialReference) -> Result<KeyMaterial, StoreError> {
    let path = reference.store_location.as_path();
    let body = open(path, &reference.store_passphrase)?;

    let mut candidates = body.entries.into_iter().filter_map(|entry| match entry {
        StoreEntry::PrivateKey {
            alias,
            chain,
            encrypted_key,
        } => Some((alias, chain, encrypted_key)),
        StoreEntry::TrustedCertificate { .. } => None,
    });

    let (alias, chain, encrypted_key) = match &reference.alias {
        Some(wanted) => candidates
            .find(|(alias, _, _)| alias == wanted)
            .ok_or_else(|| StoreError::KeyEntryNotFound {
                path:  path.to_path_buf(),
                alias: format!("{wanted:?}"),
            })?,
        None => {
            let mut all: Vec<_> = candidates.collect();
            match all.len() {
                0 => {
                    return Err(StoreError::KeyEntryNotFound {
                        path:  path.to_path_buf(),
                        alias: "(any)".to_string(),
                    })
                }
                1 => all.remove(0),
                count => {
                    return Err(StoreError::KeyEntryNotFound {
                        path:  path.to_path_buf(),
                        alias: format!("(unspecified; store holds {count} private keys)"),
                    })
                }
            }
        }
    };

    let chain = chain
        .iter()
        .map(|hex_der| decode_certificate(path, hex_der))
        .collect::<Result<Vec<_>, _>>()?;
    if chain.is_empty() {
        return Err(StoreError::corrupt(
            path,
            format!("private key entry {alias:?} has an empty certificate chain"),
        ));
    }

    let encrypted = hex::decode(&encrypted_key)
        .map_err(|e| StoreError::corrupt(path, format!("entry {alias:?}: bad key encoding: {e}")))?;
    let encrypted = EncryptedPrivateKeyInfo::try_from(encrypted.as_slice()).map_err(|e| {
        StoreError::corrupt(path, format!("entry {alias:?}: bad encrypted key: {e}"))
    })?;

    let unrecoverable = || StoreError::KeyUnrecoverable {
        path:  path.to_path_buf(),
        alias: alias.clone(),
    };
    let decrypted = encrypted
        .decrypt(reference.key_passphrase.expose())
        .map_err(|_| unrecoverable())?;
    // CBC padding can accept a wrong passphrase by chance; the plaintext
    // must still parse as a private key.
    PrivateKeyInfo::try_from(decrypted.as_bytes()).map_err(|_| unrecoverable())?;

    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(decrypted.as_bytes().to_vec()));

    tracing::debug!(path = ?path, alias = %alias, chain_len = chain.len(), "loaded key material");
    Ok(KeyMaterial { alias, chain, key })
}

/// Loads every trusted certificate entry of a store.
pub fn load_trust_anchors(reference: &CredentialReference) -> Result<TrustAnchorSet, StoreError> {
    let path = reference.store_location.as_path();
    let body = open(path, &reference.store_passphrase)?;

    let mut anchors = TrustAnchorSet::new();
    for entry in body.entries {
        if let StoreEntry::TrustedCertificate { alias, certificate } = entry {
            let certificate = decode_certificate(path, &certificate)?;
            anchors.push(alias, certificate);
        }
    }

    tracing::debug!(path = ?path, anchors = anchors.len(), "loaded trust anchors");
    Ok(anchors)
}

fn open(path: &Path, passphrase: &Secret) -> Result<StoreBody, StoreError> {
    let raw = fs::read(path).map_err(|source| StoreError::StoreNotFound {
        path: path.to_path_buf(),
        source,
    })?;

    let envelope: Envelope = serde_json::from_slice(&raw)
        .map_err(|e| StoreError::corrupt(path, format!("unreadable envelope: {e}")))?;
    if envelope.format != STORE_FORMAT {
        return Err(StoreError::corrupt(
            path,
            format!("unknown format {:?}", envelope.format),
        ));
    }
    if envelope.version != STORE_VERSION {
        return Err(StoreError::corrupt(
            path,
            format!("unsupported version {}", envelope.version),
        ));
    }
    if envelope.kdf.algorithm != KDF_ALGORITHM {
        return Err(StoreError::corrupt(
            path,
            format!("unsupported kdf {:?}", envelope.kdf.algorithm),
        ));
    }
    if envelope.kdf.iterations == 0 || envelope.kdf.iterations > MAX_ITERATIONS {
        return Err(StoreError::corrupt(
            path,
            format!("implausible kdf iteration count {}", envelope.kdf.iterations),
        ));
    }

    let salt = hex::decode(&envelope.kdf.salt)
        .map_err(|e| StoreError::corrupt(path, format!("bad salt: {e}")))?;
    let nonce = hex::decode(&envelope.nonce)
        .map_err(|e| StoreError::corrupt(path, format!("bad nonce: {e}")))?;
    if nonce.len() != NONCE_LEN {
        return Err(StoreError::corrupt(
            path,
            format!("nonce must be {NONCE_LEN} bytes, got {}", nonce.len()),
        ));
    }
    let ciphertext = hex::decode(&envelope.ciphertext)
        .map_err(|e| StoreError::corrupt(path, format!("bad ciphertext: {e}")))?;

    let cipher = envelope_cipher(passphrase, &salt, envelope.kdf.iterations);
    let aad = envelope.kdf.aad(envelope.version);
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| StoreError::PassphraseInvalid {
            path: path.to_path_buf(),
        })?;

    serde_json::from_slice(&plaintext)
        .map_err(|e| StoreError::corrupt(path, format!("unreadable store body: {e}")))
}

fn envelope_cipher(passphrase: &Secret, salt: &[u8], iterations: u32) -> ChaCha20Poly1305 {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.expose().as_bytes(), salt, iterations, &mut key);
    ChaCha20Poly1305::new(Key::from_slice(&key))
}

fn decode_certificate(path: &Path, hex_der: &str) -> Result<CertificateDer<'static>, StoreError> {
    let der = hex::decode(hex_der)
        .map_err(|e| StoreError::corrupt(path, format!("bad certificate encoding: {e}")))?;
    x509_parser::parse_x509_certificate(&der)
        .map_err(|e| StoreError::corrupt(path, format!("unparseable certificate: {e}")))?;
    Ok(CertificateDer::from(der))
}

/// Failures while sealing a store.
#[derive(Debug, Error)]
pub enum SealError {
    #[error("alias {0:?} is already used in this store")]
    DuplicateAlias(String),

    #[error("private key {0:?} must be PKCS#8")]
    UnsupportedKeyFormat(String),

    #[error("private key {alias:?} is not valid PKCS#8: {reason}")]
    InvalidKey { alias: String, reason: String },

    #[error("private key {0:?} has no certificate chain")]
    EmptyChain(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("failed to encode store: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to write store: {0}")]
    Io(#[from] io::Error),
}

/// Builds and seals a credential store.
///
/// ```no_run
/// # use keyward_common::{store::StoreWriter, Secret};
/// # fn demo(ca: rustls::pki_types::CertificateDer<'static>) -> Result<(), Box<dyn std::error::Error>> {
/// StoreWriter::new()
///     .trusted_certificate("root-ca", &ca)?
///     .write("truststore.json", &Secret::from("changeit"))?;
/// # Ok(())
/// # }
/// ```
pub struct StoreWriter {
    entries:    Vec<StoreEntry>,
    iterations: u32,
}

impl Default for StoreWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreWriter {
    pub fn new() -> Self {
        Self {
            entries:    Vec::new(),
            iterations: DEFAULT_ITERATIONS,
        }
    }

    /// PBKDF2 rounds for both the envelope and private keys.
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations.clamp(1, MAX_ITERATIONS);
        self
    }

    /// Adds a private key entry sealed under `key_passphrase`.
    pub fn private_key(
        mut self,
        alias: impl Into<String>,
        chain: &[CertificateDer<'_>],
        key: &PrivateKeyDer<'_>,
        key_passphrase: &Secret,
    ) -> Result<Self, SealError> {
        let alias = self.claim_alias(alias.into())?;
        if chain.is_empty() {
            return Err(SealError::EmptyChain(alias));
        }
        let PrivateKeyDer::Pkcs8(pkcs8) = key else {
            return Err(SealError::UnsupportedKeyFormat(alias));
        };
        let info = PrivateKeyInfo::try_from(pkcs8.secret_pkcs8_der()).map_err(|e| {
            SealError::InvalidKey {
                alias:  alias.clone(),
                reason: e.to_string(),
            }
        })?;

        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut iv);
        let params = pbes2::Parameters::pbkdf2_sha256_aes256cbc(self.iterations, &salt, &iv)
            .map_err(|e| SealError::Encryption(e.to_string()))?;
        let sealed = info
            .encrypt_with_params(params, key_passphrase.expose())
            .map_err(|e| SealError::Encryption(e.to_string()))?;

        self.entries.push(StoreEntry::PrivateKey {
            alias,
            chain: chain.iter().map(hex::encode).collect(),
            encrypted_key: hex::encode(sealed.as_bytes()),
        });
        Ok(self)
    }

    /// Adds a trusted certificate entry.
    pub fn trusted_certificate(
        mut self,
        alias: impl Into<String>,
        certificate: &CertificateDer<'_>,
    ) -> Result<Self, SealError> {
        let alias = self.claim_alias(alias.into())?;
        self.entries.push(StoreEntry::TrustedCertificate {
            alias,
            certificate: hex::encode(certificate),
        });
        Ok(self)
    }

    /// Encrypts the entries under `store_passphrase` and returns the store.
    pub fn seal(&self, store_passphrase: &Secret) -> Result<Vec<u8>, SealError> {
        let body = serde_json::to_vec(&StoreBodyRef {
            entries: &self.entries,
        })?;

        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce);

        let kdf = KdfParams {
            algorithm:  KDF_ALGORITHM.to_string(),
            iterations: self.iterations,
            salt:       hex::encode(salt),
        };
        let cipher = envelope_cipher(store_passphrase, &salt, self.iterations);
        let aad = kdf.aad(STORE_VERSION);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &body,
                    aad: &aad,
                },
            )
            .map_err(|e| SealError::Encryption(e.to_string()))?;

        let envelope = Envelope {
            format: STORE_FORMAT.to_string(),
            version: STORE_VERSION,
            kdf,
            nonce: hex::encode(nonce),
            ciphertext: hex::encode(ciphertext),
        };
        Ok(serde_json::to_vec_pretty(&envelope)?)
    }

    /// Seals the store and writes it to `path`.
    pub fn write(&self, path: impl AsRef<Path>, store_passphrase: &Secret) -> Result<(), SealError> {
        let sealed = self.seal(store_passphrase)?;
        fs::write(path.as_ref(), sealed)?;
        tracing::info!(path = ?path.as_ref(), entries = self.entries.len(), "wrote credential store");
        Ok(())
    }

    fn claim_alias(&self, alias: String) -> Result<String, SealError> {
        if self.entries.iter().any(|entry| entry.alias() == alias) {
            return Err(SealError::DuplicateAlias(alias));
        }
        Ok(alias)
    }
}

#[derive(Serialize)]
struct StoreBodyRef<'a> {
    entries: &'a [StoreEntry],
}
