//! Throwaway PKI for tests: one CA, a server leaf and a client leaf.
//!
//! Enabled by the `testing` feature.

use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
pub use tempfile::{tempdir, TempDir};

use crate::{
    config::{Secret, StoreSettings},
    store::{KeyMaterial, StoreWriter, TrustAnchorSet},
    tls_config::Role,
};

/// Keeps store sealing fast in debug builds.
pub const FAST_ITERATIONS: u32 = 1_000;

pub const STORE_PASSPHRASE: &str = "store-changeit";
pub const KEY_PASSPHRASE: &str = "key-changeit";
pub const TRUST_PASSPHRASE: &str = "trust-changeit";

/// A leaf certificate and its private key.
pub struct Identity {
    pub common_name: String,
    pub cert:        CertificateDer<'static>,
    pub key:         PrivateKeyDer<'static>,
}

impl Identity {
    pub fn key_material(&self) -> KeyMaterial {
        KeyMaterial::new(
            self.common_name.clone(),
            vec![self.cert.clone()],
            self.key.clone_key(),
        )
    }
}

pub struct Pki {
    pub ca_cert: CertificateDer<'static>,
    ca:          rcgen::Certificate,
    ca_key:      KeyPair,
    /// `localhost` / `127.0.0.1` server leaf
    pub server:  Identity,
    /// `client1` client leaf
    pub client:  Identity,
}

impl Pki {
    pub fn generate() -> Self {
        Self::with_ca_name("Keyward Test CA")
    }

    /// A PKI whose CA nobody else trusts.
    pub fn rogue() -> Self {
        Self::with_ca_name("Rogue CA")
    }

    fn with_ca_name(ca_name: &str) -> Self {
        let ca_key = KeyPair::generate().expect("generate CA key");
        let mut params = CertificateParams::new(Vec::<String>::new()).expect("CA params");
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, ca_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca = params.self_signed(&ca_key).expect("self-sign CA");

        let mut pki = Self {
            ca_cert: ca.der().clone(),
            ca,
            ca_key,
            server: placeholder(),
            client: placeholder(),
        };
        pki.server = pki.issue_server(&["localhost", "127.0.0.1"]);
        pki.client = pki.issue_client("client1");
        pki
    }

    /// Issues a server leaf valid for `names` (DNS names or IP addresses).
    pub fn issue_server(&self, names: &[&str]) -> Identity {
        let names: Vec<String> = names.iter().map(|name| name.to_string()).collect();
        let mut params = CertificateParams::new(names.clone()).expect("server params");
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        self.issue(params, &names[0])
    }

    pub fn issue_client(&self, common_name: &str) -> Identity {
        let mut params = CertificateParams::new(Vec::<String>::new()).expect("client params");
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        self.issue(params, common_name)
    }

    /// A client leaf whose validity ended in 2001.
    pub fn issue_expired_client(&self, common_name: &str) -> Identity {
        let mut params = CertificateParams::new(Vec::<String>::new()).expect("client params");
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.not_before = rcgen::date_time_ymd(2000, 1, 1);
        params.not_after = rcgen::date_time_ymd(2001, 1, 1);
        self.issue(params, common_name)
    }

    fn issue(&self, mut params: CertificateParams, common_name: &str) -> Identity {
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::OrganizationName, "Keyward");
        params.distinguished_name.push(DnType::CommonName, common_name);
        let key = KeyPair::generate().expect("generate leaf key");
        let cert = params
            .signed_by(&key, &self.ca, &self.ca_key)
            .expect("sign leaf");
        Identity {
            common_name: common_name.to_string(),
            cert:        cert.der().clone(),
            key:         PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        }
    }

    pub fn trust_anchors(&self) -> TrustAnchorSet {
        let mut anchors = TrustAnchorSet::new();
        anchors.push("root-ca", self.ca_cert.clone());
        anchors
    }

    pub fn write_keystore(&self, path: &Path, identity: &Identity, store_pass: &str, key_pass: &str) {
        StoreWriter::new()
            .with_iterations(FAST_ITERATIONS)
            .private_key(
                identity.common_name.clone(),
                &[identity.cert.clone(), self.ca_cert.clone()],
                &identity.key,
                &Secret::from(key_pass),
            )
            .expect("add key entry")
            .write(path, &Secret::from(store_pass))
            .expect("write keystore");
    }

    pub fn write_truststore(&self, path: &Path, store_pass: &str) {
        StoreWriter::new()
            .with_iterations(FAST_ITERATIONS)
            .trusted_certificate("root-ca", &self.ca_cert)
            .expect("add trusted certificate")
            .write(path, &Secret::from(store_pass))
            .expect("write truststore");
    }

    /// Writes a keystore for `identity` and a truststore holding this CA
    /// into `dir`, returning matching settings.
    pub fn write_role_stores(&self, dir: &Path, role: Role, identity: &Identity) -> StoreSettings {
        let keystore: PathBuf = dir.join(format!("{}-keystore.json", role.as_str()));
        let truststore: PathBuf = dir.join(format!("{}-truststore.json", role.as_str()));
        self.write_keystore(&keystore, identity, STORE_PASSPHRASE, KEY_PASSPHRASE);
        self.write_truststore(&truststore, TRUST_PASSPHRASE);
        StoreSettings {
            keystore,
            keystore_passphrase: Secret::from(STORE_PASSPHRASE),
            key_passphrase: Secret::from(KEY_PASSPHRASE),
            key_alias: None,
            truststore,
            truststore_passphrase: Secret::from(TRUST_PASSPHRASE),
        }
    }
}

fn placeholder() -> Identity {
    Identity {
        common_name: String::new(),
        cert:        CertificateDer::from(Vec::new()),
        key:         PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(Vec::new())),
    }
}
