use std::{fs, io::BufReader, path::PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use keyward_common::{store::DEFAULT_ITERATIONS, Secret, StoreWriter};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, private_key};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keyward-store")]
#[command(about = "Create keyward credential stores from PEM files")]
struct Args {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seal a certificate chain and its private key into a keystore
    CreateKeystore {
        /// PEM certificate chain, leaf first
        #[arg(long)]
        cert: PathBuf,
        /// PEM PKCS#8 private key
        #[arg(long)]
        key: PathBuf,
        /// Entry alias (defaults to the key file stem)
        #[arg(long)]
        alias: Option<String>,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, env = "KEYWARD_STORE_PASSWORD", hide_env_values = true)]
        store_password: String,
        /// Defaults to the store password
        #[arg(long, env = "KEYWARD_KEY_PASSWORD", hide_env_values = true)]
        key_password: Option<String>,
        #[arg(long, default_value_t = DEFAULT_ITERATIONS)]
        iterations: u32,
    },
    /// Seal one or more CA certificates into a truststore
    CreateTruststore {
        /// PEM files holding trusted CA certificates
        #[arg(long = "ca", required = true)]
        cas: Vec<PathBuf>,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, env = "KEYWARD_STORE_PASSWORD", hide_env_values = true)]
        store_password: String,
        #[arg(long, default_value_t = DEFAULT_ITERATIONS)]
        iterations: u32,
    },
}

fn read_certs(path: &PathBuf) -> Result<Vec<CertificateDer<'static>>> {
    let pem = fs::read(path).with_context(|| format!("Failed to read certificates from {path:?}"))?;
    let chain = certs(&mut BufReader::new(&*pem))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates in {path:?}"))?;
    if chain.is_empty() {
        return Err(anyhow!("No certificates found in {path:?}"));
    }
    Ok(chain)
}

fn read_key(path: &PathBuf) -> Result<PrivateKeyDer<'static>> {
    let pem = fs::read(path).with_context(|| format!("Failed to read private key from {path:?}"))?;
    private_key(&mut BufReader::new(&*pem))
        .with_context(|| format!("Failed to parse private key in {path:?}"))?
        .ok_or_else(|| anyhow!("No private key found in {path:?}"))
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Commands::CreateKeystore {
            cert,
            key,
            alias,
            out,
            store_password,
            key_password,
            iterations,
        } => {
            let chain = read_certs(&cert)?;
            let key_der = read_key(&key)?;
            let alias = alias
                .or_else(|| key.file_stem().map(|stem| stem.to_string_lossy().into_owned()))
                .unwrap_or_else(|| "key".to_string());
            let key_password = Secret::from(key_password.unwrap_or_else(|| store_password.clone()));

            StoreWriter::new()
                .with_iterations(iterations)
                .private_key(alias.clone(), &chain, &key_der, &key_password)
                .context("Failed to add private key entry")?
                .write(&out, &Secret::from(store_password))
                .with_context(|| format!("Failed to write keystore {out:?}"))?;
            info!(alias, chain_len = chain.len(), out = ?out, "keystore created");
        }

        Commands::CreateTruststore {
            cas,
            out,
            store_password,
            iterations,
        } => {
            let mut writer = StoreWriter::new().with_iterations(iterations);
            let mut count = 0;
            for path in &cas {
                for cert in read_certs(path)? {
                    count += 1;
                    writer = writer
                        .trusted_certificate(format!("ca-{count}"), &cert)
                        .context("Failed to add trusted certificate")?;
                }
            }
            writer
                .write(&out, &Secret::from(store_password))
                .with_context(|| format!("Failed to write truststore {out:?}"))?;
            info!(anchors = count, out = ?out, "truststore created");
        }
    }

    Ok(())
}
