use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use keyward_client::SecureClient;
use keyward_common::{timeouts_from_env, Role, StoreSettings, Timeouts, TlsConfig, TlsOptions};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_TARGET: &str = "https://localhost:8443/server.api/v1/user";

#[derive(Parser)]
#[command(name = "keyward-client")]
#[command(about = "Send one request to a keyward server over mutual TLS")]
struct Args {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// host:port, [v6]:port or https://host[:port]/path
    #[arg(default_value = DEFAULT_TARGET)]
    target: String,

    /// Request payload
    #[arg(short, long, default_value = "")]
    data: String,

    /// Keystore path (overrides KEYWARD_CLIENT_KEYSTORE)
    #[arg(long)]
    keystore: Option<PathBuf>,

    /// Truststore path (overrides KEYWARD_CLIENT_TRUSTSTORE)
    #[arg(long)]
    truststore: Option<PathBuf>,

    #[arg(long)]
    key_alias: Option<String>,

    /// Connect without presenting a client certificate
    #[arg(long)]
    no_client_cert: bool,

    /// Accept a trusted server certificate issued for another host
    #[arg(long)]
    no_verify_hostname: bool,

    /// Bound for every phase (overrides KEYWARD_TIMEOUT_MS)
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .with_writer(std::io::stderr)
        .init();

    let mut settings = StoreSettings::from_env(Role::Client);
    if let Some(path) = args.keystore {
        settings.keystore = path;
    }
    if let Some(path) = args.truststore {
        settings.truststore = path;
    }
    if args.key_alias.is_some() {
        settings.key_alias = args.key_alias;
    }

    let timeouts = match args.timeout_ms {
        Some(ms) => Timeouts::uniform(Duration::from_millis(ms)),
        None => timeouts_from_env(),
    };
    let options = TlsOptions::new()
        .with_mutual_auth(!args.no_client_cert)
        .with_hostname_verification(!args.no_verify_hostname)
        .with_timeouts(timeouts);

    info!(
        keystore = ?settings.keystore,
        truststore = ?settings.truststore,
        "loading client credentials"
    );
    let config = TlsConfig::from_settings(Role::Client, &settings, options)
        .context("Failed to build client TLS context")?;
    let client = SecureClient::new(config).context("Failed to create client")?;

    let response = client
        .request(&args.target, args.data.as_bytes())
        .await
        .with_context(|| format!("Request to {} failed", args.target))?;
    println!("{}", String::from_utf8_lossy(&response));

    Ok(())
}
