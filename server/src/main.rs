use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use keyward_common::{timeouts_from_env, Role, StoreSettings, SubjectField, Timeouts, TlsConfig, TlsOptions};
use keyward_server::{SecureServer, WhoAmI};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, ValueEnum)]
enum Subject {
    /// First CN attribute
    Cn,
    /// Full distinguished name
    Dn,
}

impl From<Subject> for SubjectField {
    fn from(subject: Subject) -> Self {
        match subject {
            Subject::Cn => SubjectField::CommonName,
            Subject::Dn => SubjectField::DistinguishedName,
        }
    }
}

#[derive(Parser)]
#[command(name = "keyward-server")]
#[command(about = "Keyward mutual TLS server answering with the caller's identity")]
struct Args {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[arg(short, long, env = "KEYWARD_BIND", default_value = "127.0.0.1:8443")]
    bind: String,

    /// Keystore path (overrides KEYWARD_SERVER_KEYSTORE)
    #[arg(long)]
    keystore: Option<PathBuf>,

    /// Truststore path (overrides KEYWARD_SERVER_TRUSTSTORE)
    #[arg(long)]
    truststore: Option<PathBuf>,

    #[arg(long)]
    key_alias: Option<String>,

    /// Accept clients without a certificate
    #[arg(long)]
    optional_client_auth: bool,

    #[arg(long, value_enum, default_value = "cn")]
    subject: Subject,

    /// Bound for every phase (overrides KEYWARD_TIMEOUT_MS)
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .init();

    info!("Starting keyward server...");

    let mut settings = StoreSettings::from_env(Role::Server);
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
    if args.optional_client_auth {
        warn!("client certificates are optional; anonymous requests will be unauthenticated");
    }
    let options = TlsOptions::new()
        .with_mutual_auth(!args.optional_client_auth)
        .with_subject_field(args.subject.into())
        .with_timeouts(timeouts);

    info!(
        keystore = ?settings.keystore,
        truststore = ?settings.truststore,
        "loading server credentials"
    );
    let config = TlsConfig::from_settings(Role::Server, &settings, options)
        .context("Failed to build server TLS context")?;

    let server = SecureServer::bind(args.bind.as_str(), config)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind))?;

    server
        .run_with_shutdown(WhoAmI, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await
        .context("Server error")?;

    Ok(())
}
