//! Keyward Client Library
//!
//! An outbound mutual TLS client. Build a client-role
//! [`TlsConfig`](keyward_common::TlsConfig) once at startup, then send
//! one-shot requests over fresh connections. Handshake, read and write are
//! each bounded by their own timeout and fail with their own error kind.
//!
//! # Example
//!
//! ```no_run
//! use keyward_client::SecureClient;
//! use keyward_common::{Role, StoreSettings, TlsConfig, TlsOptions};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let settings = StoreSettings::from_env(Role::Client);
//! let config = TlsConfig::from_settings(Role::Client, &settings, TlsOptions::default())?;
//! let client = SecureClient::new(config)?;
//!
//! let response = client.request("https://localhost:8443/server.api/v1/user", b"").await?;
//! println!("Authenticated as: {}", String::from_utf8_lossy(&response));
//! # Ok(())
//! # }
//! ```

mod client;

pub use client::*;
// Re-export important types from keyward-common for convenience
pub use keyward_common::{Role, StoreSettings, Timeouts, TlsConfig, TlsOptions};
