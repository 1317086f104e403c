//! Network configuration types for the rpchost server.

use std::path::PathBuf;
use std::time::Duration;

use http::HeaderName;

/// Top-level network configuration for the server.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bind address for the server.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Terminate TLS in-process.
    pub tls: Option<TlsConfig>,
    /// Plain listener behind a TLS-terminating proxy. Mutually exclusive
    /// with `tls`.
    pub trusted_proxy: Option<TrustedProxy>,
    /// Maximum time to wait for a request to complete.
    pub request_timeout: Duration,
    /// Largest accepted request body in bytes.
    pub body_limit: usize,
    /// Capacity of the queue between the HTTP front end and the dispatcher.
    pub ingress_capacity: usize,
    /// How long shutdown waits for in-flight requests.
    pub drain_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            tls: None,
            trusted_proxy: None,
            request_timeout: Duration::from_secs(30),
            body_limit: 4 * 1024 * 1024,
            ingress_capacity: 1024,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl NetworkConfig {
    /// Whether connections on this listener arrived over TLS.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.tls.is_some() || self.trusted_proxy.is_some()
    }

    /// # Errors
    ///
    /// Fails when both `tls` and `trusted_proxy` are set: a listener that
    /// terminates TLS itself never takes a forwarded client identity.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !(self.tls.is_some() && self.trusted_proxy.is_some()),
            "tls and trusted_proxy cannot both be configured"
        );
        Ok(())
    }
}

/// TLS certificate configuration.
///
/// No `Default` impl because certificate paths have no sensible defaults.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Path to the TLS certificate file.
    pub cert_path: PathBuf,
    /// Path to the TLS private key file.
    pub key_path: PathBuf,
    /// PEM file holding the one root client certificates must chain to.
    /// Without it no client certificate is requested.
    pub client_ca_path: Option<PathBuf>,
}

/// A reverse proxy that terminates TLS, verifies client certificates and
/// forwards the verified chain in a header.
#[derive(Debug, Clone)]
pub struct TrustedProxy {
    /// Header carrying the chain: comma-separated base64 DER, leaf first,
    /// root last.
    pub client_cert_header: HeaderName,
}
