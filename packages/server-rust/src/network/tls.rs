//! TLS server setup, client certificate verification and the identity a
//! request carries into the pipeline.
//!
//! A client certificate is only ever trusted because something vouched for
//! it: the rustls handshake (verified against the configured client CA) or
//! an explicitly trusted proxy. Chain bytes alone never satisfy a root check.

use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context as _;
use axum_server::accept::Accept;
use axum_server::tls_rustls::RustlsAcceptor;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tower_http::add_extension::AddExtension;

use super::config::TlsConfig;

/// Lowercase hex SHA-256 of a DER certificate.
#[must_use]
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

fn normalize_fingerprint(fingerprint: &str) -> String {
    fingerprint
        .chars()
        .filter(|c| *c != ':')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

// ---------------------------------------------------------------------------
// ClientCertificate
// ---------------------------------------------------------------------------

/// A client certificate chain in DER form, leaf first, together with the
/// trust anchor that vouched for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCertificate {
    chain: Vec<Vec<u8>>,
    anchor: Option<String>,
}

impl ClientCertificate {
    /// A chain the TLS handshake verified against the root with
    /// `anchor_fingerprint`.
    #[must_use]
    pub fn verified(chain: Vec<Vec<u8>>, anchor_fingerprint: &str) -> Self {
        Self {
            chain,
            anchor: Some(normalize_fingerprint(anchor_fingerprint)),
        }
    }

    /// A chain nobody vouched for. Never chains to any root.
    #[must_use]
    pub fn unverified(chain: Vec<Vec<u8>>) -> Self {
        Self {
            chain,
            anchor: None,
        }
    }

    /// Parses the chain a trusted proxy forwards: comma-separated base64 DER
    /// certificates, leaf first, root last. The proxy verified the chain, so
    /// its last certificate is taken as the anchor. Returns `None` for empty
    /// or undecodable input.
    #[must_use]
    pub fn from_proxy_header(value: &str) -> Option<Self> {
        let chain = value
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| STANDARD.decode(part).ok())
            .collect::<Option<Vec<_>>>()?;
        let anchor = fingerprint(chain.last()?);
        Some(Self {
            chain,
            anchor: Some(anchor),
        })
    }

    #[must_use]
    pub fn chain(&self) -> &[Vec<u8>] {
        &self.chain
    }

    /// Fingerprint of the root that vouched for this chain.
    #[must_use]
    pub fn anchor_fingerprint(&self) -> Option<&str> {
        self.anchor.as_deref()
    }

    /// Whether this chain was verified against the root with `fingerprint`.
    ///
    /// `fingerprint` is hex, case-insensitive, optionally colon-separated.
    /// The comparison runs in constant time.
    #[must_use]
    pub fn chains_to(&self, fingerprint: &str) -> bool {
        let Some(anchor) = self.anchor.as_deref() else {
            return false;
        };
        let expected = normalize_fingerprint(fingerprint);
        if expected.len() != anchor.len() {
            return false;
        }
        anchor.as_bytes().ct_eq(expected.as_bytes()).into()
    }
}

/// Per-connection TLS identity, attached to every request on the connection.
#[derive(Debug, Clone, Default)]
pub struct TlsPeer {
    pub certificate: Option<ClientCertificate>,
}

impl TlsPeer {
    /// Builds the identity from a completed handshake. Certificates count as
    /// verified only when a client verifier with `anchor` ran.
    #[must_use]
    pub fn from_handshake(peer: Option<&[CertificateDer<'_>]>, anchor: Option<&str>) -> Self {
        let certificate = match (peer, anchor) {
            (Some(certs), Some(anchor)) if !certs.is_empty() => Some(ClientCertificate::verified(
                certs.iter().map(|der| der.to_vec()).collect(),
                anchor,
            )),
            _ => None,
        };
        Self { certificate }
    }
}

// ---------------------------------------------------------------------------
// Server configuration
// ---------------------------------------------------------------------------

/// The single root client certificates must chain to.
pub struct ClientTrust {
    roots: RootCertStore,
    fingerprint: String,
}

impl ClientTrust {
    /// # Errors
    ///
    /// Fails unless `pem` holds exactly one valid certificate.
    pub fn from_pem(pem: &[u8]) -> anyhow::Result<Self> {
        let certs = rustls_pemfile::certs(&mut &pem[..])
            .collect::<Result<Vec<_>, _>>()
            .context("reading client CA certificates")?;
        let [root] = <[CertificateDer<'static>; 1]>::try_from(certs).map_err(|certs| {
            anyhow::anyhow!(
                "client CA file must hold exactly one certificate, found {}",
                certs.len()
            )
        })?;
        let fingerprint = fingerprint(&root);
        let mut roots = RootCertStore::empty();
        roots
            .add(root)
            .context("client CA certificate is not a valid trust anchor")?;
        Ok(Self { roots, fingerprint })
    }

    /// # Errors
    ///
    /// Fails if the file cannot be read or does not hold exactly one
    /// certificate.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let pem = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_pem(&pem)
    }

    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl std::fmt::Debug for ClientTrust {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTrust")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Builds the rustls server configuration. With a client CA configured,
/// clients may present a certificate and the handshake fails if it does not
/// verify. Returns the CA fingerprint alongside.
///
/// # Errors
///
/// Fails if any PEM file cannot be loaded or the key does not match the
/// certificate.
pub fn server_config(tls: &TlsConfig) -> anyhow::Result<(rustls::ServerConfig, Option<String>)> {
    let certs = load_certs(&tls.cert_path)?;
    let key = load_key(&tls.key_path)?;

    let builder = rustls::ServerConfig::builder();
    let (builder, anchor) = match &tls.client_ca_path {
        Some(path) => {
            let trust = ClientTrust::load(path)?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(trust.roots))
                .allow_unauthenticated()
                .build()
                .context("building client certificate verifier")?;
            (
                builder.with_client_cert_verifier(verifier),
                Some(trust.fingerprint),
            )
        }
        None => (builder.with_no_client_auth(), None),
    };

    let mut config = builder
        .with_single_cert(certs, key)
        .context("TLS certificate and key do not match")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok((config, anchor))
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing {}", path.display()))?;
    anyhow::ensure!(!certs.is_empty(), "no certificates in {}", path.display());
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .with_context(|| format!("parsing {}", path.display()))?
        .ok_or_else(|| anyhow::anyhow!("no private key in {}", path.display()))
}

// ---------------------------------------------------------------------------
// Acceptor
// ---------------------------------------------------------------------------

/// Runs the rustls handshake, then tags the connection's service with the
/// peer's [`TlsPeer`] so every request on it carries the verified identity.
#[derive(Debug, Clone)]
pub struct ClientCertAcceptor {
    inner: RustlsAcceptor,
    anchor: Option<String>,
}

impl ClientCertAcceptor {
    #[must_use]
    pub fn new(inner: RustlsAcceptor, anchor: Option<String>) -> Self {
        Self { inner, anchor }
    }
}

impl<I, S> Accept<I, S> for ClientCertAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = AddExtension<S, TlsPeer>;
    type Future = Pin<Box<dyn Future<Output = io::Result<(Self::Stream, Self::Service)>> + Send>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let handshake = self.inner.accept(stream, service);
        let anchor = self.anchor.clone();
        Box::pin(async move {
            let (stream, service) = handshake.await?;
            let peer = TlsPeer::from_handshake(stream.get_ref().1.peer_certificates(), anchor.as_deref());
            Ok((stream, AddExtension::new(service, peer)))
        })
    }
}
