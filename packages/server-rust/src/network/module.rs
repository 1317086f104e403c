//! Network module with deferred startup lifecycle.
//!
//! `new()` allocates shared state, `start()` binds the TCP listener and
//! `serve()` accepts HTTP traffic until shutdown. Between `start()` and
//! `serve()` the caller wires the dispatcher to the ingress channel.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context as _;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::config::{NetworkConfig, TlsConfig};
use super::ingress::{ingress_handler, IngressState};
use super::listener::IngressSender;
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;
use super::tls::{server_config, ClientCertAcceptor};

/// Owns the HTTP front end of the server.
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    /// Creates the module without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            listener: None,
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Shared shutdown controller; health endpoints and the dispatcher use it.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Every request goes to the ingress handler; routing happens in the
    /// custom endpoint chain and the RPC pipeline.
    #[must_use]
    pub fn build_router(&self, ingress: IngressSender) -> Router {
        let state = IngressState::new(
            ingress,
            self.config.is_secure(),
            self.config
                .trusted_proxy
                .as_ref()
                .map(|proxy| proxy.client_cert_header.clone()),
            self.config.body_limit,
        );

        Router::new()
            .fallback(ingress_handler)
            .layer(build_http_layers(&self.config))
            .with_state(state)
    }

    /// Binds the TCP listener. Returns the bound port, which differs from the
    /// configured one when port 0 is used.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is inconsistent or the address
    /// cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        self.config.validate()?;
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!(host = %self.config.host, port, "TCP listener bound");

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then drains in-flight requests.
    ///
    /// The ingress sender is dropped when this returns, which stops the
    /// dispatcher's listener once its queue is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called, TLS material cannot be
    /// loaded, or the server hits a fatal I/O error.
    pub async fn serve(
        self,
        ingress: IngressSender,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let router = self.build_router(ingress);
        let Self {
            config,
            listener,
            shutdown: controller,
        } = self;
        let listener =
            listener.ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;

        let signal = {
            let controller = Arc::clone(&controller);
            async move {
                shutdown.await;
                controller.trigger_shutdown();
            }
        };

        controller.set_ready();

        match &config.tls {
            Some(tls) => serve_tls(listener, router, tls, signal).await?,
            None => serve_plain(listener, router, signal).await?,
        }

        if controller.wait_for_drain(config.drain_timeout).await {
            info!("all in-flight requests drained");
        } else {
            warn!("drain timeout expired with in-flight requests remaining");
        }
        Ok(())
    }
}

async fn serve_plain(
    listener: TcpListener,
    router: Router,
    signal: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!("serving plain HTTP");
    axum::serve(listener, router)
        .with_graceful_shutdown(signal)
        .await?;
    Ok(())
}

/// Serves TLS via `axum-server` + rustls on the pre-bound listener. Client
/// certificates are verified in the handshake and reach the ingress handler
/// as a [`TlsPeer`](super::tls::TlsPeer) request extension.
async fn serve_tls(
    listener: TcpListener,
    router: Router,
    tls: &TlsConfig,
    signal: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};

    let (rustls_server, anchor) =
        server_config(tls).context("failed to load TLS certificates")?;
    let rustls_config = RustlsConfig::from_config(Arc::new(rustls_server));

    let addr = listener.local_addr()?;
    let std_listener = listener.into_std()?;
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();

    tokio::spawn(async move {
        signal.await;
        shutdown_handle.graceful_shutdown(None);
    });

    info!(%addr, client_auth = anchor.is_some(), "serving TLS");
    axum_server::from_tcp(std_listener)
        .acceptor(ClientCertAcceptor::new(RustlsAcceptor::new(rustls_config), anchor))
        .handle(handle)
        .serve(router.into_make_service())
        .await?;
    Ok(())
}
