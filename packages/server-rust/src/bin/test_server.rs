//! Test server binary for integration and load testing.
//!
//! Hosts a small `Diagnostics` service behind the full pipeline. Prints
//! `PORT=<port>` to stdout once the listener is bound so harnesses can
//! connect.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use clap::Parser;
use http::HeaderName;
use rpchost_core::{schema_hash, MethodDescriptor, ParamType, ParameterDescriptor};
use serde_json::{json, Value};

use rpchost_server::network::handlers::{
    HealthEndpoint, LivenessEndpoint, ReadinessEndpoint, SchemaEndpoint,
};
use rpchost_server::network::{
    ingress_channel, NetworkConfig, NetworkModule, TlsConfig, TrustedProxy,
};
use rpchost_server::observability;
use rpchost_server::service::{
    spawn_forked, ChannelEventPublisher, Collaborators, CompletionEvent, CustomEndpointChain,
    EventSink, LiveConfig, LoadSheddingPolicy, MethodRegistry, PipelineError, RequestDispatcher,
    RequestPipeline, ServerConfig, ShedMode, TransportSecurity, TracingEventPublisher,
};
use rpchost_server::EventPublisher;

const SERVICE: &str = "Diagnostics";

#[derive(Debug, Parser)]
#[command(name = "test-server", about = "rpchost test server")]
struct Args {
    #[arg(long, env = "RPCHOST_HOST", default_value = "127.0.0.1")]
    host: String,
    /// 0 picks a free port.
    #[arg(long, env = "RPCHOST_PORT", default_value_t = 0)]
    port: u16,
    #[arg(long, env = "RPCHOST_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,
    #[arg(long, env = "RPCHOST_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,
    /// PEM root that client certificates are verified against in the handshake.
    #[arg(long, env = "RPCHOST_CLIENT_CA", requires = "tls_cert")]
    client_ca: Option<PathBuf>,
    /// Serve plain HTTP behind a TLS-terminating proxy that forwards the
    /// verified client chain in this header.
    #[arg(long, env = "RPCHOST_PROXY_CERT_HEADER", conflicts_with = "tls_cert")]
    proxy_cert_header: Option<String>,
    #[arg(long, env = "RPCHOST_REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    request_timeout_ms: u64,
    #[arg(long, env = "RPCHOST_BODY_LIMIT", default_value_t = 4 * 1024 * 1024)]
    body_limit: usize,
    #[arg(long, env = "RPCHOST_INGRESS_CAPACITY", default_value_t = 1024)]
    ingress_capacity: usize,
    #[arg(long, env = "RPCHOST_DRAIN_TIMEOUT_MS", default_value_t = 30_000)]
    drain_timeout_ms: u64,

    #[arg(long, env = "RPCHOST_SERVICE_VERSION", default_value = "1.0.0")]
    service_version: String,
    #[arg(long, env = "RPCHOST_HOSTNAME", default_value = "localhost")]
    hostname: String,
    #[arg(long, env = "RPCHOST_DATA_CENTER", default_value = "local")]
    data_center: String,
    #[arg(long, env = "RPCHOST_ENVIRONMENT", default_value = "dev")]
    environment: String,
    #[arg(long, env = "RPCHOST_SECURITY", value_enum, default_value_t = TransportSecurity::Insecure)]
    security: TransportSecurity,
    /// Hex SHA-256 of the root certificate client chains must end in.
    #[arg(long, env = "RPCHOST_ROOT_FINGERPRINT")]
    root_fingerprint: Option<String>,
    #[arg(long, env = "RPCHOST_EVENT_QUEUE", default_value_t = 1024)]
    event_queue_capacity: usize,

    #[arg(long, env = "RPCHOST_SPAN_AGE_MODE", value_enum, default_value_t = ShedMode::Disabled)]
    span_age_mode: ShedMode,
    #[arg(long, env = "RPCHOST_MAX_SPAN_AGE_MS", default_value_t = 5_000)]
    max_span_age_ms: u64,
    #[arg(long, env = "RPCHOST_DEATH_TIME_MODE", value_enum, default_value_t = ShedMode::Disabled)]
    death_time_mode: ShedMode,
    #[arg(long, env = "RPCHOST_DEATH_TIME_MARGIN_MS", default_value_t = 100)]
    death_time_margin_ms: u64,

    /// Log one JSON object per line.
    #[arg(long, env = "RPCHOST_JSON_LOGS")]
    json_logs: bool,
    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "RPCHOST_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

impl Args {
    fn network_config(&self) -> anyhow::Result<NetworkConfig> {
        let trusted_proxy = self
            .proxy_cert_header
            .as_deref()
            .map(HeaderName::try_from)
            .transpose()
            .context("invalid client certificate header name")?
            .map(|client_cert_header| TrustedProxy { client_cert_header });
        let tls = match (&self.tls_cert, &self.tls_key) {
            (Some(cert_path), Some(key_path)) => Some(TlsConfig {
                cert_path: cert_path.clone(),
                key_path: key_path.clone(),
                client_ca_path: self.client_ca.clone(),
            }),
            _ => None,
        };
        Ok(NetworkConfig {
            host: self.host.clone(),
            port: self.port,
            tls,
            trusted_proxy,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            body_limit: self.body_limit,
            ingress_capacity: self.ingress_capacity,
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
        })
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            service_name: SERVICE.to_string(),
            service_version: self.service_version.clone(),
            hostname: self.hostname.clone(),
            data_center: self.data_center.clone(),
            environment: self.environment.clone(),
            security: self.security,
            root_fingerprint: self.root_fingerprint.clone(),
            event_queue_capacity: self.event_queue_capacity,
            ..ServerConfig::default()
        }
    }

    fn load_shedding(&self) -> LoadSheddingPolicy {
        LoadSheddingPolicy {
            span_age_mode: self.span_age_mode,
            max_span_age: Duration::from_millis(self.max_span_age_ms),
            death_time_mode: self.death_time_mode,
            death_time_safety_margin: Duration::from_millis(self.death_time_margin_ms),
        }
    }
}

/// Forwards queued events to the log.
struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn write(&mut self, event: CompletionEvent) {
        TracingEventPublisher.publish(event);
    }
}

fn method(name: &str, parameters: Vec<ParameterDescriptor>, result: ParamType) -> MethodDescriptor {
    MethodDescriptor {
        service: SERVICE.to_string(),
        name: name.to_string(),
        parameters,
        result_type: Some(result),
    }
}

fn diagnostics(version: &str) -> anyhow::Result<MethodRegistry> {
    let registry = MethodRegistry::new(SERVICE, version);

    registry.register(
        method(
            "Echo",
            vec![ParameterDescriptor::new("text", ParamType::String)],
            ParamType::String,
        ),
        |_ctx, args| async move { Ok(args.into_iter().next()) },
    )?;

    registry.register(
        method(
            "Add",
            vec![
                ParameterDescriptor::new("a", ParamType::Int),
                ParameterDescriptor::new("b", ParamType::Int),
            ],
            ParamType::Int,
        ),
        |_ctx, args| async move {
            let a = args[0].as_i64().unwrap_or_default();
            let b = args[1].as_i64().unwrap_or_default();
            Ok(Some(json!(a.wrapping_add(b))))
        },
    )?;

    // Sleeps on a forked task and reports the request id the child saw.
    registry.register(
        method(
            "Sleep",
            vec![ParameterDescriptor::new("millis", ParamType::Int)],
            ParamType::Optional(Box::new(ParamType::String)),
        ),
        |ctx, args| async move {
            let millis = args[0].as_u64().unwrap_or_default();
            let seen = spawn_forked(&ctx, |child| async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                child.request_id().map(str::to_string)
            })
            .await
            .map_err(|e| PipelineError::Internal(e.into()))?;
            Ok(Some(seen.map_or(Value::Null, Value::String)))
        },
    )?;

    Ok(registry)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    observability::init_tracing(args.json_logs)?;
    if let Some(addr) = args.metrics_addr {
        observability::init_metrics(addr)?;
    }

    let network_config = args.network_config()?;
    let server_config = args.server_config();
    let live = Arc::new(LiveConfig::new(args.load_shedding()));

    let registry = Arc::new(diagnostics(&server_config.service_version)?);
    let schema = registry.schema();
    let hash = schema_hash(&schema);

    let ingress_capacity = network_config.ingress_capacity;
    let mut module = NetworkModule::new(network_config);
    let port = module.start().await?;
    let shutdown = module.shutdown_controller();

    let endpoints = CustomEndpointChain::new()
        .with(LivenessEndpoint)
        .with(ReadinessEndpoint::new(Arc::clone(&shutdown)))
        .with(HealthEndpoint::new(Arc::clone(&shutdown)))
        .with(SchemaEndpoint::new(&schema)?);

    let (publisher, mut pump) = ChannelEventPublisher::start(
        LogSink,
        server_config.event_queue_capacity,
        Duration::from_secs(5),
    );

    let pipeline = Arc::new(RequestPipeline::new(
        Arc::new(server_config),
        &hash,
        Collaborators {
            resolver: registry.clone(),
            activator: registry,
            policy: live,
            publisher: Arc::new(publisher),
        },
        endpoints,
    )?);

    let (ingress, listener) = ingress_channel(ingress_capacity);
    let dispatcher = tokio::spawn(RequestDispatcher::new(listener, pipeline, shutdown).run());

    println!("PORT={port}");
    tracing::info!(port, schema_hash = %hash, "test server ready");

    module
        .serve(ingress, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
        })
        .await?;

    dispatcher.await??;
    pump.stop().await;
    tracing::info!("test server stopped");
    Ok(())
}
