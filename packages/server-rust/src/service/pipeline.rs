//! Per-request pipeline.
//!
//! Stages run strictly in [`PipelineStage`] order. A custom endpoint may claim
//! the request first, in which case nothing else runs. Otherwise exactly one
//! response is written and exactly one [`CompletionEvent`] is published,
//! whatever the outcome.
//!
//! Failures raised up to and including `Resolving` are normalized to request
//! errors unless already classified. Failures from admission or invocation
//! reach the classifier unchanged.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::header::{ACCEPT, ALLOW, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use rpchost_core::protocol::{
    is_json_content_type, CONTENT_TYPE_JSON, HEADER_DATA_CENTER, HEADER_ENVIRONMENT,
    HEADER_EXECUTION_TIME, HEADER_PROTOCOL_VERSION, HEADER_REQUEST_ID, HEADER_SCHEMA_HASH,
    HEADER_SERVER_HOSTNAME, HEADER_SERVICE_VERSION, WRITE_METHOD,
};
use rpchost_core::{codec, IncomingRequest, SerializationMode, TracingContext, TracingData, UnixMillis};
use tower::ServiceExt;
use tracing::Instrument;
use uuid::Uuid;

use super::admission::AdmissionController;
use super::classify::error_response;
use super::config::{ServerConfig, TransportSecurity};
use super::endpoint::{CustomEndpointChain, EndpointOutcome};
use super::error::{PipelineError, RejectReason, RequestError};
use super::events::CompletionEvent;
use super::invoke::{Invocation, ResolvedMethod};
use super::middleware::{build_invocation_stack, InvocationStack};
use crate::network::{Connection, RequestHead, RpcResponse};
use crate::traits::{Activator, EventPublisher, MethodResolver, PolicySource};

/// Pipeline states, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineStage {
    Unclaimed,
    Validating,
    SecurityChecking,
    Parsing,
    Resolving,
    AdmissionChecking,
    Invoking,
    Serializing,
    Responding,
    Published,
}

/// How a request was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// A custom endpoint claimed it; no event was published.
    Endpoint,
    /// The RPC pipeline answered with this status.
    Pipeline(StatusCode),
}

/// External collaborators the pipeline calls into.
#[derive(Clone)]
pub struct Collaborators {
    pub resolver: Arc<dyn MethodResolver>,
    pub activator: Arc<dyn Activator>,
    pub policy: Arc<dyn PolicySource>,
    pub publisher: Arc<dyn EventPublisher>,
}

#[derive(Debug)]
struct RequestState {
    stage: PipelineStage,
    request: Option<IncomingRequest>,
    method: Option<Arc<ResolvedMethod>>,
}

impl RequestState {
    fn enter(&mut self, stage: PipelineStage) {
        tracing::trace!(?stage, "pipeline stage");
        self.stage = stage;
    }
}

/// Shared by every worker; holds only read-only configuration and
/// collaborators.
pub struct RequestPipeline {
    config: Arc<ServerConfig>,
    endpoints: CustomEndpointChain,
    resolver: Arc<dyn MethodResolver>,
    policy: Arc<dyn PolicySource>,
    publisher: Arc<dyn EventPublisher>,
    admission: AdmissionController,
    invoker: InvocationStack,
    /// Headers attached to every pipeline response.
    response_headers: HeaderMap,
}

impl RequestPipeline {
    /// # Errors
    ///
    /// Fails when a configured value cannot be sent as a response header.
    pub fn new(
        config: Arc<ServerConfig>,
        schema_hash: &str,
        collaborators: Collaborators,
        endpoints: CustomEndpointChain,
    ) -> anyhow::Result<Self> {
        let mut response_headers = HeaderMap::new();
        for (name, value) in [
            (HEADER_PROTOCOL_VERSION, config.protocol_version.as_str()),
            (HEADER_DATA_CENTER, config.data_center.as_str()),
            (HEADER_ENVIRONMENT, config.environment.as_str()),
            (HEADER_SERVICE_VERSION, config.service_version.as_str()),
            (HEADER_SERVER_HOSTNAME, config.hostname.as_str()),
            (HEADER_SCHEMA_HASH, schema_hash),
        ] {
            let value = HeaderValue::from_str(value)
                .map_err(|e| anyhow::anyhow!("invalid value for {name}: {e}"))?;
            response_headers.insert(HeaderName::from_static(name), value);
        }

        Ok(Self {
            config,
            endpoints,
            resolver: collaborators.resolver,
            policy: collaborators.policy,
            publisher: collaborators.publisher,
            admission: AdmissionController,
            invoker: build_invocation_stack(collaborators.activator),
            response_headers,
        })
    }

    /// Runs one request to completion. `ctx` is the worker's own context.
    pub async fn handle(&self, conn: Box<dyn Connection>, ctx: TracingContext) -> Handled {
        let span = tracing::info_span!(
            "request",
            conn = %conn.id(),
            request_id = tracing::field::Empty,
        );
        self.run(conn, ctx).instrument(span).await
    }

    async fn run(&self, mut conn: Box<dyn Connection>, mut ctx: TracingContext) -> Handled {
        let head = conn.head().clone();

        if let EndpointOutcome::Claimed(response) = self.endpoints.try_handle(&head).await {
            if let Err(e) = conn.write_response(response).await {
                tracing::warn!(error = %e, path = head.path(), "failed to write endpoint response");
            }
            return Handled::Endpoint;
        }

        let started = Instant::now();
        let mut state = RequestState {
            stage: PipelineStage::Unclaimed,
            request: None,
            method: None,
        };

        let result = self.process(conn.as_mut(), &head, &mut ctx, &mut state).await;
        let (mut response, error) = match result {
            Ok(response) => (response, None),
            Err(error) => {
                let error = if state.stage <= PipelineStage::Resolving {
                    error.into_request_error(RejectReason::Unprocessable)
                } else {
                    error
                };
                tracing::debug!(stage = ?state.stage, error = %error, "request failed");
                (error_response(&error), Some(error))
            }
        };

        state.enter(PipelineStage::Responding);
        self.decorate(&mut response, &ctx);
        let status = response.status;
        if let Err(e) = conn.write_response(response).await {
            tracing::warn!(error = %e, status = status.as_u16(), "failed to write response");
        }

        state.enter(PipelineStage::Published);
        self.publish(state, &ctx, error, status, started);
        Handled::Pipeline(status)
    }

    async fn process(
        &self,
        conn: &mut dyn Connection,
        head: &RequestHead,
        ctx: &mut TracingContext,
        state: &mut RequestState,
    ) -> Result<RpcResponse, PipelineError> {
        state.enter(PipelineStage::Validating);
        self.validate(head)?;

        state.enter(PipelineStage::SecurityChecking);
        self.check_security(&*conn)?;

        state.enter(PipelineStage::Parsing);
        let body = Self::read_body(conn).await?;
        let request = Self::parse(head, &body, ctx)?;
        let target = request.target.clone();
        let arguments = request.arguments.clone();
        state.request = Some(request);

        state.enter(PipelineStage::Resolving);
        let method = self.resolver.resolve(&target).await?;
        state.method = Some(Arc::clone(&method));

        state.enter(PipelineStage::AdmissionChecking);
        let policy = self.policy.load_shedding();
        self.admission.evaluate(ctx, &policy, UnixMillis::now())?;

        state.enter(PipelineStage::Invoking);
        let invocation = Invocation {
            ctx: ctx.fork(),
            method: Arc::clone(&method),
            arguments,
            weakly_typed: target.is_weakly_typed,
        };
        let outcome = self.invoker.clone().oneshot(invocation).await?;

        state.enter(PipelineStage::Serializing);
        let body = codec::encode_result(
            outcome.result.as_ref(),
            method.descriptor.result_type.as_ref(),
            SerializationMode::for_target(&target),
        )
        .map_err(|e| {
            PipelineError::Internal(
                anyhow::Error::new(e).context(format!("serializing result of {}", method.name())),
            )
        })?;

        let millis = u64::try_from(outcome.execution_time.as_millis()).unwrap_or(u64::MAX);
        Ok(RpcResponse::json(StatusCode::OK, body).with_header(
            HeaderName::from_static(HEADER_EXECUTION_TIME),
            HeaderValue::from(millis),
        ))
    }

    /// Header-only checks; the body stays unread until the caller passed
    /// the security check.
    fn validate(&self, head: &RequestHead) -> Result<(), PipelineError> {
        if let Some(version) = head.headers.get(HEADER_PROTOCOL_VERSION) {
            if version.as_bytes() != self.config.protocol_version.as_bytes() {
                return Err(reject(RequestError::bad_request(
                    RejectReason::ProtocolMismatch,
                    format!(
                        "protocol version {} is not supported; server speaks {}",
                        String::from_utf8_lossy(version.as_bytes()),
                        self.config.protocol_version
                    ),
                )));
            }
        }

        if head.method.as_str() != WRITE_METHOD {
            return Err(reject(
                RequestError::bad_request(
                    RejectReason::MethodNotAllowed,
                    format!("method {} not allowed; use {WRITE_METHOD}", head.method),
                )
                .with_hint(ALLOW, HeaderValue::from_static(WRITE_METHOD)),
            ));
        }

        let content_type = head.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
        if !content_type.is_some_and(is_json_content_type) {
            return Err(reject(
                RequestError::bad_request(
                    RejectReason::UnsupportedContentType,
                    format!(
                        "content type {} not supported; use {CONTENT_TYPE_JSON}",
                        content_type.unwrap_or("(none)")
                    ),
                )
                .with_hint(ACCEPT, HeaderValue::from_static(CONTENT_TYPE_JSON)),
            ));
        }

        let declared_empty = head
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            == Some(0);
        if declared_empty {
            return Err(empty_body());
        }
        Ok(())
    }

    /// Reads the body. Bodies sent without a length are only known to be
    /// empty once read.
    async fn read_body(conn: &mut dyn Connection) -> Result<Bytes, PipelineError> {
        let body = conn
            .read_body()
            .await
            .map_err(|e| PipelineError::Internal(e.into()))?;
        if body.is_empty() {
            return Err(empty_body());
        }
        Ok(body)
    }

    fn check_security(&self, conn: &dyn Connection) -> Result<(), PipelineError> {
        match (self.config.security, conn.is_secure()) {
            (TransportSecurity::Secure, false) => {
                return Err(PipelineError::security("service requires a secure connection"))
            }
            (TransportSecurity::Insecure, true) => {
                return Err(PipelineError::security(
                    "service does not accept secure connections",
                ))
            }
            (TransportSecurity::Insecure, false) => return Ok(()),
            (TransportSecurity::Secure, true) => {}
        }

        let certificate = conn
            .client_certificate()
            .ok_or_else(|| PipelineError::security("client certificate required"))?;
        let root = self
            .config
            .root_fingerprint
            .as_deref()
            .ok_or_else(|| PipelineError::security("no root of trust configured"))?;
        if !certificate.chains_to(root) {
            return Err(PipelineError::security(
                "client certificate does not chain to the configured root of trust",
            ));
        }
        Ok(())
    }

    /// Decodes the body and publishes its tracing data and overrides into
    /// `ctx`, generating a request id when the caller sent none.
    fn parse(
        head: &RequestHead,
        body: &[u8],
        ctx: &mut TracingContext,
    ) -> Result<IncomingRequest, PipelineError> {
        let mut request = codec::decode_request(body).map_err(|e| {
            reject(RequestError::bad_request(
                RejectReason::Malformed,
                format!("malformed request body: {e}"),
            ))
        })?;
        request.protocol_version = head.header_str(HEADER_PROTOCOL_VERSION).map(str::to_string);

        let tracing_data = request.tracing_data.get_or_insert_with(TracingData::default);
        let request_id = tracing_data
            .request_id
            .get_or_insert_with(|| Uuid::new_v4().to_string());
        tracing::Span::current().record("request_id", request_id.as_str());

        ctx.set_up();
        ctx.apply_tracing_data(tracing_data)
            .map_err(anyhow::Error::from)?;
        if let Some(overrides) = &request.overrides {
            for o in &overrides.hosts {
                ctx.set_host_override(o.service_name.clone(), o.host.clone())
                    .map_err(anyhow::Error::from)?;
            }
        }
        Ok(request)
    }

    fn decorate(&self, response: &mut RpcResponse, ctx: &TracingContext) {
        for (name, value) in &self.response_headers {
            response.headers.insert(name.clone(), value.clone());
        }
        if let Some(value) = ctx.request_id().and_then(|id| HeaderValue::from_str(id).ok()) {
            response
                .headers
                .insert(HeaderName::from_static(HEADER_REQUEST_ID), value);
        }
    }

    fn publish(
        &self,
        state: RequestState,
        ctx: &TracingContext,
        error: Option<PipelineError>,
        status: StatusCode,
        started: Instant,
    ) {
        let elapsed = started.elapsed();
        metrics::counter!("rpc_requests_total", "status" => status.as_u16().to_string())
            .increment(1);
        if let Some(method) = &state.method {
            metrics::histogram!("rpc_request_duration_seconds", "method" => method.name())
                .record(elapsed.as_secs_f64());
        }

        self.publisher.publish(CompletionEvent {
            request_id: ctx.request_id().map(str::to_string),
            request: state.request,
            error,
            method: state.method,
            status,
            elapsed,
        });
    }
}

impl std::fmt::Debug for RequestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPipeline")
            .field("service", &self.config.service_name)
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}

/// Counts a validation rejection under its reason tag.
fn reject(error: RequestError) -> PipelineError {
    metrics::counter!("rpc_request_rejected_total", "reason" => error.reason.as_str())
        .increment(1);
    PipelineError::Request(error)
}

fn empty_body() -> PipelineError {
    reject(RequestError::bad_request(
        RejectReason::EmptyBody,
        "request body is empty",
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use http::{Method, Uri};
    use parking_lot::Mutex;
    use rpchost_core::{schema_hash, MethodDescriptor, ParamType, ParameterDescriptor};
    use serde_json::{json, Value};

    use super::*;
    use crate::network::connection::testing::MemoryConnection;
    use crate::network::tls::fingerprint;
    use crate::network::ClientCertificate;
    use crate::service::config::{LiveConfig, LoadSheddingPolicy, ShedMode};
    use crate::service::endpoint::CustomEndpoint;
    use crate::service::error::ErrorKind;
    use crate::service::registry::MethodRegistry;

    #[derive(Default)]
    struct Events(Mutex<Vec<CompletionEvent>>);

    impl EventPublisher for Events {
        fn publish(&self, event: CompletionEvent) {
            self.0.lock().push(event);
        }
    }

    struct Harness {
        pipeline: RequestPipeline,
        events: Arc<Events>,
        live: Arc<LiveConfig>,
        invocations: Arc<AtomicUsize>,
    }

    fn registry(invocations: &Arc<AtomicUsize>) -> MethodRegistry {
        let registry = MethodRegistry::new("Echo", "1.0.0");
        let calls = Arc::clone(invocations);
        registry
            .register(
                MethodDescriptor {
                    service: "Echo".into(),
                    name: "Say".into(),
                    parameters: vec![ParameterDescriptor::new("text", ParamType::String)],
                    result_type: Some(ParamType::String),
                },
                move |_ctx, args| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(args.into_iter().next()) }
                },
            )
            .unwrap();
        registry
            .register(
                MethodDescriptor {
                    service: "Echo".into(),
                    name: "Route".into(),
                    parameters: vec![ParameterDescriptor::new("service", ParamType::String)],
                    result_type: Some(ParamType::Optional(Box::new(ParamType::String))),
                },
                |ctx, args| async move {
                    let service = args[0].as_str().unwrap_or_default().to_string();
                    Ok(Some(json!(ctx.host_override(&service))))
                },
            )
            .unwrap();
        registry
            .register(
                MethodDescriptor {
                    service: "Echo".into(),
                    name: "Broken".into(),
                    parameters: vec![],
                    result_type: Some(ParamType::Int),
                },
                |_ctx, _args| async { Ok(Some(json!("not an int"))) },
            )
            .unwrap();
        registry
    }

    fn harness_with(config: ServerConfig, endpoints: CustomEndpointChain) -> Harness {
        let invocations = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(registry(&invocations));
        let events = Arc::new(Events::default());
        let live = Arc::new(LiveConfig::default());
        let hash = schema_hash(&registry.schema());
        let pipeline = RequestPipeline::new(
            Arc::new(config),
            &hash,
            Collaborators {
                resolver: registry.clone(),
                activator: registry,
                policy: live.clone(),
                publisher: events.clone(),
            },
            endpoints,
        )
        .unwrap();
        Harness {
            pipeline,
            events,
            live,
            invocations,
        }
    }

    fn harness() -> Harness {
        harness_with(ServerConfig::default(), CustomEndpointChain::new())
    }

    fn say(extra: Value) -> Vec<u8> {
        let mut body = json!({
            "target": { "serviceName": "Echo", "methodName": "Say", "isWeaklyTyped": true },
            "arguments": { "text": "hi" },
        });
        if let (Value::Object(body), Value::Object(extra)) = (&mut body, extra) {
            body.extend(extra);
        }
        serde_json::to_vec(&body).unwrap()
    }

    impl Harness {
        async fn send(&self, conn: MemoryConnection) -> (Handled, RpcResponse) {
            let slot = conn.response_slot();
            let handled = self
                .pipeline
                .handle(Box::new(conn), TracingContext::detached())
                .await;
            let response = slot.lock().take().expect("response written");
            (handled, response)
        }

        fn calls(&self) -> usize {
            self.invocations.load(Ordering::SeqCst)
        }

        fn only_event(&self) -> CompletionEvent {
            let mut events = self.events.0.lock();
            assert_eq!(events.len(), 1, "exactly one completion event");
            events.remove(0)
        }
    }

    fn json_body(response: &RpcResponse) -> Value {
        serde_json::from_slice(&response.body).unwrap()
    }

    fn header<'a>(response: &'a RpcResponse, name: &str) -> &'a str {
        response.headers.get(name).unwrap().to_str().unwrap()
    }

    // -- success path --------------------------------------------------------

    #[tokio::test]
    async fn success_generates_request_id_and_echoes_headers() {
        let h = harness();
        let (handled, response) = h.send(MemoryConnection::post(say(json!({})))).await;

        assert_eq!(handled, Handled::Pipeline(StatusCode::OK));
        assert_eq!(json_body(&response), json!("hi"));
        assert_eq!(header(&response, HEADER_PROTOCOL_VERSION), "1.0");
        assert_eq!(header(&response, HEADER_SERVICE_VERSION), "0.0.0");
        assert_eq!(header(&response, HEADER_SCHEMA_HASH).len(), 64);
        assert!(header(&response, HEADER_EXECUTION_TIME).parse::<u64>().is_ok());

        let event = h.only_event();
        let id = event.request_id.clone().unwrap();
        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(header(&response, HEADER_REQUEST_ID), id);
        assert!(event.is_success());
        assert_eq!(event.method_name().as_deref(), Some("Echo.Say"));
        assert_eq!(
            event.request.unwrap().tracing_data.unwrap().request_id,
            Some(id)
        );
        assert_eq!(h.calls(), 1);
    }

    #[tokio::test]
    async fn caller_request_id_is_kept() {
        let h = harness();
        let body = say(json!({ "tracingData": { "requestId": "abc-123" } }));
        let (_, response) = h.send(MemoryConnection::post(body)).await;
        assert_eq!(header(&response, HEADER_REQUEST_ID), "abc-123");
        assert_eq!(h.only_event().request_id.as_deref(), Some("abc-123"));
    }

    #[tokio::test]
    async fn host_overrides_reach_the_method() {
        let h = harness();
        let body = serde_json::to_vec(&json!({
            "target": { "serviceName": "Echo", "methodName": "Route" },
            "arguments": { "service": "Billing" },
            "overrides": { "hosts": [{ "serviceName": "Billing", "host": "billing-canary" }] },
        }))
        .unwrap();
        let (_, response) = h.send(MemoryConnection::post(body)).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(json_body(&response), json!("billing-canary"));
    }

    #[tokio::test]
    async fn strong_result_not_matching_declared_type_is_internal() {
        let h = harness();
        let body = serde_json::to_vec(&json!({
            "target": { "serviceName": "Echo", "methodName": "Broken" },
        }))
        .unwrap();
        let (_, response) = h.send(MemoryConnection::post(body)).await;
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(&response)["kind"], "Internal");
    }

    // -- validation ----------------------------------------------------------

    #[tokio::test]
    async fn protocol_mismatch_is_bad_request_without_invocation() {
        let h = harness();
        let mut conn = MemoryConnection::post(say(json!({})));
        conn.head
            .headers
            .insert(HEADER_PROTOCOL_VERSION, HeaderValue::from_static("0.9"));

        let (_, response) = h.send(conn).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(json_body(&response)["details"]["reason"], "protocol_mismatch");
        assert_eq!(h.calls(), 0);
        assert_eq!(h.only_event().error.unwrap().kind(), ErrorKind::Request);
    }

    #[tokio::test]
    async fn matching_protocol_header_is_accepted() {
        let h = harness();
        let mut conn = MemoryConnection::post(say(json!({})));
        conn.head
            .headers
            .insert(HEADER_PROTOCOL_VERSION, HeaderValue::from_static("1.0"));
        let (_, response) = h.send(conn).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(
            h.only_event().request.unwrap().protocol_version.as_deref(),
            Some("1.0")
        );
    }

    #[tokio::test]
    async fn wrong_method_is_bad_request_with_allow_hint_and_no_parse() {
        let h = harness();
        let mut head = RequestHead::new(Method::PUT, Uri::from_static("/"));
        head.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_JSON));
        let (_, response) = h.send(MemoryConnection::with_head(head, say(json!({})))).await;

        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(header(&response, "allow"), "POST");
        assert!(h.only_event().request.is_none());
        assert_eq!(h.calls(), 0);
    }

    #[tokio::test]
    async fn wrong_content_type_is_bad_request_with_accept_hint() {
        let h = harness();
        let mut conn = MemoryConnection::post(say(json!({})));
        conn.head
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let (_, response) = h.send(conn).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(header(&response, "accept"), CONTENT_TYPE_JSON);
    }

    #[tokio::test]
    async fn empty_body_is_bad_request() {
        let h = harness();
        let (_, response) = h.send(MemoryConnection::post(Bytes::new())).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(json_body(&response)["details"]["reason"], "empty_body");
    }

    #[tokio::test]
    async fn zero_content_length_is_rejected_without_reading() {
        let h = harness();
        let mut conn = MemoryConnection::post(say(json!({})));
        conn.head
            .headers
            .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        let reads = Arc::clone(&conn.body_reads);
        let (_, response) = h.send(conn).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(json_body(&response)["details"]["reason"], "empty_body");
        assert_eq!(reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let h = harness();
        let (_, response) = h.send(MemoryConnection::post("{not json")).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(json_body(&response)["details"]["reason"], "malformed");
        // Headers still go out on failures.
        assert_eq!(header(&response, HEADER_PROTOCOL_VERSION), "1.0");
    }

    #[tokio::test]
    async fn body_read_failure_is_normalized_to_request_error() {
        let h = harness();
        let mut conn = MemoryConnection::post(say(json!({})));
        conn.body = None;
        let (_, response) = h.send(conn).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(json_body(&response)["details"]["reason"], "unprocessable");
    }

    // -- security ------------------------------------------------------------

    const ROOT: &[u8] = b"root-der";

    fn secure_config() -> ServerConfig {
        ServerConfig {
            security: TransportSecurity::Secure,
            root_fingerprint: Some(fingerprint(ROOT)),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn insecure_connection_to_secure_service_is_forbidden_regardless_of_body() {
        let h = harness_with(secure_config(), CustomEndpointChain::new());
        let (_, response) = h.send(MemoryConnection::post("{garbage")).await;
        assert_eq!(response.status, StatusCode::FORBIDDEN);
        assert_eq!(json_body(&response)["kind"], "Security");
    }

    #[tokio::test]
    async fn security_rejection_leaves_the_body_unread() {
        let h = harness_with(secure_config(), CustomEndpointChain::new());
        let conn = MemoryConnection::post(vec![b'x'; 1 << 20]);
        let reads = Arc::clone(&conn.body_reads);
        let (_, response) = h.send(conn).await;
        assert_eq!(response.status, StatusCode::FORBIDDEN);
        assert_eq!(reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn secure_connection_to_insecure_service_is_forbidden() {
        let h = harness();
        let mut conn = MemoryConnection::post(say(json!({})));
        conn.secure = true;
        let (_, response) = h.send(conn).await;
        assert_eq!(response.status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn client_certificate_must_chain_to_root() {
        let h = harness_with(secure_config(), CustomEndpointChain::new());

        let mut trusted = MemoryConnection::post(say(json!({})));
        trusted.secure = true;
        trusted.certificate = Some(ClientCertificate::verified(
            vec![b"leaf".to_vec()],
            &fingerprint(ROOT),
        ));
        assert_eq!(h.send(trusted).await.1.status, StatusCode::OK);

        let mut untrusted = MemoryConnection::post(say(json!({})));
        untrusted.secure = true;
        untrusted.certificate = Some(ClientCertificate::verified(
            vec![b"leaf".to_vec()],
            &fingerprint(b"other-root"),
        ));
        assert_eq!(h.send(untrusted).await.1.status, StatusCode::FORBIDDEN);

        // Naming the root in the chain is not the same as verifying against it.
        let mut forged = MemoryConnection::post(say(json!({})));
        forged.secure = true;
        forged.certificate = Some(ClientCertificate::unverified(vec![
            b"attacker-made-up-leaf".to_vec(),
            ROOT.to_vec(),
        ]));
        assert_eq!(h.send(forged).await.1.status, StatusCode::FORBIDDEN);

        let mut missing = MemoryConnection::post(say(json!({})));
        missing.secure = true;
        assert_eq!(h.send(missing).await.1.status, StatusCode::FORBIDDEN);
        assert_eq!(h.calls(), 1);
    }

    // -- resolution ----------------------------------------------------------

    #[tokio::test]
    async fn unknown_method_is_not_found() {
        let h = harness();
        let body = serde_json::to_vec(&json!({
            "target": { "serviceName": "Echo", "methodName": "Shout" },
        }))
        .unwrap();
        let (_, response) = h.send(MemoryConnection::post(body)).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        let event = h.only_event();
        assert!(event.method.is_none());
        assert!(event.request.is_some());
    }

    #[tokio::test]
    async fn bad_weak_arguments_are_bad_request() {
        let h = harness();
        let body = serde_json::to_vec(&json!({
            "target": { "serviceName": "Echo", "methodName": "Say", "isWeaklyTyped": true },
            "arguments": { "text": "hi", "volume": 11 },
        }))
        .unwrap();
        let (_, response) = h.send(MemoryConnection::post(body)).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(json_body(&response)["details"]["reason"], "invalid_arguments");
        assert_eq!(h.calls(), 0);
    }

    #[tokio::test]
    async fn strongly_typed_arguments_of_the_wrong_type_are_bad_request() {
        let h = harness();
        let body = serde_json::to_vec(&json!({
            "target": { "serviceName": "Echo", "methodName": "Say" },
            "arguments": { "text": { "x": true } },
        }))
        .unwrap();
        let (_, response) = h.send(MemoryConnection::post(body)).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(json_body(&response)["details"]["reason"], "invalid_arguments");
        assert_eq!(h.calls(), 0);
    }

    // -- admission -----------------------------------------------------------

    fn sent_ago(secs: u64) -> Vec<u8> {
        let sent = UnixMillis::now().saturating_sub(Duration::from_secs(secs));
        say(json!({ "tracingData": { "spanStartTime": sent.0 } }))
    }

    fn abandoned_ago(secs: u64) -> Vec<u8> {
        let at = UnixMillis::now().saturating_sub(Duration::from_secs(secs));
        say(json!({ "tracingData": { "abandonRequestBy": at.0 } }))
    }

    #[tokio::test]
    async fn stale_span_is_dropped_before_invocation() {
        let h = harness();
        h.live.store(LoadSheddingPolicy {
            span_age_mode: ShedMode::Drop,
            max_span_age: Duration::from_secs(5),
            ..LoadSheddingPolicy::default()
        });

        let (_, response) = h.send(MemoryConnection::post(sent_ago(10))).await;
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(&response)["kind"], "Overloaded");
        assert_eq!(h.calls(), 0);

        let event = h.only_event();
        assert!(event.method.is_some());
        assert_eq!(event.error.unwrap().kind(), ErrorKind::Overloaded);
    }

    #[tokio::test]
    async fn stale_span_is_served_in_log_only_mode() {
        let h = harness();
        h.live.store(LoadSheddingPolicy {
            span_age_mode: ShedMode::LogOnly,
            max_span_age: Duration::from_secs(5),
            ..LoadSheddingPolicy::default()
        });
        let (_, response) = h.send(MemoryConnection::post(sent_ago(10))).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(h.calls(), 1);
    }

    #[tokio::test]
    async fn passed_deadline_follows_live_policy() {
        let h = harness();
        h.live.store(LoadSheddingPolicy {
            death_time_mode: ShedMode::Drop,
            ..LoadSheddingPolicy::default()
        });
        let (_, response) = h.send(MemoryConnection::post(abandoned_ago(1))).await;
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);

        h.live.store(LoadSheddingPolicy {
            death_time_mode: ShedMode::Disabled,
            ..LoadSheddingPolicy::default()
        });
        let (_, response) = h.send(MemoryConnection::post(abandoned_ago(1))).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(h.calls(), 1);
    }

    // -- endpoints and transport ----------------------------------------------

    struct Claim;

    #[async_trait]
    impl CustomEndpoint for Claim {
        fn name(&self) -> &'static str {
            "claim"
        }

        async fn try_handle(
            &self,
            head: &RequestHead,
        ) -> Result<Option<RpcResponse>, PipelineError> {
            Ok((head.path() == "/claimed").then(|| RpcResponse::empty(StatusCode::NO_CONTENT)))
        }
    }

    #[tokio::test]
    async fn claimed_request_skips_pipeline_entirely() {
        let h = harness_with(ServerConfig::default(), CustomEndpointChain::new().with(Claim));
        h.live.store(LoadSheddingPolicy {
            span_age_mode: ShedMode::Drop,
            ..LoadSheddingPolicy::default()
        });
        let mut head = RequestHead::new(Method::POST, Uri::from_static("/claimed"));
        head.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_JSON));

        let (handled, response) = h
            .send(MemoryConnection::with_head(head, sent_ago(60)))
            .await;
        assert_eq!(handled, Handled::Endpoint);
        assert_eq!(response.status, StatusCode::NO_CONTENT);
        assert!(response.headers.get(HEADER_REQUEST_ID).is_none());
        assert!(h.events.0.lock().is_empty());
        assert_eq!(h.calls(), 0);
    }

    #[tokio::test]
    async fn write_failure_is_swallowed_and_event_still_published() {
        let h = harness();
        let mut conn = MemoryConnection::post(say(json!({})));
        conn.fail_writes = true;
        let handled = h
            .pipeline
            .handle(Box::new(conn), TracingContext::detached())
            .await;
        assert_eq!(handled, Handled::Pipeline(StatusCode::OK));
        assert!(h.only_event().is_success());
    }

    #[test]
    fn stages_are_ordered() {
        assert!(PipelineStage::Validating < PipelineStage::SecurityChecking);
        assert!(PipelineStage::Resolving < PipelineStage::AdmissionChecking);
        assert!(PipelineStage::Serializing < PipelineStage::Published);
    }
}
