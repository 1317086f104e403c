//! HTTP ingress: turns axum requests into [`Connection`]s for the dispatcher.
//!
//! Every request lands in [`ingress_handler`] (the router's fallback). The
//! handler wraps it in an [`HttpConnection`], queues it on the ingress channel
//! and waits for the pipeline to write the response back through a oneshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::HeaderName;
use tokio::sync::oneshot;

use super::connection::{Connection, ConnectionError, ConnectionId, RequestHead, RpcResponse};
use super::listener::IngressSender;
use super::tls::{ClientCertificate, TlsPeer};

/// Shared state for the ingress handler.
#[derive(Debug, Clone)]
pub struct IngressState {
    sender: IngressSender,
    secure: bool,
    proxy_cert_header: Option<HeaderName>,
    body_limit: usize,
    next_id: Arc<AtomicU64>,
}

impl IngressState {
    /// `proxy_cert_header` names the header a trusted TLS-terminating proxy
    /// forwards the client chain in. Without it the certificate comes only
    /// from the in-process handshake.
    #[must_use]
    pub fn new(
        sender: IngressSender,
        secure: bool,
        proxy_cert_header: Option<HeaderName>,
        body_limit: usize,
    ) -> Self {
        Self {
            sender,
            secure,
            proxy_cert_header,
            body_limit,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

/// A request received over HTTP, answered through a oneshot channel.
pub struct HttpConnection {
    id: ConnectionId,
    head: RequestHead,
    body: Option<Body>,
    body_limit: usize,
    secure: bool,
    certificate: Option<ClientCertificate>,
    responder: Option<oneshot::Sender<RpcResponse>>,
}

impl HttpConnection {
    fn new(
        state: &IngressState,
        request: Request,
    ) -> (Self, oneshot::Receiver<RpcResponse>) {
        let (parts, body) = request.into_parts();
        let certificate = match &state.proxy_cert_header {
            Some(name) => parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .and_then(ClientCertificate::from_proxy_header),
            None => parts
                .extensions
                .get::<TlsPeer>()
                .and_then(|peer| peer.certificate.clone()),
        };
        let (tx, rx) = oneshot::channel();
        let conn = Self {
            id: ConnectionId(state.next_id.fetch_add(1, Ordering::Relaxed)),
            head: RequestHead {
                method: parts.method,
                uri: parts.uri,
                headers: parts.headers,
            },
            body: Some(body),
            body_limit: state.body_limit,
            secure: state.secure,
            certificate,
            responder: Some(tx),
        };
        (conn, rx)
    }
}

#[async_trait]
impl Connection for HttpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn head(&self) -> &RequestHead {
        &self.head
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    fn client_certificate(&self) -> Option<&ClientCertificate> {
        self.certificate.as_ref()
    }

    async fn read_body(&mut self) -> Result<Bytes, ConnectionError> {
        let body = self.body.take().ok_or(ConnectionError::BodyConsumed)?;
        axum::body::to_bytes(body, self.body_limit)
            .await
            .map_err(|e| ConnectionError::Read(e.to_string()))
    }

    async fn write_response(&mut self, response: RpcResponse) -> Result<(), ConnectionError> {
        let responder = self
            .responder
            .take()
            .ok_or(ConnectionError::AlreadyResponded)?;
        responder.send(response).map_err(|_| ConnectionError::Closed)
    }
}

impl IntoResponse for RpcResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Router fallback: hands the request to the dispatcher and waits for its
/// response.
pub async fn ingress_handler(State(state): State<IngressState>, request: Request) -> Response {
    let (conn, response) = HttpConnection::new(&state, request);
    if state.sender.submit(Box::new(conn)).await.is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response();
    }
    match response.await {
        Ok(response) => response.into_response(),
        Err(_) => {
            tracing::warn!("request dropped without a response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
