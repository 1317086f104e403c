//! Connection primitives the request pipeline consumes.
//!
//! A [`Connection`] is one inbound request on its transport: a parsed head,
//! a body that can be read once, and a slot for exactly one response. The
//! pipeline never sees the HTTP stack behind it, which keeps it testable with
//! in-memory connections.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use rpchost_core::protocol::CONTENT_TYPE_JSON;

use super::tls::ClientCertificate;

/// Unique identifier for an accepted connection, assigned by the ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Request line and headers of an inbound request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl RequestHead {
    #[must_use]
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Header value as a string; `None` when absent or not visible ASCII.
    #[must_use]
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// A framed response: status, headers and body.
#[derive(Debug, Clone)]
pub struct RpcResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RpcResponse {
    #[must_use]
    pub fn empty(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// A response with an `application/json` body.
    #[must_use]
    pub fn json(status: StatusCode, body: impl Into<Bytes>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_JSON));
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// Error raised by a connection's transport.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection closed by peer")]
    Closed,
    #[error("request body already consumed")]
    BodyConsumed,
    #[error("response already written")]
    AlreadyResponded,
    #[error("failed to read request body: {0}")]
    Read(String),
}

/// One inbound request on its transport.
#[async_trait]
pub trait Connection: Send {
    fn id(&self) -> ConnectionId;

    fn head(&self) -> &RequestHead;

    /// Whether the transport is encrypted.
    fn is_secure(&self) -> bool;

    /// The client certificate chain, as vouched for by the TLS handshake or a
    /// trusted proxy.
    fn client_certificate(&self) -> Option<&ClientCertificate>;

    /// Reads the full body. Can be called once.
    async fn read_body(&mut self) -> Result<Bytes, ConnectionError>;

    /// Writes the single response for this request.
    async fn write_response(&mut self, response: RpcResponse) -> Result<(), ConnectionError>;
}

impl std::fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("method", &self.head().method)
            .field("path", &self.head().path())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory connection for pipeline and dispatcher tests.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug)]
    pub struct MemoryConnection {
        pub id: ConnectionId,
        pub head: RequestHead,
        pub body: Option<Bytes>,
        pub secure: bool,
        pub certificate: Option<ClientCertificate>,
        pub fail_writes: bool,
        pub response: Arc<Mutex<Option<RpcResponse>>>,
        /// Number of `read_body` calls.
        pub body_reads: Arc<AtomicUsize>,
    }

    impl MemoryConnection {
        /// A JSON `POST /` carrying `body`.
        pub fn post(body: impl Into<Bytes>) -> Self {
            let mut head = RequestHead::new(Method::POST, Uri::from_static("/"));
            head.headers
                .insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_JSON));
            Self::with_head(head, body)
        }

        pub fn with_head(head: RequestHead, body: impl Into<Bytes>) -> Self {
            Self {
                id: ConnectionId(1),
                head,
                body: Some(body.into()),
                secure: false,
                certificate: None,
                fail_writes: false,
                response: Arc::new(Mutex::new(None)),
                body_reads: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// Handle for reading the response after the connection was moved.
        pub fn response_slot(&self) -> Arc<Mutex<Option<RpcResponse>>> {
            Arc::clone(&self.response)
        }
    }

    #[async_trait]
    impl Connection for MemoryConnection {
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
            self.body_reads.fetch_add(1, Ordering::SeqCst);
            self.body.take().ok_or(ConnectionError::BodyConsumed)
        }

        async fn write_response(&mut self, response: RpcResponse) -> Result<(), ConnectionError> {
            if self.fail_writes {
                return Err(ConnectionError::Closed);
            }
            let mut slot = self.response.lock();
            if slot.is_some() {
                return Err(ConnectionError::AlreadyResponded);
            }
            *slot = Some(response);
            Ok(())
        }
    }
}
