//! Wire-level constants shared by the server and its clients.
//!
//! Header names are plain `&'static str` so that this crate stays free of an
//! HTTP stack; the server converts them with `HeaderName::from_static`.

/// Exact protocol version string the host speaks. A request carrying the
/// protocol header with any other value is rejected.
pub const PROTOCOL_VERSION: &str = "1.0";

/// The only HTTP method accepted for RPC calls.
pub const WRITE_METHOD: &str = "POST";

/// The only content type accepted for RPC bodies (parameters are tolerated).
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Request and response header carrying the protocol version.
pub const HEADER_PROTOCOL_VERSION: &str = "x-rpc-protocol-version";
/// Response header: data center / zone the responding host runs in.
pub const HEADER_DATA_CENTER: &str = "x-rpc-data-center";
/// Response header: deployment environment (e.g. `prod`, `staging`).
pub const HEADER_ENVIRONMENT: &str = "x-rpc-environment";
/// Response header: version of the hosted service.
pub const HEADER_SERVICE_VERSION: &str = "x-rpc-service-version";
/// Response header: hostname of the responding server.
pub const HEADER_SERVER_HOSTNAME: &str = "x-rpc-server-hostname";
/// Response header: fingerprint of the hosted method surface.
pub const HEADER_SCHEMA_HASH: &str = "x-rpc-schema-hash";
/// Response header: method execution time in milliseconds.
pub const HEADER_EXECUTION_TIME: &str = "x-rpc-execution-time";
/// Response header: request id assigned to the call.
pub const HEADER_REQUEST_ID: &str = "x-rpc-request-id";

/// Returns `true` if `value` names the designated structured-data content type.
///
/// Media type parameters (`; charset=utf-8`) and letter case are ignored.
#[must_use]
pub fn is_json_content_type(value: &str) -> bool {
    value
        .split(';')
        .next()
        .is_some_and(|media| media.trim().eq_ignore_ascii_case(CONTENT_TYPE_JSON))
}
