//! JSON encoding of requests and results.

use serde_json::Value;

use crate::schema::{conforms, ParamType};
use crate::types::{IncomingRequest, InvokeTarget};

/// How a result is serialized for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializationMode {
    /// The result must conform to the declared result type.
    Strong,
    /// The result is written as-is.
    Weak,
}

impl SerializationMode {
    /// Weakly typed targets get weak results.
    #[must_use]
    pub fn for_target(target: &InvokeTarget) -> Self {
        if target.is_weakly_typed {
            SerializationMode::Weak
        } else {
            SerializationMode::Strong
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("result does not conform to declared type {expected}")]
    NonConforming { expected: String },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Decodes a request body. The protocol version is left unset.
///
/// # Errors
///
/// Returns the `serde_json` error for malformed JSON or missing `target`.
pub fn decode_request(body: &[u8]) -> Result<IncomingRequest, serde_json::Error> {
    serde_json::from_slice(body)
}

/// # Errors
///
/// Returns the `serde_json` error if encoding fails.
pub fn encode_request(request: &IncomingRequest) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(request)
}

/// Encodes a method result. A missing result is written as `null`.
///
/// # Errors
///
/// - [`CodecError::NonConforming`] in strong mode when the result does not
///   match `declared`
/// - [`CodecError::Json`] if encoding fails
pub fn encode_result(
    result: Option<&Value>,
    declared: Option<&ParamType>,
    mode: SerializationMode,
) -> Result<Vec<u8>, CodecError> {
    let value = result.unwrap_or(&Value::Null);
    if mode == SerializationMode::Strong {
        if let Some(declared) = declared {
            if !conforms(value, declared) {
                return Err(CodecError::NonConforming {
                    expected: declared.to_string(),
                });
            }
        }
    }
    Ok(serde_json::to_vec(value)?)
}

/// # Errors
///
/// Returns the `serde_json` error for malformed JSON.
pub fn decode_result(body: &[u8]) -> Result<Value, serde_json::Error> {
    serde_json::from_slice(body)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            (-1_000_000_i32..1_000_000).prop_map(|n| Value::from(f64::from(n) / 8.0)),
            "[a-zA-Z0-9 _\\-]{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..6)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn weak_results_round_trip(value in arb_json()) {
            let bytes = encode_result(Some(&value), None, SerializationMode::Weak).unwrap();
            prop_assert_eq!(decode_result(&bytes).unwrap(), value);
        }

        #[test]
        fn conforming_strong_results_round_trip(value in arb_json()) {
            let bytes = encode_result(Some(&value), Some(&ParamType::Any), SerializationMode::Strong).unwrap();
            prop_assert_eq!(decode_result(&bytes).unwrap(), value);
        }
    }

    #[test]
    fn strong_mode_rejects_non_conforming_result() {
        let err = encode_result(Some(&json!("x")), Some(&ParamType::Int), SerializationMode::Strong)
            .unwrap_err();
        assert!(matches!(err, CodecError::NonConforming { expected } if expected == "int"));
    }

    #[test]
    fn weak_mode_ignores_declared_type() {
        let bytes =
            encode_result(Some(&json!("x")), Some(&ParamType::Int), SerializationMode::Weak).unwrap();
        assert_eq!(bytes, b"\"x\"");
    }

    #[test]
    fn missing_result_encodes_as_null() {
        let bytes = encode_result(None, None, SerializationMode::Strong).unwrap();
        assert_eq!(bytes, b"null");
    }

    #[test]
    fn request_round_trips_without_protocol_version() {
        let mut req = IncomingRequest::new(InvokeTarget {
            service_name: "S".into(),
            method_name: "M".into(),
            is_weakly_typed: false,
        });
        req.arguments.insert("b".into(), json!(1));
        req.arguments.insert("a".into(), json!([true]));
        req.protocol_version = Some("1.0".into());

        let decoded = decode_request(&encode_request(&req).unwrap()).unwrap();
        assert_eq!(decoded.arguments.keys().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(decoded.target, req.target);
        assert!(decoded.protocol_version.is_none());
    }

    #[test]
    fn mode_follows_target_typing() {
        let mut target = InvokeTarget {
            service_name: "S".into(),
            method_name: "M".into(),
            is_weakly_typed: true,
        };
        assert_eq!(SerializationMode::for_target(&target), SerializationMode::Weak);
        target.is_weakly_typed = false;
        assert_eq!(SerializationMode::for_target(&target), SerializationMode::Strong);
    }
}
