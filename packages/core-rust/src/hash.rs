//! Schema fingerprinting.
//!
//! Callers compare the schema hash the server echoes in every response with the
//! one they were built against to detect incompatible deployments.

use sha2::{Digest, Sha256};

use crate::schema::ServiceSchema;

/// Lowercase hex SHA-256 of the canonical JSON form of `schema`.
///
/// Methods are sorted by name first, so registration order does not affect
/// the result. Parameter order is part of the signature and is kept.
///
/// # Examples
///
/// ```
/// use rpchost_core::{schema_hash, ServiceSchema};
///
/// let schema = ServiceSchema { service: "Echo".into(), version: "1".into(), methods: vec![] };
/// assert_eq!(schema_hash(&schema).len(), 64);
/// ```
#[must_use]
pub fn schema_hash(schema: &ServiceSchema) -> String {
    let mut canonical = schema.clone();
    canonical.methods.sort_by(|a, b| a.name.cmp(&b.name));
    // Serializing plain structs, strings and enums cannot fail.
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{MethodDescriptor, ParamType, ParameterDescriptor};

    fn method(name: &str, params: &[(&str, ParamType)]) -> MethodDescriptor {
        MethodDescriptor {
            service: "Orders".into(),
            name: name.into(),
            parameters: params
                .iter()
                .map(|(n, t)| ParameterDescriptor::new(*n, t.clone()))
                .collect(),
            result_type: Some(ParamType::Object),
        }
    }

    fn schema(methods: Vec<MethodDescriptor>) -> ServiceSchema {
        ServiceSchema {
            service: "Orders".into(),
            version: "2.1.0".into(),
            methods,
        }
    }

    #[test]
    fn hash_ignores_method_order() {
        let a = method("Get", &[("id", ParamType::Int)]);
        let b = method("List", &[]);
        assert_eq!(
            schema_hash(&schema(vec![a.clone(), b.clone()])),
            schema_hash(&schema(vec![b, a]))
        );
    }

    #[test]
    fn hash_changes_with_parameter_type() {
        let before = schema(vec![method("Get", &[("id", ParamType::Int)])]);
        let after = schema(vec![method("Get", &[("id", ParamType::String)])]);
        assert_ne!(schema_hash(&before), schema_hash(&after));
    }

    #[test]
    fn hash_is_lowercase_hex() {
        let h = schema_hash(&schema(vec![]));
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }
}
