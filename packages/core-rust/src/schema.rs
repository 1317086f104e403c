//! Method and parameter shapes, plus the weak-typing conversion.
//!
//! [`coerce`] is the only place where loosely typed arguments are converted to
//! the declared parameter type. Keep it that way: the pipeline hands it a value
//! and a [`ParamType`] and gets back either the converted value or an error.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Declared type of a parameter or result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParamType {
    Any,
    Bool,
    Int,
    Float,
    String,
    Array(Box<ParamType>),
    /// String-keyed map with uniformly typed values.
    Map(Box<ParamType>),
    /// Any JSON object (a structured type the host does not inspect).
    Object,
    Optional(Box<ParamType>),
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamType::Any => f.write_str("any"),
            ParamType::Bool => f.write_str("bool"),
            ParamType::Int => f.write_str("int"),
            ParamType::Float => f.write_str("float"),
            ParamType::String => f.write_str("string"),
            ParamType::Array(inner) => write!(f, "array<{inner}>"),
            ParamType::Map(inner) => write!(f, "map<{inner}>"),
            ParamType::Object => f.write_str("object"),
            ParamType::Optional(inner) => write!(f, "{inner}?"),
        }
    }
}

/// One declared parameter of a method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDescriptor {
    pub name: String,
    pub param_type: ParamType,
}

impl ParameterDescriptor {
    #[must_use]
    pub fn new(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
        }
    }
}

/// A callable method: where it lives, what it takes, what it returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodDescriptor {
    pub service: String,
    pub name: String,
    pub parameters: Vec<ParameterDescriptor>,
    /// `None` for methods that return nothing.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result_type: Option<ParamType>,
}

impl MethodDescriptor {
    /// Metric/log label: `Service.Method`.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.service, self.name)
    }
}

/// The method surface of one hosted service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSchema {
    pub service: String,
    pub version: String,
    pub methods: Vec<MethodDescriptor>,
}

// ---------------------------------------------------------------------------
// Coercion
// ---------------------------------------------------------------------------

/// A value could not be converted to the declared type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("expected {expected}, found {found}")]
pub struct CoercionError {
    pub expected: String,
    pub found: String,
}

impl CoercionError {
    fn new(expected: &ParamType, value: &Value) -> Self {
        Self {
            expected: expected.to_string(),
            found: describe(value),
        }
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "bool".to_string(),
        Value::Number(n) if n.is_f64() => "float".to_string(),
        Value::Number(_) => "int".to_string(),
        Value::String(s) => format!("string {s:?}"),
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "object".to_string(),
    }
}

/// Converts a loosely typed `value` to `target`.
///
/// Accepted conversions: numeric strings to numbers, `"true"`/`"false"` to
/// booleans, whole floats to integers, numbers and booleans to strings.
/// Arrays and maps are converted element-wise. `null` is only accepted by
/// `Optional` and `Any`.
///
/// # Errors
///
/// Returns [`CoercionError`] naming the expected type and what was found.
pub fn coerce(value: &Value, target: &ParamType) -> Result<Value, CoercionError> {
    let fail = || CoercionError::new(target, value);
    match (target, value) {
        (ParamType::Any, v) => Ok(v.clone()),
        (ParamType::Optional(_), Value::Null) => Ok(Value::Null),
        (ParamType::Optional(inner), v) => coerce(v, inner),
        (_, Value::Null) => Err(fail()),

        (ParamType::Bool, Value::Bool(b)) => Ok(Value::Bool(*b)),
        (ParamType::Bool, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(fail()),
        },

        (ParamType::Int, Value::Number(n)) => int_from_number(n).ok_or_else(fail),
        (ParamType::Int, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| fail()),

        (ParamType::Float, Value::Number(n)) => n
            .as_f64()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(fail),
        (ParamType::Float, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(fail),

        (ParamType::String, Value::String(s)) => Ok(Value::String(s.clone())),
        (ParamType::String, Value::Number(n)) => Ok(Value::String(n.to_string())),
        (ParamType::String, Value::Bool(b)) => Ok(Value::String(b.to_string())),

        (ParamType::Array(inner), Value::Array(items)) => items
            .iter()
            .map(|item| coerce(item, inner))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),

        (ParamType::Map(inner), Value::Object(entries)) => entries
            .iter()
            .map(|(k, v)| coerce(v, inner).map(|v| (k.clone(), v)))
            .collect::<Result<Map<_, _>, _>>()
            .map(Value::Object),

        (ParamType::Object, Value::Object(entries)) => Ok(Value::Object(entries.clone())),

        _ => Err(fail()),
    }
}

fn int_from_number(n: &Number) -> Option<Value> {
    if let Some(i) = n.as_i64() {
        return Some(Value::from(i));
    }
    if n.is_u64() {
        return None;
    }
    let f = n.as_f64()?;
    #[allow(clippy::cast_precision_loss)]
    let in_range = f >= i64::MIN as f64 && f < i64::MAX as f64;
    if f.fract() != 0.0 || !in_range {
        return None;
    }
    #[allow(clippy::cast_possible_truncation)]
    let whole = f as i64;
    Some(Value::from(whole))
}

/// Strict check that `value` already has the shape of `target`.
#[must_use]
pub fn conforms(value: &Value, target: &ParamType) -> bool {
    match (target, value) {
        (ParamType::Any, _) | (ParamType::Optional(_), Value::Null) => true,
        (ParamType::Optional(inner), v) => conforms(v, inner),
        (ParamType::Bool, Value::Bool(_)) => true,
        (ParamType::Int, Value::Number(n)) => n.is_i64() || n.is_u64(),
        (ParamType::Float, Value::Number(_)) => true,
        (ParamType::String, Value::String(_)) => true,
        (ParamType::Array(inner), Value::Array(items)) => items.iter().all(|i| conforms(i, inner)),
        (ParamType::Map(inner), Value::Object(m)) => m.values().all(|v| conforms(v, inner)),
        (ParamType::Object, Value::Object(_)) => true,
        _ => false,
    }
}
