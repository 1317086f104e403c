//! Resolved methods, invocation outcomes and argument-list construction.

use std::time::Duration;

use rpchost_core::{coerce, conforms, MethodDescriptor, ParamType, TracingContext};
use serde_json::{Map, Value};

use super::error::{RejectReason, RequestError};

/// A method the resolver found for a target.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMethod {
    pub descriptor: MethodDescriptor,
}

impl ResolvedMethod {
    #[must_use]
    pub fn new(descriptor: MethodDescriptor) -> Self {
        Self { descriptor }
    }

    /// `Service.Method`, used as the metric and log key.
    #[must_use]
    pub fn name(&self) -> String {
        self.descriptor.qualified_name()
    }
}

/// What the activator returns for a successful call.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationOutcome {
    /// `None` for methods without a result.
    pub result: Option<Value>,
    pub execution_time: Duration,
}

/// A single invocation travelling through the invocation stack.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub ctx: TracingContext,
    pub method: std::sync::Arc<ResolvedMethod>,
    pub arguments: Map<String, Value>,
    pub weakly_typed: bool,
}

/// Builds the ordered argument list for `method`.
///
/// Weakly-typed calls look every declared parameter up by name and coerce it
/// to the declared type; a missing parameter is `null` when the type allows
/// it. Unknown argument names are rejected.
///
/// Strongly-typed calls take the argument values as sent, in request order,
/// must supply exactly one value per declared parameter, and each value must
/// already have its parameter's type. Values are matched to parameters by
/// position.
///
/// # Errors
///
/// Returns a bad-request [`RequestError`] tagged `invalid_arguments`.
pub fn build_arguments(
    method: &MethodDescriptor,
    arguments: &Map<String, Value>,
    weakly_typed: bool,
) -> Result<Vec<Value>, RequestError> {
    if weakly_typed {
        weak_arguments(method, arguments)
    } else {
        strong_arguments(method, arguments)
    }
}

fn weak_arguments(
    method: &MethodDescriptor,
    arguments: &Map<String, Value>,
) -> Result<Vec<Value>, RequestError> {
    if let Some(unknown) = arguments
        .keys()
        .find(|name| !method.parameters.iter().any(|p| &p.name == *name))
    {
        return Err(invalid(format!(
            "{} has no parameter named '{unknown}'",
            method.qualified_name()
        )));
    }

    method
        .parameters
        .iter()
        .map(|param| match arguments.get(&param.name) {
            Some(value) => coerce(value, &param.param_type).map_err(|e| {
                invalid(format!("parameter '{}': {e}", param.name))
            }),
            None if accepts_null(&param.param_type) => Ok(Value::Null),
            None => Err(invalid(format!("missing parameter '{}'", param.name))),
        })
        .collect()
}

fn strong_arguments(
    method: &MethodDescriptor,
    arguments: &Map<String, Value>,
) -> Result<Vec<Value>, RequestError> {
    if arguments.len() != method.parameters.len() {
        return Err(invalid(format!(
            "{} takes {} arguments, got {}",
            method.qualified_name(),
            method.parameters.len(),
            arguments.len()
        )));
    }
    arguments
        .values()
        .zip(&method.parameters)
        .map(|(value, param)| {
            if conforms(value, &param.param_type) {
                Ok(value.clone())
            } else {
                Err(invalid(format!(
                    "parameter '{}': expected {}",
                    param.name, param.param_type
                )))
            }
        })
        .collect()
}

fn accepts_null(param_type: &ParamType) -> bool {
    matches!(param_type, ParamType::Optional(_) | ParamType::Any)
}

fn invalid(message: String) -> RequestError {
    RequestError::bad_request(RejectReason::InvalidArguments, message)
}
