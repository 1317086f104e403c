//! `rpchost` Core — wire types, tracing context, method shapes, and result codec.

pub mod codec;
pub mod context;
pub mod hash;
pub mod protocol;
pub mod schema;
pub mod types;

pub use codec::{CodecError, SerializationMode};
pub use context::{ContextError, ContextKey, ContextValue, RequestOverrides, TracingContext};
pub use hash::schema_hash;
pub use schema::{
    coerce, conforms, CoercionError, MethodDescriptor, ParamType, ParameterDescriptor,
    ServiceSchema,
};
pub use types::{HostOverride, IncomingRequest, InvokeTarget, OverridesData, TracingData, UnixMillis};
