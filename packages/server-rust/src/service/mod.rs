//! Request handling: the per-request pipeline and everything it calls.
//!
//! 1. **Dispatch** (`dispatcher`): accept loop, one worker per connection
//! 2. **Custom endpoints** (`endpoint`): handlers tried before the pipeline
//! 3. **Pipeline** (`pipeline`): validate, secure, parse, resolve, admit,
//!    invoke, serialize, respond, publish
//! 4. **Admission** (`admission`): span-age and death-time load shedding
//! 5. **Invocation** (`middleware`): Tower stack around the activator
//! 6. **Classification** (`classify`): failure to status and payload

pub mod admission;
pub mod classify;
pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod invoke;
pub mod middleware;
pub mod pipeline;
pub mod registry;

pub use admission::{Admission, AdmissionController};
pub use classify::{classify, error_response, Classified, ErrorPayload};
pub use config::{LiveConfig, LoadSheddingPolicy, ServerConfig, ShedMode, TransportSecurity};
pub use dispatcher::{spawn_forked, RequestDispatcher};
pub use endpoint::{CustomEndpoint, CustomEndpointChain, EndpointOutcome};
pub use error::{ErrorKind, PipelineError, RejectReason, RequestError, ShedReason};
pub use events::{ChannelEventPublisher, CompletionEvent, EventPump, EventSink, TracingEventPublisher};
pub use invoke::{Invocation, InvocationOutcome, ResolvedMethod};
pub use pipeline::{Collaborators, Handled, PipelineStage, RequestPipeline};
pub use registry::{HandlerFuture, MethodRegistry};
