//! Call handling: call types, routing, and the middleware pipeline.
//!
//! 1. **Call types** (`call`): `InboundCall` from the transport, `EnrichedCall` to handlers
//! 2. **Middleware** (`middleware`): admission, context enrichment, recovery, access log
//! 3. **Routing** (`router`): dispatch to handlers by fully-qualified method
//! 4. **Profiling** (`profiling`): task-scoped labels for the running call

pub mod call;
pub mod config;
pub mod middleware;
pub mod profiling;
pub mod router;

pub use call::{BoxCallFuture, CallError, CallKind, EnrichedCall, InboundCall, TrailerSink};
pub use config::ServerConfig;
pub use middleware::{build_call_pipeline, CallOutcome, CallPipeline};
pub use router::{Handler, MethodRouter};
