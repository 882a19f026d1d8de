//! Tower middleware layers for the call pipeline.
//!
//! - [`admission`]: Reject calls once shutdown starts, track in-flight calls
//! - [`context`]: Per-call context enrichment
//! - [`recover`]: Panic containment and completion logging
//! - [`access_log`]: Request details record before dispatch
//! - [`pipeline`]: Composes all layers into a single service stack

pub mod access_log;
pub mod admission;
pub mod context;
pub mod pipeline;
pub mod recover;

pub use access_log::AccessLogLayer;
pub use admission::AdmissionLayer;
pub use context::ContextLayer;
pub use pipeline::{build_call_pipeline, CallPipeline};
pub use recover::{CallOutcome, RecoverLayer, PANIC_MESSAGE};
