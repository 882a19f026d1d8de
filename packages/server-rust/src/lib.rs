//! Keel Server: hot-reloading settings, per-call context pipeline, and an axum transport.

pub mod network;
pub mod observability;
pub mod service;
pub mod settings;

#[cfg(test)]
pub(crate) mod test_support;

pub use network::{NetworkConfig, NetworkModule, ShutdownController};
pub use service::{build_call_pipeline, CallError, EnrichedCall, InboundCall, MethodRouter};
pub use settings::{ConsulStore, MemoryStore, Reloader, ReloaderConfig};
