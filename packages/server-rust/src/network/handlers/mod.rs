//! HTTP handler definitions.
//!
//! This module defines `AppState` (the shared state carried through axum
//! extractors) and re-exports all handler functions for building the router.

pub mod health;
pub mod rpc;

pub use health::{health_handler, liveness_handler, readiness_handler};
pub use rpc::{rpc_handler, RpcPipeline};

use std::sync::Arc;
use std::time::Instant;

use super::ShutdownController;
use crate::settings::Reloader;

/// Shared application state passed to all axum handlers via `State` extraction.
///
/// Holds `Arc` references and a cloneable pipeline, so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Graceful shutdown controller with health state and in-flight tracking.
    pub shutdown: Arc<ShutdownController>,
    /// Settings reloader, for readiness and health reporting.
    pub reloader: Arc<Reloader>,
    /// Call pipeline serving `/rpc` requests.
    pub pipeline: RpcPipeline,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
}
