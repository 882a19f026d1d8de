//! HTTP transport, health probes, shutdown control and signal handling.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod module;
pub mod shutdown;
pub mod signals;

pub use config::NetworkConfig;
pub use handlers::AppState;
pub use module::NetworkModule;
pub use shutdown::*;
pub use signals::{handle_termination, shutdown_requested, OsSignals, SignalSource};
