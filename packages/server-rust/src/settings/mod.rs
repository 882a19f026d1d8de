//! Settings subsystem: the hot-reloading snapshot and its store backends.

pub mod consul;
pub mod memory;
pub mod reloader;

pub use consul::ConsulStore;
pub use memory::MemoryStore;
pub use reloader::{ReloadError, Reloader, ReloaderConfig, DEFAULT_FALLBACK, DEFAULT_WAIT_TIME};
