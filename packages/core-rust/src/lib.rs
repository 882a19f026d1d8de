//! Keel Core: settings snapshot schema, modify-index ordering, call metadata and per-call context.

pub mod context;
pub mod index;
pub mod metadata;
pub mod settings;
pub mod status;
pub mod traits;

pub use context::{CallContext, ProfilingLabels, RequestId, RequestIdError};
pub use index::{IndexChange, ModifyIndex};
pub use metadata::{Metadata, MetadataError};
pub use settings::Settings;
pub use status::{Code, Status};
pub use traits::{ConfigStore, KvPair, StoreError};
