//! Facebank
//!
//! A face identity registry: register a face under a name, recognize who is
//! in a photo, and manage the registered identities.

pub mod api;
pub mod blob;
pub mod config;
pub mod embed;
pub mod error;
pub mod gallery;
pub mod matcher;
pub mod metrics;
pub mod model;
pub mod registry;
pub mod store;

pub use error::RegistryError;
pub use model::*;
pub use registry::Registry;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    pub const DEFAULT_DIMENSION: usize = 512;
    pub const DEFAULT_THRESHOLD: f32 = 0.8;
    pub const DEFAULT_EMBED_TIMEOUT_MS: u64 = 10_000;
    pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
    pub const DEFAULT_LISTEN: &str = "0.0.0.0:8000";
    pub const WAL_FILE_NAME: &str = "gallery.wal";
}
