pub mod auth;
pub mod config;
pub mod error;
pub mod log;
pub mod pagination;
pub mod sync;
pub mod time;
pub mod uuid;

/// Helper type used as a return type for HTTP handlers. This type helps
/// agregating multiple error types from this crate as well as different
/// external crates which have an error system.
pub type Result<T> = std::result::Result<T, error::ServerError>;
