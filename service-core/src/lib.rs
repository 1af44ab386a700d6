//! service-core: Shared infrastructure for Hub services.
pub mod config;
pub mod error;
pub mod observability;

pub use tracing;
