//! CONCLAVE Server
//!
//! HTTP/JSON connection layer over the registry: decodes client requests
//! into [`RegistryService`](conclave_registry::RegistryService) calls.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod config;
pub mod error;

pub use api::router;
pub use config::ServerConfig;
pub use error::{ApiError, ConfigError};
