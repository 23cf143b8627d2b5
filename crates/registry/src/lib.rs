//! `loomerp-registry` — logical service names → base URLs, plus the typed
//! HTTP client used for synchronous service-to-service calls.

pub mod client;
pub mod registry;

pub use client::{DownstreamError, ServiceClient};
pub use registry::{RegistryError, ServiceRegistry};
