//! Reverse proxy functionality
//!
//! Token resolution, credential rotation and forwarding to the upstream.

pub mod registry;
pub mod resolver;
pub mod upstream;

pub use registry::{CredentialRegistry, RegistryEntry};
pub use resolver::{CredentialSource, Resolution, ResolveError, Resolver};
pub use upstream::{ProxyHandler, UpstreamError, UpstreamTarget};
