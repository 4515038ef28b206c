#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

//! Consul Connect native client.
//!
//! This crate provides the pieces a process needs to talk to another service
//! through the Consul service mesh without a sidecar proxy:
//! - resolving the agent address ([`resolve_registry_address`])
//! - a thin client for the agent HTTP API ([`RegistryClient`])
//! - a mesh identity for a named local service ([`MeshService`])
//! - mutually authenticated dialing behind the [`MeshDialer`] capability,
//!   bounded by a [`DialContext`] deadline
//!
//! **Note:** the registry is the only source of instance discovery and of
//! trust material. Nothing here caches across runs or reconnects on failure.
//!
//! # Example
//!
//! ```ignore
//! use mesh_connect::{dial_with_deadline, resolve_registry_address, DialContext, MeshService, RegistryClient};
//! use std::time::Duration;
//!
//! let client = RegistryClient::new(&resolve_registry_address(""), None, Duration::from_secs(5))?;
//! let service = MeshService::register(client, "billing").await?;
//! let stream = dial_with_deadline(&service, "redis", &DialContext::new(Duration::from_secs(10))).await?;
//! ```

mod address;
mod dial;
mod error;
mod identity;
pub mod registry;
mod secret;
pub mod tls;

pub use address::{DEFAULT_REGISTRY_HOST, DEFAULT_REGISTRY_PORT, resolve_registry_address};
pub use dial::{DialContext, MeshDialer, MeshIo, MeshStream, dial_with_deadline};
pub use error::{MeshError, MeshErrorKind, RegistryError};
pub use identity::MeshService;
pub use registry::RegistryClient;
pub use secret::SecretString;
