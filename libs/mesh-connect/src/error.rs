use std::time::Duration;
use thiserror::Error;

/// Failure of a single registry HTTP call.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RegistryError {
    /// Network-level failure (connection refused, DNS, client timeout)
    #[error("registry request {path} failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    /// Agent answered with a non-2xx status (ACL denial, unknown service, ...)
    #[error("registry returned HTTP {status} for {path}: {body}")]
    Status {
        path: String,
        status: reqwest::StatusCode,
        body: String,
    },

    /// Body was not the expected JSON document
    #[error("registry response for {path} could not be decoded: {source}")]
    Decode {
        path: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Coarse classification of [`MeshError`], matching the stage that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshErrorKind {
    /// Local configuration problem; no network call was made.
    RegistryClient,
    /// The registry could not issue a usable mesh identity.
    ServiceRegistration,
    /// Discovery, transport, handshake, deadline or cancellation.
    Connectivity,
}

/// Errors raised while building the mesh client, registering, or dialing.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum MeshError {
    /// Registry address does not form a valid HTTP authority
    #[error("invalid registry address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    /// HTTP client could not be constructed
    #[error("failed to build registry HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),

    /// Registry refused or failed to issue identity material
    #[error("registry could not register mesh service '{service}': {source}")]
    Registration {
        service: String,
        #[source]
        source: RegistryError,
    },

    /// Identity material from the registry is unusable
    #[error("invalid mesh identity for '{service}': {reason}")]
    InvalidIdentity { service: String, reason: String },

    /// Discovery request failed
    #[error("discovery of '{service}' failed: {source}")]
    Discovery {
        service: String,
        #[source]
        source: RegistryError,
    },

    /// Discovery succeeded but nothing is passing
    #[error("no healthy Connect-capable instances of '{service}'")]
    NoHealthyInstances { service: String },

    /// TCP connect to the chosen instance failed
    #[error("TCP connection to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// TLS client configuration could not be assembled
    #[error("TLS setup for '{service}' failed: {reason}")]
    TlsConfig { service: String, reason: String },

    /// Mutual TLS handshake failed (includes identity mismatch)
    #[error("mTLS handshake with '{service}' at {addr} failed: {source}")]
    Handshake {
        service: String,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Dial did not complete before the context deadline
    #[error("dial to '{service}' exceeded deadline of {timeout:?}")]
    DialTimeout { service: String, timeout: Duration },

    /// Dial context was cancelled
    #[error("dial to '{service}' was cancelled")]
    Cancelled { service: String },
}

impl MeshError {
    #[must_use]
    pub fn kind(&self) -> MeshErrorKind {
        match self {
            Self::InvalidAddress { .. } | Self::ClientBuild(_) => MeshErrorKind::RegistryClient,
            Self::Registration { .. } | Self::InvalidIdentity { .. } => {
                MeshErrorKind::ServiceRegistration
            }
            Self::Discovery { .. }
            | Self::NoHealthyInstances { .. }
            | Self::Connect { .. }
            | Self::TlsConfig { .. }
            | Self::Handshake { .. }
            | Self::DialTimeout { .. }
            | Self::Cancelled { .. } => MeshErrorKind::Connectivity,
        }
    }
}
