/// Host used when no registry host is configured.
pub const DEFAULT_REGISTRY_HOST: &str = "localhost";

/// Consul agent HTTP port; always appended.
pub const DEFAULT_REGISTRY_PORT: u16 = 8500;

/// Produce the `host:port` of the registry agent.
///
/// An empty override means "use the default host". The result is not checked
/// for reachability; a bad address surfaces when the client is built or used.
#[must_use]
pub fn resolve_registry_address(host_override: &str) -> String {
    let host = if host_override.is_empty() {
        DEFAULT_REGISTRY_HOST
    } else {
        host_override
    };
    format!("{host}:{DEFAULT_REGISTRY_PORT}")
}
