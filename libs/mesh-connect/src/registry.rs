//! Thin client for the Consul agent HTTP API.
//!
//! Only the three endpoints a native Connect client needs are covered:
//! CA roots, the leaf certificate of a local service, and health-filtered
//! Connect discovery. Responses are decoded leniently; unknown fields are
//! ignored so newer agents keep working.

use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::{MeshError, RegistryError};
use crate::secret::SecretString;

const TOKEN_HEADER: &str = "X-Consul-Token";

/// Connect CA trust bundle as served by `/v1/agent/connect/ca/roots`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CaRoots {
    pub trust_domain: String,
    #[serde(default)]
    pub roots: Vec<CaRoot>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CaRoot {
    #[serde(rename = "ID", default)]
    pub id: String,
    pub root_cert: String,
    #[serde(default)]
    pub active: bool,
}

/// Leaf certificate issued to a local service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LeafCert {
    #[serde(rename = "CertPEM")]
    pub cert_pem: String,
    #[serde(rename = "PrivateKeyPEM")]
    pub private_key_pem: SecretString,
    /// Service the leaf was issued for; empty on agents that omit it.
    #[serde(default)]
    pub service: String,
}

/// One row of `/v1/health/connect/<service>`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceEntry {
    pub node: NodeInfo,
    pub service: AgentService,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeInfo {
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub datacenter: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentService {
    #[serde(rename = "ID", default)]
    pub id: String,
    pub service: String,
    #[serde(default)]
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub namespace: Option<String>,
}

impl ServiceEntry {
    /// Dialable `host:port` of this instance.
    ///
    /// The service address wins; an empty one falls back to the node address.
    /// IPv6 literals are bracketed.
    #[must_use]
    pub fn socket_address(&self) -> String {
        let host = if self.service.address.is_empty() {
            self.node.address.as_str()
        } else {
            self.service.address.as_str()
        };
        if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{}", self.service.port)
        } else {
            format!("{host}:{}", self.service.port)
        }
    }

    /// Namespace of the instance, `default` when the agent does not report one.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.service
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or("default")
    }
}

/// HTTP client bound to one registry agent.
#[derive(Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: Url,
    token: Option<SecretString>,
}

impl std::fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryClient")
            .field("base_url", &self.base_url.as_str())
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl RegistryClient {
    /// Bind a client to `address` (`host:port`). No request is made.
    ///
    /// An empty `token` is treated as absent.
    ///
    /// # Errors
    /// Returns [`MeshError::InvalidAddress`] if `address` is not a bare HTTP
    /// authority, or [`MeshError::ClientBuild`] if the HTTP client cannot be
    /// constructed.
    pub fn new(
        address: &str,
        token: Option<SecretString>,
        request_timeout: Duration,
    ) -> Result<Self, MeshError> {
        let invalid = |reason: String| MeshError::InvalidAddress {
            address: address.to_owned(),
            reason,
        };

        let base_url = Url::parse(&format!("http://{address}")).map_err(|e| invalid(e.to_string()))?;
        if base_url.host_str().is_none_or(str::is_empty) {
            return Err(invalid("empty host".to_owned()));
        }
        if base_url.path() != "/" || base_url.query().is_some() || base_url.fragment().is_some() {
            return Err(invalid("expected host:port without path".to_owned()));
        }
        if !base_url.username().is_empty() {
            return Err(invalid("credentials are not allowed in the address".to_owned()));
        }

        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(MeshError::ClientBuild)?;

        Ok(Self {
            http,
            base_url,
            token: token.filter(|t| !t.is_empty()),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Fetch the Connect CA trust bundle.
    ///
    /// # Errors
    /// Returns [`RegistryError`] on transport failure, non-2xx status, or a
    /// body that does not decode.
    pub async fn connect_ca_roots(&self) -> Result<CaRoots, RegistryError> {
        let url = self.endpoint(&["v1", "agent", "connect", "ca", "roots"]);
        self.get_json(url).await
    }

    /// Fetch (or have the agent issue) the leaf certificate for `service`.
    ///
    /// # Errors
    /// Returns [`RegistryError`] on transport failure, non-2xx status, or a
    /// body that does not decode.
    pub async fn connect_leaf(&self, service: &str) -> Result<LeafCert, RegistryError> {
        let url = self.endpoint(&["v1", "agent", "connect", "ca", "leaf", service]);
        self.get_json(url).await
    }

    /// List Connect-capable instances of `service` whose checks are passing.
    ///
    /// # Errors
    /// Returns [`RegistryError`] on transport failure, non-2xx status, or a
    /// body that does not decode.
    pub async fn healthy_connect_instances(
        &self,
        service: &str,
    ) -> Result<Vec<ServiceEntry>, RegistryError> {
        let mut url = self.endpoint(&["v1", "health", "connect", service]);
        url.query_pairs_mut().append_pair("passing", "true");
        let entries: Option<Vec<ServiceEntry>> = self.get_json(url).await?;
        Ok(entries.unwrap_or_default())
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.clear().extend(segments);
        }
        url
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, RegistryError> {
        let path = url.path().to_owned();
        tracing::debug!(%path, "registry request");

        let mut request = self.http.get(url);
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token.expose());
        }

        let response = request.send().await.map_err(|source| RegistryError::Transport {
            path: path.clone(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::Status {
                path,
                status,
                body: body.trim().to_owned(),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|source| RegistryError::Decode { path, source })
    }
}
