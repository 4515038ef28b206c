use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::IndexedRandom;
use rustls::RootCertStore;
use rustls_pki_types::{CertificateDer, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::dial::{DialContext, MeshDialer, MeshStream};
use crate::error::MeshError;
use crate::registry::{RegistryClient, ServiceEntry};
use crate::secret::SecretString;
use crate::tls::{self, SpiffeServiceId};

/// Mesh identity of a local service, held for the lifetime of one run.
///
/// Holds the Connect CA roots and the leaf certificate issued to `name`.
/// The private key stays in PEM form inside a zeroizing secret and is only
/// decoded when a TLS configuration is built.
pub struct MeshService {
    name: String,
    trust_domain: String,
    registry: RegistryClient,
    roots: Arc<RootCertStore>,
    cert_chain: Vec<CertificateDer<'static>>,
    key_pem: SecretString,
}

impl std::fmt::Debug for MeshService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshService")
            .field("name", &self.name)
            .field("trust_domain", &self.trust_domain)
            .field("registry", &self.registry)
            .field("roots", &self.roots.len())
            .field("cert_chain", &self.cert_chain.len())
            .field("key_pem", &self.key_pem)
            .finish()
    }
}

impl MeshService {
    /// Obtain a mesh identity for `name` from the registry.
    ///
    /// # Errors
    /// Returns [`MeshError::Registration`] if the registry cannot be reached
    /// or refuses issuance, and [`MeshError::InvalidIdentity`] if the returned
    /// material does not parse or was issued for another service.
    pub async fn register(registry: RegistryClient, name: &str) -> Result<Self, MeshError> {
        let registration = |source| MeshError::Registration {
            service: name.to_owned(),
            source,
        };
        let invalid = |reason: String| MeshError::InvalidIdentity {
            service: name.to_owned(),
            reason,
        };

        let bundle = registry.connect_ca_roots().await.map_err(registration)?;
        let leaf = registry.connect_leaf(name).await.map_err(registration)?;

        if !leaf.service.is_empty() && leaf.service != name {
            return Err(invalid(format!("leaf certificate issued for '{}'", leaf.service)));
        }
        if bundle.trust_domain.is_empty() {
            return Err(invalid("registry returned an empty trust domain".to_owned()));
        }
        let roots = tls::root_store(&bundle).map_err(invalid)?;
        let cert_chain = tls::parse_certificates(&leaf.cert_pem).map_err(invalid)?;
        tls::parse_private_key(leaf.private_key_pem.expose()).map_err(invalid)?;

        tracing::info!(
            service = name,
            trust_domain = %bundle.trust_domain,
            roots = roots.len(),
            "mesh service registered"
        );

        Ok(Self {
            name: name.to_owned(),
            trust_domain: bundle.trust_domain,
            registry,
            roots: Arc::new(roots),
            cert_chain,
            key_pem: leaf.private_key_pem,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// Release the identity now instead of at scope end.
    pub fn close(self) {
        drop(self);
    }

    fn pick_instance(service: &str, entries: &[ServiceEntry]) -> Result<ServiceEntry, MeshError> {
        entries
            .choose(&mut rand::rng())
            .cloned()
            .ok_or_else(|| MeshError::NoHealthyInstances {
                service: service.to_owned(),
            })
    }
}

impl Drop for MeshService {
    fn drop(&mut self) {
        tracing::debug!(service = %self.name, "mesh service closed");
    }
}

#[async_trait]
impl MeshDialer for MeshService {
    async fn dial(&self, service: &str, _ctx: &DialContext) -> Result<MeshStream, MeshError> {
        let entries = self
            .registry
            .healthy_connect_instances(service)
            .await
            .map_err(|source| MeshError::Discovery {
                service: service.to_owned(),
                source,
            })?;
        let instance = Self::pick_instance(service, &entries)?;
        let addr = instance.socket_address();
        tracing::debug!(
            instances = entries.len(),
            instance = %instance.service.id,
            node = %instance.node.node,
            %addr,
            "selected service instance"
        );

        let expected = SpiffeServiceId {
            trust_domain: self.trust_domain.clone(),
            namespace: instance.namespace().to_owned(),
            datacenter: instance.node.datacenter.clone(),
            service: service.to_owned(),
        };
        let sni = tls::service_sni(service, &instance.node.datacenter, &self.trust_domain);
        let server_name =
            ServerName::try_from(sni.clone()).map_err(|e| MeshError::TlsConfig {
                service: service.to_owned(),
                reason: format!("invalid SNI '{sni}': {e}"),
            })?;
        let key = tls::parse_private_key(self.key_pem.expose()).map_err(|reason| {
            MeshError::InvalidIdentity {
                service: self.name.clone(),
                reason,
            }
        })?;
        let config = tls::client_config(
            Arc::clone(&self.roots),
            self.cert_chain.clone(),
            key,
            expected,
        )?;

        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|source| MeshError::Connect {
                addr: addr.clone(),
                source,
            })?;
        tcp.set_nodelay(true).map_err(|source| MeshError::Connect {
            addr: addr.clone(),
            source,
        })?;

        let stream = TlsConnector::from(config)
            .connect(server_name, tcp)
            .await
            .map_err(|source| MeshError::Handshake {
                service: service.to_owned(),
                addr: addr.clone(),
                source,
            })?;

        tracing::info!(service, %addr, "mesh connection established");
        Ok(Box::new(stream))
    }
}
