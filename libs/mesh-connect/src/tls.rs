//! Mesh mTLS: SPIFFE identities, PEM loading and the client configuration.
//!
//! Connect leaf certificates carry no DNS names. Servers are authenticated by
//! chaining to the Connect CA and by the SPIFFE URI SAN of their leaf, so the
//! webpki host-name check is replaced by a service identity check.

use std::fmt;
use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, Error as TlsError, RootCertStore,
    SignatureScheme,
};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};

use crate::error::MeshError;
use crate::registry::CaRoots;

const SPIFFE_SCHEME: &str = "spiffe://";
/// Context-specific tag of `uniformResourceIdentifier` in `GeneralName`.
const URI_SAN_TAG: u8 = 0x86;

/// Service identity encoded in a Connect SPIFFE URI:
/// `spiffe://<trust-domain>/ns/<ns>/dc/<dc>/svc/<service>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiffeServiceId {
    pub trust_domain: String,
    pub namespace: String,
    pub datacenter: String,
    pub service: String,
}

impl SpiffeServiceId {
    #[must_use]
    pub fn uri(&self) -> String {
        format!(
            "{SPIFFE_SCHEME}{}/ns/{}/dc/{}/svc/{}",
            self.trust_domain, self.namespace, self.datacenter, self.service
        )
    }

    /// Parse a service URI. Agent and other non-service URIs yield `None`.
    #[must_use]
    pub fn parse(uri: &str) -> Option<Self> {
        let rest = uri.strip_prefix(SPIFFE_SCHEME)?;
        let mut parts = rest.split('/');
        let trust_domain = parts.next().filter(|s| !s.is_empty())?;
        let mut field = |label: &str| -> Option<String> {
            if parts.next()? != label {
                return None;
            }
            parts.next().filter(|s| !s.is_empty()).map(str::to_owned)
        };
        let namespace = field("ns")?;
        let datacenter = field("dc")?;
        let service = field("svc")?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            trust_domain: trust_domain.to_owned(),
            namespace,
            datacenter,
            service,
        })
    }

    /// Whether a presented identity authorizes as `self`.
    ///
    /// The datacenter is not compared: a service keeps its identity when
    /// reached across datacenters.
    #[must_use]
    pub fn matches(&self, presented: &Self) -> bool {
        self.trust_domain.eq_ignore_ascii_case(&presented.trust_domain)
            && self.namespace == presented.namespace
            && self.service == presented.service
    }
}

impl fmt::Display for SpiffeServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

/// SNI a Connect-native server expects for `service` in the default namespace.
#[must_use]
pub fn service_sni(service: &str, datacenter: &str, trust_domain: &str) -> String {
    format!("{service}.default.{datacenter}.internal.{trust_domain}")
}

/// Extract `spiffe://` URI SANs from a DER certificate.
///
/// This is a tag scan rather than a full X.509 parse; the scheme prefix makes
/// accidental matches in signature or key bytes practically impossible.
#[must_use]
pub fn spiffe_uri_sans(der: &[u8]) -> Vec<String> {
    let mut found = Vec::new();
    let mut i = 0;
    while i < der.len() {
        if der[i] == URI_SAN_TAG
            && let Some((len, header)) = der_length(&der[i + 1..])
        {
            let start = i + 1 + header;
            if let Some(body) = der.get(start..start + len)
                && body.starts_with(SPIFFE_SCHEME.as_bytes())
                && let Ok(uri) = std::str::from_utf8(body)
            {
                found.push(uri.to_owned());
                i = start + len;
                continue;
            }
        }
        i += 1;
    }
    found
}

/// Decode a DER length (short form or up to two length octets).
fn der_length(bytes: &[u8]) -> Option<(usize, usize)> {
    let first = *bytes.first()?;
    if first < 0x80 {
        return Some((usize::from(first), 1));
    }
    let octets = usize::from(first & 0x7f);
    if octets == 0 || octets > 2 {
        return None;
    }
    let len = bytes
        .get(1..=octets)?
        .iter()
        .fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
    Some((len, octets + 1))
}

/// Parse every certificate in a PEM bundle. An empty bundle is an error.
///
/// # Errors
/// Returns a description of the first malformed block, or of an empty bundle.
pub fn parse_certificates(pem: &str) -> Result<Vec<CertificateDer<'static>>, String> {
    let certs = CertificateDer::pem_slice_iter(pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("malformed certificate PEM: {e}"))?;
    if certs.is_empty() {
        return Err("no certificates in PEM".to_owned());
    }
    Ok(certs)
}

/// Parse the first private key (PKCS#8, SEC1 or PKCS#1) from PEM.
///
/// # Errors
/// Returns a description if no supported key block is found.
pub fn parse_private_key(pem: &str) -> Result<PrivateKeyDer<'static>, String> {
    PrivateKeyDer::from_pem_slice(pem.as_bytes()).map_err(|e| format!("malformed private key PEM: {e}"))
}

/// Build the trust store from every root (active or not) in the bundle.
///
/// # Errors
/// Returns a description if a root does not parse or the bundle is empty.
pub fn root_store(bundle: &CaRoots) -> Result<RootCertStore, String> {
    let mut store = RootCertStore::empty();
    for root in &bundle.roots {
        for cert in parse_certificates(&root.root_cert)? {
            store
                .add(cert)
                .map_err(|e| format!("CA root '{}' rejected: {e}", root.id))?;
        }
    }
    if store.is_empty() {
        return Err("registry returned no CA roots".to_owned());
    }
    Ok(store)
}

/// Server verifier: Connect CA chain plus SPIFFE identity instead of host name.
#[derive(Debug)]
pub struct SpiffeServerVerifier {
    chain: Arc<WebPkiServerVerifier>,
    expected: SpiffeServiceId,
}

impl SpiffeServerVerifier {
    /// # Errors
    /// Returns [`MeshError::TlsConfig`] if the root store cannot back a verifier.
    pub fn new(
        roots: Arc<RootCertStore>,
        expected: SpiffeServiceId,
        provider: Arc<CryptoProvider>,
    ) -> Result<Self, MeshError> {
        let chain = WebPkiServerVerifier::builder_with_provider(roots, provider)
            .build()
            .map_err(|e| MeshError::TlsConfig {
                service: expected.service.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self { chain, expected })
    }
}

impl ServerCertVerifier for SpiffeServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        // Chain validity is checked before the name, so a name-only failure
        // still means the chain is trusted.
        match self
            .chain
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Ok(_)
            | Err(TlsError::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            )) => {}
            Err(e) => return Err(e),
        }

        let presented = spiffe_uri_sans(end_entity.as_ref());
        if presented
            .iter()
            .filter_map(|uri| SpiffeServiceId::parse(uri))
            .any(|id| self.expected.matches(&id))
        {
            return Ok(ServerCertVerified::assertion());
        }

        tracing::warn!(
            expected = %self.expected,
            presented = ?presented,
            "server certificate does not carry the expected service identity"
        );
        Err(TlsError::InvalidCertificate(
            CertificateError::ApplicationVerificationFailure,
        ))
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.chain.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        self.chain.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.chain.supported_verify_schemes()
    }
}

/// Client configuration presenting `cert_chain` and accepting only `expected`.
///
/// # Errors
/// Returns [`MeshError::TlsConfig`] if the verifier cannot be built or the
/// key does not match a supported algorithm.
pub fn client_config(
    roots: Arc<RootCertStore>,
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    expected: SpiffeServiceId,
) -> Result<Arc<ClientConfig>, MeshError> {
    let service = expected.service.clone();
    let tls_error = |e: TlsError| MeshError::TlsConfig {
        service: service.clone(),
        reason: e.to_string(),
    };

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let verifier = SpiffeServerVerifier::new(roots, expected, Arc::clone(&provider))?;

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(cert_chain, key)
        .map_err(tls_error)?;

    Ok(Arc::new(config))
}
