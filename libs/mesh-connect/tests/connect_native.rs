#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Registration against a mocked agent and mTLS dialing of a local
//! Connect-native server built from the fixture certificates.

use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use mesh_connect::{
    DialContext, MeshError, MeshErrorKind, MeshService, RegistryClient, dial_with_deadline,
};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

const TRUST_DOMAIN: &str = "11111111-2222-3333-4444-555555555555.consul";
const LOCAL_SERVICE: &str = "balance-interest-lambda";
const CA_PEM: &str = include_str!("fixtures/ca.pem");
const LOCAL_CERT: &str = include_str!("fixtures/balance-interest-lambda.pem");
const LOCAL_KEY: &str = include_str!("fixtures/balance-interest-lambda-key.pem");
const REDIS_CERT: &str = include_str!("fixtures/redis.pem");
const REDIS_KEY: &str = include_str!("fixtures/redis-key.pem");
const POSTGRES_CERT: &str = include_str!("fixtures/postgres.pem");
const POSTGRES_KEY: &str = include_str!("fixtures/postgres-key.pem");

fn client_for(server: &MockServer) -> RegistryClient {
    RegistryClient::new(&server.address().to_string(), None, Duration::from_secs(5)).unwrap()
}

fn mock_identity(server: &MockServer, leaf_cert: &str) {
    mock_identity_for(server, leaf_cert, LOCAL_SERVICE);
}

fn mock_identity_for(server: &MockServer, leaf_cert: &str, issued_to: &str) {
    server.mock(|when, then| {
        when.method(GET).path("/v1/agent/connect/ca/roots");
        then.status(200).json_body(serde_json::json!({
            "ActiveRootID": "root-1",
            "TrustDomain": TRUST_DOMAIN,
            "Roots": [{"ID": "root-1", "Name": "Test CA", "RootCert": CA_PEM, "Active": true}]
        }));
    });
    server.mock(|when, then| {
        when.method(GET)
            .path(format!("/v1/agent/connect/ca/leaf/{LOCAL_SERVICE}"));
        then.status(200).json_body(serde_json::json!({
            "CertPEM": leaf_cert,
            "PrivateKeyPEM": LOCAL_KEY,
            "Service": issued_to,
            "ServiceURI": format!("spiffe://{TRUST_DOMAIN}/ns/default/dc/dc1/svc/{issued_to}")
        }));
    });
}

fn mock_instances(server: &MockServer, service: &str, port: u16) {
    let service = service.to_owned();
    server.mock(move |when, then| {
        when.method(GET)
            .path(format!("/v1/health/connect/{service}"))
            .query_param("passing", "true");
        then.status(200).json_body(serde_json::json!([{
            "Node": {"Node": "node-1", "Address": "127.0.0.1", "Datacenter": "dc1"},
            "Service": {"ID": format!("{service}-1"), "Service": &service, "Address": "", "Port": port},
            "Checks": []
        }]));
    });
}

/// Connect-native server that requires a client certificate from the test CA
/// and answers the first read with a RESP `+PONG`.
async fn spawn_mesh_server(cert_pem: &'static str, key_pem: &'static str) -> u16 {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_slice_iter(CA_PEM.as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }
    let client_verifier =
        WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
            .build()
            .unwrap();

    let chain: Vec<_> = CertificateDer::pem_slice_iter(cert_pem.as_bytes())
        .map(Result::unwrap)
        .collect();
    let key = PrivateKeyDer::from_pem_slice(key_pem.as_bytes()).unwrap();
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(chain, key)
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let Ok((tcp, _)) = listener.accept().await else {
            return;
        };
        let Ok(mut tls) = acceptor.accept(tcp).await else {
            return;
        };
        let mut buf = [0u8; 64];
        if tls.read(&mut buf).await.unwrap_or(0) > 0 {
            let _ = tls.write_all(b"+PONG\r\n").await;
            let _ = tls.flush().await;
        }
    });

    port
}

#[tokio::test]
async fn register_and_dial_over_mutual_tls() {
    let registry = MockServer::start();
    mock_identity(&registry, LOCAL_CERT);
    let port = spawn_mesh_server(REDIS_CERT, REDIS_KEY).await;
    mock_instances(&registry, "redis", port);

    let service = MeshService::register(client_for(&registry), LOCAL_SERVICE)
        .await
        .unwrap();
    assert_eq!(service.name(), LOCAL_SERVICE);
    assert_eq!(service.trust_domain(), TRUST_DOMAIN);

    let ctx = DialContext::new(Duration::from_secs(10));
    let mut stream = dial_with_deadline(&service, "redis", &ctx).await.ok().unwrap();
    stream.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
    stream.flush().await.unwrap();

    let mut reply = [0u8; 7];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"+PONG\r\n");

    service.close();
}

#[tokio::test]
async fn server_with_wrong_identity_is_rejected() {
    let registry = MockServer::start();
    mock_identity(&registry, LOCAL_CERT);
    let port = spawn_mesh_server(POSTGRES_CERT, POSTGRES_KEY).await;
    mock_instances(&registry, "redis", port);

    let service = MeshService::register(client_for(&registry), LOCAL_SERVICE)
        .await
        .unwrap();
    let ctx = DialContext::new(Duration::from_secs(10));
    let err = dial_with_deadline(&service, "redis", &ctx).await.err().unwrap();

    assert!(matches!(err, MeshError::Handshake { .. }), "{err}");
    assert_eq!(err.kind(), MeshErrorKind::Connectivity);
}

#[tokio::test]
async fn no_passing_instances_is_connectivity_error() {
    let registry = MockServer::start();
    mock_identity(&registry, LOCAL_CERT);
    registry.mock(|when, then| {
        when.method(GET).path("/v1/health/connect/redis");
        then.status(200).json_body(serde_json::json!([]));
    });

    let service = MeshService::register(client_for(&registry), LOCAL_SERVICE)
        .await
        .unwrap();
    let ctx = DialContext::new(Duration::from_secs(10));
    let err = dial_with_deadline(&service, "redis", &ctx).await.err().unwrap();

    assert!(matches!(err, MeshError::NoHealthyInstances { ref service } if service == "redis"), "{err}");
    assert_eq!(err.kind(), MeshErrorKind::Connectivity);
}

#[tokio::test]
async fn refused_leaf_is_registration_error() {
    let registry = MockServer::start();
    registry.mock(|when, then| {
        when.method(GET).path("/v1/agent/connect/ca/roots");
        then.status(200).json_body(serde_json::json!({
            "TrustDomain": TRUST_DOMAIN,
            "Roots": [{"ID": "root-1", "RootCert": CA_PEM, "Active": true}]
        }));
    });
    registry.mock(|when, then| {
        when.method(GET)
            .path(format!("/v1/agent/connect/ca/leaf/{LOCAL_SERVICE}"));
        then.status(403).body("ACL not found");
    });

    let err = MeshService::register(client_for(&registry), LOCAL_SERVICE)
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::Registration { .. }), "{err}");
    assert_eq!(err.kind(), MeshErrorKind::ServiceRegistration);
}

#[tokio::test]
async fn malformed_leaf_is_invalid_identity() {
    let registry = MockServer::start();
    mock_identity(&registry, "not a certificate");

    let err = MeshService::register(client_for(&registry), LOCAL_SERVICE)
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::InvalidIdentity { .. }), "{err}");
    assert_eq!(err.kind(), MeshErrorKind::ServiceRegistration);
}

#[tokio::test]
async fn leaf_for_another_service_is_invalid_identity() {
    let registry = MockServer::start();
    mock_identity_for(&registry, LOCAL_CERT, "billing");

    let err = MeshService::register(client_for(&registry), LOCAL_SERVICE)
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::InvalidIdentity { .. }), "{err}");
    assert!(err.to_string().contains("billing"), "{err}");
}

#[tokio::test]
async fn unreachable_registry_is_registration_error() {
    let client = RegistryClient::new("127.0.0.1:1", None, Duration::from_secs(2)).unwrap();
    let err = MeshService::register(client, LOCAL_SERVICE).await.unwrap_err();
    assert!(matches!(err, MeshError::Registration { .. }), "{err}");
}
