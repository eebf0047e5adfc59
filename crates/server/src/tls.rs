//! Mutually-authenticated TLS for the vehicle listener.
//!
//! Every peer must present a certificate signed by the configured vehicle
//! CA; the verifier rejects anything else during the handshake. The
//! accepted leaf certificate is the source of the connection identity.

use std::sync::Arc;

use config::TlsConfig;
use identity::{Identity, IdentitySource};
use rustls::{server::WebPkiClientVerifier, RootCertStore, ServerConfig};
use rustls_pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer};
use tokio::net::TcpStream;
use tokio_rustls::{server::TlsStream, TlsAcceptor};

use crate::Error;

/// Builds the TLS acceptor from the configured PEM material.
pub(crate) fn build_acceptor(config: &TlsConfig) -> Result<TlsAcceptor, Error> {
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(&config.server_cert)
        .map_err(|e| tls_error("server_cert", e))?
        .collect::<Result<_, _>>()
        .map_err(|e| tls_error("server_cert", e))?;
    if certs.is_empty() {
        return Err(Error::Tls {
            item: "server_cert",
            reason: "no certificates in file".into(),
        });
    }

    let key =
        PrivateKeyDer::from_pem_file(&config.server_key).map_err(|e| tls_error("server_key", e))?;

    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_file_iter(&config.client_ca).map_err(|e| tls_error("client_ca", e))? {
        let cert = cert.map_err(|e| tls_error("client_ca", e))?;
        roots.add(cert).map_err(|e| tls_error("client_ca", e))?;
    }
    if roots.is_empty() {
        return Err(Error::Tls {
            item: "client_ca",
            reason: "no CA certificates loaded".into(),
        });
    }

    let verifier = WebPkiClientVerifier::builder(roots.into())
        .build()
        .map_err(|e| tls_error("client_ca", e))?;

    let server_config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| tls_error("server_cert", e))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Extracts the vehicle identity from the session's peer certificate.
pub(crate) fn peer_identity(
    stream: &TlsStream<TcpStream>,
    source: IdentitySource,
) -> Result<Identity, identity::Error> {
    let (_, session) = stream.get_ref();
    let leaf = session
        .peer_certificates()
        .and_then(|certs| certs.first())
        .ok_or(identity::Error::IdentityMissing {
            source_field: "peer_certificate",
        })?;
    Identity::from_client_cert(leaf.as_ref(), source)
}

fn tls_error(item: &'static str, error: impl std::fmt::Display) -> Error {
    Error::Tls {
        item,
        reason: error.to_string(),
    }
}

#[cfg(test)]
mod test {
    use config::TlsConfig;
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};

    use crate::tls::build_acceptor;

    fn material() -> (tempfile::TempDir, TlsConfig) {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let dir = tempfile::tempdir().unwrap();

        let mut ca_params = CertificateParams::new(vec![]).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_key = KeyPair::generate().unwrap();
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let server_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let server_key = KeyPair::generate().unwrap();
        let server_cert = server_params.signed_by(&server_key, &ca, &ca_key).unwrap();

        let config = TlsConfig {
            server_cert: dir.path().join("server.pem"),
            server_key: dir.path().join("server-key.pem"),
            client_ca: dir.path().join("ca.pem"),
        };
        std::fs::write(&config.server_cert, server_cert.pem()).unwrap();
        std::fs::write(&config.server_key, server_key.serialize_pem()).unwrap();
        std::fs::write(&config.client_ca, ca.pem()).unwrap();

        (dir, config)
    }

    #[test]
    fn acceptor_builds_from_pem_material() {
        let (_dir, config) = material();
        assert!(build_acceptor(&config).is_ok());
    }

    #[test]
    fn missing_material_is_a_startup_error() {
        let (_dir, mut config) = material();
        config.client_ca = config.client_ca.with_extension("missing");
        assert!(matches!(
            build_acceptor(&config),
            Err(crate::Error::Tls { item: "client_ca", .. })
        ));
    }
}
