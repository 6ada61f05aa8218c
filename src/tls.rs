use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use thiserror::Error;

use crate::config::MqttConfig;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),
    #[error("could not load system root certificates: {0}")]
    NativeRoots(#[source] io::Error),
    #[error("no trusted root certificates available")]
    NoRoots,
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// Client settings for an `mqtts://` broker. The server is checked against the
/// system roots plus `tls_ca_cert`, unless `tls_insecure` turns checking off.
pub fn client_config(config: &MqttConfig) -> Result<ClientConfig, TlsError> {
    let builder = ClientConfig::builder();
    let builder = if config.tls_insecure {
        warn!("MQTT broker certificate will not be verified");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
    } else {
        builder.with_root_certificates(root_store(config.tls_ca_cert.as_deref())?)
    };

    match (&config.tls_client_cert, &config.tls_client_key) {
        (Some(cert), Some(key)) => Ok(builder.with_client_auth_cert(load_certs(cert)?, load_key(key)?)?),
        _ => Ok(builder.with_no_client_auth()),
    }
}

fn root_store(ca_cert: Option<&Path>) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();

    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = roots.add_parsable_certificates(certs);
            debug!("Loaded {} system root certificates, ignored {}", added, ignored);
        }
        // A private CA still works on hosts without a system bundle
        Err(err) if ca_cert.is_some() => warn!("could not load system root certificates: {}", err),
        Err(err) => return Err(TlsError::NativeRoots(err)),
    }

    if let Some(path) = ca_cert {
        for cert in load_certs(path)? {
            roots.add(cert)?;
        }
    }

    if roots.is_empty() {
        return Err(TlsError::NoRoots);
    }
    Ok(roots)
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|source| TlsError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

/// Trusts whatever certificate the broker presents. Handshake signatures are
/// still verified so the session keys belong to that certificate.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        AcceptAnyServerCert {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata").join(name)
    }

    fn tls_config() -> MqttConfig {
        MqttConfig {
            broker: "mqtts://broker.lan:8883".to_string(),
            default_topic: "presence".to_string(),
            client_id: None,
            random_client_id_suffix: false,
            username: None,
            password: None,
            keep_alive_seconds: None,
            tls_ca_cert: None,
            tls_client_cert: None,
            tls_client_key: None,
            tls_insecure: false,
        }
    }

    #[test]
    fn test_private_ca_and_client_cert() {
        let mut config = tls_config();
        config.tls_ca_cert = Some(fixture("ca.pem"));
        config.tls_client_cert = Some(fixture("ca.pem"));
        config.tls_client_key = Some(fixture("client.key"));

        let client = client_config(&config).unwrap();
        assert!(client.client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn test_insecure_skips_roots() {
        let mut config = tls_config();
        config.tls_insecure = true;

        let client = client_config(&config).unwrap();
        assert!(!client.client_auth_cert_resolver.has_certs());

        let verifier = AcceptAnyServerCert::new();
        assert!(!verifier.supported_verify_schemes().is_empty());
    }

    #[test]
    fn test_unreadable_material() {
        let mut config = tls_config();
        config.tls_insecure = true;
        config.tls_client_cert = Some(fixture("client.key"));
        config.tls_client_key = Some(fixture("client.key"));
        assert!(matches!(
            client_config(&config),
            Err(TlsError::NoCertificates(_))
        ));

        config.tls_client_cert = Some(fixture("ca.pem"));
        config.tls_client_key = Some(fixture("ca.pem"));
        assert!(matches!(client_config(&config), Err(TlsError::NoPrivateKey(_))));

        config.tls_insecure = false;
        config.tls_client_cert = None;
        config.tls_client_key = None;
        config.tls_ca_cert = Some(fixture("missing.pem"));
        assert!(matches!(client_config(&config), Err(TlsError::Read { .. })));
    }
}
