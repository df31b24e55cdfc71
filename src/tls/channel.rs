use std::fs;
use std::sync::Arc;

use log::debug;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};

use crate::comm::credentials::ClientIdentity;
use crate::error::testwire_error::TestwireError;

// Builds the client-side TLS configuration for a destination.
//
// With verify_server = false (the test-environment default) any server
// certificate is accepted. That is not an acceptable production posture;
// callers wanting real verification pass verify_server = true to use the
// platform root store extended with webpki roots.
//
// When an identity is supplied it is loaded from disk and presented as the
// client certificate during the handshake. Loading failures are fatal
// configuration errors, raised here before any network I/O happens.
pub fn build_client_tls(identity: Option<&ClientIdentity>, verify_server: bool) -> Result<ClientConfig, TestwireError> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let builder = ClientConfig::builder().with_root_certificates(root_store());

    let mut config = match identity {
        Some(identity) => {
            debug!("client cert {}", identity.certificate.display());
            let (certs, key) = load_identity(identity)?;
            builder.with_client_auth_cert(certs, key).map_err(TestwireError::tls)?
        }
        None => builder.with_no_client_auth(),
    };

    if !verify_server {
        config.dangerous().set_certificate_verifier(Arc::new(AcceptAnyServerCert));
    }

    Ok(config)
}

fn root_store() -> RootCertStore {
    let mut roots = RootCertStore::empty();

    let native_certs_result = rustls_native_certs::load_native_certs();
    for cert in native_certs_result.certs {
        let _ = roots.add(cert);
    }

    // Extend with webpki-roots
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    roots
}

// Reads a client identity file: PEM bundles (certificate chain plus PKCS#8
// key) and PKCS#12 keystores are both accepted.
fn load_identity(identity: &ClientIdentity) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TestwireError> {
    let bytes = fs::read(&identity.certificate)
        .map_err(|e| TestwireError::Tls(format!("cannot read client certificate '{}': {}", identity.certificate.display(), e)))?;

    if bytes.starts_with(b"-----BEGIN") {
        load_pem_identity(&bytes)
    } else {
        load_pkcs12_identity(&bytes, &identity.password)
    }
}

fn load_pem_identity(bytes: &[u8]) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TestwireError> {
    let mut reader = std::io::Cursor::new(bytes);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TestwireError::Tls(format!("invalid PEM certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(TestwireError::Tls("no certificate found in PEM bundle".to_string()));
    }

    let mut reader = std::io::Cursor::new(bytes);
    let key = rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TestwireError::Tls(format!("invalid PEM key: {}", e)))?
        .ok_or_else(|| TestwireError::Tls("no private key found in PEM bundle".to_string()))?;

    Ok((certs, key))
}

fn load_pkcs12_identity(bytes: &[u8], password: &str) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TestwireError> {
    let pfx = p12::PFX::parse(bytes).map_err(|e| TestwireError::Tls(format!("unsupported keystore format: {:?}", e)))?;
    if !pfx.verify_mac(password) {
        return Err(TestwireError::Tls("keystore password verification failed".to_string()));
    }

    let keys = pfx.key_bags(password).map_err(|e| TestwireError::Tls(format!("cannot decrypt keystore key: {:?}", e)))?;
    let key = keys.into_iter().next().ok_or_else(|| TestwireError::Tls("no private key in keystore".to_string()))?;

    let cert_ders = pfx.cert_x509_bags(password).map_err(|e| TestwireError::Tls(format!("cannot read keystore certificates: {:?}", e)))?;
    if cert_ders.is_empty() {
        return Err(TestwireError::Tls("no certificate in keystore".to_string()));
    }
    let certs = cert_ders.into_iter().map(CertificateDer::from).collect();

    Ok((certs, PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key))))
}

// Accepts every server certificate without validation. Test environments talk
// to self-signed endpoints all the time; the type name makes the posture
// impossible to miss.
#[derive(Debug)]
struct AcceptAnyServerCert;

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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_trust_all_config_builds() {
        let config = build_client_tls(None, false).unwrap();
        // ALPN left to the connector; config must exist with a verifier set
        assert!(config.alpn_protocols.is_empty());
    }

    #[test]
    fn test_verified_config_builds() {
        assert!(build_client_tls(None, true).is_ok());
    }

    #[test]
    fn test_missing_identity_file_is_tls_error() {
        let identity = ClientIdentity {
            certificate: PathBuf::from("/nonexistent/client.p12"),
            password: "secret".to_string(),
        };
        let err = build_client_tls(Some(&identity), false).unwrap_err();
        assert!(matches!(err, TestwireError::Tls(_)));
    }

    #[test]
    fn test_garbage_keystore_is_tls_error() {
        let dir = std::env::temp_dir().join("testwire-tls-test");
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("garbage.p12");
        std::fs::write(&path, b"definitely not a keystore").unwrap();

        let identity = ClientIdentity { certificate: path, password: "secret".to_string() };
        let err = build_client_tls(Some(&identity), false).unwrap_err();
        assert!(matches!(err, TestwireError::Tls(_)));
    }
}
