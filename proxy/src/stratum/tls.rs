/// TLS plumbing for both sides of the proxy
///
/// Downstream listeners use ./certificate.pem + ./key.pem, generating a
/// fresh Ed25519 self-signed pair when the files are missing or unreadable.
/// Upstream dials skip CA validation entirely; trust is either explicit
/// (a pinned SHA-256 certificate fingerprint) or logged for the operator
/// to pin later.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};

pub const CERT_FILE: &str = "./certificate.pem";
pub const KEY_FILE: &str = "./key.pem";

pub fn sha256_fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Generate a self-signed Ed25519 certificate for the listener:
/// CN=localhost, ten years of validity, server and client auth usages.
/// Returns (certificate PEM, key PEM).
pub fn generate_certificate() -> Result<(String, String)> {
    let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()]);
    params.alg = &rcgen::PKCS_ED25519;

    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, "localhost");
    params.distinguished_name = dn;

    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before + time::Duration::days(10 * 365);

    params.key_usages = vec![
        rcgen::KeyUsagePurpose::DigitalSignature,
        rcgen::KeyUsagePurpose::KeyAgreement,
        rcgen::KeyUsagePurpose::KeyEncipherment,
        rcgen::KeyUsagePurpose::DataEncipherment,
    ];
    params.extended_key_usages = vec![
        rcgen::ExtendedKeyUsagePurpose::ServerAuth,
        rcgen::ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let cert = rcgen::Certificate::from_params(params)?;
    let cert_pem = cert.serialize_pem()?;
    let key_pem = cert.serialize_private_key_pem();
    Ok((cert_pem, key_pem))
}

/// Build a server config from PEM text. Returns the config and the SHA-256
/// fingerprint of the leaf certificate.
pub fn server_config_from_pem(cert_pem: &str, key_pem: &str) -> Result<(rustls::ServerConfig, String)> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .collect::<std::io::Result<Vec<_>>>()
            .context("parsing certificate PEM")?;
    if certs.is_empty() {
        return Err(anyhow!("certificate PEM contains no certificates"));
    }
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .context("parsing key PEM")?
        .ok_or_else(|| anyhow!("key PEM contains no private key"))?;

    let fingerprint = sha256_fingerprint(certs[0].as_ref());

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok((config, fingerprint))
}

/// Load the listener certificate, generating and persisting a new one when
/// the PEM files are absent or broken. Logs the fingerprint so operators
/// can pin it on the miner side.
pub fn load_or_generate_server_config() -> Result<Arc<rustls::ServerConfig>> {
    let loaded = std::fs::read_to_string(CERT_FILE)
        .and_then(|cert| std::fs::read_to_string(KEY_FILE).map(|key| (cert, key)));

    let (cert_pem, key_pem) = match loaded {
        Ok(pair) => pair,
        Err(err) => {
            info!("Failed to load TLS certificate from file, generating a new one.");
            debug!("{}", err);

            let (cert_pem, key_pem) = generate_certificate()?;
            std::fs::write(KEY_FILE, &key_pem).context("writing key.pem")?;
            std::fs::write(CERT_FILE, &cert_pem).context("writing certificate.pem")?;
            (cert_pem, key_pem)
        }
    };

    let (config, fingerprint) = server_config_from_pem(&cert_pem, &key_pem)?;
    info!("TLS fingerprint (SHA-256): {}", fingerprint);
    Ok(Arc::new(config))
}

/// Upstream-side TLS config. CA validation is disabled; when a pin is
/// configured the single leaf certificate must hash to it.
pub fn client_config(pinned_fingerprint: Option<String>) -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(FingerprintVerifier {
            pinned: pinned_fingerprint.filter(|p| !p.is_empty()),
        }))
        .with_no_client_auth()
}

#[derive(Debug)]
struct FingerprintVerifier {
    pinned: Option<String>,
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let fingerprint = sha256_fingerprint(end_entity.as_ref());

        let Some(pinned) = &self.pinned else {
            info!("Pool fingerprint {}", fingerprint);
            return Ok(ServerCertVerified::assertion());
        };

        if !intermediates.is_empty() {
            error!("invalid number of certificates");
            return Err(rustls::Error::General("invalid number of certificates".into()));
        }
        if &fingerprint != pinned {
            error!("invalid pool TLS fingerprint: {} expected {}", fingerprint, pinned);
            return Err(rustls::Error::General("invalid fingerprint".into()));
        }
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
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_certificate_builds_a_server_config() {
        let (cert_pem, key_pem) = generate_certificate().unwrap();
        assert!(cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(key_pem.contains("PRIVATE KEY"));

        let (_config, fingerprint) = server_config_from_pem(&cert_pem, &key_pem).unwrap();
        assert_eq!(fingerprint.len(), 64);
        assert!(fingerprint.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fresh_certificates_have_distinct_fingerprints() {
        let (a_cert, a_key) = generate_certificate().unwrap();
        let (b_cert, b_key) = generate_certificate().unwrap();
        let (_c1, f1) = server_config_from_pem(&a_cert, &a_key).unwrap();
        let (_c2, f2) = server_config_from_pem(&b_cert, &b_key).unwrap();
        assert_ne!(f1, f2);
    }
}
