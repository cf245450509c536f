//! TLS 1.3 setup for the QUIC endpoint.
//!
//! There is no CA: every node presents a self-signed Ed25519 certificate and
//! its identity is the certificate key. Both sides must present one. The
//! handshake only checks that the key is an Ed25519 identity and that the
//! peer proves possession of it; whether it is the *expected* peer is
//! checked by the dialer once the handshake is done.

use crate::identity::{peer_id_from_certificate, IdentityCertificate};
use crate::RuvTransportError;

use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, SignatureScheme};
use std::sync::Arc;

/// Accepts any certificate that carries an Ed25519 peer identity.
#[derive(Debug)]
pub(crate) struct PeerCertVerifier {
    provider: Arc<CryptoProvider>,
}

impl PeerCertVerifier {
    pub fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }

    fn check_identity(&self, end_entity: &CertificateDer<'_>) -> Result<(), rustls::Error> {
        peer_id_from_certificate(end_entity)
            .map(|_| ())
            .map_err(|e| {
                tracing::debug!("rejecting peer certificate: {e}");
                rustls::Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure)
            })
    }

    fn tls12_unsupported() -> rustls::Error {
        rustls::Error::General("ruvmail only speaks TLS 1.3".into())
    }
}

impl ServerCertVerifier for PeerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.check_identity(end_entity)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Err(Self::tls12_unsupported())
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

impl ClientCertVerifier for PeerCertVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.check_identity(end_entity)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Err(Self::tls12_unsupported())
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

fn tls_error(context: &str, e: impl std::fmt::Display) -> RuvTransportError {
    RuvTransportError::Identity(format!("{context}: {e}"))
}

pub(crate) fn server_config(
    cert: &IdentityCertificate,
    alpn: &[u8],
    provider: Arc<CryptoProvider>,
    transport: Arc<quinn::TransportConfig>,
) -> Result<quinn::ServerConfig, RuvTransportError> {
    let verifier = Arc::new(PeerCertVerifier::new(provider.clone()));
    let mut tls = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| tls_error("server protocol versions", e))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(cert.chain.clone(), cert.key.clone_key())
        .map_err(|e| tls_error("server certificate", e))?;
    tls.alpn_protocols = vec![alpn.to_vec()];

    let crypto = QuicServerConfig::try_from(tls).map_err(|e| tls_error("quic server", e))?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    config.transport_config(transport);
    Ok(config)
}

pub(crate) fn client_config(
    cert: &IdentityCertificate,
    alpn: &[u8],
    provider: Arc<CryptoProvider>,
    transport: Arc<quinn::TransportConfig>,
) -> Result<quinn::ClientConfig, RuvTransportError> {
    let verifier = Arc::new(PeerCertVerifier::new(provider.clone()));
    let mut tls = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| tls_error("client protocol versions", e))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(cert.chain.clone(), cert.key.clone_key())
        .map_err(|e| tls_error("client certificate", e))?;
    tls.alpn_protocols = vec![alpn.to_vec()];

    let crypto = QuicClientConfig::try_from(tls).map_err(|e| tls_error("quic client", e))?;
    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    config.transport_config(transport);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Identity;

    fn provider() -> Arc<CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    #[test]
    fn identity_certificates_pass_verification() {
        let cert = Identity::generate().certificate().unwrap();
        let verifier = PeerCertVerifier::new(provider());
        let name = ServerName::try_from("ruvmail").unwrap();
        assert!(verifier
            .verify_server_cert(&cert.chain[0], &[], &name, &[], UnixTime::now())
            .is_ok());
        assert!(verifier
            .verify_client_cert(&cert.chain[0], &[], UnixTime::now())
            .is_ok());
    }

    #[test]
    fn non_ed25519_certificates_are_rejected() {
        let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let cert = rcgen::CertificateParams::new(vec!["ruvmail".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        let verifier = PeerCertVerifier::new(provider());
        assert!(verifier
            .verify_client_cert(cert.der(), &[], UnixTime::now())
            .is_err());
    }

    #[test]
    fn configs_build_from_identity() {
        let cert = Identity::generate().certificate().unwrap();
        let transport = Arc::new(quinn::TransportConfig::default());
        assert!(server_config(&cert, crate::RUVMAIL_ALPN, provider(), transport.clone()).is_ok());
        assert!(client_config(&cert, crate::RUVMAIL_ALPN, provider(), transport).is_ok());
    }
}
