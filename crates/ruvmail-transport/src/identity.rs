//! Local node identity and the certificates that carry it over TLS.

use crate::{PeerId, RuvTransportError};

use ed25519_dalek::pkcs8::EncodePrivateKey;
use ed25519_dalek::SigningKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fmt;

/// Server name presented in every handshake. Identity comes from the
/// certificate key, never from the name.
pub(crate) const TLS_SERVER_NAME: &str = "ruvmail";

/// DER prefix of an Ed25519 SubjectPublicKeyInfo (RFC 8410), followed by
/// the 32 raw key bytes.
const ED25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
];

/// The long-term Ed25519 key pair of this node.
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        Self::from_secret_bytes(rand::random())
    }

    /// Restore an identity from its 32-byte secret seed.
    pub fn from_secret_bytes(secret: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&secret),
        }
    }

    /// Restore an identity from a hex-encoded secret seed.
    pub fn from_secret_hex(secret: &str) -> Result<Self, RuvTransportError> {
        let mut raw = [0u8; 32];
        hex::decode_to_slice(secret.trim(), &mut raw)
            .map_err(|e| RuvTransportError::Identity(format!("secret key: {e}")))?;
        Ok(Self::from_secret_bytes(raw))
    }

    /// The public identity other nodes address us by.
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_bytes(self.signing_key.verifying_key().to_bytes())
    }

    /// The 32-byte secret seed, for persisting the identity.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Self-signed certificate binding this identity's key, for TLS.
    pub fn certificate(&self) -> Result<IdentityCertificate, RuvTransportError> {
        let pkcs8 = self
            .signing_key
            .to_pkcs8_der()
            .map_err(|e| RuvTransportError::Identity(format!("pkcs8 encoding: {e}")))?;
        let key_der = PrivatePkcs8KeyDer::from(pkcs8.as_bytes().to_vec());

        let key_pair =
            rcgen::KeyPair::from_pkcs8_der_and_sign_algo(&key_der, &rcgen::PKCS_ED25519)
                .map_err(|e| RuvTransportError::Identity(format!("key pair: {e}")))?;
        let params = rcgen::CertificateParams::new(vec![TLS_SERVER_NAME.to_string()])
            .map_err(|e| RuvTransportError::Identity(format!("certificate params: {e}")))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| RuvTransportError::Identity(format!("self-signing: {e}")))?;

        Ok(IdentityCertificate {
            chain: vec![cert.der().clone()],
            key: PrivateKeyDer::Pkcs8(key_der),
        })
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

/// Certificate chain and private key handed to the TLS layer.
#[derive(Debug)]
pub struct IdentityCertificate {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Clone for IdentityCertificate {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

/// Extract the peer identity bound by a presented certificate.
///
/// Only Ed25519 certificates carry an identity; anything else is rejected.
pub(crate) fn peer_id_from_certificate(
    cert: &CertificateDer<'_>,
) -> Result<PeerId, RuvTransportError> {
    let parsed = rustls::server::ParsedCertificate::try_from(cert)
        .map_err(|e| RuvTransportError::Identity(format!("certificate: {e}")))?;
    let spki = parsed.subject_public_key_info();
    let spki: &[u8] = spki.as_ref();
    let key = spki
        .strip_prefix(&ED25519_SPKI_PREFIX[..])
        .ok_or_else(|| RuvTransportError::Identity("certificate key is not Ed25519".into()))?;
    PeerId::from_slice(key)
}

/// Check that an identity claimed by a remote (for example the hostname in
/// an SMTP greeting on an anonymous session) is the peer actually connected.
pub fn verify_claimed_identity(remote: &PeerId, claimed: &str) -> Result<(), RuvTransportError> {
    let mismatch = || RuvTransportError::AuthenticationFailed {
        expected: remote.to_string(),
        presented: claimed.to_string(),
    };
    let claimed: PeerId = claimed.parse().map_err(|_| mismatch())?;
    if claimed != *remote {
        return Err(mismatch());
    }
    Ok(())
}
