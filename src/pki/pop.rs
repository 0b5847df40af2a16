//! Proof-of-possession verification
//!
//! The kubelet proves it holds the private key by signing SHA-256 of the
//! exact `pkixPublicKey` bytes it submits. The signature travels as base64
//! text inside the (itself base64 on the wire) `proofOfPossession` field.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use rsa::Pkcs1v15Sign;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::key::RequestedKey;

/// Proof-of-possession failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PopError {
    /// No signature was supplied
    #[error("empty proof of possession")]
    EmptySignature,

    /// The field is not valid base64
    #[error("failed to decode proof of possession as base64: {0}")]
    Decode(String),

    /// The key kind has no verification procedure
    #[error("unsupported key type for proof of possession: {0}")]
    UnsupportedKeyType(String),

    /// The signature does not verify against the submitted key
    #[error("proof of possession signature verification failed")]
    VerificationFailed,
}

impl PopError {
    /// Stable reason code for conditions and metrics
    pub fn reason(&self) -> &'static str {
        match self {
            Self::EmptySignature => "EmptySignature",
            Self::Decode(_) => "DecodeError",
            Self::UnsupportedKeyType(_) => "UnsupportedKeyType",
            Self::VerificationFailed => "VerificationFailed",
        }
    }
}

/// Check that `encoded_signature` is a valid signature by `key` over
/// SHA-256 of `public_key_der`.
///
/// RSA signatures are PKCS#1 v1.5. ECDSA signatures are the fixed-width
/// `r || s` concatenation, each half padded to the curve's field width
/// (56 bytes on P-224, 64 on P-256, 96 on P-384, 132 on P-521).
pub fn verify_proof_of_possession(
    key: &RequestedKey,
    public_key_der: &[u8],
    encoded_signature: &[u8],
) -> Result<(), PopError> {
    let encoded = encoded_signature.trim_ascii();
    if encoded.is_empty() {
        return Err(PopError::EmptySignature);
    }

    let signature = STANDARD
        .decode(encoded)
        .map_err(|e| PopError::Decode(e.to_string()))?;
    if signature.is_empty() {
        return Err(PopError::EmptySignature);
    }

    let digest = Sha256::digest(public_key_der);

    match key {
        RequestedKey::Rsa(public) => public
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
            .map_err(|_| PopError::VerificationFailed),
        RequestedKey::EcP224(public) => {
            let signature = p224::ecdsa::Signature::from_slice(&signature)
                .map_err(|_| PopError::VerificationFailed)?;
            public
                .verify_prehash(&digest, &signature)
                .map_err(|_| PopError::VerificationFailed)
        }
        RequestedKey::EcP256(public) => {
            let signature = p256::ecdsa::Signature::from_slice(&signature)
                .map_err(|_| PopError::VerificationFailed)?;
            public
                .verify_prehash(&digest, &signature)
                .map_err(|_| PopError::VerificationFailed)
        }
        RequestedKey::EcP384(public) => {
            let signature = p384::ecdsa::Signature::from_slice(&signature)
                .map_err(|_| PopError::VerificationFailed)?;
            public
                .verify_prehash(&digest, &signature)
                .map_err(|_| PopError::VerificationFailed)
        }
        RequestedKey::EcP521(public) => {
            let signature = p521::ecdsa::Signature::from_slice(&signature)
                .map_err(|_| PopError::VerificationFailed)?;
            public
                .verify_prehash(&p521_prehash(&digest), &signature)
                .map_err(|_| PopError::VerificationFailed)
        }
    }
}

/// Left-pad a digest to the P-521 field width
///
/// The ECDSA backend refuses prehashes shorter than half the field (33
/// bytes on P-521). Zero-padding keeps the integer value, which is how a
/// SHA-256 digest is interpreted on that curve.
pub(crate) fn p521_prehash(digest: &[u8]) -> Vec<u8> {
    const FIELD_BYTES: usize = 66;
    let mut padded = vec![0u8; FIELD_BYTES.saturating_sub(digest.len())];
    padded.extend_from_slice(digest);
    padded
}
