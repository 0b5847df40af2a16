//! Public keys submitted by requesters
//!
//! Only RSA and ECDSA over the NIST curves (P-224, P-256, P-384, P-521) are
//! accepted. Everything that
//! depends on the key kind (key usage, proof-of-possession, log labels)
//! matches on [`RequestedKey`] so adding a kind is a compile error until
//! every site handles it.

use p224::NistP224;
use p256::NistP256;
use p384::NistP384;
use p521::elliptic_curve::sec1::ToEncodedPoint;
use p521::NistP521;
use pkcs8::der::Decode;
use pkcs8::spki::SubjectPublicKeyInfoRef;
use pkcs8::{AssociatedOid, DecodePublicKey};
use rcgen::KeyUsagePurpose;
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;
use thiserror::Error;

/// Why a submitted key was refused
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    /// The bytes are not a well-formed SubjectPublicKeyInfo
    #[error("malformed public key: {0}")]
    Malformed(String),

    /// Well-formed, but not an algorithm or curve this signer issues for
    #[error("unsupported public key: {0}")]
    Unsupported(String),
}

/// A parsed requester public key
#[derive(Clone)]
pub enum RequestedKey {
    /// RSA key of any size
    Rsa(RsaPublicKey),
    /// ECDSA key on NIST P-224
    EcP224(p224::ecdsa::VerifyingKey),
    /// ECDSA key on NIST P-256
    EcP256(p256::ecdsa::VerifyingKey),
    /// ECDSA key on NIST P-384
    EcP384(p384::ecdsa::VerifyingKey),
    /// ECDSA key on NIST P-521
    EcP521(p521::ecdsa::VerifyingKey),
}

impl std::fmt::Debug for RequestedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rsa(k) => f.debug_tuple("Rsa").field(k).finish(),
            Self::EcP224(k) => f.debug_tuple("EcP224").field(k).finish(),
            Self::EcP256(k) => f.debug_tuple("EcP256").field(k).finish(),
            Self::EcP384(k) => f.debug_tuple("EcP384").field(k).finish(),
            // p521's VerifyingKey does not implement Debug
            Self::EcP521(k) => f.debug_tuple("EcP521").field(k.as_affine()).finish(),
        }
    }
}

impl RequestedKey {
    /// Parse DER-encoded SubjectPublicKeyInfo
    pub fn from_spki_der(der: &[u8]) -> Result<Self, KeyError> {
        let spki =
            SubjectPublicKeyInfoRef::from_der(der).map_err(|e| KeyError::Malformed(e.to_string()))?;
        let algorithm = spki.algorithm.oid;

        if algorithm == rsa::pkcs1::ALGORITHM_OID {
            return RsaPublicKey::from_public_key_der(der)
                .map(Self::Rsa)
                .map_err(|e| KeyError::Malformed(format!("RSA key: {}", e)));
        }

        if algorithm == p256::elliptic_curve::ALGORITHM_OID {
            let curve = spki
                .algorithm
                .parameters_oid()
                .map_err(|e| KeyError::Malformed(format!("EC key without named curve: {}", e)))?;

            if curve == NistP224::OID {
                return p224::ecdsa::VerifyingKey::from_public_key_der(der)
                    .map(Self::EcP224)
                    .map_err(|e| KeyError::Malformed(format!("P-224 key: {}", e)));
            }
            if curve == NistP256::OID {
                return p256::ecdsa::VerifyingKey::from_public_key_der(der)
                    .map(Self::EcP256)
                    .map_err(|e| KeyError::Malformed(format!("P-256 key: {}", e)));
            }
            if curve == NistP384::OID {
                return p384::ecdsa::VerifyingKey::from_public_key_der(der)
                    .map(Self::EcP384)
                    .map_err(|e| KeyError::Malformed(format!("P-384 key: {}", e)));
            }
            if curve == NistP521::OID {
                return p521::PublicKey::from_public_key_der(der)
                    .and_then(|public| {
                        p521::ecdsa::VerifyingKey::from_sec1_bytes(
                            public.to_encoded_point(false).as_bytes(),
                        )
                        .map_err(|_| pkcs8::spki::Error::KeyMalformed)
                    })
                    .map(Self::EcP521)
                    .map_err(|e| KeyError::Malformed(format!("P-521 key: {}", e)));
            }
            return Err(KeyError::Unsupported(format!("elliptic curve {}", curve)));
        }

        Err(KeyError::Unsupported(format!("algorithm {}", algorithm)))
    }

    /// Label used in logs
    pub fn algorithm(&self) -> &'static str {
        match self {
            Self::Rsa(_) => "RSA",
            Self::EcP224(_) => "ECDSA-P224",
            Self::EcP256(_) => "ECDSA-P256",
            Self::EcP384(_) => "ECDSA-P384",
            Self::EcP521(_) => "ECDSA-P521",
        }
    }

    /// Size of the key in bits
    pub fn bits(&self) -> usize {
        match self {
            Self::Rsa(key) => key.size() * 8,
            Self::EcP224(_) => 224,
            Self::EcP256(_) => 256,
            Self::EcP384(_) => 384,
            Self::EcP521(_) => 521,
        }
    }

    /// Key usages for a leaf certified for this key
    ///
    /// RSA keys can be used for key transport, so they also get
    /// keyEncipherment.
    pub fn key_usages(&self) -> Vec<KeyUsagePurpose> {
        match self {
            Self::Rsa(_) => vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyEncipherment,
            ],
            Self::EcP224(_) | Self::EcP256(_) | Self::EcP384(_) | Self::EcP521(_) => {
                vec![KeyUsagePurpose::DigitalSignature]
            }
        }
    }
}
