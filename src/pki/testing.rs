//! Shared key material for unit tests
//!
//! RSA key generation dominates test time, so every key here is generated
//! once per test binary.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use k8s_openapi::ByteString;
use once_cell::sync::Lazy;
use p256::ecdsa::signature::hazmat::PrehashSigner;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha2::{Digest, Sha256};

use super::pop::p521_prehash;
use super::{parse_private_key_pem, CaStore, CertificateAuthority};
use crate::crd::PodCertificateRequestSpec;

/// Private half of a requester key
pub enum RequesterKey {
    /// RSA-2048
    Rsa(RsaPrivateKey),
    /// ECDSA P-224
    P224(p224::ecdsa::SigningKey),
    /// ECDSA P-256
    P256(p256::ecdsa::SigningKey),
    /// ECDSA P-384
    P384(p384::ecdsa::SigningKey),
    /// ECDSA P-521
    P521(p521::ecdsa::SigningKey),
}

/// A simulated kubelet key
pub struct Requester {
    /// Name for assertion messages
    pub label: &'static str,
    /// SubjectPublicKeyInfo DER, as submitted in `pkixPublicKey`
    pub spki_der: Vec<u8>,
    /// The private key
    pub key: RequesterKey,
}

impl Requester {
    fn rsa(label: &'static str) -> Self {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        let spki_der = key.to_public_key().to_public_key_der().unwrap().into_vec();
        Self {
            label,
            spki_der,
            key: RequesterKey::Rsa(key),
        }
    }

    fn p224(label: &'static str) -> Self {
        let key = p224::ecdsa::SigningKey::random(&mut rand::thread_rng());
        let spki_der = key
            .verifying_key()
            .to_public_key_der()
            .unwrap()
            .into_vec();
        Self {
            label,
            spki_der,
            key: RequesterKey::P224(key),
        }
    }

    fn p256(label: &'static str) -> Self {
        let key = p256::ecdsa::SigningKey::random(&mut rand::thread_rng());
        let spki_der = key
            .verifying_key()
            .to_public_key_der()
            .unwrap()
            .into_vec();
        Self {
            label,
            spki_der,
            key: RequesterKey::P256(key),
        }
    }

    fn p384(label: &'static str) -> Self {
        let key = p384::ecdsa::SigningKey::random(&mut rand::thread_rng());
        let spki_der = key
            .verifying_key()
            .to_public_key_der()
            .unwrap()
            .into_vec();
        Self {
            label,
            spki_der,
            key: RequesterKey::P384(key),
        }
    }

    fn p521(label: &'static str) -> Self {
        let secret = p521::SecretKey::random(&mut rand::thread_rng());
        let spki_der = secret.public_key().to_public_key_der().unwrap().into_vec();
        let key = p521::ecdsa::SigningKey::from_bytes(&secret.to_bytes()).unwrap();
        Self {
            label,
            spki_der,
            key: RequesterKey::P521(key),
        }
    }

    /// Base64 signature over SHA-256 of `message`, in the kubelet's format
    pub fn sign_base64(&self, message: &[u8]) -> Vec<u8> {
        let digest = Sha256::digest(message);
        let signature = match &self.key {
            RequesterKey::Rsa(key) => key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest).unwrap(),
            RequesterKey::P224(key) => {
                let sig: p224::ecdsa::Signature = key.sign_prehash(&digest).unwrap();
                sig.to_bytes().to_vec()
            }
            RequesterKey::P256(key) => {
                let sig: p256::ecdsa::Signature = key.sign_prehash(&digest).unwrap();
                sig.to_bytes().to_vec()
            }
            RequesterKey::P384(key) => {
                let sig: p384::ecdsa::Signature = key.sign_prehash(&digest).unwrap();
                sig.to_bytes().to_vec()
            }
            RequesterKey::P521(key) => {
                let sig: p521::ecdsa::Signature =
                    key.sign_prehash(&p521_prehash(&digest)).unwrap();
                sig.to_bytes().to_vec()
            }
        };
        STANDARD.encode(signature).into_bytes()
    }

    /// Valid proof of possession for this requester's own key
    pub fn proof_of_possession(&self) -> Vec<u8> {
        self.sign_base64(&self.spki_der)
    }
}

static RSA_REQUESTER: Lazy<Requester> = Lazy::new(|| Requester::rsa("rsa-2048"));
static P256_REQUESTER: Lazy<Requester> = Lazy::new(|| Requester::p256("p256"));
static P256_OTHER_REQUESTER: Lazy<Requester> = Lazy::new(|| Requester::p256("p256-other"));
static P384_REQUESTER: Lazy<Requester> = Lazy::new(|| Requester::p384("p384"));
static P224_REQUESTER: Lazy<Requester> = Lazy::new(|| Requester::p224("p224"));
static P521_REQUESTER: Lazy<Requester> = Lazy::new(|| Requester::p521("p521"));

static CA_KEY_PKCS8_PEM: Lazy<String> = Lazy::new(|| rsa_private_key_pem(false));
static CA_KEY_PKCS1_PEM: Lazy<String> = Lazy::new(|| rsa_private_key_pem(true));
static TEST_CA: Lazy<Arc<CertificateAuthority>> = Lazy::new(|| {
    let key = parse_private_key_pem(CA_KEY_PKCS8_PEM.as_bytes()).unwrap();
    Arc::new(CertificateAuthority::self_signed("Test Signer CA", key).unwrap())
});
static OTHER_CA: Lazy<Arc<CertificateAuthority>> = Lazy::new(|| {
    let key = parse_private_key_pem(CA_KEY_PKCS1_PEM.as_bytes()).unwrap();
    Arc::new(CertificateAuthority::self_signed("Other Signer CA", key).unwrap())
});

fn rsa_private_key_pem(pkcs1: bool) -> String {
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
    if pkcs1 {
        use rsa::pkcs1::EncodeRsaPrivateKey;
        key.to_pkcs1_pem(LineEnding::LF).unwrap().to_string()
    } else {
        key.to_pkcs8_pem(LineEnding::LF).unwrap().to_string()
    }
}

/// RSA-2048 requester
pub fn rsa_requester() -> &'static Requester {
    &RSA_REQUESTER
}

/// P-256 requester
pub fn p256_requester() -> &'static Requester {
    &P256_REQUESTER
}

/// A second, unrelated P-256 requester
pub fn p256_other_requester() -> &'static Requester {
    &P256_OTHER_REQUESTER
}

/// P-384 requester
pub fn p384_requester() -> &'static Requester {
    &P384_REQUESTER
}

/// P-224 requester
pub fn p224_requester() -> &'static Requester {
    &P224_REQUESTER
}

/// P-521 requester
pub fn p521_requester() -> &'static Requester {
    &P521_REQUESTER
}

/// A CA whose key is PKCS#8 encoded
pub fn test_ca() -> Arc<CertificateAuthority> {
    TEST_CA.clone()
}

/// A second CA whose key is PKCS#1 encoded
pub fn other_ca() -> Arc<CertificateAuthority> {
    OTHER_CA.clone()
}

/// A store holding [`test_ca`]
pub fn test_store() -> CaStore {
    CaStore::with_authority(test_ca())
}

/// PKCS#8 PEM of [`test_ca`]'s key
pub fn test_ca_key_pem() -> &'static str {
    &CA_KEY_PKCS8_PEM
}

/// PKCS#1 PEM of [`other_ca`]'s key
pub fn other_ca_key_pem() -> &'static str {
    &CA_KEY_PKCS1_PEM
}

/// SubjectPublicKeyInfo for an Ed25519 key
pub fn ed25519_spki() -> Vec<u8> {
    let mut der = vec![
        0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
    ];
    der.extend_from_slice(&[0x11; 32]);
    der
}

/// SubjectPublicKeyInfo for an EC key on secp256k1
pub fn secp256k1_spki() -> Vec<u8> {
    let mut der = vec![
        0x30, 0x56, 0x30, 0x10, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x05,
        0x2b, 0x81, 0x04, 0x00, 0x0a, 0x03, 0x42, 0x00, 0x04,
    ];
    der.extend_from_slice(&[0x22; 64]);
    der
}

/// Request spec as the kubelet would submit it for `requester`
pub fn request_spec(
    requester: &Requester,
    signer_name: &str,
    pod_name: &str,
) -> PodCertificateRequestSpec {
    PodCertificateRequestSpec {
        signer_name: signer_name.to_string(),
        pod_name: pod_name.to_string(),
        pod_uid: format!("{}-uid", pod_name),
        service_account_name: "default".to_string(),
        service_account_uid: "sa-uid".to_string(),
        node_name: "node-a".to_string(),
        node_uid: "node-uid".to_string(),
        max_expiration_seconds: None,
        pkix_public_key: ByteString(requester.spki_der.clone()),
        proof_of_possession: ByteString(requester.proof_of_possession()),
    }
}
