//! PKI operations for pod certificates
//!
//! The signer holds one CA at a time and issues short-lived leaf
//! certificates for public keys submitted by the kubelet. It never sees a
//! requester's private key; possession is proven by a signature instead.
//!
//! - [`CertificateAuthority`]: an immutable CA certificate and key pair
//! - [`CaStore`]: the active CA, swapped atomically on reload
//! - [`RequestedKey`]: the closed set of requester key kinds
//! - [`verify_proof_of_possession`]: the possession check
//! - [`issue`]: the signing policy turning a request into a certificate

mod issue;
mod key;
mod pop;
mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use issue::{
    compute_timing, issue, CertificateTiming, IssueError, IssuedCertificate, SigningPolicy,
    MIN_CERT_VALIDITY, MIN_REFRESH_BEFORE,
};
pub use key::{KeyError, RequestedKey};
pub use pop::{verify_proof_of_possession, PopError};
pub use store::{ca_from_secret, CaError, CaStore, KubeSecretReader, SecretReader};

use chrono::{DateTime, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, PublicKeyData, SerialNumber,
};
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use x509_parser::prelude::*;

/// Common name of the CA generated when no secret is configured
pub const EPHEMERAL_CA_NAME: &str = "Pod Certificate Signer CA";

/// Lifetime of a generated CA, in days
pub const EPHEMERAL_CA_VALIDITY_DAYS: i64 = 3650;

const EPHEMERAL_CA_KEY_BITS: usize = 2048;

/// Parse PEM-encoded data and return the DER bytes of a block with `tag`
pub fn parse_pem(pem_data: &[u8], tag: &str) -> Result<Vec<u8>, CaError> {
    let block = ::pem::parse(pem_data)
        .map_err(|e| CaError::PemDecode(format!("failed to parse PEM: {}", e)))?;
    if block.tag() != tag {
        return Err(CaError::PemDecode(format!(
            "expected {} block, found {}",
            tag,
            block.tag()
        )));
    }
    Ok(block.contents().to_vec())
}

/// Parse a CA private key from PEM
///
/// Accepts PKCS#8 (`PRIVATE KEY`) and PKCS#1 RSA (`RSA PRIVATE KEY`).
pub fn parse_private_key_pem(key_pem: &[u8]) -> Result<KeyPair, CaError> {
    let block = ::pem::parse(key_pem)
        .map_err(|e| CaError::PemDecode(format!("failed to parse key PEM: {}", e)))?;

    let pkcs8_der = match block.tag() {
        "PRIVATE KEY" => block.contents().to_vec(),
        "RSA PRIVATE KEY" => {
            let key = RsaPrivateKey::from_pkcs1_der(block.contents())
                .map_err(|e| CaError::KeyParse(format!("PKCS#1 key: {}", e)))?;
            key.to_pkcs8_der()
                .map_err(|e| CaError::KeyParse(format!("PKCS#1 key: {}", e)))?
                .as_bytes()
                .to_vec()
        }
        other => {
            return Err(CaError::KeyParse(format!(
                "unsupported private key PEM block {}",
                other
            )))
        }
    };

    key_pair_from_pkcs8(pkcs8_der)
}

fn key_pair_from_pkcs8(der: Vec<u8>) -> Result<KeyPair, CaError> {
    let pem = ::pem::encode(&::pem::Pem::new("PRIVATE KEY", der));
    KeyPair::from_pem(&pem).map_err(|e| CaError::KeyParse(e.to_string()))
}

/// Random positive 128-bit serial number
pub fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}

/// Convert a chrono timestamp to the type rcgen expects
pub(crate) fn to_offset_date_time(at: DateTime<Utc>) -> Result<::time::OffsetDateTime, String> {
    ::time::OffsetDateTime::from_unix_timestamp(at.timestamp()).map_err(|e| e.to_string())
}

/// Certificate Authority used to sign pod certificates
pub struct CertificateAuthority {
    cert_pem: String,
    cert_der: Vec<u8>,
    key: KeyPair,
    subject: String,
    not_after: DateTime<Utc>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("subject", &self.subject)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Generate an in-memory RSA-2048 root valid for ten years
    pub fn generate() -> Result<Self, CaError> {
        let rsa_key = RsaPrivateKey::new(&mut rand::thread_rng(), EPHEMERAL_CA_KEY_BITS)
            .map_err(|e| CaError::Generation(format!("failed to generate CA key: {}", e)))?;
        let der = rsa_key
            .to_pkcs8_der()
            .map_err(|e| CaError::Generation(format!("failed to encode CA key: {}", e)))?;
        let key = key_pair_from_pkcs8(der.as_bytes().to_vec())?;
        Self::self_signed(EPHEMERAL_CA_NAME, key)
    }

    /// Self-sign a root for an existing key
    pub fn self_signed(common_name: &str, key: KeyPair) -> Result<Self, CaError> {
        let now = Utc::now();
        let not_before = to_offset_date_time(now).map_err(CaError::Generation)?;
        let not_after = to_offset_date_time(now + chrono::Duration::days(EPHEMERAL_CA_VALIDITY_DAYS))
            .map_err(CaError::Generation)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        params.distinguished_name = dn;
        params.serial_number = Some(random_serial());
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.not_before = not_before;
        params.not_after = not_after;

        let cert = params.self_signed(&key).map_err(|e| {
            CaError::Generation(format!("failed to create CA certificate: {}", e))
        })?;

        Self::assemble(cert.der().to_vec(), key)
    }

    /// Load a CA from PEM certificate and key bytes
    ///
    /// Fails unless the key belongs to the certificate.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, CaError> {
        let cert_der = parse_pem(cert_pem, "CERTIFICATE")?;
        // Parse before the key so a broken certificate reports as such
        X509Certificate::from_der(&cert_der)
            .map_err(|e| CaError::CertificateParse(e.to_string()))?;
        let key = parse_private_key_pem(key_pem)?;
        Self::assemble(cert_der, key)
    }

    fn assemble(cert_der: Vec<u8>, key: KeyPair) -> Result<Self, CaError> {
        let (_, cert) = X509Certificate::from_der(&cert_der)
            .map_err(|e| CaError::CertificateParse(e.to_string()))?;

        if cert.public_key().subject_public_key.data.as_ref() != key.public_key_raw() {
            return Err(CaError::KeyMismatch);
        }

        let subject = cert.subject().to_string();
        let not_after = DateTime::<Utc>::from_timestamp(cert.validity().not_after.timestamp(), 0)
            .ok_or_else(|| CaError::CertificateParse("notAfter out of range".to_string()))?;
        let cert_pem = ::pem::encode(&::pem::Pem::new("CERTIFICATE", cert_der.clone()));

        Ok(Self {
            cert_pem,
            cert_der,
            key,
            subject,
            not_after,
        })
    }

    /// CA certificate in PEM format
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// CA certificate in DER format
    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// Subject distinguished name, for logging
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// End of the CA's own validity
    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Sign `params` for `subject_key` and return the PEM certificate
    pub fn sign(
        &self,
        params: &CertificateParams,
        subject_key: &impl PublicKeyData,
    ) -> Result<String, rcgen::Error> {
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &self.key)?;
        let cert = params.signed_by(subject_key, &issuer)?;
        Ok(cert.pem())
    }
}
