//! Signing policy: from a request spec to a signed leaf certificate
//!
//! [`issue`] is a pure function of the request, the active CA, the policy
//! and the current time. It does not retry and does not touch the API.

use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use rcgen::{
    string::Ia5String, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, SanType, SubjectPublicKeyInfo,
};
use thiserror::Error;
use tracing::{debug, warn};

use super::key::{KeyError, RequestedKey};
use super::pop::{verify_proof_of_possession, PopError};
use super::store::CaStore;
use super::{random_serial, to_offset_date_time};
use crate::config::format_duration;
use crate::crd::PodCertificateRequestSpec;

/// Shortest certificate lifetime the signer will configure
pub const MIN_CERT_VALIDITY: Duration = Duration::from_secs(60 * 60);

/// Shortest refresh lead time the signer will configure
pub const MIN_REFRESH_BEFORE: Duration = Duration::from_secs(30 * 60);

/// DNS suffix of the name certified for each pod
pub const POD_DNS_SUFFIX: &str = "pod.cluster.local";

/// Issuance failures
#[derive(Debug, Error)]
pub enum IssueError {
    /// `pkixPublicKey` could not be parsed
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// `pkixPublicKey` is a key kind the signer does not issue for
    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),

    /// `proofOfPossession` did not check out
    #[error("proof of possession failed: {0}")]
    ProofOfPossession(#[from] PopError),

    /// No CA has been loaded yet
    #[error("certificate authority not initialized")]
    CaNotInitialized,

    /// Building or signing the certificate failed
    #[error("signing failed: {0}")]
    SigningFailed(String),
}

impl IssueError {
    /// Stable reason code for conditions and metrics
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidPublicKey(_) => "InvalidPublicKey",
            Self::UnsupportedKeyType(_) => "UnsupportedKeyType",
            Self::ProofOfPossession(e) => e.reason(),
            Self::CaNotInitialized | Self::SigningFailed(_) => "SigningFailed",
        }
    }

    /// True when the request itself is at fault
    pub fn is_request_invalid(&self) -> bool {
        matches!(
            self,
            Self::InvalidPublicKey(_) | Self::UnsupportedKeyType(_) | Self::ProofOfPossession(_)
        )
    }
}

impl From<KeyError> for IssueError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::Malformed(msg) => Self::InvalidPublicKey(msg),
            KeyError::Unsupported(msg) => Self::UnsupportedKeyType(msg),
        }
    }
}

/// Process-wide issuance settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningPolicy {
    /// Lifetime of issued certificates before any per-request cap
    pub cert_validity: Duration,
    /// How long before `notAfter` holders should start refreshing
    pub cert_refresh_before: Duration,
    /// Whether the proof-of-possession signature is checked
    pub verify_proof_of_possession: bool,
}

impl SigningPolicy {
    /// Build a policy, raising values below the floors
    pub fn new(
        cert_validity: Duration,
        cert_refresh_before: Duration,
        verify_proof_of_possession: bool,
    ) -> Self {
        if cert_validity < MIN_CERT_VALIDITY {
            warn!(
                configured = %format_duration(cert_validity),
                minimum = %format_duration(MIN_CERT_VALIDITY),
                "certificate validity too low, using minimum"
            );
        }
        if cert_refresh_before < MIN_REFRESH_BEFORE {
            warn!(
                configured = %format_duration(cert_refresh_before),
                minimum = %format_duration(MIN_REFRESH_BEFORE),
                "refresh lead time too low, using minimum"
            );
        }
        Self {
            cert_validity: cert_validity.max(MIN_CERT_VALIDITY),
            cert_refresh_before: cert_refresh_before.max(MIN_REFRESH_BEFORE),
            verify_proof_of_possession,
        }
    }
}

impl Default for SigningPolicy {
    fn default() -> Self {
        Self::new(MIN_CERT_VALIDITY, MIN_REFRESH_BEFORE, true)
    }
}

/// Validity window written to the certificate and the request status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CertificateTiming {
    /// Start of validity, whole seconds
    pub not_before: DateTime<Utc>,
    /// End of validity
    pub not_after: DateTime<Utc>,
    /// When the holder should start refreshing; within `[not_before, not_after]`
    pub begin_refresh_at: DateTime<Utc>,
    /// Granted lifetime
    pub validity: Duration,
}

/// A signed leaf certificate and its timing
#[derive(Clone, Debug)]
pub struct IssuedCertificate {
    /// Single PEM `CERTIFICATE` block
    pub certificate_pem: String,
    /// Validity window
    pub timing: CertificateTiming,
    /// DNS name in the subject and SAN
    pub dns_name: String,
    /// Requester key kind
    pub key_algorithm: &'static str,
}

/// Compute the validity window for a request
///
/// A positive `max_expiration_seconds` shortens the configured validity
/// (and may go below the floor); zero or negative values are ignored.
pub fn compute_timing(
    now: DateTime<Utc>,
    policy: &SigningPolicy,
    max_expiration_seconds: Option<i32>,
) -> CertificateTiming {
    let not_before = now.trunc_subsecs(0);

    let mut validity = policy.cert_validity.max(MIN_CERT_VALIDITY);
    if let Some(max) = max_expiration_seconds.filter(|s| *s > 0) {
        validity = validity.min(Duration::from_secs(max.unsigned_abs().into()));
    }

    let not_after = chrono::Duration::from_std(validity)
        .ok()
        .and_then(|v| not_before.checked_add_signed(v))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);

    let lead = policy.cert_refresh_before.max(MIN_REFRESH_BEFORE);
    let begin_refresh_at = chrono::Duration::from_std(lead)
        .ok()
        .and_then(|l| not_after.checked_sub_signed(l))
        .unwrap_or(not_before)
        .clamp(not_before, not_after);

    CertificateTiming {
        not_before,
        not_after,
        begin_refresh_at,
        validity,
    }
}

/// DNS name certified for a pod
pub fn pod_dns_name(pod_name: &str) -> String {
    format!("{}.{}", pod_name, POD_DNS_SUFFIX)
}

/// Validate a request and sign a certificate for it
pub fn issue(
    spec: &PodCertificateRequestSpec,
    ca: &CaStore,
    policy: &SigningPolicy,
    now: DateTime<Utc>,
) -> Result<IssuedCertificate, IssueError> {
    let public_key_der = spec.pkix_public_key.0.as_slice();
    let key = RequestedKey::from_spki_der(public_key_der)?;

    if policy.verify_proof_of_possession {
        verify_proof_of_possession(&key, public_key_der, &spec.proof_of_possession.0)?;
    }

    let timing = compute_timing(now, policy, spec.max_expiration_seconds);
    let dns_name = pod_dns_name(&spec.pod_name);
    let params = leaf_params(&key, &dns_name, &timing)?;
    let subject_key = SubjectPublicKeyInfo::from_der(public_key_der)
        .map_err(|e| IssueError::InvalidPublicKey(e.to_string()))?;

    let authority = ca.snapshot().ok_or(IssueError::CaNotInitialized)?;
    let certificate_pem = authority
        .sign(&params, &subject_key)
        .map_err(|e| IssueError::SigningFailed(e.to_string()))?;

    debug!(
        pod = %spec.pod_name,
        key_algorithm = key.algorithm(),
        key_bits = key.bits(),
        validity = %format_duration(timing.validity),
        issuer = %authority.subject(),
        "certificate signed"
    );

    Ok(IssuedCertificate {
        certificate_pem,
        timing,
        dns_name,
        key_algorithm: key.algorithm(),
    })
}

fn leaf_params(
    key: &RequestedKey,
    dns_name: &str,
    timing: &CertificateTiming,
) -> Result<CertificateParams, IssueError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(dns_name.to_string()));
    params.distinguished_name = dn;

    let san = Ia5String::try_from(dns_name.to_string())
        .map_err(|e| IssueError::SigningFailed(format!("invalid DNS name {}: {}", dns_name, e)))?;
    params.subject_alt_names = vec![SanType::DnsName(san)];

    params.serial_number = Some(random_serial());
    params.is_ca = IsCa::NoCa;
    params.key_usages = key.key_usages();
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::ServerAuth,
    ];
    params.use_authority_key_identifier_extension = true;
    params.not_before = to_offset_date_time(timing.not_before).map_err(IssueError::SigningFailed)?;
    params.not_after = to_offset_date_time(timing.not_after).map_err(IssueError::SigningFailed)?;

    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::testing::{self, Requester};
    use chrono::TimeZone;
    use k8s_openapi::ByteString;
    use x509_parser::extensions::GeneralName;
    use x509_parser::prelude::*;

    const SIGNER: &str = "example.com/signer";

    fn at(secs: i64, nanos: u32) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, nanos).unwrap()
    }

    fn policy(validity_secs: u64, refresh_secs: u64) -> SigningPolicy {
        SigningPolicy {
            cert_validity: Duration::from_secs(validity_secs),
            cert_refresh_before: Duration::from_secs(refresh_secs),
            verify_proof_of_possession: true,
        }
    }

    fn issue_for(requester: &Requester) -> IssuedCertificate {
        let spec = testing::request_spec(requester, SIGNER, "web-0");
        issue(&spec, &testing::test_store(), &SigningPolicy::default(), Utc::now()).unwrap()
    }

    // ==========================================================================
    // Timing
    // ==========================================================================

    #[test]
    fn test_default_timing() {
        let now = at(1_700_000_000, 0);
        let t = compute_timing(now, &SigningPolicy::default(), None);

        assert_eq!(t.not_before, now);
        assert_eq!(t.not_after, at(1_700_000_000 + 3600, 0));
        assert_eq!(t.begin_refresh_at, at(1_700_000_000 + 1800, 0));
        assert_eq!(t.validity, Duration::from_secs(3600));
    }

    #[test]
    fn test_not_before_is_whole_seconds() {
        let t = compute_timing(at(1_700_000_000, 987_654_321), &SigningPolicy::default(), None);
        assert_eq!(t.not_before, at(1_700_000_000, 0));
        assert_eq!(t.not_after, at(1_700_003_600, 0));
    }

    #[test]
    fn test_validity_below_floor_is_raised() {
        let now = at(1_700_000_000, 0);
        let t = compute_timing(now, &policy(600, 1800), None);
        assert_eq!(t.validity, MIN_CERT_VALIDITY);
        assert_eq!(t.not_after, at(1_700_003_600, 0));
    }

    #[test]
    fn test_refresh_below_floor_is_raised() {
        let now = at(1_700_000_000, 0);
        let t = compute_timing(now, &policy(24 * 3600, 60), None);
        // 24h validity, 30m lead
        assert_eq!(t.begin_refresh_at, at(1_700_000_000 + 24 * 3600 - 1800, 0));
    }

    #[test]
    fn test_max_expiration_caps_validity_below_floor() {
        let now = at(1_700_000_000, 0);
        let t = compute_timing(now, &policy(24 * 3600, 1800), Some(1200));

        assert_eq!(t.validity, Duration::from_secs(1200));
        assert_eq!(t.not_after, at(1_700_001_200, 0));
        // lead exceeds validity: refresh starts immediately
        assert_eq!(t.begin_refresh_at, t.not_before);
    }

    #[test]
    fn test_larger_max_expiration_is_ignored() {
        let now = at(1_700_000_000, 0);
        let t = compute_timing(now, &policy(3600, 1800), Some(86400));
        assert_eq!(t.validity, Duration::from_secs(3600));
    }

    #[test]
    fn test_non_positive_max_expiration_is_ignored() {
        let now = at(1_700_000_000, 0);
        for max in [0, -1, i32::MIN] {
            let t = compute_timing(now, &policy(7200, 1800), Some(max));
            assert_eq!(t.validity, Duration::from_secs(7200), "max={}", max);
        }
    }

    #[test]
    fn test_refresh_lead_longer_than_validity_clamps_to_not_before() {
        let now = at(1_700_000_000, 0);
        let t = compute_timing(now, &policy(3600, 2 * 3600), None);
        assert_eq!(t.begin_refresh_at, t.not_before);
        assert!(t.begin_refresh_at <= t.not_after);
    }

    #[test]
    fn test_policy_new_applies_floors() {
        let p = SigningPolicy::new(Duration::from_secs(1), Duration::from_secs(1), false);
        assert_eq!(p.cert_validity, MIN_CERT_VALIDITY);
        assert_eq!(p.cert_refresh_before, MIN_REFRESH_BEFORE);
        assert!(!p.verify_proof_of_possession);

        let p = SigningPolicy::new(Duration::from_secs(7200), Duration::from_secs(3600), true);
        assert_eq!(p.cert_validity, Duration::from_secs(7200));
        assert_eq!(p.cert_refresh_before, Duration::from_secs(3600));
    }

    // ==========================================================================
    // Story Tests: issuing for real keys
    // ==========================================================================

    /// Story: a pod with an RSA key gets a TLS leaf signed by the CA
    #[test]
    fn story_rsa_request_gets_verifiable_leaf() {
        let issued = issue_for(testing::rsa_requester());
        assert_eq!(issued.dns_name, "web-0.pod.cluster.local");
        assert_eq!(issued.key_algorithm, "RSA");
        assert_eq!(issued.certificate_pem.matches("BEGIN CERTIFICATE").count(), 1);

        let der = ::pem::parse(&issued.certificate_pem).unwrap().into_contents();
        let (_, cert) = X509Certificate::from_der(&der).unwrap();

        let ca = testing::test_ca();
        let (_, ca_cert) = X509Certificate::from_der(ca.cert_der()).unwrap();
        assert!(cert.verify_signature(Some(ca_cert.public_key())).is_ok());
        assert_eq!(cert.issuer().to_string(), ca_cert.subject().to_string());

        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok());
        assert_eq!(cn, Some("web-0.pod.cluster.local"));

        let san = cert.subject_alternative_name().unwrap().unwrap().value;
        assert_eq!(
            san.general_names,
            vec![GeneralName::DNSName("web-0.pod.cluster.local")]
        );

        let usage = cert.key_usage().unwrap().unwrap().value;
        assert!(usage.digital_signature());
        assert!(usage.key_encipherment());
        assert!(!usage.key_cert_sign());

        let eku = cert.extended_key_usage().unwrap().unwrap().value;
        assert!(eku.client_auth);
        assert!(eku.server_auth);

        assert!(!cert.is_ca());
        assert!(cert
            .extensions()
            .iter()
            .any(|ext| ext.oid == x509_parser::oid_registry::OID_X509_EXT_AUTHORITY_KEY_IDENTIFIER));

        assert_eq!(
            cert.validity().not_before.timestamp(),
            issued.timing.not_before.timestamp()
        );
        assert_eq!(
            cert.validity().not_after.timestamp(),
            issued.timing.not_after.timestamp()
        );
        assert_eq!(
            cert.public_key().raw,
            testing::rsa_requester().spki_der.as_slice()
        );
    }

    /// Story: EC keys are certified for signatures only
    #[test]
    fn story_ec_requests_get_digital_signature_only() {
        for requester in [
            testing::p224_requester(),
            testing::p256_requester(),
            testing::p384_requester(),
            testing::p521_requester(),
        ] {
            let issued = issue_for(requester);
            let der = ::pem::parse(&issued.certificate_pem).unwrap().into_contents();
            let (_, cert) = X509Certificate::from_der(&der).unwrap();

            let usage = cert.key_usage().unwrap().unwrap().value;
            assert!(usage.digital_signature(), "{}", requester.label);
            assert!(!usage.key_encipherment(), "{}", requester.label);
            assert_eq!(cert.public_key().raw, requester.spki_der.as_slice());
        }
    }

    /// Story: a kubelet configured for ECDSA-P521 keys gets its certificate
    #[test]
    fn story_p521_request_is_issued() {
        let requester = testing::p521_requester();
        let issued = issue_for(requester);
        assert_eq!(issued.key_algorithm, "ECDSA-P521");

        let der = ::pem::parse(&issued.certificate_pem).unwrap().into_contents();
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        let ca = testing::test_ca();
        let (_, ca_cert) = X509Certificate::from_der(ca.cert_der()).unwrap();
        assert!(cert.verify_signature(Some(ca_cert.public_key())).is_ok());
        assert_eq!(cert.public_key().raw, requester.spki_der.as_slice());
    }

    /// Story: a requester that cannot prove possession is refused
    #[test]
    fn story_forged_proof_is_refused() {
        let victim = testing::p256_requester();
        let attacker = testing::p256_other_requester();
        let mut spec = testing::request_spec(victim, SIGNER, "web-0");
        spec.proof_of_possession = ByteString(attacker.sign_base64(&victim.spki_der));

        let err = issue(&spec, &testing::test_store(), &SigningPolicy::default(), Utc::now())
            .unwrap_err();
        assert!(matches!(
            err,
            IssueError::ProofOfPossession(PopError::VerificationFailed)
        ));
        assert_eq!(err.reason(), "VerificationFailed");
        assert!(err.is_request_invalid());
    }

    /// Story: with possession checks delegated to admission, any proof passes
    #[test]
    fn story_possession_check_can_be_disabled() {
        let mut spec = testing::request_spec(testing::p256_requester(), SIGNER, "web-0");
        spec.proof_of_possession = ByteString(b"some-proof".to_vec());
        let mut policy = SigningPolicy::default();
        policy.verify_proof_of_possession = false;

        let issued = issue(&spec, &testing::test_store(), &policy, Utc::now()).unwrap();
        assert!(issued.certificate_pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn test_bad_keys_are_classified() {
        let mut spec = testing::request_spec(testing::p256_requester(), SIGNER, "web-0");
        spec.pkix_public_key = ByteString(b"garbage".to_vec());
        let err = issue(&spec, &testing::test_store(), &SigningPolicy::default(), Utc::now())
            .unwrap_err();
        assert_eq!(err.reason(), "InvalidPublicKey");

        spec.pkix_public_key = ByteString(testing::ed25519_spki());
        let err = issue(&spec, &testing::test_store(), &SigningPolicy::default(), Utc::now())
            .unwrap_err();
        assert_eq!(err.reason(), "UnsupportedKeyType");
        assert!(err.is_request_invalid());
    }

    #[test]
    fn test_missing_ca_is_signing_failure() {
        let spec = testing::request_spec(testing::p256_requester(), SIGNER, "web-0");
        let err =
            issue(&spec, &CaStore::empty(), &SigningPolicy::default(), Utc::now()).unwrap_err();
        assert!(matches!(err, IssueError::CaNotInitialized));
        assert_eq!(err.reason(), "SigningFailed");
        assert!(!err.is_request_invalid());
    }

    #[test]
    fn test_request_cap_reaches_certificate() {
        let mut spec = testing::request_spec(testing::p256_requester(), SIGNER, "web-0");
        spec.max_expiration_seconds = Some(1800);
        let issued =
            issue(&spec, &testing::test_store(), &SigningPolicy::default(), Utc::now()).unwrap();

        let der = ::pem::parse(&issued.certificate_pem).unwrap().into_contents();
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        let lifetime =
            cert.validity().not_after.timestamp() - cert.validity().not_before.timestamp();
        assert_eq!(lifetime, 1800);
        assert_eq!(issued.timing.begin_refresh_at, issued.timing.not_before);
    }

    #[test]
    fn test_serials_differ_between_issuances() {
        let a = issue_for(testing::p256_requester());
        let b = issue_for(testing::p256_requester());
        let serial = |pem: &str| {
            let der = ::pem::parse(pem).unwrap().into_contents();
            X509Certificate::from_der(&der).unwrap().1.serial.clone()
        };
        assert_ne!(serial(&a.certificate_pem), serial(&b.certificate_pem));
    }
}
