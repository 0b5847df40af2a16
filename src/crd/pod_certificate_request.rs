//! PodCertificateRequest resource
//!
//! `certificates.k8s.io/v1beta1` PodCertificateRequest is a built-in API. It is
//! modelled here with the `CustomResource` derive so it gets a typed `Api`
//! without depending on a k8s-openapi release that ships it. The signer only
//! reads `spec` and only writes `status`.

use chrono::{DateTime, Utc};
use k8s_openapi::ByteString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ISSUED_CONDITION};

/// Specification of a PodCertificateRequest, written by the kubelet
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "certificates.k8s.io",
    version = "v1beta1",
    kind = "PodCertificateRequest",
    plural = "podcertificaterequests",
    status = "PodCertificateRequestStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PodCertificateRequestSpec {
    /// Signer that should handle this request
    pub signer_name: String,

    /// Name of the requesting pod
    pub pod_name: String,

    /// UID of the requesting pod
    #[serde(rename = "podUID")]
    pub pod_uid: String,

    /// Service account the pod runs as
    pub service_account_name: String,

    /// UID of the service account
    #[serde(rename = "serviceAccountUID")]
    pub service_account_uid: String,

    /// Node the pod is scheduled on
    pub node_name: String,

    /// UID of the node
    #[serde(rename = "nodeUID")]
    pub node_uid: String,

    /// Upper bound on the lifetime the requester will accept
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_expiration_seconds: Option<i32>,

    /// DER-encoded SubjectPublicKeyInfo of the key to certify
    #[serde(rename = "pkixPublicKey")]
    #[schemars(with = "String")]
    pub pkix_public_key: ByteString,

    /// Base64 text of a signature over SHA-256 of `pkixPublicKey`
    #[schemars(with = "String")]
    pub proof_of_possession: ByteString,
}

/// Status of a PodCertificateRequest, written once by the signer
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodCertificateRequestStatus {
    /// Issued certificate in PEM, leaf only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_chain: Option<String>,

    /// Start of the certificate validity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,

    /// Time at which the holder should start refreshing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub begin_refresh_at: Option<DateTime<Utc>>,

    /// End of the certificate validity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,

    /// Conditions describing the outcome
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl PodCertificateRequestStatus {
    /// True once a certificate has been written; the request is then terminal
    pub fn is_issued(&self) -> bool {
        self.certificate_chain
            .as_deref()
            .is_some_and(|chain| !chain.is_empty())
    }

    /// The `Issued` condition, if any
    pub fn issued_condition(&self) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == ISSUED_CONDITION)
    }

    /// Replace the `Issued` condition, keeping any other condition types
    pub fn set_issued_condition(&mut self, condition: Condition) {
        self.conditions.retain(|c| c.type_ != ISSUED_CONDITION);
        self.conditions.push(condition);
    }
}

impl PodCertificateRequest {
    /// True once a certificate has been written to status
    pub fn is_issued(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.is_issued())
    }
}
