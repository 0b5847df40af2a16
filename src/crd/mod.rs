//! Resource definitions used by the signer
//!
//! PodCertificateRequest is the only resource the signer reconciles; the CA
//! secret is a plain core/v1 Secret.

mod pod_certificate_request;
mod types;

pub use pod_certificate_request::{
    PodCertificateRequest, PodCertificateRequestSpec, PodCertificateRequestStatus,
};
pub use types::{Condition, ConditionStatus, ISSUED_CONDITION};
