//! Controllers for the signer
//!
//! - [`signer`]: reconciles PodCertificateRequests
//! - [`secret`]: reloads the CA when its Secret changes

mod secret;
mod signer;

pub use secret::{run_secret_watcher, secret_event_command, ReloadCommand};
pub use signer::{
    error_policy, reconcile, CertificateRequestClient, Context, ContextBuilder,
    KubeCertificateRequestClient, ISSUED_REASON,
};
