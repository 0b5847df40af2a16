//! Pod certificate signer - issues X.509 certificates for Kubernetes
//! PodCertificateRequests
//!
//! The kubelet creates a PodCertificateRequest carrying a pod's public key and
//! a proof that the pod holds the private key. This crate watches those
//! requests, checks them, and answers the ones addressed to its signer name
//! with a short-lived certificate signed by a managed CA.
//!
//! # Modules
//!
//! - [`crd`] - PodCertificateRequest resource and status types
//! - [`controller`] - Request reconciliation and CA secret watching
//! - [`pki`] - CA store, key parsing, proof-of-possession and issuance
//! - [`config`] - Command-line and environment configuration
//! - [`leader_election`] - Lease-based leader election
//! - [`health`] - Liveness and readiness endpoints
//! - [`metrics`] / [`telemetry`] - OpenTelemetry instruments and log setup
//! - [`retry`] - Backoff helpers
//! - [`error`] - Error types for the signer

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod health;
pub mod leader_election;
pub mod metrics;
pub mod pki;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
