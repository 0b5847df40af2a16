//! The active certificate authority
//!
//! Signing takes an `Arc` snapshot under a read lock and works from it, so
//! a reload that lands mid-signature never mixes the old certificate with
//! the new key.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use super::CertificateAuthority;
use crate::config::{CaSource, SecretRef};

/// CA loading errors
#[derive(Debug, Error)]
pub enum CaError {
    /// The CA secret does not exist
    #[error("CA secret {0} not found")]
    SecretNotFound(String),

    /// The CA secret lacks a data field
    #[error("field {field} not found in CA secret {secret}")]
    FieldMissing {
        /// `namespace/name` of the secret
        secret: String,
        /// Missing data key
        field: String,
    },

    /// A field is not the expected PEM
    #[error("failed to decode PEM: {0}")]
    PemDecode(String),

    /// The certificate is not valid X.509
    #[error("failed to parse certificate: {0}")]
    CertificateParse(String),

    /// The private key could not be parsed
    #[error("failed to parse private key: {0}")]
    KeyParse(String),

    /// The private key does not belong to the certificate
    #[error("private key does not match certificate public key")]
    KeyMismatch,

    /// Generating an in-memory CA failed
    #[error("failed to generate CA: {0}")]
    Generation(String),

    /// Fetching the secret failed
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}

/// Trait for reading Secrets, so the store can be tested without a cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretReader: Send + Sync {
    /// Fetch a secret, `None` when it does not exist
    async fn get_secret(&self, namespace: &str, name: &str)
        -> Result<Option<Secret>, kube::Error>;
}

/// [`SecretReader`] backed by the Kubernetes API
pub struct KubeSecretReader {
    client: Client,
}

impl KubeSecretReader {
    /// Create a reader using `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretReader for KubeSecretReader {
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, kube::Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await
    }
}

/// Build a CA from the data fields of `secret`
pub fn ca_from_secret(
    secret: &Secret,
    secret_ref: &SecretRef,
) -> Result<CertificateAuthority, CaError> {
    let field = |key: &str| {
        secret
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .map(|value| value.0.as_slice())
            .ok_or_else(|| CaError::FieldMissing {
                secret: secret_ref.to_string(),
                field: key.to_string(),
            })
    };

    let cert_pem = field(&secret_ref.cert_key)?;
    let key_pem = field(&secret_ref.key_key)?;
    CertificateAuthority::from_pem(cert_pem, key_pem)
}

/// Holder of the active CA
#[derive(Default)]
pub struct CaStore {
    active: RwLock<Option<Arc<CertificateAuthority>>>,
}

impl std::fmt::Debug for CaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaStore")
            .field("has_authority", &self.active.read().is_some())
            .finish()
    }
}

impl CaStore {
    /// A store with no CA; issuance fails until one is installed
    pub fn empty() -> Self {
        Self::default()
    }

    /// A store holding `authority`
    pub fn with_authority(authority: Arc<CertificateAuthority>) -> Self {
        Self {
            active: RwLock::new(Some(authority)),
        }
    }

    /// A store holding a freshly generated in-memory CA
    pub fn ephemeral() -> Result<Self, CaError> {
        let authority = CertificateAuthority::generate()?;
        info!(
            subject = %authority.subject(),
            not_after = %authority.not_after(),
            "generated in-memory CA"
        );
        Ok(Self::with_authority(Arc::new(authority)))
    }

    /// A store loaded from a secret
    pub async fn from_secret(
        reader: &dyn SecretReader,
        secret_ref: &SecretRef,
    ) -> Result<Self, CaError> {
        let store = Self::empty();
        store.load(reader, secret_ref).await?;
        Ok(store)
    }

    /// A store for the configured CA source
    pub async fn initialize(
        source: &CaSource,
        reader: &dyn SecretReader,
    ) -> Result<Self, CaError> {
        match source {
            CaSource::Ephemeral => Self::ephemeral(),
            CaSource::Secret(secret_ref) => Self::from_secret(reader, secret_ref).await,
        }
    }

    /// Fetch the secret and replace the active CA
    ///
    /// The active CA is untouched unless every step succeeds.
    pub async fn load(
        &self,
        reader: &dyn SecretReader,
        secret_ref: &SecretRef,
    ) -> Result<(), CaError> {
        let secret = reader
            .get_secret(&secret_ref.namespace, &secret_ref.name)
            .await?
            .ok_or_else(|| CaError::SecretNotFound(secret_ref.to_string()))?;
        let authority = ca_from_secret(&secret, secret_ref)?;

        info!(
            secret = %secret_ref,
            subject = %authority.subject(),
            not_after = %authority.not_after(),
            "loaded CA from secret"
        );
        self.install(Arc::new(authority));
        Ok(())
    }

    /// Reload after the secret changed, recording the outcome
    ///
    /// Returns whether the active certificate changed.
    pub async fn reload(
        &self,
        reader: &dyn SecretReader,
        secret_ref: &SecretRef,
    ) -> Result<bool, CaError> {
        let before = self.current_certificate_pem();
        let result = self.load(reader, secret_ref).await;
        crate::metrics::record_ca_reload(result.is_ok());
        result?;
        Ok(self.current_certificate_pem() != before)
    }

    /// Swap in a new CA
    pub fn install(&self, authority: Arc<CertificateAuthority>) {
        *self.active.write() = Some(authority);
    }

    /// The active CA, if any
    pub fn snapshot(&self) -> Option<Arc<CertificateAuthority>> {
        self.active.read().clone()
    }

    /// PEM of the active CA certificate
    pub fn current_certificate_pem(&self) -> Option<String> {
        self.snapshot().map(|ca| ca.cert_pem().to_string())
    }
}
