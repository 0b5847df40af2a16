//! PodCertificateRequest signing controller
//!
//! Every reconciliation re-reads its request, ignores requests for other
//! signers and requests that already carry a chain, and otherwise issues a
//! certificate and writes the outcome to the status subresource.
//!
//! Outcomes:
//! - signed: `certificateChain`, `notBefore`, `beginRefreshAt`, `notAfter` and
//!   `Issued=True`
//! - rejected: `Issued=False` with the failure reason; the error goes back to
//!   the runtime so [`error_policy`] picks the requeue delay

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kube::api::{Api, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{
    Condition, ConditionStatus, PodCertificateRequest, PodCertificateRequestStatus,
    ISSUED_CONDITION,
};
use crate::metrics::{MetricsRecorder, ReconcileResult, ReconcileTimer, SignerMetrics};
use crate::pki::{issue, CaStore, IssueError, IssuedCertificate, SigningPolicy};
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::Error;

/// Condition reason written on success
pub const ISSUED_REASON: &str = "Issued";

const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);
const INVALID_REQUEST_REQUEUE: Duration = Duration::from_secs(60);
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Access to PodCertificateRequests, mockable in tests
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CertificateRequestClient: Send + Sync {
    /// Fetch a request, `None` if it no longer exists
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PodCertificateRequest>, Error>;

    /// Replace the status of `request`, guarded by its resourceVersion
    ///
    /// A stale resourceVersion yields [`Error::Conflict`].
    async fn replace_status(
        &self,
        request: &PodCertificateRequest,
    ) -> Result<PodCertificateRequest, Error>;
}

/// [`CertificateRequestClient`] backed by the Kubernetes API
pub struct KubeCertificateRequestClient {
    client: Client,
}

impl KubeCertificateRequestClient {
    /// Create a new client wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CertificateRequestClient for KubeCertificateRequestClient {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PodCertificateRequest>, Error> {
        let api: Api<PodCertificateRequest> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn replace_status(
        &self,
        request: &PodCertificateRequest,
    ) -> Result<PodCertificateRequest, Error> {
        let namespace = request.namespace().unwrap_or_default();
        let api: Api<PodCertificateRequest> = Api::namespaced(self.client.clone(), &namespace);
        let body = serde_json::to_vec(request).map_err(kube::Error::SerdeError)?;

        match api
            .replace_status(&request.name_any(), &PostParams::default(), body)
            .await
        {
            Ok(updated) => Ok(updated),
            Err(kube::Error::Api(e)) if e.code == 409 => Err(Error::conflict(e.message)),
            Err(e) => Err(e.into()),
        }
    }
}

/// Shared state for reconciliations
pub struct Context {
    /// Request access (trait object for testability)
    pub client: Arc<dyn CertificateRequestClient>,
    /// Active certificate authority
    pub ca: Arc<CaStore>,
    /// Only requests naming this signer are handled
    pub signer_name: String,
    /// Validity and proof-of-possession policy
    pub policy: SigningPolicy,
    /// Backoff for status writes that hit a conflict
    pub retry: RetryConfig,
    /// Issued/failed counters and reconcile timings
    pub metrics: Arc<dyn MetricsRecorder>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Arc<dyn CertificateRequestClient>, ca: Arc<CaStore>) -> ContextBuilder {
        ContextBuilder::new(client, ca)
    }
}

/// Builder for [`Context`]
///
/// ```ignore
/// let ctx = Context::builder(Arc::new(KubeCertificateRequestClient::new(client)), store)
///     .signer_name("example.com/signer")
///     .policy(config.signing_policy())
///     .build();
/// ```
pub struct ContextBuilder {
    client: Arc<dyn CertificateRequestClient>,
    ca: Arc<CaStore>,
    signer_name: String,
    policy: SigningPolicy,
    retry: RetryConfig,
    metrics: Arc<dyn MetricsRecorder>,
}

impl ContextBuilder {
    fn new(client: Arc<dyn CertificateRequestClient>, ca: Arc<CaStore>) -> Self {
        Self {
            client,
            ca,
            signer_name: crate::config::DEFAULT_SIGNER_NAME.to_string(),
            policy: SigningPolicy::default(),
            retry: RetryConfig::conflict(),
            metrics: SignerMetrics::global(),
        }
    }

    /// Set the signer name this controller answers to
    pub fn signer_name(mut self, signer_name: impl Into<String>) -> Self {
        self.signer_name = signer_name.into();
        self
    }

    /// Set the signing policy
    pub fn policy(mut self, policy: SigningPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Override the conflict retry (primarily for testing)
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Override the metrics sink (primarily for testing)
    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            client: self.client,
            ca: self.ca,
            signer_name: self.signer_name,
            policy: self.policy,
            retry: self.retry,
            metrics: self.metrics,
        }
    }
}

/// Status change decided by a reconciliation
enum StatusUpdate {
    Issued(IssuedCertificate),
    Failed(Condition),
}

impl StatusUpdate {
    /// New status, or `None` when the current one already says the same thing
    fn apply(
        &self,
        current: Option<PodCertificateRequestStatus>,
        generation: Option<i64>,
    ) -> Option<PodCertificateRequestStatus> {
        let mut status = current.unwrap_or_default();
        match self {
            Self::Issued(cert) => {
                status.certificate_chain = Some(cert.certificate_pem.clone());
                status.not_before = Some(cert.timing.not_before);
                status.begin_refresh_at = Some(cert.timing.begin_refresh_at);
                status.not_after = Some(cert.timing.not_after);
                status.set_issued_condition(
                    Condition::new(
                        ISSUED_CONDITION,
                        ConditionStatus::True,
                        ISSUED_REASON,
                        format!("certificate issued for {}", cert.dns_name),
                    )
                    .with_observed_generation(generation),
                );
            }
            Self::Failed(condition) => {
                if status
                    .issued_condition()
                    .is_some_and(|existing| existing.same_outcome(condition))
                {
                    return None;
                }
                status.set_issued_condition(
                    condition.clone().with_observed_generation(generation),
                );
            }
        }
        Some(status)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum WriteOutcome {
    Written,
    Unchanged,
    Abandoned,
}

enum Outcome {
    Skipped,
    Issued,
    Failed(IssueError),
}

/// Reconcile a PodCertificateRequest
#[instrument(
    skip(request, ctx),
    fields(
        request = %request.name_any(),
        namespace = %request.namespace().unwrap_or_default()
    )
)]
pub async fn reconcile(
    request: Arc<PodCertificateRequest>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let timer = ReconcileTimer::start();

    let metrics = ctx.metrics.as_ref();

    match reconcile_request(&request, &ctx).await {
        Ok(Outcome::Skipped) => {
            timer.finish(metrics, ReconcileResult::Skipped);
            Ok(Action::await_change())
        }
        Ok(Outcome::Issued) => {
            timer.finish(metrics, ReconcileResult::Issued);
            Ok(Action::await_change())
        }
        Ok(Outcome::Failed(e)) => {
            timer.finish(metrics, ReconcileResult::Failed);
            Err(e.into())
        }
        Err(e) => {
            timer.finish(metrics, ReconcileResult::Error);
            Err(e)
        }
    }
}

async fn reconcile_request(
    request: &PodCertificateRequest,
    ctx: &Context,
) -> Result<Outcome, Error> {
    let namespace = request.namespace().unwrap_or_default();
    let name = request.name_any();

    let Some(fresh) = ctx.client.get(&namespace, &name).await? else {
        debug!("request no longer exists");
        return Ok(Outcome::Skipped);
    };

    if fresh.spec.signer_name != ctx.signer_name {
        return Ok(Outcome::Skipped);
    }
    if fresh.is_issued() {
        debug!("request already signed");
        return Ok(Outcome::Skipped);
    }

    match issue(&fresh.spec, &ctx.ca, &ctx.policy, Utc::now()) {
        Ok(cert) => {
            let validity = cert.timing.validity;
            let not_after = cert.timing.not_after;
            let key_algorithm = cert.key_algorithm;
            let outcome =
                write_status(ctx, &namespace, &name, fresh, StatusUpdate::Issued(cert)).await?;

            if outcome == WriteOutcome::Written {
                ctx.metrics.record_issued(validity);
                info!(
                    pod = %request.spec.pod_name,
                    key_algorithm,
                    %not_after,
                    "certificate issued"
                );
                Ok(Outcome::Issued)
            } else {
                Ok(Outcome::Skipped)
            }
        }
        Err(e) => {
            warn!(pod = %request.spec.pod_name, reason = e.reason(), error = %e, "request rejected");

            let condition = Condition::new(
                ISSUED_CONDITION,
                ConditionStatus::False,
                e.reason(),
                e.to_string(),
            );
            let outcome =
                write_status(ctx, &namespace, &name, fresh, StatusUpdate::Failed(condition))
                    .await?;
            match outcome {
                WriteOutcome::Abandoned => return Ok(Outcome::Skipped),
                WriteOutcome::Unchanged => debug!("failure condition already recorded"),
                WriteOutcome::Written => {}
            }
            ctx.metrics.record_failed(e.reason());
            Ok(Outcome::Failed(e))
        }
    }
}

/// Read-modify-write of the status, retried on conflict
///
/// The first attempt uses `fresh`; retries re-read the request and give up
/// quietly if it is gone or was signed in the meantime.
async fn write_status(
    ctx: &Context,
    namespace: &str,
    name: &str,
    fresh: PodCertificateRequest,
    update: StatusUpdate,
) -> Result<WriteOutcome, Error> {
    let mut first = Some(fresh);
    let update = &update;

    let result = retry_on_conflict(&ctx.retry, "write_status", Error::is_conflict, || {
        let cached = first.take();
        async move {
            let mut current = match cached {
                Some(request) => request,
                None => match ctx.client.get(namespace, name).await? {
                    Some(request) => request,
                    None => return Ok(WriteOutcome::Abandoned),
                },
            };

            if current.spec.signer_name != ctx.signer_name || current.is_issued() {
                return Ok(WriteOutcome::Abandoned);
            }

            let generation = current.metadata.generation;
            let Some(status) = update.apply(current.status.take(), generation) else {
                return Ok(WriteOutcome::Unchanged);
            };
            current.status = Some(status);
            ctx.client.replace_status(&current).await?;
            Ok::<_, Error>(WriteOutcome::Written)
        }
    })
    .await;

    match result {
        Err(e) if e.is_conflict() => Err(Error::conflict(format!(
            "status of {}/{} kept changing: {}",
            namespace, name, e
        ))),
        other => other,
    }
}

/// Requeue delay after a failed reconciliation
pub fn error_policy(
    request: Arc<PodCertificateRequest>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    let name = request.name_any();

    if error.is_conflict() {
        debug!(request = %name, %error, "status write conflict");
        Action::requeue(CONFLICT_REQUEUE)
    } else if error.is_request_invalid() {
        info!(request = %name, reason = error.reason(), "request rejected");
        Action::requeue(INVALID_REQUEST_REQUEUE)
    } else {
        error!(?error, request = %name, "reconciliation failed");
        Action::requeue(ERROR_REQUEUE)
    }
}
