//! Lease-based leader election
//!
//! Only the replica holding the `coordination.k8s.io/v1` Lease runs the
//! signing controllers. Every write carries the `resourceVersion` that was
//! read, so two replicas racing for an expired lease cannot both win: the
//! loser gets 409 Conflict and goes back to waiting.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);
const FIELD_MANAGER: &str = "pod-cert-signer";

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The lease came back without a resourceVersion
    #[error("lease {0} has no resourceVersion")]
    MissingResourceVersion(String),
}

/// What to do with the lease as currently observed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaseAction {
    /// No lease exists yet
    Create,
    /// We hold it; bump the renew time
    Renew,
    /// Someone else held it but it expired; take it over
    TakeOver {
        /// Transition count recorded on the lease before takeover
        transitions: i32,
    },
    /// Another holder's lease is still live
    Wait,
}

/// Decide how to treat `lease` for `identity` at `now`
///
/// A lease with no holder, no renew time or no duration counts as expired.
pub fn lease_action(lease: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> LeaseAction {
    let Some(lease) = lease else {
        return LeaseAction::Create;
    };
    let spec = lease.spec.as_ref();

    if spec.and_then(|s| s.holder_identity.as_deref()) == Some(identity) {
        return LeaseAction::Renew;
    }

    let holder = spec.and_then(|s| s.holder_identity.as_deref());
    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    let expired = match (holder, renew_time, duration_secs) {
        (Some(_), Some(rt), Some(duration)) => {
            now > rt.0 + chrono::Duration::seconds(i64::from(duration))
        }
        _ => true,
    };

    if expired {
        LeaseAction::TakeOver {
            transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0),
        }
    } else {
        LeaseAction::Wait
    }
}

/// Leader elector backed by a Kubernetes Lease
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
}

impl LeaderElector {
    /// Create an elector with default timing (30s lease, 10s renew, 5s retry)
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
            retry_interval: RETRY_INTERVAL,
        }
    }

    /// Identity written into the lease
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Block until leadership is acquired
    ///
    /// Transient API errors are logged and retried; this never gives up.
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            namespace = %self.namespace,
            "Waiting for leadership"
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    return self.create_guard();
                }
                Ok(false) => {
                    debug!(
                        identity = %self.identity,
                        retry_secs = self.retry_interval.as_secs(),
                        "Lease held by another replica"
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_secs = self.retry_interval.as_secs(),
                        "Failed to acquire lease, retrying"
                    );
                }
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();
        let existing = api.get_opt(&self.lease_name).await?;

        match lease_action(existing.as_ref(), &self.identity, now) {
            LeaseAction::Wait => Ok(false),
            LeaseAction::Create => {
                let lease = self.held_lease(None, now, 0);
                self.write(&api, lease, true).await
            }
            LeaseAction::Renew => {
                // Renewal keeps the existing acquire time and transition count
                let Some(mut lease) = existing else {
                    return Ok(false);
                };
                if lease.metadata.resource_version.is_none() {
                    return Err(LeaderElectionError::MissingResourceVersion(
                        self.lease_name.clone(),
                    ));
                }
                if let Some(spec) = lease.spec.as_mut() {
                    spec.renew_time = Some(MicroTime(now));
                }
                self.write(&api, lease, false).await
            }
            LeaseAction::TakeOver { transitions } => {
                let rv = existing
                    .and_then(|l| l.metadata.resource_version)
                    .ok_or_else(|| {
                        LeaderElectionError::MissingResourceVersion(self.lease_name.clone())
                    })?;
                let lease = self.held_lease(Some(rv), now, transitions + 1);
                let won = self.write(&api, lease, false).await?;
                if won {
                    info!(
                        identity = %self.identity,
                        transitions = transitions + 1,
                        "Took over expired lease"
                    );
                }
                Ok(won)
            }
        }
    }

    fn held_lease(
        &self,
        resource_version: Option<String>,
        now: DateTime<Utc>,
        transitions: i32,
    ) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    /// Create or replace the lease; a 409 means another replica won the race
    async fn write(
        &self,
        api: &Api<Lease>,
        lease: Lease,
        create: bool,
    ) -> Result<bool, LeaderElectionError> {
        let pp = PostParams::default();
        let result = if create {
            api.create(&pp, &lease).await
        } else {
            api.replace(&self.lease_name, &pp, &lease).await
        };

        match result {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "Lease write conflict");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(self.renew_interval).await;

            match self.try_acquire_or_renew().await {
                Ok(true) => debug!(identity = %self.identity, "Lease renewed"),
                Ok(false) => {
                    warn!(identity = %self.identity, "Lease taken by another replica");
                    let _ = lost_tx.send(());
                    return;
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Lease renewal failed");
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }

    /// Clear the holder so a standby can take over without waiting for expiry
    async fn release_lease(&self) -> Result<(), LeaderElectionError> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);

        let Some(lease) = api.get_opt(&self.lease_name).await? else {
            debug!(identity = %self.identity, "Lease not found, nothing to release");
            return Ok(());
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        let patch = json!({
            "metadata": { "resourceVersion": lease.metadata.resource_version },
            "spec": {
                "holderIdentity": null,
                "renewTime": null
            }
        });
        api.patch(
            &self.lease_name,
            &PatchParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..Default::default()
            },
            &Patch::Merge(&patch),
        )
        .await?;

        info!(identity = %self.identity, "Lease released");
        Ok(())
    }
}

/// Held while this replica is the leader
///
/// A background task renews the lease. [`LeaderGuard::lost`] resolves once a
/// renewal fails. Dropping the guard stops renewing.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Give up the lease ahead of shutdown
    pub async fn release(self) -> Result<(), LeaderElectionError> {
        self.renewal_task.abort();
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
        debug!(identity = %self.elector.identity, "Stopped renewing lease");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(holder: Option<&str>, renewed: Option<DateTime<Utc>>, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some("signer-controller".to_string()),
                resource_version: Some("42".to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: holder.map(str::to_string),
                lease_duration_seconds: Some(30),
                renew_time: renewed.map(MicroTime),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_missing_lease_is_created() {
        assert_eq!(lease_action(None, "a", Utc::now()), LeaseAction::Create);
    }

    #[test]
    fn test_own_lease_is_renewed() {
        let now = Utc::now();
        let l = lease(Some("a"), Some(now), 3);
        assert_eq!(lease_action(Some(&l), "a", now), LeaseAction::Renew);
    }

    #[test]
    fn test_live_foreign_lease_waits() {
        let now = Utc::now();
        let l = lease(Some("b"), Some(now - chrono::Duration::seconds(10)), 0);
        assert_eq!(lease_action(Some(&l), "a", now), LeaseAction::Wait);
    }

    #[test]
    fn test_expired_foreign_lease_is_taken_over() {
        let now = Utc::now();
        let l = lease(Some("b"), Some(now - chrono::Duration::seconds(31)), 4);
        assert_eq!(
            lease_action(Some(&l), "a", now),
            LeaseAction::TakeOver { transitions: 4 }
        );
    }

    #[test]
    fn test_released_lease_is_taken_over_immediately() {
        let now = Utc::now();
        let l = lease(None, None, 1);
        assert_eq!(
            lease_action(Some(&l), "a", now),
            LeaseAction::TakeOver { transitions: 1 }
        );
    }

    #[test]
    fn test_lease_without_spec_counts_as_expired() {
        let l = Lease::default();
        assert_eq!(
            lease_action(Some(&l), "a", Utc::now()),
            LeaseAction::TakeOver { transitions: 0 }
        );
    }
}
