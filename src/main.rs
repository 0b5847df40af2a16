//! Pod certificate signer - answers PodCertificateRequests with certificates
//! from a managed CA

use std::future::Future;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use futures::StreamExt;
use kube::runtime::controller::{Action, Config as ControllerConfig};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use pod_cert_signer::config::{CaSource, SignerConfig};
use pod_cert_signer::controller::{
    error_policy, reconcile, run_secret_watcher, Context, KubeCertificateRequestClient,
};
use pod_cert_signer::crd::PodCertificateRequest;
use pod_cert_signer::health;
use pod_cert_signer::leader_election::LeaderElector;
use pod_cert_signer::pki::{CaStore, KubeSecretReader, SigningPolicy};
use pod_cert_signer::retry::{retry_with_backoff, RetryConfig};
use pod_cert_signer::telemetry::{init_telemetry, TelemetryConfig};

/// Watcher timeout (seconds); must stay below the client read timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Attempts at loading the CA before giving up on this leadership term
const CA_LOAD_ATTEMPTS: u32 = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let config = SignerConfig::parse();

    init_telemetry(&TelemetryConfig {
        service_name: "pod-cert-signer".to_string(),
        log_level: config.log_level.clone(),
        otlp_endpoint: config.otlp_endpoint.clone(),
    })
    .context("failed to initialize telemetry")?;

    let health_addr = config.health_addr()?;
    health::serve(health_addr)
        .await
        .with_context(|| format!("failed to bind health server on {}", health_addr))?;

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let policy = config.signing_policy();
    info!(
        signer = %config.signer_name,
        validity = ?policy.cert_validity,
        refresh_before = ?policy.cert_refresh_before,
        verify_pop = policy.verify_proof_of_possession,
        leader_election = config.leader_election,
        "Starting pod certificate signer"
    );

    if !config.leader_election {
        return run_signer(client, &config, &policy).await;
    }

    let elector = Arc::new(LeaderElector::new(
        client.clone(),
        &config.leader_election_id,
        &config.lease_namespace(),
        &config.identity(),
    ));

    let shutdown = shutdown_signal().context("failed to install signal handlers")?;
    tokio::pin!(shutdown);

    loop {
        let mut guard = tokio::select! {
            guard = elector.clone().acquire() => guard,
            received = &mut shutdown => {
                info!(signal = ?received, "Shutdown requested while waiting for leadership");
                return Ok(());
            }
        };

        let finished = tokio::select! {
            result = run_signer(client.clone(), &config, &policy) => Some(result),
            _ = guard.lost() => None,
        };

        match finished {
            Some(result) => {
                if let Err(e) = guard.release().await {
                    warn!(error = %e, "Failed to release lease");
                }
                info!("Pod certificate signer shutting down");
                return result;
            }
            None => {
                warn!(
                    identity = %elector.identity(),
                    "Leadership lost, stopping controllers"
                );
            }
        }
    }
}

/// Load the CA and run the controllers until shutdown
///
/// Each leadership term starts from a fresh CA store so a new leader never
/// signs with state left over from a previous term.
async fn run_signer(
    client: Client,
    config: &SignerConfig,
    policy: &SigningPolicy,
) -> anyhow::Result<()> {
    let source = config.ca_source();
    let reader = KubeSecretReader::new(client.clone());
    let store = retry_with_backoff(
        &RetryConfig::with_max_attempts(CA_LOAD_ATTEMPTS),
        "initialize_ca",
        || CaStore::initialize(&source, &reader),
    )
    .await
    .context("failed to initialize certificate authority")?;
    let store = Arc::new(store);

    let ctx = Arc::new(
        Context::builder(
            Arc::new(KubeCertificateRequestClient::new(client.clone())),
            store.clone(),
        )
        .signer_name(config.signer_name.clone())
        .policy(policy.clone())
        .build(),
    );

    let requests: Api<PodCertificateRequest> = Api::all(client.clone());
    let controller = Controller::new(
        requests,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .with_config(ControllerConfig::default().concurrency(config.max_concurrent_reconciles))
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(log_reconcile_result);

    info!(
        concurrency = config.max_concurrent_reconciles,
        "PodCertificateRequest controller started"
    );

    match source {
        CaSource::Secret(secret_ref) => {
            tokio::select! {
                _ = controller => {}
                _ = run_secret_watcher(client, store, secret_ref) => {
                    error!("CA secret watch ended unexpectedly");
                }
            }
        }
        CaSource::Ephemeral => controller.await,
    }

    Ok(())
}

/// Signal that ended the process
#[derive(Debug, PartialEq, Eq)]
enum ShutdownSignal {
    Interrupt,
    Terminate,
}

/// Resolves on SIGINT or SIGTERM
///
/// The SIGTERM handler is installed before this returns, so a termination
/// sent afterwards is never missed.
fn shutdown_signal() -> std::io::Result<impl Future<Output = ShutdownSignal>> {
    let mut terminate = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            Ok(()) = tokio::signal::ctrl_c() => ShutdownSignal::Interrupt,
            Some(()) = terminate.recv() => ShutdownSignal::Terminate,
            else => std::future::pending::<ShutdownSignal>().await,
        }
    })
}

fn log_reconcile_result(
    result: Result<
        (ObjectRef<PodCertificateRequest>, Action),
        kube::runtime::controller::Error<pod_cert_signer::Error, kube::runtime::watcher::Error>,
    >,
) -> std::future::Ready<()> {
    match result {
        Ok((object, action)) => {
            tracing::debug!(request = %object, ?action, "reconciliation completed")
        }
        Err(e) => tracing::debug!(error = %e, "reconciliation error"),
    }
    std::future::ready(())
}
