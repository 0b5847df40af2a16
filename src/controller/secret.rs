//! CA secret watcher
//!
//! Watches the single Secret holding the CA and reloads the [`CaStore`] when
//! it changes. A reload that fails keeps the previous CA.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::config::SecretRef;
use crate::pki::{CaStore, KubeSecretReader};

const WATCH_TIMEOUT_SECS: u32 = 25;
const WATCH_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Instruction produced by a watch event
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReloadCommand {
    /// Version of the secret that triggered the reload
    pub resource_version: Option<String>,
}

/// Map a watch event to a reload, if it calls for one
///
/// Only applies of the configured secret reload. Deletes keep the current CA
/// since signing with it is still valid; the next apply replaces it.
pub fn secret_event_command(event: &Event<Secret>, secret_ref: &SecretRef) -> Option<ReloadCommand> {
    match event {
        Event::Apply(secret) | Event::InitApply(secret) => {
            let matches = secret.name_any() == secret_ref.name
                && secret.namespace().as_deref() == Some(secret_ref.namespace.as_str());
            matches.then(|| ReloadCommand {
                resource_version: secret.resource_version(),
            })
        }
        Event::Delete(_) | Event::Init | Event::InitDone => None,
    }
}

/// Watch the CA secret and reload `store` on change; runs until the stream ends
pub async fn run_secret_watcher(client: Client, store: Arc<CaStore>, secret_ref: SecretRef) {
    let api: Api<Secret> = Api::namespaced(client.clone(), &secret_ref.namespace);
    let reader = KubeSecretReader::new(client);
    let config = watcher::Config::default()
        .fields(&format!("metadata.name={}", secret_ref.name))
        .timeout(WATCH_TIMEOUT_SECS);
    let mut events = std::pin::pin!(watcher::watcher(api, config));

    info!(secret = %secret_ref, "Watching CA secret");

    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                if let Event::Delete(_) = event {
                    warn!(secret = %secret_ref, "CA secret deleted, keeping current CA");
                    continue;
                }
                let Some(command) = secret_event_command(&event, &secret_ref) else {
                    continue;
                };
                debug!(
                    secret = %secret_ref,
                    resource_version = ?command.resource_version,
                    "CA secret changed"
                );
                match store.reload(&reader, &secret_ref).await {
                    Ok(true) => info!(secret = %secret_ref, "CA certificate rotated"),
                    Ok(false) => debug!(secret = %secret_ref, "CA certificate unchanged"),
                    Err(e) => error!(
                        secret = %secret_ref,
                        error = %e,
                        "CA reload failed, keeping previous CA"
                    ),
                }
            }
            Err(e) => {
                warn!(error = %e, secret = %secret_ref, "CA secret watch error, will retry");
                tokio::time::sleep(WATCH_ERROR_BACKOFF).await;
            }
        }
    }
}
