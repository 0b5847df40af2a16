//! Process configuration
//!
//! Every setting is a command-line flag with an environment-variable
//! fallback, so the same binary works from a Deployment manifest (env) and
//! from a shell (flags).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::{ArgAction, Parser};
use rand::Rng;

use crate::pki::SigningPolicy;
use crate::{Error, Result};

/// Default signer name when none is configured
pub const DEFAULT_SIGNER_NAME: &str = "pod-cert-signer.dev/signer";

/// Signer configuration
#[derive(Parser, Debug, Clone)]
#[command(name = "pod-cert-signer", version, about, long_about = None)]
pub struct SignerConfig {
    /// Signer name this process is responsible for
    #[arg(long, env = "SIGNER_NAME", default_value = DEFAULT_SIGNER_NAME)]
    pub signer_name: String,

    /// Requested lifetime of issued certificates (floored at 1h)
    #[arg(long, env = "CERT_VALIDITY", default_value = "1h", value_parser = parse_duration)]
    pub cert_validity: Duration,

    /// How long before expiry holders should start refreshing (floored at 30m)
    #[arg(long, env = "CERT_REFRESH_BEFORE", default_value = "30m", value_parser = parse_duration)]
    pub cert_refresh_before: Duration,

    /// Verify the proof-of-possession signature on each request
    #[arg(
        long,
        env = "VERIFY_PROOF_OF_POSSESSION",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub verify_proof_of_possession: bool,

    /// Secret holding the CA certificate and key; empty generates an in-memory CA
    #[arg(long, env = "CA_SECRET_NAME", default_value = "")]
    pub ca_secret_name: String,

    /// Namespace of the CA secret; empty means the pod namespace
    #[arg(long, env = "CA_SECRET_NAMESPACE", default_value = "")]
    pub ca_secret_namespace: String,

    /// Data key of the CA certificate inside the secret
    #[arg(long, env = "CA_CERT_KEY", default_value = "ca.crt")]
    pub ca_cert_key: String,

    /// Data key of the CA private key inside the secret
    #[arg(long, env = "CA_KEY_KEY", default_value = "ca.key")]
    pub ca_key_key: String,

    /// Only run the controllers while holding the leader lease
    #[arg(
        long,
        env = "LEADER_ELECTION",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub leader_election: bool,

    /// Name of the Lease used for leader election
    #[arg(long, env = "LEADER_ELECTION_ID", default_value = "signer-controller")]
    pub leader_election_id: String,

    /// Namespace of the Lease; empty means the pod namespace
    #[arg(long, env = "LEADER_ELECTION_NAMESPACE", default_value = "")]
    pub leader_election_namespace: String,

    /// Address for the /healthz and /readyz endpoints
    #[arg(long, env = "HEALTH_PROBE_BIND_ADDRESS", default_value = ":8081")]
    pub health_probe_bind_address: String,

    /// Upper bound on concurrently running reconciliations
    #[arg(long, env = "MAX_CONCURRENT_RECONCILES", default_value_t = 4)]
    pub max_concurrent_reconciles: u16,

    /// Log level used when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// OTLP gRPC endpoint for metrics export; unset disables export
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Namespace this pod runs in (downward API)
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    pub pod_namespace: String,

    /// Name of this pod (downward API), used as the leader identity
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,
}

/// Location of the CA material inside a Secret
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretRef {
    /// Secret namespace
    pub namespace: String,
    /// Secret name
    pub name: String,
    /// Data key holding the PEM certificate
    pub cert_key: String,
    /// Data key holding the PEM private key
    pub key_key: String,
}

impl std::fmt::Display for SecretRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Where the CA comes from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaSource {
    /// Generated at startup, kept in memory only
    Ephemeral,
    /// Loaded from a Secret and reloaded when it changes
    Secret(SecretRef),
}

impl SignerConfig {
    /// Resolve the CA source from the secret settings
    pub fn ca_source(&self) -> CaSource {
        if self.ca_secret_name.is_empty() {
            return CaSource::Ephemeral;
        }
        CaSource::Secret(SecretRef {
            namespace: or_pod_namespace(&self.ca_secret_namespace, &self.pod_namespace),
            name: self.ca_secret_name.clone(),
            cert_key: self.ca_cert_key.clone(),
            key_key: self.ca_key_key.clone(),
        })
    }

    /// Namespace of the leader-election Lease
    pub fn lease_namespace(&self) -> String {
        or_pod_namespace(&self.leader_election_namespace, &self.pod_namespace)
    }

    /// Identity used when holding the lease
    pub fn identity(&self) -> String {
        if let Some(name) = self.pod_name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        match std::env::var("HOSTNAME") {
            Ok(host) if !host.is_empty() => host,
            _ => format!(
                "pod-cert-signer-{:08x}",
                rand::thread_rng().gen::<u32>()
            ),
        }
    }

    /// Signing policy with floors applied
    pub fn signing_policy(&self) -> SigningPolicy {
        SigningPolicy::new(
            self.cert_validity,
            self.cert_refresh_before,
            self.verify_proof_of_possession,
        )
    }

    /// Socket address for the health server
    pub fn health_addr(&self) -> Result<SocketAddr> {
        parse_bind_address(&self.health_probe_bind_address)
    }
}

fn or_pod_namespace(configured: &str, pod_namespace: &str) -> String {
    if configured.is_empty() {
        pod_namespace.to_string()
    } else {
        configured.to_string()
    }
}

/// Parse a bind address, accepting the `:port` shorthand for all interfaces
pub fn parse_bind_address(addr: &str) -> Result<SocketAddr> {
    let addr = addr.trim();
    if let Some(port) = addr.strip_prefix(':') {
        let port: u16 = port
            .parse()
            .map_err(|_| Error::configuration(format!("invalid port in '{}'", addr)))?;
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    addr.parse()
        .map_err(|_| Error::configuration(format!("invalid bind address '{}'", addr)))
}

/// Parse a duration such as `1h`, `30m`, `90s`, `1h30m` or bare seconds
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let invalid = || {
        Error::configuration(format!(
            "invalid duration '{}', expected e.g. 1h, 30m, 3600s",
            s
        ))
    };

    if s.is_empty() {
        return Err(invalid());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let n: u64 = digits.parse().map_err(|_| invalid())?;
        digits.clear();
        let unit = match c {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => return Err(invalid()),
        };
        total = n
            .checked_mul(unit)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(invalid)?;
    }
    if !digits.is_empty() {
        return Err(invalid());
    }
    Ok(Duration::from_secs(total))
}

/// Render a duration compactly, e.g. `1h`, `30m`, `1h30m`, `45s`
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs == 0 {
        return "0s".to_string();
    }
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{}h", h));
    }
    if m > 0 {
        out.push_str(&format!("{}m", m));
    }
    if s > 0 {
        out.push_str(&format!("{}s", s));
    }
    out
}
