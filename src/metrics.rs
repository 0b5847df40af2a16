//! Metrics for signer observability
//!
//! [`SignerMetrics`] owns the OpenTelemetry instruments. The process-wide
//! instance sits on the global meter; until
//! [`crate::telemetry::init_telemetry`] installs an exporting provider its
//! instruments are no-ops.
//!
//! The controller records through the [`MetricsRecorder`] trait so tests can
//! assert exactly what was counted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

#[cfg(test)]
use mockall::automock;

use crate::config::format_duration;

/// Instrumentation scope name
pub const METER_NAME: &str = "pod-cert-signer";

static GLOBAL: Lazy<Arc<SignerMetrics>> =
    Lazy::new(|| Arc::new(SignerMetrics::new(&global::meter(METER_NAME))));

/// How a reconciliation ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileResult {
    /// A certificate was written
    Issued,
    /// Nothing to do (other signer, already signed, gone)
    Skipped,
    /// A failure condition was written
    Failed,
    /// The reconcile returned an error before deciding
    Error,
}

impl ReconcileResult {
    /// Label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issued => "issued",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::Error => "error",
        }
    }
}

/// Sink for reconciliation metrics
#[cfg_attr(test, automock)]
pub trait MetricsRecorder: Send + Sync {
    /// Count an issued certificate with its granted lifetime
    fn record_issued(&self, validity: Duration);

    /// Count a rejected request by reason code
    fn record_failed(&self, reason: &str);

    /// Record how long a reconciliation took
    fn record_reconcile(&self, result: ReconcileResult, elapsed: Duration);
}

/// Attributes of `signer_certificates_issued_total`
pub fn issued_attributes(validity: Duration) -> [KeyValue; 1] {
    [KeyValue::new("validity", format_duration(validity))]
}

/// Attributes of `signer_certificates_failed_total`
pub fn failed_attributes(reason: &str) -> [KeyValue; 1] {
    [KeyValue::new("reason", reason.to_string())]
}

/// Attributes of `signer_ca_reloads_total`
pub fn ca_reload_attributes(success: bool) -> [KeyValue; 1] {
    let result = if success { "success" } else { "error" };
    [KeyValue::new("result", result)]
}

/// OpenTelemetry instruments for the signer
pub struct SignerMetrics {
    /// `signer_certificates_issued_total{validity}`
    certificates_issued: Counter<u64>,
    /// `signer_certificates_failed_total{reason}`
    certificates_failed: Counter<u64>,
    /// `signer_reconciliation_duration_seconds{result}`
    reconcile_duration: Histogram<f64>,
    /// `signer_ca_reloads_total{result}`
    ca_reloads: Counter<u64>,
}

impl SignerMetrics {
    /// Build the instruments on `meter`
    pub fn new(meter: &Meter) -> Self {
        Self {
            certificates_issued: meter
                .u64_counter("signer_certificates_issued_total")
                .with_description("The total number of certificates issued")
                .with_unit("{certificates}")
                .build(),
            certificates_failed: meter
                .u64_counter("signer_certificates_failed_total")
                .with_description("The total number of failed certificate requests")
                .with_unit("{requests}")
                .build(),
            reconcile_duration: meter
                .f64_histogram("signer_reconciliation_duration_seconds")
                .with_description("Duration of reconciliation operations in seconds")
                .with_unit("s")
                .build(),
            ca_reloads: meter
                .u64_counter("signer_ca_reloads_total")
                .with_description("The total number of CA reloads triggered by secret changes")
                .with_unit("{reloads}")
                .build(),
        }
    }

    /// The process-wide instance on the global meter
    pub fn global() -> Arc<Self> {
        GLOBAL.clone()
    }

    /// Count a CA reload attempt
    pub fn record_ca_reload(&self, success: bool) {
        self.ca_reloads.add(1, &ca_reload_attributes(success));
    }
}

impl MetricsRecorder for SignerMetrics {
    fn record_issued(&self, validity: Duration) {
        self.certificates_issued.add(1, &issued_attributes(validity));
    }

    fn record_failed(&self, reason: &str) {
        self.certificates_failed.add(1, &failed_attributes(reason));
    }

    fn record_reconcile(&self, result: ReconcileResult, elapsed: Duration) {
        self.reconcile_duration.record(
            elapsed.as_secs_f64(),
            &[KeyValue::new("result", result.as_str())],
        );
    }
}

/// Times one reconciliation
pub struct ReconcileTimer {
    start: Instant,
}

impl ReconcileTimer {
    /// Start timing a reconciliation
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Record the duration with its outcome
    pub fn finish(self, metrics: &dyn MetricsRecorder, result: ReconcileResult) {
        metrics.record_reconcile(result, self.start.elapsed());
    }
}

/// Count a CA reload attempt on the global instruments
pub fn record_ca_reload(success: bool) {
    GLOBAL.record_ca_reload(success);
}
