//! Prometheus metrics for the CSI driver.
//!
//! Tracks CSI operation outcomes, VMS session health, and mount-shim
//! activity, not agent connectivity — this process has no sidecar.

use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: Total number of CSI operations by type and status
    pub const CSI_OPERATIONS_TOTAL: &str = "csi_operations_total";
    /// Histogram: Duration of CSI operations in seconds
    pub const CSI_OPERATION_DURATION_SECONDS: &str = "csi_operation_duration_seconds";
    /// Gauge: VMS session reachability (1 = last call succeeded, 0 = failed)
    pub const CSI_VMS_SESSION_UP: &str = "csi_vms_session_up";
    /// Counter: Number of VMS auth-token refresh attempts
    pub const CSI_VMS_TOKEN_REFRESH_TOTAL: &str = "csi_vms_token_refresh_total";
    /// Gauge: Number of client-side mounts currently held by this node
    pub const CSI_MOUNTS_ACTIVE: &str = "csi_mounts_active";
    /// Counter: Number of retried operations
    pub const CSI_RETRIES_TOTAL: &str = "csi_retries_total";
}

/// Start an HTTP server on `addr` (`host:port`) serving metrics at `/metrics`.
pub fn init_metrics(addr: &str) -> anyhow::Result<()> {
    let socket_addr: std::net::SocketAddr = addr.parse()?;
    PrometheusBuilder::new().with_http_listener(socket_addr).install()?;

    info!("metrics server listening on http://{socket_addr}/metrics");
    Ok(())
}

/// Record a CSI operation with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::CSI_OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::CSI_OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

/// Record whether the last VMS request succeeded
pub fn set_vms_session_up(up: bool) {
    gauge!(names::CSI_VMS_SESSION_UP).set(if up { 1.0 } else { 0.0 });
}

/// Record a VMS auth-token refresh attempt
pub fn record_token_refresh(success: bool) {
    counter!(names::CSI_VMS_TOKEN_REFRESH_TOTAL, "success" => success.to_string()).increment(1);
}

/// Adjust the active client-side mount gauge by `delta` (+1 on publish, -1 on unpublish)
pub fn adjust_mounts_active(delta: f64) {
    gauge!(names::CSI_MOUNTS_ACTIVE).increment(delta);
}

/// Record a retry attempt
pub fn record_retry(operation: &str) {
    counter!(names::CSI_RETRIES_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Helper for timing operations
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    /// Start timing an operation
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    /// Complete the operation with success
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(&self.operation, "success", duration);
    }

    /// Complete the operation with failure
    pub fn failure(self, error_code: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(&self.operation, error_code, duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_timer_does_not_panic_without_exporter_installed() {
        let timer = OperationTimer::new("test_operation");
        std::thread::sleep(std::time::Duration::from_millis(5));
        timer.success();
    }
}
