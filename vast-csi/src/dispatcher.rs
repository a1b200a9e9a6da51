//! Per-RPC instrumentation: argument validation, structured logging, and
//! uniform error-to-status mapping. Every handler method calls
//! [`require_fields`] first, then runs its business logic through
//! [`instrument`] so each RPC produces one audit-trail log line regardless
//! of outcome.

use std::future::Future;

use tonic::{Code, Response, Status};
use tracing::{debug, error, info};

use crate::error::DriverError;

/// RPCs logged at DEBUG instead of INFO — high-frequency, low-signal calls.
pub const SILENCED: &[&str] = &["Probe", "NodeGetCapabilities"];

/// Check that every named required field is present; otherwise abort with
/// `INVALID_ARGUMENT` and a message naming every missing field, sorted.
pub fn require_fields(fields: &[(&str, bool)]) -> Result<(), DriverError> {
    let mut missing: Vec<&str> = fields.iter().filter(|(_, present)| !present).map(|(name, _)| *name).collect();
    if missing.is_empty() {
        return Ok(());
    }
    missing.sort_unstable();
    Err(DriverError::MissingFields(missing.join(", ")))
}

/// Map a handler outcome to a gRPC status, logging the request/response
/// pair with the method name for auditing.
pub async fn instrument<T, F>(method: &str, params: &str, fut: F) -> Result<Response<T>, Status>
where
    F: Future<Output = Result<T, DriverError>>,
    T: std::fmt::Debug,
{
    let silenced = SILENCED.contains(&method);
    if silenced {
        debug!(rpc = method, params, "handling request");
    } else {
        info!(rpc = method, params, "handling request");
    }

    match fut.await {
        Ok(response) => {
            if silenced {
                debug!(rpc = method, response = ?response, "request completed");
            } else {
                info!(rpc = method, response = ?response, "request completed");
            }
            Ok(Response::new(response))
        }
        Err(err) => {
            let status = map_error(method, err);
            error!(rpc = method, code = ?status.code(), message = status.message(), "request failed");
            Err(status)
        }
    }
}

/// Translate a `DriverError` into the gRPC status the dispatcher contract
/// requires, folding the RPC name into VMS HTTP error messages.
pub fn map_error(method: &str, err: DriverError) -> Status {
    match err {
        DriverError::MissingFields(fields) => {
            Status::new(Code::InvalidArgument, format!("Missing required fields: {fields}"))
        }
        DriverError::InvalidArgument(msg) => Status::new(Code::InvalidArgument, msg),
        DriverError::VolumeAlreadyExists(msg) => Status::new(Code::AlreadyExists, msg),
        DriverError::SourceNotFound(msg) => Status::new(Code::NotFound, msg),
        DriverError::NotFound(msg) => Status::new(Code::NotFound, msg),
        DriverError::MountFailed(msg) => Status::new(Code::Unknown, msg),
        DriverError::Aborted(msg) => Status::new(Code::Aborted, msg),
        DriverError::OutOfRange(msg) => Status::new(Code::OutOfRange, msg),
        DriverError::FailedPrecondition(msg) => Status::new(Code::FailedPrecondition, msg),
        DriverError::Api(api) => Status::new(Code::Unknown, format!("[{method}]. {api}")),
        DriverError::Other(err) => Status::new(Code::Unknown, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_fields_passes_when_all_present() {
        assert!(require_fields(&[("name", true), ("volume_id", true)]).is_ok());
    }

    #[test]
    fn require_fields_reports_sorted_missing_names() {
        let err = require_fields(&[("volume_id", false), ("name", false), ("ok", true)]).unwrap_err();
        match err {
            DriverError::MissingFields(msg) => assert_eq!(msg, "name, volume_id"),
            _ => panic!("expected MissingFields"),
        }
    }

    #[test]
    fn map_error_formats_api_error_with_method() {
        use crate::error::ApiError;
        let err = DriverError::Api(ApiError {
            status: 503,
            reason: "Service Unavailable".to_string(),
            body: "maintenance\nmore".to_string(),
            url: "https://vms/quotas".to_string(),
        });
        let status = map_error("CreateVolume", err);
        assert_eq!(status.code(), Code::Unknown);
        assert!(status.message().starts_with("[CreateVolume]."));
        assert!(status.message().contains("maintenance"));
    }
}
