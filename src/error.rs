//! Crate-wide error taxonomy.
//!
//! Mirrors the kinds the device-side protocol can report (timeouts, protocol
//! violations, pool exhaustion, ...) as one flat enum rather than a
//! per-subsystem error hierarchy, since this crate targets `std` and can
//! lean on `thiserror` directly.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration or argument: {0}")]
    ConfigInvalid(&'static str),

    #[error("device busy: {0}")]
    DeviceBusy(&'static str),

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("mapping failed: {0}")]
    MappingFailed(&'static str),

    #[error("operation timed out after {0:?}")]
    TimedOut(std::time::Duration),

    #[error("protocol error: {0}")]
    ProtocolError(&'static str),

    #[error("device gone (vendor/device id mismatch)")]
    DeviceGone,

    #[error("reset did not complete: device not back in Boot mode")]
    ResetIncomplete,

    #[error("no space: {0}")]
    NoSpace(&'static str),

    #[error("permission denied: {0}")]
    PermissionDenied(&'static str),

    #[error("I/O error: {0}")]
    IoError(&'static str),
}

/// Common return shape for operations that either succeed with a value or
/// fail with one of the kinds above.
pub type CanFail<T> = Result<T, Error>;
