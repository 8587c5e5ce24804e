//! Structured errors shared by the library, scanner, and façade layers.
//!
//! One variant per failure kind; the HTTP layer maps variants to status
//! codes, the CLI prints the display form.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Probe text failed to parse; the message names the offending field.
    #[error("parse error: {0}")]
    Parse(String),

    /// Probe, category, or job not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate id, category, or name.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed path, segment, or request parameter.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Disk failure; the library's in-memory state still matches disk.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Network failure during a scan; local to one (target, probe) pair.
    #[error("network error: {0}")]
    Network(String),

    /// Operation interrupted by cancellation. Expected, not a fault.
    #[error("cancelled")]
    Cancelled,

    /// Unrecoverable internal fault (e.g. a panicked worker).
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
