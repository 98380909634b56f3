//! Status codes returned across the DDI boundary and the internal error type
//!
//! Internal helpers return [`Result`]; the first failure in a sequence is
//! propagated unchanged with `?` and converted to a [`StatusCode`] only at the
//! entry points.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Exhaustive status returned by every entry point.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Success = 0,
    Failed,
    IncorrectVersion,
    IncorrectParameter,
    IncorrectSlot,
    IncorrectObject,
    InsufficientSpace,
    NotImplemented,
    NotSupported,
    NotInitialized,
    NullPointer,
    OutOfMemory,
    UnknownGen,

    // Report quality. Carried as flags inside successfully returned reports.
    ReportNotReady,
    ReportLost,
    ReportInconsistent,
    ReportContextSwitchLost,
    ReportWithoutWorkload,
    ReportWithEmptyConfiguration,
    ContextMismatch,
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Internal error type. Every variant maps onto exactly one non-success status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("incorrect parameter: {0}")]
    IncorrectParameter(String),

    #[error("slots {first}..{} exceed the {available} available", .first + .count)]
    IncorrectSlot {
        first: u32,
        count: u32,
        available: u32,
    },

    #[error("handle does not refer to a live {0}")]
    IncorrectObject(&'static str),

    #[error("unsupported interface version {major}.{minor}")]
    IncorrectVersion { major: u32, minor: u32 },

    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(usize),

    #[error("insufficient space: {needed} bytes needed, {available} available")]
    InsufficientSpace { needed: usize, available: usize },

    #[error("{0} is not supported")]
    NotSupported(String),

    #[error("unknown gpu generation for chipset {0:#06x}")]
    UnknownGen(u32),

    #[error("{0} is not initialized")]
    NotInitialized(&'static str),

    #[error("io control {request} failed: {reason}")]
    IoControl {
        request: &'static str,
        reason: String,
    },

    #[error("{0}")]
    Failed(String),
}

impl Error {
    pub fn failed(msg: impl Into<String>) -> Self {
        Error::Failed(msg.into())
    }

    pub fn parameter(msg: impl Into<String>) -> Self {
        Error::IncorrectParameter(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::IncorrectParameter(_) => StatusCode::IncorrectParameter,
            Error::IncorrectSlot { .. } => StatusCode::IncorrectSlot,
            Error::IncorrectObject(_) => StatusCode::IncorrectObject,
            Error::IncorrectVersion { .. } => StatusCode::IncorrectVersion,
            Error::OutOfMemory(_) => StatusCode::OutOfMemory,
            Error::InsufficientSpace { .. } => StatusCode::InsufficientSpace,
            Error::NotSupported(_) => StatusCode::NotSupported,
            Error::UnknownGen(_) => StatusCode::UnknownGen,
            Error::NotInitialized(_) => StatusCode::NotInitialized,
            Error::IoControl { .. } | Error::Failed(_) => StatusCode::Failed,
        }
    }
}

impl From<&Error> for StatusCode {
    fn from(e: &Error) -> Self {
        e.status()
    }
}

impl From<Error> for StatusCode {
    fn from(e: Error) -> Self {
        e.status()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
